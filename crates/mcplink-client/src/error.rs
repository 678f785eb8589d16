use std::time::Duration;

use mcplink_wire::RpcError;

use crate::state::ConnectionState;

/// Errors that can occur in client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// A call was attempted before the handshake completed (or after
    /// shutdown).
    #[error("connection not ready (state: {0})")]
    NotReady(ConnectionState),

    /// No matching response arrived within the deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The stream ended or the server process exited; fatal to all
    /// pending calls.
    #[error("transport closed: {0}")]
    TransportClosed(String),

    /// Handshake failed. Carries the underlying cause so a handshake
    /// timeout keeps its retryability.
    #[error("handshake failed: {0}")]
    HandshakeFailed(#[source] Box<ClientError>),

    /// The remote returned an error object. A business failure, not a
    /// transport fault.
    #[error("tool error: {0}")]
    Tool(RpcError),

    /// The tool reported failure inside an otherwise successful response
    /// (the `isError` result envelope).
    #[error("tool failed: {0}")]
    ToolFailed(String),

    /// Malformed or unexpected traffic on an otherwise healthy stream.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Wire-level error.
    #[error("wire error: {0}")]
    Wire(#[from] mcplink_wire::WireError),

    /// Subprocess error.
    #[error("process error: {0}")]
    Proc(#[from] mcplink_proc::ProcError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    /// Whether retrying the same call could plausibly succeed.
    ///
    /// Timeouts and transport failures are environmental; tool errors and
    /// caller mistakes are not. A failed handshake inherits the verdict of
    /// its cause.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::TransportClosed(_) => true,
            Self::HandshakeFailed(cause) => cause.is_retryable(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
