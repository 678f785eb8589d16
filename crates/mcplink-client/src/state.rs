use std::fmt;

/// Lifecycle of one client connection.
///
/// Only `Ready` accepts tool calls. `Closed` is reached by explicit
/// shutdown, `Failed` by stream end, process death, or a protocol
/// violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Spawned but handshake not yet attempted.
    Unstarted,
    /// Handshake request in flight.
    Initializing,
    /// Handshake complete; calls are accepted.
    Ready,
    /// Explicitly shut down.
    Closed,
    /// Transport or protocol failure.
    Failed,
}

impl ConnectionState {
    /// Whether new tool calls are accepted in this state.
    pub fn accepts_calls(self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Whether the connection can never accept calls again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unstarted => "unstarted",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}
