/// Errors that can occur while framing or parsing wire messages.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// A line exceeds the configured maximum size.
    #[error("line too long ({size} bytes, max {max})")]
    LineTooLong { size: usize, max: usize },

    /// A line was valid JSON but not a request, response, or notification.
    #[error("unrecognized message shape: {0}")]
    UnrecognizedMessage(String),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An I/O error occurred while reading or writing lines.
    #[error("wire I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream was closed before a complete line was received.
    #[error("connection closed")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, WireError>;
