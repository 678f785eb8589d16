/// Errors that can occur while managing the server subprocess.
#[derive(Debug, thiserror::Error)]
pub enum ProcError {
    /// The command line was empty.
    #[error("empty server command")]
    EmptyCommand,

    /// Failed to launch the subprocess.
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    /// A pipe handle was requested more than once.
    #[error("{0} pipe already taken")]
    PipeTaken(&'static str),

    /// An I/O error occurred while waiting on or signalling the subprocess.
    #[error("process I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProcError>;
