//! Subprocess ownership for mcplink.
//!
//! Spawns the tool server with piped standard input/output and guarantees
//! orderly teardown: graceful wait, then SIGTERM, then kill. This is the
//! lowest layer of mcplink. Everything else builds on the pipe handles
//! handed out by [`ServerProcess`].

pub mod error;
pub mod process;

pub use error::{ProcError, Result};
pub use process::{ServerProcess, StopOutcome};
