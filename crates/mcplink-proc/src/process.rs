use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{ProcError, Result};

const REAP_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How a [`ServerProcess::shutdown`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The process had already exited when shutdown started.
    AlreadyExited,
    /// The process exited on its own within the grace period.
    Graceful,
    /// The process exited after SIGTERM.
    Terminated,
    /// The process had to be killed.
    Killed,
}

/// An owned tool-server subprocess with piped standard input/output.
///
/// stdin and stdout are handed out exactly once via [`take_stdin`] and
/// [`take_stdout`]; stderr is discarded so an unread pipe can never block
/// the server. Dropping a `ServerProcess` reaps the child.
///
/// [`take_stdin`]: ServerProcess::take_stdin
/// [`take_stdout`]: ServerProcess::take_stdout
#[derive(Debug)]
pub struct ServerProcess {
    child: Child,
    command: String,
    stopped: bool,
}

impl ServerProcess {
    /// Launch the server command with piped stdio.
    pub fn spawn(command: &[String]) -> Result<Self> {
        let (program, args) = command.split_first().ok_or(ProcError::EmptyCommand)?;
        let command_line = command.join(" ");

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| ProcError::Spawn {
                command: command_line.clone(),
                source,
            })?;

        debug!(pid = child.id(), command = %command_line, "server process spawned");

        Ok(Self {
            child,
            command: command_line,
            stopped: false,
        })
    }

    /// Take the write end of the server's stdin.
    pub fn take_stdin(&mut self) -> Result<ChildStdin> {
        self.child.stdin.take().ok_or(ProcError::PipeTaken("stdin"))
    }

    /// Take the read end of the server's stdout.
    pub fn take_stdout(&mut self) -> Result<ChildStdout> {
        self.child
            .stdout
            .take()
            .ok_or(ProcError::PipeTaken("stdout"))
    }

    /// Operating-system process id.
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// The command line this process was spawned with.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Whether the process has exited (non-blocking).
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Stop the subprocess, escalating as needed.
    ///
    /// Waits up to `grace` for the process to exit on its own (callers
    /// normally close its stdin first), then sends SIGTERM and waits the
    /// same grace period again, then kills. The child is always reaped
    /// before this returns. Idempotent.
    pub fn shutdown(&mut self, grace: Duration) -> Result<StopOutcome> {
        if self.stopped {
            return Ok(StopOutcome::AlreadyExited);
        }
        self.stopped = true;

        if self.child.try_wait()?.is_some() {
            return Ok(StopOutcome::AlreadyExited);
        }

        if self.wait_with_deadline(grace)? {
            debug!(pid = self.child.id(), "server exited gracefully");
            return Ok(StopOutcome::Graceful);
        }

        self.terminate();
        if self.wait_with_deadline(grace)? {
            debug!(pid = self.child.id(), "server exited after SIGTERM");
            return Ok(StopOutcome::Terminated);
        }

        warn!(pid = self.child.id(), "server unresponsive, killing");
        self.child.kill()?;
        self.child.wait()?;
        Ok(StopOutcome::Killed)
    }

    /// Poll `try_wait` until the deadline. Returns true if the child exited.
    fn wait_with_deadline(&mut self, grace: Duration) -> Result<bool> {
        let deadline = Instant::now() + grace;
        loop {
            if self.child.try_wait()?.is_some() {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(REAP_POLL_INTERVAL);
        }
    }

    /// Ask the process to terminate.
    ///
    /// SIGTERM on Unix; on other platforms this is a no-op and shutdown
    /// falls through to `kill`.
    #[cfg(unix)]
    fn terminate(&self) {
        let pid = self.child.id() as libc::pid_t;
        // SAFETY: `pid` is the id of a child this process spawned and has
        // not yet reaped, so it cannot have been recycled.
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc != 0 {
            warn!(pid, "SIGTERM failed: {}", std::io::Error::last_os_error());
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self) {}
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        if !self.stopped {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}
