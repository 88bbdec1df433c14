//! Spawn-and-wait with timeout enforcement.

use std::os::fd::AsFd;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use floe_platform::{SysError, io, process};

use super::Command;
use super::spawn::{KillGuard, SpawnError};

/// Outcome of [`Command::run`] other than success.
#[derive(Debug, Error)]
pub enum RunError {
    /// The container could not be constructed or the program could not be
    /// executed.
    #[error("{0}")]
    Spawn(#[from] SpawnError),

    /// A parent-side syscall failed while supervising the child.
    #[error(transparent)]
    Sys(#[from] SysError),

    /// The command was still running when the timeout elapsed.
    #[error("command exceeded timeout: {0:?}")]
    Timeout(Duration),

    /// The command exited non-zero or was killed by a signal.
    #[error("command terminated unsuccessfully: {0}")]
    Terminated(ExitStatus),
}

impl Command {
    /// Spawns the container and waits for it to terminate.
    ///
    /// Never returns while the child is alive: if the timeout elapses first,
    /// or supervision fails, the child is killed and reaped before this
    /// returns. The pidfd is readable exactly when the child has terminated,
    /// which is what bounds the wait.
    pub fn run(&self, timeout: Duration) -> Result<(), RunError> {
        let (pid, pidfd) = self.spawn()?;
        let mut guard = KillGuard::new(pid);

        let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        let terminated = io::poll_readable(pidfd.as_fd(), timeout_ms)?;
        if !terminated {
            debug!(pid, ?timeout, "container timed out");
            return Err(RunError::Timeout(timeout));
        }

        let status = process::wait_pid(pid)?;
        guard.disarm();
        debug!(pid, %status, "container terminated");

        if !status.success() {
            return Err(RunError::Terminated(status));
        }
        Ok(())
    }
}
