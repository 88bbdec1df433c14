//! Pipes, polling, and descriptor duplication.

use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};

use crate::error::{ErrnoContext, SysError, last_errno};

/// Creates a pipe with `CLOEXEC` set on both ends. Returns `(read, write)`.
pub fn pipe() -> Result<(OwnedFd, OwnedFd), SysError> {
    rustix::pipe::pipe_with(rustix::pipe::PipeFlags::CLOEXEC).ctx("pipe2")
}

/// Duplicates `fd` with `CLOEXEC` set atomically (`F_DUPFD_CLOEXEC`).
///
/// This is the only duplication primitive exposed; `dup(2)` would leave a
/// window in which the new descriptor could leak across an exec.
pub fn dup_cloexec(fd: BorrowedFd<'_>) -> Result<OwnedFd, SysError> {
    rustix::io::fcntl_dupfd_cloexec(fd, 0).ctx("fcntl")
}

/// Waits until `fd` is readable or `timeout_ms` expires.
///
/// Returns `Ok(true)` when readable, `Ok(false)` on timeout. A negative
/// timeout blocks indefinitely, as with `poll(2)`.
pub fn poll_readable(fd: BorrowedFd<'_>, timeout_ms: i32) -> Result<bool, SysError> {
    let mut pollfd = libc::pollfd {
        fd: fd.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    // SAFETY: pollfd points at one valid, initialized struct.
    let ready = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
    match ready {
        -1 => Err(SysError::new(last_errno(), "poll")),
        0 => Ok(false),
        _ => Ok(true),
    }
}
