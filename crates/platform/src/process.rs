//! Process control: signals, reaping, and credentials.

use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use rustix::io::Errno;

use crate::error::{SysError, last_errno};

/// Sends `signal` to `pid`.
pub fn kill(pid: libc::pid_t, signal: libc::c_int) -> Result<(), SysError> {
    // SAFETY: plain syscall, no pointers involved.
    match unsafe { libc::kill(pid, signal) } {
        0 => Ok(()),
        _ => Err(SysError::new(last_errno(), "kill")),
    }
}

/// Waits for `pid` to terminate and returns its wait status.
///
/// Retries on `EINTR`; any other failure is surfaced.
pub fn wait_pid(pid: libc::pid_t) -> Result<ExitStatus, SysError> {
    let mut wstatus: libc::c_int = 0;
    loop {
        // SAFETY: wstatus points at one valid c_int.
        let reaped = unsafe { libc::waitpid(pid, &mut wstatus, 0) };
        if reaped == pid {
            return Ok(ExitStatus::from_raw(wstatus));
        }
        let errno = last_errno();
        if errno != Errno::INTR {
            return Err(SysError::new(errno, "waitpid"));
        }
    }
}

/// Real user id of the calling process.
pub fn uid() -> u32 {
    // SAFETY: always succeeds.
    unsafe { libc::getuid() }
}

/// Real group id of the calling process.
pub fn gid() -> u32 {
    // SAFETY: always succeeds.
    unsafe { libc::getgid() }
}

#[cfg(test)]
mod tests {
    use std::process::Command;

    use super::*;

    #[test]
    fn wait_reports_exit_code() {
        let child = Command::new("/bin/sh").args(["-c", "exit 7"]).spawn().unwrap();
        let status = wait_pid(child.id() as libc::pid_t).unwrap();
        assert_eq!(status.code(), Some(7));
    }

    #[test]
    fn kill_then_wait_reports_signal() {
        let child = Command::new("/bin/sh").args(["-c", "sleep 30"]).spawn().unwrap();
        let pid = child.id() as libc::pid_t;
        kill(pid, libc::SIGKILL).unwrap();
        let status = wait_pid(pid).unwrap();
        assert_eq!(status.signal(), Some(libc::SIGKILL));
    }
}
