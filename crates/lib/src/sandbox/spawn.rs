//! The `clone3`/`execve` spawn protocol.
//!
//! The parent pre-serializes everything, creates a CLOEXEC error pipe, and
//! calls `clone3` requesting a pidfd. The child performs its setup sequence
//! with nothing but direct syscalls; on any failure it writes a 4-byte
//! errno followed by a short context string into the pipe and exits. The
//! parent learns the outcome from the pipe: EOF with no bytes means
//! `execve` succeeded (CLOEXEC closed the write end), anything else is a
//! structured setup failure.

use std::ffi::{CStr, CString};
use std::fmt;
use std::io::Read;
use std::mem::{size_of, zeroed};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStringExt;
use std::path::PathBuf;
use std::ptr;

use tracing::debug;

use floe_platform::{SysError, fs, io, process};

use super::{Command, MountOp, Stdio};

/// A failed step of the spawn sequence, on either side of `clone3`.
#[derive(Debug)]
pub struct SpawnError {
    pub errno: i32,
    pub context: String,
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}",
            self.context,
            std::io::Error::from_raw_os_error(self.errno)
        )
    }
}

impl std::error::Error for SpawnError {}

impl SpawnError {
    fn new(errno: i32, context: impl Into<String>) -> Self {
        Self { errno, context: context.into() }
    }

    fn last_os(context: &str) -> Self {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        Self::new(errno, context)
    }
}

impl From<SysError> for SpawnError {
    fn from(err: SysError) -> Self {
        Self::new(err.raw_os_error(), err.context())
    }
}

/// Everything the child touches, fully serialized before `clone3`.
///
/// Only raw pointers and borrowed slices: the child must not allocate.
struct ChildPlan<'a> {
    pipe_r: RawFd,
    pipe_w: RawFd,
    setgroups: Option<&'a [u8]>,
    uid_map: Option<&'a [u8]>,
    gid_map: Option<&'a [u8]>,
    workdir: Option<&'a CStr>,
    mounts: &'a [MountOp],
    chroot_dir: Option<&'a CStr>,
    chroot_workdir: Option<&'a CStr>,
    stdin: Stdio,
    stdout: Stdio,
    stderr: Stdio,
    program: *const libc::c_char,
    argv: *const *const libc::c_char,
    envp: *const *const libc::c_char,
}

/// Pre-execve failure, constructed without allocating.
struct ChildError {
    errno: libc::c_int,
    context: &'static str,
}

impl ChildError {
    fn last(context: &'static str) -> Self {
        // SAFETY: errno location is always valid on the calling thread.
        let errno = unsafe { *libc::__errno_location() };
        Self { errno, context }
    }
}

#[repr(C)]
struct CloneArgs {
    flags: u64,
    pidfd: u64,
    child_tid: u64,
    parent_tid: u64,
    exit_signal: u64,
    stack: u64,
    stack_size: u64,
    tls: u64,
    set_tid: u64,
    set_tid_size: u64,
    cgroup: u64,
}

/// Kills and reaps the child when dropped, unless disarmed.
///
/// SIGKILL into a fresh PID namespace takes the whole process tree with
/// it, so nothing the action spawned can survive.
pub(crate) struct KillGuard {
    pid: libc::pid_t,
    armed: bool,
}

impl KillGuard {
    pub(crate) fn new(pid: libc::pid_t) -> Self {
        Self { pid, armed: true }
    }

    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for KillGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = process::kill(self.pid, libc::SIGKILL);
            let _ = process::wait_pid(self.pid);
        }
    }
}

impl Command {
    /// Spawns the container. Returns the child pid and its pidfd.
    ///
    /// On error the child (if one was created) has been killed and reaped.
    pub(super) fn spawn(&self) -> Result<(libc::pid_t, OwnedFd), SpawnError> {
        // The child must change directory via a resolved path, not the
        // descriptor: after fchdir(2), mount(2) and chroot(2) misbehave with
        // relative paths, and chdir("/proc/self/fd/N") is not sufficient
        // either. Dereferencing the magic link here and passing the plain
        // path works.
        let workdir = match self.workdir {
            Some(fd) => {
                let magic = PathBuf::from(format!("/proc/self/fd/{fd}"));
                let resolved = fs::read_link(&magic)?;
                Some(
                    CString::new(resolved.into_vec())
                        .map_err(|_| SpawnError::new(libc::EINVAL, "workdir path"))?,
                )
            }
            None => None,
        };

        let argv: Vec<*const libc::c_char> = self
            .argv
            .iter()
            .map(|arg| arg.as_ptr())
            .chain(std::iter::once(ptr::null()))
            .collect();
        let envp: Vec<*const libc::c_char> = self
            .envp
            .iter()
            .map(|entry| entry.as_ptr())
            .chain(std::iter::once(ptr::null()))
            .collect();

        let (pipe_r, pipe_w) = io::pipe()?;

        let plan = ChildPlan {
            pipe_r: pipe_r.as_raw_fd(),
            pipe_w: pipe_w.as_raw_fd(),
            setgroups: self.setgroups.as_deref(),
            uid_map: self.uid_map.as_deref(),
            gid_map: self.gid_map.as_deref(),
            workdir: workdir.as_deref(),
            mounts: &self.mounts,
            chroot_dir: self.chroot_dir.as_deref(),
            chroot_workdir: self.chroot_workdir.as_deref(),
            stdin: self.stdin,
            stdout: self.stdout,
            stderr: self.stderr,
            program: self.program.as_ptr(),
            argv: argv.as_ptr(),
            envp: envp.as_ptr(),
        };

        let mut pidfd: RawFd = -1;
        // SAFETY: cl_args is a valid clone_args struct for the duration of the
        // call; the child branch runs only async-signal-safe code.
        let pid = unsafe {
            let mut cl_args: CloneArgs = zeroed();
            cl_args.flags = self.namespaces | libc::CLONE_PIDFD as u64;
            cl_args.pidfd = &mut pidfd as *mut RawFd as u64;
            cl_args.exit_signal = libc::SIGCHLD as u64;
            libc::syscall(libc::SYS_clone3, &cl_args as *const CloneArgs, size_of::<CloneArgs>())
        };

        if pid == -1 {
            return Err(SpawnError::last_os("clone3"));
        }

        if pid == 0 {
            // SAFETY: fresh address space; the plan outlives this branch, which
            // never returns.
            unsafe {
                let err = child_pre_exec(&plan);
                report_and_exit(plan.pipe_w, err);
            }
        }

        let pid = pid as libc::pid_t;
        let mut guard = KillGuard::new(pid);

        // SAFETY: clone3 stored a fresh pidfd for us (CLOEXEC by construction).
        let pidfd = unsafe { OwnedFd::from_raw_fd(pidfd) };

        // Close our copy of the write end, then wait for the execve verdict:
        // EOF without data means the child's copy died with a successful exec.
        drop(pipe_w);
        let mut packet = Vec::new();
        std::fs::File::from(pipe_r)
            .read_to_end(&mut packet)
            .map_err(|err| SpawnError::new(err.raw_os_error().unwrap_or(0), "read: error pipe"))?;

        match packet.len() {
            0 => {
                guard.disarm();
                debug!(pid, "container spawned");
                Ok((pid, pidfd))
            }
            len if len > 4 => {
                let errno = i32::from_ne_bytes([packet[0], packet[1], packet[2], packet[3]]);
                let context = String::from_utf8_lossy(&packet[4..]).into_owned();
                Err(SpawnError::new(errno, context))
            }
            _ => Err(SpawnError::new(libc::EIO, "child error report truncated")),
        }
    }
}

/// The child between `clone3` and `execve`.
///
/// Everything here must be async-signal-safe: direct syscalls on
/// pre-serialized data only, with no allocation, no unwinding, and no
/// dynamic dispatch. Returns only on failure.
unsafe fn child_pre_exec(plan: &ChildPlan<'_>) -> ChildError {
    unsafe {
        libc::close(plan.pipe_r);

        if let Some(contents) = plan.setgroups
            && let Err(err) = write_proc_file(c"/proc/self/setgroups", contents, "setgroups")
        {
            return err;
        }
        if let Some(contents) = plan.uid_map
            && let Err(err) = write_proc_file(c"/proc/self/uid_map", contents, "uid_map")
        {
            return err;
        }
        if let Some(contents) = plan.gid_map
            && let Err(err) = write_proc_file(c"/proc/self/gid_map", contents, "gid_map")
        {
            return err;
        }

        if let Some(workdir) = plan.workdir
            && libc::chdir(workdir.as_ptr()) == -1
        {
            return ChildError::last("chdir: workdir");
        }

        for mount in plan.mounts {
            let result = libc::mount(
                opt_ptr(&mount.source),
                mount.target.as_ptr(),
                opt_ptr(&mount.fstype),
                mount.flags,
                opt_ptr(&mount.data).cast(),
            );
            if result == -1 {
                return ChildError::last("mount");
            }
        }

        if let Some(root) = plan.chroot_dir
            && libc::chroot(root.as_ptr()) == -1
        {
            return ChildError::last("chroot");
        }

        if let Some(workdir) = plan.chroot_workdir
            && libc::chdir(workdir.as_ptr()) == -1
        {
            return ChildError::last("chdir: chroot workdir");
        }

        if let Err(err) = adjust_fd(0, plan.stdin, "stdin") {
            return err;
        }
        if let Err(err) = adjust_fd(1, plan.stdout, "stdout") {
            return err;
        }
        if let Err(err) = adjust_fd(2, plan.stderr, "stderr") {
            return err;
        }

        libc::execve(plan.program, plan.argv, plan.envp);
        ChildError::last("execve")
    }
}

fn opt_ptr(value: &Option<CString>) -> *const libc::c_char {
    value.as_ref().map_or(ptr::null(), |s| s.as_ptr())
}

/// Overwrites a `/proc/self` map file with a single write.
unsafe fn write_proc_file(
    path: &CStr,
    contents: &[u8],
    context: &'static str,
) -> Result<(), ChildError> {
    unsafe {
        let fd = libc::open(path.as_ptr(), libc::O_WRONLY | libc::O_TRUNC | libc::O_CLOEXEC);
        if fd == -1 {
            return Err(ChildError::last(context));
        }
        let written = libc::write(fd, contents.as_ptr().cast(), contents.len());
        libc::close(fd);
        if written != contents.len() as isize {
            return Err(ChildError {
                errno: libc::EAGAIN,
                context,
            });
        }
        Ok(())
    }
}

unsafe fn adjust_fd(fd: RawFd, stdio: Stdio, context: &'static str) -> Result<(), ChildError> {
    unsafe {
        match stdio {
            Stdio::Inherit => Ok(()),
            Stdio::Close => {
                libc::close(fd);
                Ok(())
            }
            Stdio::Dup2 { oldfd } => {
                if libc::dup2(oldfd, fd) == -1 {
                    return Err(ChildError::last(context));
                }
                Ok(())
            }
        }
    }
}

/// Sends the error packet (native-endian errno, then the context bytes,
/// capped at 508) and exits. Never returns.
unsafe fn report_and_exit(pipe_w: RawFd, err: ChildError) -> ! {
    unsafe {
        let errno_bytes = err.errno.to_ne_bytes();
        let _ = libc::write(pipe_w, errno_bytes.as_ptr().cast(), errno_bytes.len());
        let context = err.context.as_bytes();
        let len = context.len().min(508);
        let _ = libc::write(pipe_w, context.as_ptr().cast(), len);
        libc::_exit(1);
    }
}
