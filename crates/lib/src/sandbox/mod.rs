//! Running one command inside a freshly constructed container.
//!
//! [`Command`] is a builder over everything the child process needs between
//! `clone3(2)` and `execve(2)`: namespace flags, id-map contents, the
//! initial working directory, an ordered list of mounts, the chroot, and
//! stdio dispositions. `std::process::Command` cannot express
//! `CLONE_NEWPID` (and `unshare(CLONE_NEWPID)` does not affect the calling
//! process), so the spawn machinery is replicated here on top of `clone3`.
//!
//! Everything the child touches is pre-serialized into C strings and raw
//! pointer arrays while still in the parent: the code after `clone3`
//! must stay async-signal-safe, so it may not allocate, unwind, or call
//! anything that might take a lock.

use std::ffi::CString;
use std::os::fd::{BorrowedFd, RawFd};

pub use self::run::RunError;
pub use self::spawn::SpawnError;

mod run;
mod spawn;

/// The full namespace set of an action container: cgroup, IPC, network,
/// mount, PID, user, and UTS.
pub const ALL_NAMESPACES: u64 = (libc::CLONE_NEWCGROUP
    | libc::CLONE_NEWIPC
    | libc::CLONE_NEWNET
    | libc::CLONE_NEWNS
    | libc::CLONE_NEWPID
    | libc::CLONE_NEWUSER
    | libc::CLONE_NEWUTS) as u64;

/// One `mount(2)` call, recorded for replay inside the child.
///
/// `None` fields become null pointers, as `mount(2)` permits.
pub struct MountOp {
    pub source: Option<CString>,
    pub target: CString,
    pub fstype: Option<CString>,
    pub flags: libc::c_ulong,
    pub data: Option<CString>,
}

/// Disposition of one of the child's standard descriptors.
#[derive(Clone, Copy)]
pub enum Stdio {
    /// Leave the descriptor as inherited.
    Inherit,
    /// Close the descriptor.
    Close,
    /// Replace the descriptor with a duplicate of `oldfd`.
    Dup2 { oldfd: RawFd },
}

/// A command to run in a container. Built up with the `with_*` methods,
/// consumed by [`Command::run`].
pub struct Command {
    program: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    namespaces: u64,
    setgroups: Option<Vec<u8>>,
    uid_map: Option<Vec<u8>>,
    gid_map: Option<Vec<u8>>,
    workdir: Option<RawFd>,
    mounts: Vec<MountOp>,
    chroot_dir: Option<CString>,
    chroot_workdir: Option<CString>,
    stdin: Stdio,
    stdout: Stdio,
    stderr: Stdio,
}

impl Command {
    pub fn new(program: CString) -> Self {
        Self {
            program,
            argv: Vec::new(),
            envp: Vec::new(),
            namespaces: 0,
            setgroups: None,
            uid_map: None,
            gid_map: None,
            workdir: None,
            mounts: Vec::new(),
            chroot_dir: None,
            chroot_workdir: None,
            stdin: Stdio::Inherit,
            stdout: Stdio::Inherit,
            stderr: Stdio::Inherit,
        }
    }

    /// The full argument vector, including `argv[0]`.
    pub fn with_args(mut self, argv: Vec<CString>) -> Self {
        self.argv = argv;
        self
    }

    /// The environment, as `NAME=VALUE` entries.
    pub fn with_env(mut self, envp: Vec<CString>) -> Self {
        self.envp = envp;
        self
    }

    /// `CLONE_NEW*` flags for the child's namespaces.
    pub fn with_namespaces(mut self, flags: u64) -> Self {
        self.namespaces = flags;
        self
    }

    /// Contents written to `/proc/self/setgroups` before the gid map.
    pub fn with_setgroups(mut self, contents: impl Into<Vec<u8>>) -> Self {
        self.setgroups = Some(contents.into());
        self
    }

    /// Contents written to `/proc/self/uid_map`.
    pub fn with_uid_map(mut self, contents: impl Into<Vec<u8>>) -> Self {
        self.uid_map = Some(contents.into());
        self
    }

    /// Contents written to `/proc/self/gid_map`.
    pub fn with_gid_map(mut self, contents: impl Into<Vec<u8>>) -> Self {
        self.gid_map = Some(contents.into());
        self
    }

    /// Maps root inside the user namespace to `uid`/`gid` outside, denying
    /// `setgroups(2)` as the kernel requires before writing the gid map.
    pub fn with_root_mapped_to(self, uid: u32, gid: u32) -> Self {
        self
            .with_setgroups(b"deny\n".as_slice())
            .with_uid_map(format!("0 {uid} 1\n").into_bytes())
            .with_gid_map(format!("0 {gid} 1\n").into_bytes())
    }

    /// Directory the child changes into before mounting.
    ///
    /// The descriptor is recorded by number: it must stay open in the parent
    /// until [`Command::run`] returns.
    pub fn with_workdir(mut self, dirfd: BorrowedFd<'_>) -> Self {
        use std::os::fd::AsRawFd;
        self.workdir = Some(dirfd.as_raw_fd());
        self
    }

    /// Appends one mount. Mounts replay in the order recorded.
    pub fn with_mount(mut self, mount: MountOp) -> Self {
        self.mounts.push(mount);
        self
    }

    /// Appends a recursive read-only bind of `source` at `target`.
    ///
    /// `MS_BIND | MS_RDONLY` in a single call is silently ignored by the
    /// kernel; read-only binds take a bind followed by a read-only remount.
    pub fn with_bind_rdonly(mut self, source: CString, target: CString) -> Self {
        let bind = libc::MS_BIND | libc::MS_REC;
        self.mounts.push(MountOp {
            source: Some(source),
            target: target.clone(),
            fstype: None,
            flags: bind,
            data: None,
        });
        self.mounts.push(MountOp {
            source: Some(c"none".into()),
            target,
            fstype: None,
            flags: bind | libc::MS_RDONLY | libc::MS_REMOUNT,
            data: None,
        });
        self
    }

    /// Root directory to `chroot(2)` into after mounting.
    pub fn with_chroot(mut self, path: CString) -> Self {
        self.chroot_dir = Some(path);
        self
    }

    /// Working directory to change into after the chroot.
    pub fn with_chroot_workdir(mut self, path: CString) -> Self {
        self.chroot_workdir = Some(path);
        self
    }

    pub fn with_stdin(mut self, stdio: Stdio) -> Self {
        self.stdin = stdio;
        self
    }

    pub fn with_stdout(mut self, stdio: Stdio) -> Self {
        self.stdout = stdio;
        self
    }

    pub fn with_stderr(mut self, stdio: Stdio) -> Self {
        self.stderr = stdio;
        self
    }
}
