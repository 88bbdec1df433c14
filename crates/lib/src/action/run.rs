//! The run action: execute a program in the container.

use std::ffi::CString;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::time::Duration;

use tracing::info;

use floe_platform::process;

use crate::context::Context;
use crate::error::EngineError;
use crate::sandbox::{ALL_NAMESPACES, Command, MountOp, RunError, Stdio};

use super::{ActionContext, ActionStatus, perform_action};

/// Descriptor of one run action.
pub struct RunAction {
    /// Absolute path of the program, as seen inside the container.
    pub program: CString,
    /// Argument vector; the first element conventionally equals `program`.
    pub arguments: Vec<CString>,
    /// Environment, as `NAME=VALUE` entries.
    pub environment: Vec<CString>,
    /// Paths the action must produce, relative to `/outputs`.
    pub outputs: Vec<PathBuf>,
    /// Maximum wall-clock time the program may spend.
    pub timeout: Duration,
}

/// Performs a run action: container skeleton, sandboxed execution, output
/// hashing and installation.
pub fn perform_run_action(
    context: &Context,
    action: &RunAction,
) -> Result<ActionStatus, EngineError> {
    info!(program = ?action.program, timeout = ?action.timeout, "performing run action");
    perform_action(context, &action.outputs, |action_context| {
        run_command(action_context, action)
    })
}

fn run_command(action_context: &ActionContext<'_>, action: &RunAction) -> Result<(), RunError> {
    let log_fd = action_context.log_file.as_raw_fd();
    Command::new(action.program.clone())
        .with_args(action.arguments.clone())
        .with_env(action.environment.clone())
        .with_namespaces(ALL_NAMESPACES)
        .with_root_mapped_to(process::uid(), process::gid())
        .with_workdir(action_context.scratch_dir)
        // systemd mounts / as MS_SHARED; without MS_PRIVATE every mount below
        // would propagate back out of the namespace.
        .with_mount(MountOp {
            source: Some(c"none".into()),
            target: c"/".into(),
            fstype: None,
            flags: libc::MS_PRIVATE | libc::MS_REC,
            data: None,
        })
        // Fresh procfs for the new PID namespace.
        .with_mount(MountOp {
            source: Some(c"proc".into()),
            target: c"proc".into(),
            fstype: Some(c"proc".into()),
            flags: libc::MS_NODEV | libc::MS_NOEXEC | libc::MS_NOSUID,
            data: None,
        })
        .with_bind_rdonly(c"/nix/store".into(), c"nix/store".into())
        .with_chroot(c".".into())
        .with_chroot_workdir(c"/build".into())
        .with_stdin(Stdio::Close)
        .with_stdout(Stdio::Dup2 { oldfd: log_fd })
        .with_stderr(Stdio::Dup2 { oldfd: log_fd })
        .run(action.timeout)
}
