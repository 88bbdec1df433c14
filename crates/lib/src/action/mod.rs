//! The action orchestrator.
//!
//! [`perform_action`] drives one action through its whole lifecycle:
//! allocate a scratch directory, lay out the container skeleton inside it,
//! hand the scratch and log descriptors to the action-specific code, then
//! verify, hash, and install every declared output into the cache.
//!
//! Failures the action caused (it timed out, exited non-zero, or did not
//! produce its outputs) come back as [`ActionStatus::Failure`] with the
//! build log and a structured [`UserError`]; failures of the engine itself
//! propagate as [`EngineError`].

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::os::fd::{AsFd, BorrowedFd};
use std::path::PathBuf;

use tracing::{debug, info};

use floe_platform::{OFlags, SysError, fs, io};

use crate::consts;
use crate::context::Context;
use crate::error::{EngineError, UserError};
use crate::hash::hash_file_at;
use crate::sandbox::RunError;

mod run;

pub use run::{RunAction, perform_run_action};

/// What the action code works with while it runs.
///
/// Both descriptors are borrowed: the action code must not close them. It
/// may freely create, modify, and delete files inside the scratch
/// directory, and must leave each declared output as an entry of
/// `outputs/` when it returns.
pub struct ActionContext<'a> {
    pub scratch_dir: BorrowedFd<'a>,
    pub log_file: BorrowedFd<'a>,
}

/// Outcome of one action, as reported to callers.
#[derive(Debug)]
pub enum ActionStatus {
    Success,
    /// The action succeeded but its log matched a warning pattern.
    Warning { log: Vec<u8> },
    /// The action failed; `cause` says how and `log` is the build log.
    Failure { log: Vec<u8>, cause: UserError },
}

impl ActionStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Runs one action: scratch, skeleton, action code, then hash and install
/// the declared `outputs`.
pub fn perform_action<F>(
    context: &Context,
    outputs: &[PathBuf],
    action_code: F,
) -> Result<ActionStatus, EngineError>
where
    F: FnOnce(&ActionContext<'_>) -> Result<(), RunError>,
{
    let scratch_dir = context.new_scratch_dir()?;
    build_skeleton(scratch_dir.as_fd())?;

    let log_file = fs::open_at(
        scratch_dir.as_fd(),
        "build.log",
        OFlags::CREATE | OFlags::RDWR,
        0o644,
    )?;

    let action_context = ActionContext {
        scratch_dir: scratch_dir.as_fd(),
        log_file: log_file.as_fd(),
    };
    if let Err(err) = action_code(&action_context) {
        let cause = match err {
            RunError::Timeout(timeout) => UserError::Timeout { timeout },
            RunError::Terminated(status) => UserError::Termination { status },
            RunError::Spawn(cause) => UserError::CommandSetup { cause },
            // Parent-side supervision failures are the engine's problem, not
            // the action's.
            RunError::Sys(err) => return Err(err.into()),
        };
        return Ok(ActionStatus::Failure {
            log: read_log(log_file.as_fd())?,
            cause,
        });
    }

    // The action may have clobbered outputs/ itself; that is on the action.
    let outputs_dir = match fs::open_at(
        scratch_dir.as_fd(),
        "outputs",
        OFlags::DIRECTORY | OFlags::PATH,
        0,
    ) {
        Ok(fd) => fd,
        Err(cause) => {
            return Ok(ActionStatus::Failure {
                log: read_log(log_file.as_fd())?,
                cause: UserError::OutputsDirectoryInaccessible { cause },
            });
        }
    };

    // Hash every output before installing any, collecting failures so the
    // user sees all bad outputs at once.
    let mut hashed = Vec::with_capacity(outputs.len());
    let mut failures = BTreeMap::new();
    for output in outputs {
        match hash_file_at(outputs_dir.as_fd(), output) {
            Ok(hash) => hashed.push((output, hash)),
            Err(err) => {
                failures.insert(output.clone(), err);
            }
        }
    }
    if !failures.is_empty() {
        return Ok(ActionStatus::Failure {
            log: read_log(log_file.as_fd())?,
            cause: UserError::OutputsInaccessible { causes: failures },
        });
    }

    for (output, hash) in hashed {
        context.store_cached_output(&hash, outputs_dir.as_fd(), output)?;
        debug!(output = %output.display(), %hash, "output installed");
    }

    let log = read_log(log_file.as_fd())?;
    if detect_warnings(&log) {
        return Ok(ActionStatus::Warning { log });
    }

    info!(outputs = outputs.len(), "action complete");
    Ok(ActionStatus::Success)
}

/// Creates the container root skeleton inside the scratch directory.
fn build_skeleton(scratch_dir: BorrowedFd<'_>) -> Result<(), SysError> {
    fs::mkdir_at(scratch_dir, "bin", 0o755)?;
    fs::mkdir_at(scratch_dir, "nix", 0o755)?;
    fs::mkdir_at(scratch_dir, "nix/store", 0o755)?;
    fs::mkdir_at(scratch_dir, "proc", 0o555)?;
    fs::mkdir_at(scratch_dir, "usr", 0o755)?;
    fs::mkdir_at(scratch_dir, "usr/bin", 0o755)?;
    fs::mkdir_at(scratch_dir, "build", 0o755)?;
    fs::mkdir_at(scratch_dir, "outputs", 0o755)?;

    // Scripts expect #!/bin/sh and /usr/bin/env to exist even when nothing
    // declared them as inputs, so every container gets them. They belong in
    // the action cache key once one exists.
    fs::symlink_at(&format!("{}/bin/bash", consts::BASH_PATH), scratch_dir, "bin/sh")?;
    fs::symlink_at(
        &format!("{}/bin/env", consts::COREUTILS_PATH),
        scratch_dir,
        "usr/bin/env",
    )?;
    Ok(())
}

/// Reads the whole build log back from its descriptor.
///
/// The child advanced the shared offset while writing, so rewind a
/// duplicate first.
fn read_log(log_file: BorrowedFd<'_>) -> Result<Vec<u8>, EngineError> {
    let mut file = File::from(io::dup_cloexec(log_file)?);
    file.seek(SeekFrom::Start(0))?;
    let mut log = Vec::new();
    file.read_to_end(&mut log)?;
    Ok(log)
}

/// Hook for log-driven warning detection.
///
/// The scanning rules belong to the evaluation layer; until it supplies
/// them, every clean exit is a plain success.
fn detect_warnings(_log: &[u8]) -> bool {
    false
}
