//! The two error strata of the engine.
//!
//! [`UserError`] covers failures attributable to the action itself: it
//! exited non-zero, overran its timeout, deleted its outputs directory, or
//! failed to produce a declared output. Each kind carries typed fields and
//! can describe itself to an [`Elaboration`] visitor;
//! [`render_diagnostic`] is the terminal formatter over that capability.
//!
//! [`EngineError`] covers everything else: bugs and unexpected OS
//! failures. It propagates as an ordinary error and is never rendered as a
//! user diagnostic.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

use floe_platform::SysError;

use crate::hash::HashError;
use crate::sandbox::SpawnError;

/// A failure attributable to the user's action.
#[derive(Debug, Error)]
pub enum UserError {
    /// The command was still running when the timeout elapsed.
    #[error("Command exceeded timeout")]
    Timeout { timeout: Duration },

    /// The command exited non-zero or was killed by a signal.
    #[error("Command terminated unsuccessfully")]
    Termination { status: ExitStatus },

    /// A syscall failed while constructing the sandbox or executing the
    /// program.
    #[error("Failed to set up command")]
    CommandSetup { cause: SpawnError },

    /// The `outputs` directory could not be opened after the command ran.
    #[error("Outputs directory is inaccessible")]
    OutputsDirectoryInaccessible { cause: SysError },

    /// One or more declared outputs could not be hashed. Collected per
    /// output so every bad output is reported at once.
    #[error("Outputs are inaccessible")]
    OutputsInaccessible { causes: BTreeMap<PathBuf, HashError> },
}

impl UserError {
    /// Emits this error's named fields to `out`.
    pub fn elaborate(&self, out: &mut dyn Elaboration) {
        match self {
            Self::Timeout { timeout } => out.duration("timeout", *timeout),
            Self::Termination { status } => {
                out.integer("wstatus", status.into_raw().into());
                out.string("status", &status.to_string());
            }
            Self::CommandSetup { cause } => out.cause("cause", cause),
            Self::OutputsDirectoryInaccessible { cause } => out.cause("cause", cause),
            Self::OutputsInaccessible { causes } => {
                for (output, cause) in causes {
                    out.cause(&output.display().to_string(), cause);
                }
            }
        }
    }
}

/// Receiver for the named fields of a [`UserError`].
pub trait Elaboration {
    fn string(&mut self, name: &str, value: &str);
    fn integer(&mut self, name: &str, value: i64);
    fn duration(&mut self, name: &str, value: Duration);
    fn cause(&mut self, name: &str, cause: &dyn std::error::Error);
}

/// Formats a user error for the terminal:
/// `"<message>\n -> <field> = <value>\n"` for each field.
pub fn render_diagnostic(error: &UserError) -> String {
    struct Renderer(String);

    impl Elaboration for Renderer {
        fn string(&mut self, name: &str, value: &str) {
            let _ = writeln!(self.0, " -> {name} = {value}");
        }

        fn integer(&mut self, name: &str, value: i64) {
            let _ = writeln!(self.0, " -> {name} = {value}");
        }

        fn duration(&mut self, name: &str, value: Duration) {
            let _ = writeln!(self.0, " -> {name} = {value:?}");
        }

        fn cause(&mut self, name: &str, cause: &dyn std::error::Error) {
            let _ = writeln!(self.0, " -> {name} = {cause}");
        }
    }

    let mut renderer = Renderer(format!("{error}\n"));
    error.elaborate(&mut renderer);
    renderer.0
}

/// An infrastructure failure: not the action's fault.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Sys(#[from] SysError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_renders_message_and_field() {
        let error = UserError::Timeout {
            timeout: Duration::from_millis(100),
        };
        assert_eq!(
            render_diagnostic(&error),
            "Command exceeded timeout\n -> timeout = 100ms\n"
        );
    }

    #[test]
    fn termination_renders_wait_status() {
        let error = UserError::Termination {
            status: ExitStatus::from_raw(7 << 8),
        };
        let rendered = render_diagnostic(&error);
        assert!(rendered.starts_with("Command terminated unsuccessfully\n"));
        assert!(rendered.contains(" -> wstatus = 1792\n"));
        assert!(rendered.contains("exit status: 7"));
    }

    #[test]
    fn inaccessible_outputs_render_one_field_per_output() {
        let mut causes = BTreeMap::new();
        causes.insert(
            PathBuf::from("m.o"),
            HashError::UnsupportedFileType { mode: 0o10644 },
        );
        causes.insert(
            PathBuf::from("lib.a"),
            HashError::UnsupportedFileType { mode: 0o10644 },
        );
        let rendered = render_diagnostic(&UserError::OutputsInaccessible { causes });
        assert!(rendered.contains(" -> m.o = "));
        assert!(rendered.contains(" -> lib.a = "));
    }
}
