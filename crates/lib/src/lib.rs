//! floe-lib: hermetic, content-addressed action execution.
//!
//! This crate is the core of the floe build engine. Callers hand it a run
//! action (a program, its argument vector, environment, declared outputs,
//! and a timeout) and it:
//!
//! 1. builds a fresh container root inside a scratch directory,
//! 2. executes the program there under all seven Linux namespaces with the
//!    scratch directory as `/`,
//! 3. verifies that the declared outputs were produced,
//! 4. hashes each output (BLAKE3 over a canonical tree encoding), and
//! 5. installs each output into the content-addressed cache under its
//!    digest, atomically.
//!
//! The pieces compose bottom-up: [`hash`] for content addressing,
//! [`context`] for the state directory, [`sandbox`] for the container spawn
//! protocol, and [`action`] for the orchestrator tying them together.
//! Failures attributable to the action itself (non-zero exit, timeout,
//! missing outputs) are reported as structured [`UserError`] values inside
//! an [`ActionStatus`]; everything else uses [`EngineError`].
//!
//! Build-file parsing, action-graph evaluation, and scheduling live
//! outside this crate; they drive it through [`Context`] and
//! [`action::perform_run_action`].

pub mod action;
pub mod consts;
pub mod context;
pub mod error;
pub mod hash;
pub mod sandbox;

pub use action::{ActionContext, ActionStatus, RunAction, perform_action, perform_run_action};
pub use context::Context;
pub use error::{Elaboration, EngineError, UserError, render_diagnostic};
pub use hash::{HashError, ObjectHash, hash_file_at};
