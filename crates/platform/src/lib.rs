//! Linux syscall wrappers for the floe engine.
//!
//! This crate is the lowest layer of the engine. It wraps the syscalls the
//! engine needs with three contractual differences from the raw calls:
//!
//! - Failures are reported as [`SysError`], carrying the errno and a short
//!   context string naming the operation.
//! - Path arguments are ordinary Rust paths; no pre-null-terminated strings.
//! - Every call that creates a file descriptor sets close-on-exec
//!   atomically. No FD ever escapes this crate without `CLOEXEC`; plain
//!   `dup` is not exposed because it cannot satisfy that.
//!
//! Syscalls that only ever run between `clone3(2)` and `execve(2)` (mount,
//! chroot, the id-map writes, stdio adjustment) have no wrappers here: that
//! window is restricted to async-signal-safe, allocation-free code and is
//! handled with raw `libc` calls at the single place it occurs.

mod error;

pub mod fs;
pub mod io;
pub mod process;

pub use error::SysError;
pub use rustix::fs::OFlags;
pub use rustix::io::Errno;
