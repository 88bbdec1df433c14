//! Error type for the wrapper layer.

use std::fmt;

use rustix::io::Errno;

/// A failed syscall: which errno, and from which operation.
///
/// The context is a static string so constructing the error never
/// allocates.
#[derive(Debug)]
pub struct SysError {
    errno: Errno,
    context: &'static str,
}

impl SysError {
    pub fn new(errno: Errno, context: &'static str) -> Self {
        Self { errno, context }
    }

    /// The errno reported by the kernel.
    pub fn errno(&self) -> Errno {
        self.errno
    }

    /// The operation that failed, e.g. `"openat"`.
    pub fn context(&self) -> &'static str {
        self.context
    }

    pub fn raw_os_error(&self) -> i32 {
        self.errno.raw_os_error()
    }
}

impl fmt::Display for SysError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.context, std::io::Error::from(self.errno))
    }
}

impl std::error::Error for SysError {}

/// Attaches an operation name to a raw errno result.
pub(crate) trait ErrnoContext<T> {
    fn ctx(self, context: &'static str) -> Result<T, SysError>;
}

impl<T> ErrnoContext<T> for Result<T, Errno> {
    fn ctx(self, context: &'static str) -> Result<T, SysError> {
        self.map_err(|errno| SysError { errno, context })
    }
}

/// The calling thread's current errno, for raw `libc` calls.
pub(crate) fn last_errno() -> Errno {
    Errno::from_raw_os_error(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context_and_errno() {
        let err = SysError::new(Errno::NOENT, "openat");
        let rendered = err.to_string();
        assert!(rendered.starts_with("openat: "));
        assert_eq!(err.errno(), Errno::NOENT);
    }
}
