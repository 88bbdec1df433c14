//! The state directory and its content-addressed cache.
//!
//! A [`Context`] owns one state directory (conventionally `.floe`) laid
//! out as:
//!
//! ```text
//! <state>/
//! ├── scratches/<N>/          per-action disposable working directories
//! └── cached-outputs/<hex>    content-addressed installed outputs
//! ```
//!
//! Both subdirectories are created lazily on first use and their
//! descriptors cached for the Context's lifetime. Scratch ids come from a
//! monotonic counter; cache installs are individually atomic renames, so
//! concurrent writers and crashes cannot corrupt the store.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::Path;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info};

use floe_platform::{Errno, OFlags, SysError, fs};

use crate::error::EngineError;
use crate::hash::ObjectHash;

const SCRATCHES_DIR: &str = "scratches";
const CACHED_OUTPUTS_DIR: &str = "cached-outputs";

/// Handle to a state directory.
///
/// The Context exclusively owns its directory descriptors; they stay valid
/// for its whole lifetime and are closed exactly once when it is dropped.
/// Scratch descriptors handed out by [`Context::new_scratch_dir`] belong to
/// the caller.
pub struct Context {
    state_dir: OwnedFd,
    scratches: OnceLock<OwnedFd>,
    cached_outputs: OnceLock<OwnedFd>,
    next_scratch: AtomicU64,
}

impl Context {
    /// Opens `path` as the state directory, creating it if absent.
    pub fn open(path: &Path) -> Result<Self, EngineError> {
        std::fs::create_dir_all(path)?;
        let state_dir = fs::open(path, OFlags::DIRECTORY | OFlags::PATH, 0)?;
        info!(state = %path.display(), "opened state directory");
        Ok(Self {
            state_dir,
            scratches: OnceLock::new(),
            cached_outputs: OnceLock::new(),
            next_scratch: AtomicU64::new(0),
        })
    }

    /// Creates a fresh scratch directory and opens it `O_DIRECTORY|O_PATH`.
    ///
    /// Ids already present under `scratches/` (left by an earlier process
    /// over the same state directory) are skipped, keeping the counter
    /// monotonic without clearing old scratches.
    pub fn new_scratch_dir(&self) -> Result<OwnedFd, SysError> {
        let scratches = self.subdir(&self.scratches, SCRATCHES_DIR)?;
        loop {
            let id = self.next_scratch.fetch_add(1, Ordering::Relaxed);
            let name = id.to_string();
            match fs::mkdir_at(scratches, &name, 0o755) {
                Ok(()) => {
                    debug!(scratch = id, "created scratch directory");
                    return fs::open_at(scratches, name.as_str(), OFlags::DIRECTORY | OFlags::PATH, 0);
                }
                Err(err) if err.errno() == Errno::EXIST => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Installs the file at `(from_dirfd, from_path)` into the cache under
    /// `hash`, by atomic rename.
    ///
    /// An already-present entry means the same content was installed before
    /// (entries are content-addressed), so `EEXIST` is success.
    pub fn store_cached_output(
        &self,
        hash: &ObjectHash,
        from_dirfd: BorrowedFd<'_>,
        from_path: &Path,
    ) -> Result<(), SysError> {
        debug_assert!(
            matches!(crate::hash::hash_file_at(from_dirfd, from_path), Ok(h) if h == *hash),
            "cache install with a stale hash for {}",
            from_path.display(),
        );

        let cache = self.subdir(&self.cached_outputs, CACHED_OUTPUTS_DIR)?;
        let entry = hash.to_hex();
        match fs::rename_noreplace(from_dirfd, from_path, cache, &entry) {
            Ok(()) => {
                debug!(%entry, "installed cached output");
                Ok(())
            }
            Err(err) if err.errno() == Errno::EXIST => {
                debug!(%entry, "cached output already present");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Returns the cached descriptor for a state subdirectory, creating and
    /// opening it on first use.
    ///
    /// A lost initialization race just drops the extra descriptor; the cell
    /// is written at most once.
    fn subdir<'a>(
        &'a self,
        cell: &'a OnceLock<OwnedFd>,
        name: &'static str,
    ) -> Result<BorrowedFd<'a>, SysError> {
        if cell.get().is_none() {
            match fs::mkdir_at(self.state_dir.as_fd(), name, 0o755) {
                Ok(()) => {}
                Err(err) if err.errno() == Errno::EXIST => {}
                Err(err) => return Err(err),
            }
            let fd = fs::open_at(self.state_dir.as_fd(), name, OFlags::DIRECTORY | OFlags::PATH, 0)?;
            let _ = cell.set(fd);
        }
        Ok(cell.get().expect("initialized above").as_fd())
    }
}
