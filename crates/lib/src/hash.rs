//! Content addressing: BLAKE3 over a canonical tree encoding.
//!
//! A file's hash is a pure function of its contents, permission bits, and
//! structure, never of timestamps, owners, or where the tree lives. The
//! encoding fed to BLAKE3 is, per node:
//!
//! | kind      | encoding                                                        |
//! |-----------|-----------------------------------------------------------------|
//! | regular   | `0x00`, mode & 0o777 as u16 BE, size as u64 BE, file bytes      |
//! | directory | `0x01`, mode & 0o777 as u16 BE, per entry in lexicographic      |
//! |           | order: name bytes, `0x00`, child encoding; then a final `0x00`  |
//! | symlink   | `0x02`, target bytes, `0x00`                                    |
//!
//! Symlinks are never followed: the link target string is hashed, whether
//! or not it resolves. Entry order is strict lexicographic over the raw
//! name bytes, so the hash is independent of readdir order. Any other file
//! kind (fifo, socket, device) is an error.

use std::ffi::{CStr, CString};
use std::fmt;
use std::fs::File;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::Path;

use thiserror::Error;

use floe_platform::fs::{self, FileType};
use floe_platform::{OFlags, SysError};

const TAG_REGULAR: u8 = 0x00;
const TAG_DIRECTORY: u8 = 0x01;
const TAG_SYMLINK: u8 = 0x02;

/// A 32-byte BLAKE3 digest identifying file contents.
///
/// Rendered as lowercase hex wherever it names a filesystem entry.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectHash([u8; 32]);

impl ObjectHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex rendering, the cache entry name for this digest.
    pub fn to_hex(&self) -> String {
        self.to_string()
    }
}

impl From<blake3::Hash> for ObjectHash {
    fn from(hash: blake3::Hash) -> Self {
        Self(*hash.as_bytes())
    }
}

impl fmt::Display for ObjectHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ObjectHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectHash({self})")
    }
}

/// Errors while hashing one node of a tree.
#[derive(Debug, Error)]
pub enum HashError {
    #[error(transparent)]
    Sys(#[from] SysError),

    /// Only regular files, directories, and symlinks have a defined
    /// encoding.
    #[error("unsupported file type (mode {mode:#o})")]
    UnsupportedFileType { mode: u32 },

    #[error("read: {0}")]
    Read(#[source] std::io::Error),

    /// A path that cannot be passed to the kernel (interior NUL).
    #[error("path contains a NUL byte")]
    InvalidPath,
}

/// Hashes the file tree anchored at `path`, relative to `dirfd`.
pub fn hash_file_at(dirfd: BorrowedFd<'_>, path: &Path) -> Result<ObjectHash, HashError> {
    let path = CString::new(path.as_os_str().as_bytes()).map_err(|_| HashError::InvalidPath)?;
    let mut hasher = blake3::Hasher::new();
    encode_node(&mut hasher, dirfd, &path)?;
    Ok(hasher.finalize().into())
}

fn encode_node(
    hasher: &mut blake3::Hasher,
    dirfd: BorrowedFd<'_>,
    path: &CStr,
) -> Result<(), HashError> {
    let stat = fs::stat_at(dirfd, path)?;
    let mode = (stat.st_mode & 0o777) as u16;

    match FileType::from_raw_mode(stat.st_mode) {
        FileType::RegularFile => {
            hasher.update(&[TAG_REGULAR]);
            hasher.update(&mode.to_be_bytes());
            hasher.update(&(stat.st_size as u64).to_be_bytes());
            let file = fs::open_at(dirfd, path, OFlags::RDONLY | OFlags::NOFOLLOW, 0)?;
            hasher
                .update_reader(File::from(file))
                .map_err(HashError::Read)?;
        }

        FileType::Directory => {
            hasher.update(&[TAG_DIRECTORY]);
            hasher.update(&mode.to_be_bytes());
            let dir = fs::open_at(
                dirfd,
                path,
                OFlags::RDONLY | OFlags::DIRECTORY | OFlags::NOFOLLOW,
                0,
            )?;
            let mut names = fs::read_dir_names(dir.as_fd())?;
            names.sort();
            for name in names {
                hasher.update(name.to_bytes());
                hasher.update(&[0x00]);
                encode_node(hasher, dir.as_fd(), &name)?;
            }
            hasher.update(&[0x00]);
        }

        FileType::Symlink => {
            hasher.update(&[TAG_SYMLINK]);
            let target = fs::read_link_at(dirfd, path)?;
            hasher.update(target.into_vec().as_slice());
            hasher.update(&[0x00]);
        }

        _ => return Err(HashError::UnsupportedFileType { mode: stat.st_mode }),
    }

    Ok(())
}
