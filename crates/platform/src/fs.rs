//! Filesystem syscalls, mostly the `*at` family.
//!
//! Directory-relative operations take a [`BorrowedFd`] for the directory;
//! an `O_PATH` descriptor is accepted everywhere the kernel accepts one.

use std::ffi::{CString, OsString};
use std::os::fd::{BorrowedFd, OwnedFd};
use std::os::unix::ffi::OsStringExt;
use std::path::Path;

use rustix::fs::{AtFlags, Dir, Mode, OFlags, RenameFlags};

use crate::error::{ErrnoContext, SysError};

pub use rustix::fs::{FileType, Stat};

/// Opens `path`, unconditionally adding `O_CLOEXEC`.
pub fn open(path: &Path, flags: OFlags, mode: u32) -> Result<OwnedFd, SysError> {
    rustix::fs::open(path, flags | OFlags::CLOEXEC, Mode::from_raw_mode(mode)).ctx("open")
}

/// Opens `path` relative to `dirfd`, unconditionally adding `O_CLOEXEC`.
pub fn open_at(
    dirfd: BorrowedFd<'_>,
    path: impl rustix::path::Arg,
    flags: OFlags,
    mode: u32,
) -> Result<OwnedFd, SysError> {
    rustix::fs::openat(dirfd, path, flags | OFlags::CLOEXEC, Mode::from_raw_mode(mode)).ctx("openat")
}

/// Creates the directory `path` relative to `dirfd`.
pub fn mkdir_at(dirfd: BorrowedFd<'_>, path: &str, mode: u32) -> Result<(), SysError> {
    rustix::fs::mkdirat(dirfd, path, Mode::from_raw_mode(mode)).ctx("mkdirat")
}

/// Creates a symlink at `linkpath` (relative to `dirfd`) pointing to `target`.
pub fn symlink_at(target: &str, dirfd: BorrowedFd<'_>, linkpath: &str) -> Result<(), SysError> {
    rustix::fs::symlinkat(target, dirfd, linkpath).ctx("symlinkat")
}

/// Reads the target of the symlink at `path` relative to `dirfd`.
pub fn read_link_at(dirfd: BorrowedFd<'_>, path: impl rustix::path::Arg) -> Result<OsString, SysError> {
    let target = rustix::fs::readlinkat(dirfd, path, Vec::new()).ctx("readlinkat")?;
    Ok(OsString::from_vec(target.into_bytes()))
}

/// Reads the target of the symlink at an absolute `path`.
pub fn read_link(path: &Path) -> Result<OsString, SysError> {
    let target = rustix::fs::readlinkat(rustix::fs::CWD, path, Vec::new()).ctx("readlink")?;
    Ok(OsString::from_vec(target.into_bytes()))
}

/// Stats `path` relative to `dirfd` without following a trailing symlink.
pub fn stat_at(dirfd: BorrowedFd<'_>, path: impl rustix::path::Arg) -> Result<Stat, SysError> {
    rustix::fs::statat(dirfd, path, AtFlags::SYMLINK_NOFOLLOW).ctx("fstatat")
}

/// Renames without replacing an existing target (`renameat2` +
/// `RENAME_NOREPLACE`). Fails with `EEXIST` if the target exists.
pub fn rename_noreplace(
    old_dirfd: BorrowedFd<'_>,
    old_path: &Path,
    new_dirfd: BorrowedFd<'_>,
    new_path: &str,
) -> Result<(), SysError> {
    rustix::fs::renameat_with(old_dirfd, old_path, new_dirfd, new_path, RenameFlags::NOREPLACE)
        .ctx("renameat2")
}

/// Lists the entry names of the directory open at `dirfd`, excluding `.`
/// and `..`, in readdir order.
///
/// `dirfd` must be readable (`O_RDONLY`, not `O_PATH`): listing uses
/// `fdopendir(3)` on a duplicate of it.
pub fn read_dir_names(dirfd: BorrowedFd<'_>) -> Result<Vec<CString>, SysError> {
    let dir = Dir::read_from(dirfd).ctx("fdopendir")?;
    let mut names = Vec::new();
    for entry in dir {
        let entry = entry.ctx("readdir")?;
        let name = entry.file_name();
        if name.to_bytes() == b"." || name.to_bytes() == b".." {
            continue;
        }
        names.push(name.to_owned());
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Write;
    use std::os::fd::AsFd;

    use rustix::io::Errno;
    use tempfile::TempDir;

    use super::*;

    fn open_tree(dir: &TempDir) -> OwnedFd {
        open(dir.path(), OFlags::DIRECTORY | OFlags::PATH, 0).unwrap()
    }

    #[test]
    fn open_sets_cloexec() {
        let tmp = TempDir::new().unwrap();
        let fd = open_tree(&tmp);
        let flags = rustix::io::fcntl_getfd(&fd).unwrap();
        assert!(flags.contains(rustix::io::FdFlags::CLOEXEC));
    }

    #[test]
    fn mkdir_and_open_relative() {
        let tmp = TempDir::new().unwrap();
        let root = open_tree(&tmp);
        mkdir_at(root.as_fd(), "sub", 0o755).unwrap();

        let fd = open_at(
            root.as_fd(),
            "sub/file",
            OFlags::CREATE | OFlags::WRONLY,
            0o644,
        )
        .unwrap();
        File::from(fd).write_all(b"hi").unwrap();
        assert_eq!(std::fs::read(tmp.path().join("sub/file")).unwrap(), b"hi");
    }

    #[test]
    fn symlink_roundtrip_without_following() {
        let tmp = TempDir::new().unwrap();
        let root = open_tree(&tmp);
        symlink_at("dangling-target", root.as_fd(), "link").unwrap();

        let target = read_link_at(root.as_fd(), "link").unwrap();
        assert_eq!(target, OsString::from("dangling-target"));

        let st = stat_at(root.as_fd(), "link").unwrap();
        assert_eq!(FileType::from_raw_mode(st.st_mode), FileType::Symlink);
    }

    #[test]
    fn rename_noreplace_reports_eexist() {
        let tmp = TempDir::new().unwrap();
        let root = open_tree(&tmp);
        std::fs::write(tmp.path().join("a"), "a").unwrap();
        std::fs::write(tmp.path().join("b"), "b").unwrap();

        let err = rename_noreplace(root.as_fd(), Path::new("a"), root.as_fd(), "b").unwrap_err();
        assert_eq!(err.errno(), Errno::EXIST);
        assert_eq!(std::fs::read(tmp.path().join("b")).unwrap(), b"b");

        rename_noreplace(root.as_fd(), Path::new("a"), root.as_fd(), "c").unwrap();
        assert_eq!(std::fs::read(tmp.path().join("c")).unwrap(), b"a");
    }

    #[test]
    fn read_dir_names_skips_dot_entries() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("x"), "").unwrap();
        std::fs::create_dir(tmp.path().join("y")).unwrap();

        let fd = open(tmp.path(), OFlags::DIRECTORY | OFlags::RDONLY, 0).unwrap();
        let mut names = read_dir_names(fd.as_fd()).unwrap();
        names.sort();
        let names: Vec<&[u8]> = names.iter().map(|n| n.to_bytes()).collect();
        assert_eq!(names, vec![b"x".as_slice(), b"y".as_slice()]);
    }
}
