//! Orchestrator semantics that need no container: skeleton layout, output
//! hashing and installation, failure collection, and cache idempotence,
//! exercised with plain-Rust action callbacks.

use std::fs::File;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use serial_test::serial;
use tempfile::TempDir;

use floe_lib::sandbox::RunError;
use floe_lib::{ActionContext, ActionStatus, Context, ObjectHash, UserError, perform_action};
use floe_platform::{OFlags, fs, io};

fn open_context(tmp: &TempDir) -> Context {
    Context::open(&tmp.path().join("state")).unwrap()
}

fn write_output(action_context: &ActionContext<'_>, name: &str, contents: &str) {
    let fd = fs::open_at(
        action_context.scratch_dir,
        format!("outputs/{name}").as_str(),
        OFlags::CREATE | OFlags::WRONLY,
        0o644,
    )
    .unwrap();
    File::from(fd).write_all(contents.as_bytes()).unwrap();
}

fn write_log(action_context: &ActionContext<'_>, line: &str) {
    let dup = io::dup_cloexec(action_context.log_file).unwrap();
    File::from(dup).write_all(line.as_bytes()).unwrap();
}

/// The scratch directory, resolved back to a path for std::fs assertions.
fn scratch_path(action_context: &ActionContext<'_>) -> PathBuf {
    let fd = action_context.scratch_dir.as_raw_fd();
    std::fs::read_link(format!("/proc/self/fd/{fd}")).unwrap()
}

fn cache_dir(tmp: &TempDir) -> PathBuf {
    tmp.path().join("state/cached-outputs")
}

#[test]
#[serial]
fn success_installs_hashed_outputs() {
    let tmp = TempDir::new().unwrap();
    let context = open_context(&tmp);

    let status = perform_action(&context, &[PathBuf::from("m.o")], |action_context| {
        write_output(action_context, "m.o", "hi\n");
        Ok(())
    })
    .unwrap();
    assert!(status.is_success());

    // The entry is named by the canonical encoding's BLAKE3 digest and
    // keeps the output's contents and mode.
    let mut encoded: Vec<u8> = vec![0x00, 0x01, 0xA4];
    encoded.extend(3u64.to_be_bytes());
    encoded.extend(b"hi\n");
    let hash: ObjectHash = blake3::hash(&encoded).into();

    let entry = cache_dir(&tmp).join(hash.to_hex());
    assert_eq!(std::fs::read(&entry).unwrap(), b"hi\n");
    assert_eq!(entry.metadata().unwrap().permissions().mode() & 0o777, 0o644);
}

#[test]
#[serial]
fn skeleton_is_laid_out_before_the_action_runs() {
    let tmp = TempDir::new().unwrap();
    let context = open_context(&tmp);

    let status = perform_action(&context, &[], |action_context| {
        let root = scratch_path(action_context);
        for dir in ["bin", "nix/store", "proc", "usr/bin", "build", "outputs"] {
            assert!(root.join(dir).is_dir(), "missing {dir}");
        }
        assert_eq!(root.join("proc").metadata().unwrap().permissions().mode() & 0o777, 0o555);
        assert!(root.join("bin/sh").is_symlink());
        assert!(root.join("usr/bin/env").is_symlink());
        assert!(root.join("build.log").is_file());
        Ok(())
    })
    .unwrap();
    assert!(status.is_success());
}

#[test]
#[serial]
fn missing_outputs_are_collected_not_short_circuited() {
    let tmp = TempDir::new().unwrap();
    let context = open_context(&tmp);

    let outputs = [PathBuf::from("m.o"), PathBuf::from("lib.a"), PathBuf::from("gone")];
    let status = perform_action(&context, &outputs, |action_context| {
        write_output(action_context, "m.o", "present");
        Ok(())
    })
    .unwrap();

    let ActionStatus::Failure { cause, .. } = status else {
        panic!("expected failure, got {status:?}");
    };
    let UserError::OutputsInaccessible { causes } = cause else {
        panic!("expected OutputsInaccessible, got {cause}");
    };
    let missing: Vec<_> = causes.keys().cloned().collect();
    assert_eq!(missing, vec![PathBuf::from("gone"), PathBuf::from("lib.a")]);

    // Nothing is installed unless every output hashed cleanly.
    assert!(!cache_dir(&tmp).exists() || std::fs::read_dir(cache_dir(&tmp)).unwrap().count() == 0);
}

#[test]
#[serial]
fn deleted_outputs_directory_is_a_user_error() {
    let tmp = TempDir::new().unwrap();
    let context = open_context(&tmp);

    let status = perform_action(&context, &[PathBuf::from("m.o")], |action_context| {
        std::fs::remove_dir(scratch_path(action_context).join("outputs")).unwrap();
        Ok(())
    })
    .unwrap();

    let ActionStatus::Failure { cause, .. } = status else {
        panic!("expected failure, got {status:?}");
    };
    assert!(matches!(cause, UserError::OutputsDirectoryInaccessible { .. }));
}

#[test]
#[serial]
fn failing_action_reports_its_log_and_cause() {
    let tmp = TempDir::new().unwrap();
    let context = open_context(&tmp);

    let status = perform_action(&context, &[], |action_context| {
        write_log(action_context, "cc: error: no such file: m.c\n");
        Err(RunError::Terminated(ExitStatus::from_raw(7 << 8)))
    })
    .unwrap();

    let ActionStatus::Failure { log, cause } = status else {
        panic!("expected failure, got {status:?}");
    };
    assert_eq!(log, b"cc: error: no such file: m.c\n");
    let UserError::Termination { status } = cause else {
        panic!("expected Termination, got {cause}");
    };
    assert_eq!(status.code(), Some(7));
}

#[test]
#[serial]
fn identical_outputs_across_actions_deduplicate() {
    let tmp = TempDir::new().unwrap();
    let context = open_context(&tmp);

    for _ in 0..2 {
        let status = perform_action(&context, &[PathBuf::from("m.o")], |action_context| {
            write_output(action_context, "m.o", "hi\n");
            Ok(())
        })
        .unwrap();
        assert!(status.is_success());
    }

    assert_eq!(std::fs::read_dir(cache_dir(&tmp)).unwrap().count(), 1);
}

#[test]
#[serial]
fn symlink_outputs_are_installed_as_symlinks() {
    let tmp = TempDir::new().unwrap();
    let context = open_context(&tmp);

    let status = perform_action(&context, &[PathBuf::from("link")], |action_context| {
        let root = scratch_path(action_context);
        std::os::unix::fs::symlink("/outside/the/outputs", root.join("outputs/link")).unwrap();
        Ok(())
    })
    .unwrap();
    assert!(status.is_success());

    // Hashed from the target string, never dereferenced.
    let mut encoded: Vec<u8> = vec![0x02];
    encoded.extend(b"/outside/the/outputs\0");
    let hash: ObjectHash = blake3::hash(&encoded).into();

    let entry = cache_dir(&tmp).join(hash.to_hex());
    assert!(entry.is_symlink());
    assert_eq!(std::fs::read_link(&entry).unwrap(), Path::new("/outside/the/outputs"));
}

#[test]
#[serial]
fn orchestrator_leaks_no_descriptors() {
    let tmp = TempDir::new().unwrap();
    let context = open_context(&tmp);

    let run = |context: &Context| {
        perform_action(context, &[PathBuf::from("m.o")], |action_context| {
            write_output(action_context, "m.o", "hi\n");
            Ok(())
        })
        .unwrap()
    };

    // First run warms up the Context's lazy subdirectory descriptors.
    run(&context);
    let open_fds = || std::fs::read_dir("/proc/self/fd").unwrap().count();
    let before = open_fds();
    run(&context);
    assert_eq!(open_fds(), before);
}
