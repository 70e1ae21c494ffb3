// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use fuser::FileType;
use fuser::consts::FOPEN_DIRECT_IO;
use lambdafs::{BranchUnion, Error, LambdaLayer, MountContext, OsError};
use rstest::{fixture, rstest};

use super::{Config, Filesystem, attr_from_metadata, file_offset, file_type, negative_attr};

#[fixture]
fn tmpdir() -> tempfile::TempDir {
    tempfile::Builder::new()
        .prefix("lambdafs-test-")
        .tempdir()
        .expect("create a temp directory for test files")
}

/// A filesystem over a read-only branch holding a.txt, with a
/// transform that appends a suffix and counts its calls
struct Mounted {
    _tmpdir: tempfile::TempDir,
    fs: Filesystem,
    calls: Arc<AtomicUsize>,
    fail: Arc<AtomicBool>,
}

#[fixture]
fn mounted(tmpdir: tempfile::TempDir) -> Mounted {
    let rw = tmpdir.path().join("rw");
    let ro = tmpdir.path().join("ro");
    std::fs::create_dir(&rw).unwrap();
    std::fs::create_dir(&ro).unwrap();
    std::fs::write(ro.join("a.txt"), "world").unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let fail = Arc::new(AtomicBool::new(false));
    let transform = {
        let calls = Arc::clone(&calls);
        let fail = Arc::clone(&fail);
        move |path: &Path| -> lambdafs::Result<Vec<u8>> {
            calls.fetch_add(1, Ordering::SeqCst);
            if fail.load(Ordering::SeqCst) {
                return Err(Error::String("transform failed on purpose".into()));
            }
            let mut content = std::fs::read(path).unwrap();
            content.extend_from_slice(b"\nhello");
            Ok(content)
        }
    };
    let union = Arc::new(BranchUnion::new(&rw, [&ro]));
    let layer = LambdaLayer::new(union, Arc::new(transform));
    let context = MountContext::new(tmpdir.path().join("mnt"), &rw, vec![ro], layer);
    let fs = Filesystem::new(
        Arc::new(context),
        Config::from_settings(&Default::default()),
    );
    Mounted {
        _tmpdir: tmpdir,
        fs,
        calls,
        fail,
    }
}

fn read_all(mut file: std::fs::File) -> String {
    let mut content = String::new();
    file.read_to_string(&mut content).unwrap();
    content
}

#[rstest]
fn test_open_for_read_regenerates(mounted: Mounted) {
    let path = Path::new("a.txt");
    let (file, flags) = mounted.fs.open_file(path, libc::O_RDONLY).unwrap();
    assert_eq!(read_all(file), "world\nhello");
    assert_eq!(flags, FOPEN_DIRECT_IO);
    assert_eq!(mounted.calls.load(Ordering::SeqCst), 1);

    // already up to date, so the kernel may keep using its page cache
    let (file, flags) = mounted.fs.open_file(path, libc::O_RDWR).unwrap();
    assert_eq!(read_all(file), "world\nhello");
    assert_eq!(flags, 0);
    assert_eq!(mounted.calls.load(Ordering::SeqCst), 1);
}

#[rstest]
fn test_open_for_write_skips_transform(mounted: Mounted) {
    let (_file, flags) = mounted
        .fs
        .open_file(Path::new("a.txt"), libc::O_WRONLY)
        .unwrap();
    assert_eq!(flags, 0);
    assert_eq!(mounted.calls.load(Ordering::SeqCst), 0);
}

#[rstest]
fn test_open_fails_when_transform_fails(mounted: Mounted) {
    mounted.fail.store(true, Ordering::SeqCst);
    let err = mounted
        .fs
        .open_file(Path::new("a.txt"), libc::O_RDONLY)
        .expect_err("a failed transform should fail the open");
    assert_eq!(err.os_error(), Some(libc::EIO));
    assert_eq!(mounted.calls.load(Ordering::SeqCst), 1);

    mounted.fail.store(false, Ordering::SeqCst);
    let (file, flags) = mounted
        .fs
        .open_file(Path::new("a.txt"), libc::O_RDONLY)
        .unwrap();
    assert_eq!(read_all(file), "world\nhello");
    assert_eq!(flags, FOPEN_DIRECT_IO);
}

#[rstest]
fn test_attr_from_metadata(tmpdir: tempfile::TempDir) {
    let path = tmpdir.path().join("a.txt");
    std::fs::write(&path, "world\nhello").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o640)).unwrap();
    let meta = std::fs::symlink_metadata(&path).unwrap();

    let attr = attr_from_metadata(42, &meta);
    assert_eq!(attr.ino, 42);
    assert_eq!(attr.size, 11);
    assert_eq!(attr.perm, 0o640);
    assert_eq!(attr.kind, FileType::RegularFile);
    assert_eq!(attr.nlink, 1);
    assert_eq!(attr.mtime, meta.modified().unwrap());
}

#[rstest]
fn test_file_types(tmpdir: tempfile::TempDir) {
    let link = tmpdir.path().join("link");
    std::os::unix::fs::symlink("missing", &link).unwrap();
    let dir = std::fs::symlink_metadata(tmpdir.path()).unwrap();
    let link = std::fs::symlink_metadata(&link).unwrap();
    assert_eq!(file_type(dir.file_type()), FileType::Directory);
    assert_eq!(file_type(link.file_type()), FileType::Symlink);
}

#[rstest]
fn test_negative_attr_has_no_inode() {
    assert_eq!(negative_attr().ino, 0);
}

#[rstest]
#[case(0, Some(0))]
#[case(4096, Some(4096))]
#[case(-1, None)]
fn test_file_offset(#[case] offset: i64, #[case] expected: Option<u64>) {
    match (file_offset(offset), expected) {
        (Ok(actual), Some(expected)) => assert_eq!(actual, expected),
        (Err(err), None) => assert_eq!(err.os_error(), Some(libc::EINVAL)),
        (actual, expected) => panic!("expected {expected:?}, got {actual:?}"),
    }
}

#[rstest]
fn test_config_from_settings() {
    let settings = lambdafs::settings::Fuse {
        entry_ttl: 2.5,
        negative_ttl: 0.0,
        portable: true,
    };
    let config = Config::from_settings(&settings);
    assert_eq!(config.entry_ttl, Duration::from_millis(2500));
    assert_eq!(config.attr_ttl, config.entry_ttl);
    assert!(config.negative_ttl.is_zero());
    assert!(config.portable_inodes);
    assert!(config.mount_options.is_empty());
}
