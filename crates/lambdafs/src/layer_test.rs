// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use rstest::{fixture, rstest};

use super::{Freshness, LambdaLayer};
use crate::transform::AppendTransform;
use crate::{BranchUnion, Error, OsError, PathFilter, Transform, UnionFileSystem};

/// Counts invocations of the wrapped transform, optionally failing them
struct Counting {
    inner: AppendTransform,
    calls: AtomicUsize,
    fail: AtomicBool,
}

impl Counting {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: AppendTransform::new("\nhello"),
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Transform for Counting {
    fn transform(&self, path: &Path) -> crate::Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::String("transform failed on purpose".into()));
        }
        self.inner.transform(path)
    }
}

struct Mount {
    _tmpdir: tempfile::TempDir,
    rw: PathBuf,
    ro: PathBuf,
    union: Arc<BranchUnion>,
}

#[fixture]
fn mount() -> Mount {
    let tmpdir = tempfile::Builder::new()
        .prefix("lambdafs-test-")
        .tempdir()
        .expect("create a temp directory for test files");
    let rw = tmpdir.path().join("rw");
    let ro = tmpdir.path().join("ro");
    std::fs::create_dir(&rw).unwrap();
    std::fs::create_dir(&ro).unwrap();
    std::fs::write(ro.join("a.txt"), "world").unwrap();
    let union = Arc::new(BranchUnion::new(&rw, [&ro]));
    Mount {
        _tmpdir: tmpdir,
        rw,
        ro,
        union,
    }
}

fn touch(path: &Path, modified: SystemTime) {
    std::fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(modified)
        .unwrap();
}

#[rstest]
fn test_scenario_append_hello(mount: Mount) {
    let counter = Counting::new();
    let layer = LambdaLayer::new(mount.union.clone(), counter.clone());
    let path = Path::new("a.txt");

    // first read triggers exactly one transform
    assert_eq!(
        layer.ensure_fresh(path).unwrap(),
        Freshness::Regenerated { bytes: 11 }
    );
    assert_eq!(counter.calls(), 1);
    assert_eq!(mount.union.read_file(path).unwrap(), b"world\nhello");
    assert_eq!(
        std::fs::read(mount.rw.join("a.txt")).unwrap(),
        b"world\nhello"
    );
    assert_eq!(
        std::fs::read(mount.ro.join("a.txt")).unwrap(),
        b"world",
        "the source is never modified"
    );

    // a second read is served without running the transform
    assert_eq!(layer.ensure_fresh(path).unwrap(), Freshness::Current);
    assert_eq!(counter.calls(), 1);
    assert_eq!(mount.union.read_file(path).unwrap(), b"world\nhello");

    // touching the source triggers a second run
    touch(
        &mount.ro.join("a.txt"),
        SystemTime::now() + Duration::from_secs(3600),
    );
    assert!(matches!(
        layer.ensure_fresh(path).unwrap(),
        Freshness::Regenerated { .. }
    ));
    assert_eq!(counter.calls(), 2);
    assert_eq!(
        mount.union.read_file(path).unwrap(),
        b"world\nhello",
        "the transform is always applied to the source, never to its own output"
    );
}

#[rstest]
fn test_cold_start_is_stale(mount: Mount) {
    let counter = Counting::new();
    let layer = LambdaLayer::new(mount.union.clone(), counter.clone());
    let path = Path::new("a.txt");
    let source = mount.union.source(path).unwrap().unwrap();
    assert!(layer.tracker().is_stale(path, source.modified));
    assert!(layer.tracker().is_empty());

    layer.ensure_fresh(path).unwrap();
    assert_eq!(counter.calls(), 1);
    assert!(!layer.tracker().is_stale(path, source.modified));
}

#[rstest]
fn test_paths_are_normalized(mount: Mount) {
    let counter = Counting::new();
    let layer = LambdaLayer::new(mount.union.clone(), counter.clone());
    layer.ensure_fresh(Path::new("/a.txt")).unwrap();
    assert_eq!(
        layer.ensure_fresh(Path::new("./a.txt")).unwrap(),
        Freshness::Current
    );
    assert_eq!(counter.calls(), 1);

    let err = layer
        .ensure_fresh(Path::new("../a.txt"))
        .expect_err("should not escape the mount");
    assert_eq!(err.os_error(), Some(libc::EINVAL));
}

#[rstest]
fn test_failure_leaves_record_untouched(mount: Mount) {
    let counter = Counting::new();
    let layer = LambdaLayer::new(mount.union.clone(), counter.clone());
    let path = Path::new("a.txt");

    counter.fail.store(true, Ordering::SeqCst);
    let err = layer.ensure_fresh(path).expect_err("transform should fail");
    assert!(matches!(err, Error::Transform(..)), "{err:?}");
    assert_eq!(err.os_error(), Some(libc::EIO));
    assert_eq!(layer.tracker().last_processed(path), None);
    assert!(
        !mount.rw.join("a.txt").exists(),
        "nothing is written for a failed transform"
    );

    // the very next access retries
    counter.fail.store(false, Ordering::SeqCst);
    assert!(matches!(
        layer.ensure_fresh(path).unwrap(),
        Freshness::Regenerated { .. }
    ));
    assert_eq!(counter.calls(), 2);
    assert!(layer.tracker().last_processed(path).is_some());
}

#[rstest]
fn test_failure_after_success_keeps_old_content(mount: Mount) {
    let counter = Counting::new();
    let layer = LambdaLayer::new(mount.union.clone(), counter.clone());
    let path = Path::new("a.txt");
    layer.ensure_fresh(path).unwrap();
    let recorded = layer.tracker().last_processed(path);

    touch(
        &mount.ro.join("a.txt"),
        SystemTime::now() + Duration::from_secs(3600),
    );
    counter.fail.store(true, Ordering::SeqCst);
    layer.ensure_fresh(path).expect_err("transform should fail");
    assert_eq!(layer.tracker().last_processed(path), recorded);
    assert_eq!(mount.union.read_file(path).unwrap(), b"world\nhello");
}

#[rstest]
fn test_write_back_failure_leaves_record_untouched(mount: Mount) {
    let counter = Counting::new();
    let layer = LambdaLayer::new(mount.union.clone(), counter.clone());
    let path = Path::new("a.txt");

    // a directory in the writable branch cannot be replaced by the new content
    std::fs::create_dir(mount.rw.join("a.txt")).unwrap();
    let err = layer.ensure_fresh(path).expect_err("write back should fail");
    assert!(matches!(err, Error::WriteBack(..)), "{err:?}");
    assert_eq!(err.os_error(), Some(libc::EIO));
    assert_eq!(layer.tracker().last_processed(path), None);
    assert_eq!(counter.calls(), 1);

    std::fs::remove_dir(mount.rw.join("a.txt")).unwrap();
    assert!(matches!(
        layer.ensure_fresh(path).unwrap(),
        Freshness::Regenerated { .. }
    ));
    assert_eq!(counter.calls(), 2);
    assert!(layer.tracker().last_processed(path).is_some());
    assert_eq!(mount.union.read_file(path).unwrap(), b"world\nhello");
}

#[rstest]
fn test_unqualified_paths(mount: Mount) {
    let counter = Counting::new();
    let layer = LambdaLayer::new(mount.union.clone(), counter.clone())
        .with_filter(PathFilter::new(["*.txt"]).unwrap());
    std::fs::write(mount.ro.join("b.bin"), "binary").unwrap();
    std::fs::write(mount.rw.join("only-rw.txt"), "local").unwrap();
    std::fs::create_dir(mount.ro.join("dir.txt")).unwrap();

    for path in ["b.bin", "only-rw.txt", "dir.txt", "missing.txt"] {
        assert_eq!(
            layer.ensure_fresh(Path::new(path)).unwrap(),
            Freshness::Unqualified,
            "{path}"
        );
    }
    assert_eq!(counter.calls(), 0);
    assert_eq!(std::fs::read(mount.ro.join("b.bin")).unwrap(), b"binary");
}

#[rstest]
fn test_mode_is_copied_from_source(mount: Mount) {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(
        mount.ro.join("a.txt"),
        std::fs::Permissions::from_mode(0o751),
    )
    .unwrap();
    let layer = LambdaLayer::new(mount.union.clone(), Counting::new());
    layer.ensure_fresh(Path::new("a.txt")).unwrap();
    let mode = std::fs::metadata(mount.rw.join("a.txt"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o7777, 0o751);
}

#[rstest]
fn test_concurrent_refreshes(mount: Mount) {
    let counter = Counting::new();
    let layer = LambdaLayer::new(mount.union.clone(), counter.clone());
    let path = Path::new("a.txt");
    let before = SystemTime::now();

    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| scope.spawn(|| layer.ensure_fresh(path)))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let regenerated = results
        .iter()
        .filter(|r| matches!(r, Ok(Freshness::Regenerated { .. })))
        .count();
    assert!(regenerated >= 1, "{results:?}");
    assert!(results.iter().all(|r| r.is_ok()), "{results:?}");
    assert_eq!(counter.calls(), regenerated);
    let recorded = layer
        .tracker()
        .last_processed(path)
        .expect("a successful refresh is always recorded");
    assert!(recorded >= before);
    assert_eq!(mount.union.read_file(path).unwrap(), b"world\nhello");
}
