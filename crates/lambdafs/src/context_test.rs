// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::path::Path;

use rstest::{fixture, rstest};

use super::MountContext;
use crate::{Config, Freshness};

#[fixture]
fn tmpdir() -> tempfile::TempDir {
    tempfile::Builder::new()
        .prefix("lambdafs-test-")
        .tempdir()
        .expect("create a temp directory for test files")
}

#[rstest]
fn test_from_default_config(tmpdir: tempfile::TempDir) {
    let rw = tmpdir.path().join("rw");
    let ro = tmpdir.path().join("ro");
    std::fs::create_dir(&rw).unwrap();
    std::fs::create_dir(&ro).unwrap();
    std::fs::write(ro.join("a.txt"), "world").unwrap();

    let context = MountContext::from_config(
        tmpdir.path().join("mnt"),
        &rw,
        vec![ro.clone()],
        &Config::default(),
    )
    .unwrap();
    assert_eq!(context.rw_dir(), rw);
    assert_eq!(context.ro_dirs(), [ro]);

    assert_eq!(
        context.ensure_fresh(Path::new("a.txt")).unwrap(),
        Freshness::Regenerated { bytes: 11 }
    );
    assert_eq!(
        context.union().read_file(Path::new("a.txt")).unwrap(),
        b"world\nhello"
    );
    assert_eq!(context.layer().tracker().len(), 1);
}

#[rstest]
fn test_from_config_with_patterns(tmpdir: tempfile::TempDir) {
    let rw = tmpdir.path().join("rw");
    let ro = tmpdir.path().join("ro");
    std::fs::create_dir(&rw).unwrap();
    std::fs::create_dir(&ro).unwrap();
    std::fs::write(ro.join("a.bin"), "world").unwrap();

    let mut config = Config::default();
    config.transform.patterns = vec!["*.txt".into()];
    let context =
        MountContext::from_config(tmpdir.path(), &rw, vec![ro.clone()], &config).unwrap();
    assert_eq!(
        context.ensure_fresh(Path::new("a.bin")).unwrap(),
        Freshness::Unqualified
    );

    config.transform.patterns = vec!["[bad".into()];
    MountContext::from_config(tmpdir.path(), &rw, vec![ro], &config)
        .expect_err("invalid patterns should be rejected");
}
