// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::path::Path;

use rstest::rstest;

use super::{InodeTable, ROOT_INODE};

#[rstest]
fn test_root_is_preallocated() {
    let table = InodeTable::new(false);
    assert_eq!(table.path(ROOT_INODE), Some(Path::new("").to_owned()));
    assert_eq!(table.get(Path::new("")), Some(ROOT_INODE));
    table.forget(ROOT_INODE, 100);
    assert_eq!(table.len(), 1, "the root is never forgotten");
}

#[rstest]
fn test_lookup_is_stable() {
    let table = InodeTable::new(false);
    let a = table.lookup(Path::new("a.txt")).unwrap();
    let b = table.lookup(Path::new("b.txt")).unwrap();
    assert_ne!(a, b);
    assert_ne!(a, ROOT_INODE);
    assert_eq!(table.lookup(Path::new("a.txt")), Some(a));
    assert_eq!(table.path(a), Some(Path::new("a.txt").to_owned()));
}

#[rstest]
fn test_forget_releases_after_all_lookups() {
    let table = InodeTable::new(false);
    let ino = table.lookup(Path::new("a.txt")).unwrap();
    table.lookup(Path::new("a.txt")).unwrap();

    table.forget(ino, 1);
    assert!(table.path(ino).is_some(), "one lookup remains");
    table.forget(ino, 1);
    assert!(table.path(ino).is_none());
    assert!(table.get(Path::new("a.txt")).is_none());
}

#[rstest]
#[case(false)]
#[case(true)]
fn test_lookup_after_concurrent_forget(#[case] portable: bool) {
    let table = InodeTable::new(portable);
    let path = Path::new("a.txt");
    let stale = table.get_or_allocate(path).unwrap();
    // forgotten between finding the inode and counting the lookup,
    // leaving only the path mapping behind
    table.inodes.remove(&stale);
    assert_eq!(table.get(path), Some(stale));

    let ino = table.lookup(path).unwrap();
    assert_ne!(ino, stale);
    assert_eq!(table.get(path), Some(ino));
    assert_eq!(table.path(ino), Some(path.to_owned()));
    table.forget(ino, 1);
    assert!(table.get(path).is_none(), "the new lookup was counted");
}

#[rstest]
fn test_lookup_skips_reused_inode() {
    let table = InodeTable::new(true);
    let path = Path::new("a.txt");
    let stale = table.get_or_allocate(path).unwrap();
    // the number has since been handed to another path
    table.inodes.get_mut(&stale).unwrap().path = Some(Path::new("b.txt").to_owned());

    let ino = table.lookup(path).unwrap();
    assert_ne!(ino, stale);
    assert_eq!(table.path(ino), Some(path.to_owned()));
    assert_eq!(table.path(stale), Some(Path::new("b.txt").to_owned()));
}

#[rstest]
fn test_rename_moves_subtree() {
    let table = InodeTable::new(false);
    let dir = table.lookup(Path::new("dir")).unwrap();
    let file = table.lookup(Path::new("dir/nested/file")).unwrap();
    let other = table.lookup(Path::new("dirty")).unwrap();
    let replaced = table.lookup(Path::new("moved")).unwrap();

    table.rename(Path::new("dir"), Path::new("moved"));
    assert_eq!(table.path(dir), Some(Path::new("moved").to_owned()));
    assert_eq!(
        table.path(file),
        Some(Path::new("moved/nested/file").to_owned())
    );
    assert_eq!(
        table.path(other),
        Some(Path::new("dirty").to_owned()),
        "only whole path components are matched"
    );
    assert_eq!(table.path(replaced), None);
    assert_eq!(table.get(Path::new("moved")), Some(dir));
    assert_eq!(table.get(Path::new("dir")), None);
}

#[rstest]
fn test_remove_detaches_path() {
    let table = InodeTable::new(false);
    let ino = table.lookup(Path::new("a.txt")).unwrap();
    table.remove(Path::new("a.txt"));
    assert!(table.path(ino).is_none());
    let again = table.lookup(Path::new("a.txt")).unwrap();
    assert_ne!(again, ino, "a recreated file gets a new inode");
}

#[rstest]
#[case(false)]
#[case(true)]
fn test_portable_reuses_inodes(#[case] portable: bool) {
    let table = InodeTable::new(portable);
    let first = table.lookup(Path::new("a")).unwrap();
    table.forget(first, 1);
    let second = table.lookup(Path::new("b")).unwrap();
    if portable {
        assert_eq!(second, first, "portable inodes should be reused");
    } else {
        assert!(second > first, "inodes should only grow");
    }
}

#[rstest]
fn test_portable_inodes_fit_in_32_bits() {
    let table = InodeTable::new(true);
    table
        .next_inode
        .store(u64::from(u32::MAX), std::sync::atomic::Ordering::Relaxed);
    assert_eq!(table.lookup(Path::new("last")), Some(u64::from(u32::MAX)));
    assert_eq!(table.lookup(Path::new("overflow")), None);
}
