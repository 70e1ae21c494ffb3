// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

#[cfg(test)]
#[path = "./inodes_test.rs"]
mod inodes_test;

/// The inode of the root directory, as required by FUSE
pub const ROOT_INODE: u64 = 1;

#[derive(Debug)]
struct Inode {
    /// The current location of this inode, or none once it's been removed
    path: Option<PathBuf>,
    /// The number of lookups that the kernel has not yet forgotten
    lookups: u64,
}

/// Assigns inode numbers to paths within the mount.
///
/// Inodes are handed out on first use and live until the kernel
/// forgets every lookup of them. The root is always [`ROOT_INODE`].
#[derive(Debug)]
pub struct InodeTable {
    inodes: DashMap<u64, Inode>,
    by_path: DashMap<PathBuf, u64>,
    next_inode: AtomicU64,
    portable: bool,
    free: Mutex<Vec<u64>>,
}

impl InodeTable {
    /// Create a table holding only the root.
    ///
    /// Portable tables keep all inode numbers within 32 bits,
    /// reusing numbers once they are forgotten.
    pub fn new(portable: bool) -> Self {
        let table = Self {
            inodes: DashMap::new(),
            by_path: DashMap::new(),
            next_inode: AtomicU64::new(ROOT_INODE + 1),
            portable,
            free: Mutex::new(Vec::new()),
        };
        table.inodes.insert(
            ROOT_INODE,
            Inode {
                path: Some(PathBuf::new()),
                // the root is never forgotten
                lookups: 1,
            },
        );
        table.by_path.insert(PathBuf::new(), ROOT_INODE);
        table
    }

    pub fn len(&self) -> usize {
        self.inodes.len()
    }

    /// The path of an inode, relative to the root of the mount
    pub fn path(&self, ino: u64) -> Option<PathBuf> {
        self.inodes.get(&ino).and_then(|i| i.path.clone())
    }

    /// The inode currently assigned to a path, if any
    pub fn get(&self, path: &Path) -> Option<u64> {
        self.by_path.get(path).map(|i| *i)
    }

    /// Get the inode for a path, allocating one if needed, and
    /// count a lookup of it on behalf of the kernel
    pub fn lookup(&self, path: &Path) -> Option<u64> {
        loop {
            let ino = self.get_or_allocate(path)?;
            if let Some(mut inode) = self.inodes.get_mut(&ino) {
                if inode.path.as_deref() == Some(path) {
                    inode.lookups += 1;
                    return Some(ino);
                }
            }
            // forgotten since it was found, so drop the
            // stale mapping and allocate a fresh inode
            self.by_path.remove_if(path, |_, current| *current == ino);
        }
    }

    /// Get the inode for a path, allocating one if needed.
    ///
    /// Returns none when a portable table has run out of numbers.
    pub fn get_or_allocate(&self, path: &Path) -> Option<u64> {
        match self.by_path.entry(path.to_owned()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => Some(*entry.get()),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let ino = self.allocate_inode()?;
                self.inodes.insert(
                    ino,
                    Inode {
                        path: Some(path.to_owned()),
                        lookups: 0,
                    },
                );
                entry.insert(ino);
                Some(ino)
            }
        }
    }

    fn allocate_inode(&self) -> Option<u64> {
        if !self.portable {
            return Some(self.next_inode.fetch_add(1, Ordering::Relaxed));
        }
        if let Some(ino) = self.free.lock().ok().and_then(|mut free| free.pop()) {
            return Some(ino);
        }
        let ino = self.next_inode.fetch_add(1, Ordering::Relaxed);
        (ino <= u64::from(u32::MAX)).then_some(ino)
    }

    /// Drop `count` lookups of an inode, releasing it when none remain
    pub fn forget(&self, ino: u64, count: u64) {
        if ino == ROOT_INODE {
            return;
        }
        let removed = self
            .inodes
            .remove_if_mut(&ino, |_, inode| {
                inode.lookups = inode.lookups.saturating_sub(count);
                inode.lookups == 0
            })
            .map(|(_, inode)| inode);
        let Some(inode) = removed else {
            return;
        };
        if let Some(path) = inode.path {
            self.by_path.remove_if(&path, |_, current| *current == ino);
        }
        if self.portable {
            if let Ok(mut free) = self.free.lock() {
                free.push(ino);
            }
        }
    }

    /// Detach a removed path from its inode.
    ///
    /// The inode itself lives on until it is forgotten.
    pub fn remove(&self, path: &Path) {
        if let Some((_, ino)) = self.by_path.remove(path) {
            if let Some(mut inode) = self.inodes.get_mut(&ino) {
                inode.path = None;
            }
        }
    }

    /// Move the inode of `from`, and of everything below it, to `to`
    pub fn rename(&self, from: &Path, to: &Path) {
        self.remove(to);
        let moved: Vec<(PathBuf, u64)> = self
            .by_path
            .iter()
            .filter(|e| e.key().starts_with(from))
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        for (old, ino) in moved {
            let Ok(suffix) = old.strip_prefix(from) else {
                continue;
            };
            let new = if suffix.as_os_str().is_empty() {
                to.to_owned()
            } else {
                to.join(suffix)
            };
            // the inode moves first, so a lookup that finds the new
            // mapping always sees a matching inode
            if let Some(mut inode) = self.inodes.get_mut(&ino) {
                inode.path = Some(new.clone());
            }
            self.by_path.remove(&old);
            self.by_path.insert(new, ino);
        }
    }
}
