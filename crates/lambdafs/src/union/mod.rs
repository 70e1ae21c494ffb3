// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! The merged view of a writable branch over read-only branches.
//!
//! All paths given to a [`UnionFileSystem`] are relative to the root of
//! the union, with the empty path naming the root itself.

use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use crate::{Error, Result};

mod branch;

pub use branch::BranchUnion;

/// The read-only copy of a file that transformed content is derived from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Absolute path to the file within its read-only branch
    pub path: PathBuf,
    /// The last modification time of the file
    pub modified: SystemTime,
    /// Permission bits of the file
    pub mode: u32,
}

/// One name in a merged directory listing
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: OsString,
    pub file_type: std::fs::FileType,
}

/// Usage information for the storage behind the writable branch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatFs {
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub files: u64,
    pub files_free: u64,
    pub block_size: u32,
    pub name_max: u32,
    pub fragment_size: u32,
}

/// A filesystem made of a writable branch layered over read-only ones.
///
/// Reads resolve each path to the topmost branch that holds it, writes
/// always land in the writable branch, and removals of read-only
/// content are recorded rather than performed.
pub trait UnionFileSystem: Send + Sync {
    /// Metadata of the path in the merged view, without following symlinks
    fn stat(&self, path: &Path) -> Result<std::fs::Metadata>;

    /// Locate the read-only copy of a regular file, if one is visible
    fn source(&self, path: &Path) -> Result<Option<SourceFile>>;

    /// Read the full content of a file in the merged view
    fn read_file(&self, path: &Path) -> Result<Vec<u8>>;

    /// Replace the content of a file in the writable branch,
    /// creating any missing parent directories
    fn write_file(&self, path: &Path, data: &[u8], mode: u32) -> Result<()>;

    /// List a directory in the merged view
    fn read_dir(&self, path: &Path) -> Result<Vec<DirEntry>>;

    /// Open an existing file with the given open(2) flags,
    /// copying it into the writable branch when opened for writing
    fn open(&self, path: &Path, flags: i32) -> Result<std::fs::File>;

    /// Create a new file in the writable branch
    fn create(&self, path: &Path, mode: u32, flags: i32) -> Result<std::fs::File>;

    fn mkdir(&self, path: &Path, mode: u32) -> Result<()>;
    fn unlink(&self, path: &Path) -> Result<()>;
    fn rmdir(&self, path: &Path) -> Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;
    fn symlink(&self, target: &Path, link: &Path) -> Result<()>;
    fn readlink(&self, path: &Path) -> Result<PathBuf>;
    fn link(&self, existing: &Path, new: &Path) -> Result<()>;
    fn set_mode(&self, path: &Path, mode: u32) -> Result<()>;
    fn set_owner(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()>;
    fn truncate(&self, path: &Path, size: u64) -> Result<()>;
    fn set_times(
        &self,
        path: &Path,
        accessed: Option<SystemTime>,
        modified: Option<SystemTime>,
    ) -> Result<()>;
    fn statfs(&self) -> Result<StatFs>;
}

/// Normalize a path to be relative to the root of the union.
///
/// Leading separators and `.` components are dropped, and any attempt
/// to climb out with `..` is rejected.
pub fn relative_path(path: &Path) -> Result<PathBuf> {
    let mut relative = PathBuf::new();
    for component in path.components() {
        match component {
            Component::RootDir | Component::CurDir => continue,
            Component::Normal(name) => relative.push(name),
            Component::ParentDir | Component::Prefix(_) => {
                return Err(Error::InvalidPath(path.to_owned()));
            }
        }
    }
    Ok(relative)
}
