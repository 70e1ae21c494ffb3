// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{DirBuilder, File, FileTimes, OpenOptions, Permissions};
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use data_encoding::HEXLOWER;
use moka::sync::Cache;

use super::{DirEntry, SourceFile, StatFs, UnionFileSystem};
use crate::{Error, Result, config};

#[cfg(test)]
#[path = "./branch_test.rs"]
mod branch_test;

/// Upper bound on the number of paths held by each lookup cache
const CACHE_CAPACITY: u64 = 64 * 1024;

/// A union of plain directories on the local filesystem.
///
/// The first branch is writable, all others are read-only and are
/// searched in the order given. Removing something that lives in a
/// read-only branch leaves a marker file in the writable branch's
/// deletion directory, named by the digest of the removed path and
/// holding the path itself.
pub struct BranchUnion {
    branches: Vec<PathBuf>,
    deletion_dirname: OsString,
    branch_cache: Option<Cache<PathBuf, Option<usize>>>,
    deletion_cache: Option<Cache<PathBuf, bool>>,
}

impl std::fmt::Debug for BranchUnion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BranchUnion")
            .field("branches", &self.branches)
            .field("deletion_dirname", &self.deletion_dirname)
            .finish_non_exhaustive()
    }
}

impl BranchUnion {
    /// Create a union with default settings
    pub fn new<W, R, P>(writable: W, read_only: R) -> Self
    where
        W: Into<PathBuf>,
        R: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self::from_settings(writable, read_only, &config::Union::default())
    }

    pub fn from_settings<W, R, P>(writable: W, read_only: R, settings: &config::Union) -> Self
    where
        W: Into<PathBuf>,
        R: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let branches = std::iter::once(writable.into())
            .chain(read_only.into_iter().map(Into::into))
            .collect();
        Self {
            branches,
            deletion_dirname: settings.deletion_dirname.clone().into(),
            branch_cache: None,
            deletion_cache: None,
        }
        .with_branch_cache_ttl(settings.branch_cache_ttl())
        .with_deletion_cache_ttl(settings.deletion_cache_ttl())
    }

    /// Name the directory used to record deletions
    pub fn with_deletion_dirname(mut self, name: impl Into<OsString>) -> Self {
        self.deletion_dirname = name.into();
        self
    }

    /// Cache the branch serving each path for this long, zero disables the cache
    ///
    /// Durations longer than [`config::MAX_TTL`] are clamped to it.
    pub fn with_branch_cache_ttl(mut self, ttl: Duration) -> Self {
        self.branch_cache = ttl_cache(ttl);
        self
    }

    /// Cache the deleted state of each path for this long, zero disables the cache
    pub fn with_deletion_cache_ttl(mut self, ttl: Duration) -> Self {
        self.deletion_cache = ttl_cache(ttl);
        self
    }

    pub fn writable_root(&self) -> &Path {
        &self.branches[0]
    }

    pub fn read_only_roots(&self) -> &[PathBuf] {
        &self.branches[1..]
    }

    fn is_hidden(&self, path: &Path) -> bool {
        path.components()
            .next()
            .is_some_and(|c| c.as_os_str() == self.deletion_dirname)
    }

    fn deletion_dir(&self) -> PathBuf {
        self.writable_root().join(&self.deletion_dirname)
    }

    fn deletion_marker(&self, path: &Path) -> PathBuf {
        let digest = ring::digest::digest(&ring::digest::SHA256, path.as_os_str().as_bytes());
        self.deletion_dir().join(HEXLOWER.encode(digest.as_ref()))
    }

    fn is_deleted(&self, path: &Path) -> bool {
        if path.as_os_str().is_empty() {
            return false;
        }
        let check = || exists(&self.deletion_marker(path));
        match &self.deletion_cache {
            Some(cache) => cache.get_with(path.to_owned(), check),
            None => check(),
        }
    }

    fn mark_deleted(&self, path: &Path) -> Result<()> {
        let dir = self.deletion_dir();
        std::fs::create_dir_all(&dir).map_err(io_err("create deletion directory", &dir))?;
        let marker = self.deletion_marker(path);
        std::fs::write(&marker, path.as_os_str().as_bytes())
            .map_err(io_err("record deletion", &marker))?;
        tracing::trace!(?path, "marked deleted");
        self.invalidate(path);
        Ok(())
    }

    fn clear_deleted(&self, path: &Path) -> Result<()> {
        let marker = self.deletion_marker(path);
        match std::fs::remove_file(&marker) {
            Ok(()) => tracing::trace!(?path, "cleared deletion"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(Error::Io("clear deletion", marker, err)),
        }
        self.invalidate(path);
        Ok(())
    }

    fn invalidate(&self, path: &Path) {
        if let Some(cache) = &self.branch_cache {
            cache.invalidate(path);
        }
        if let Some(cache) = &self.deletion_cache {
            cache.invalidate(path);
        }
    }

    fn invalidate_all(&self) {
        if let Some(cache) = &self.branch_cache {
            cache.invalidate_all();
        }
        if let Some(cache) = &self.deletion_cache {
            cache.invalidate_all();
        }
    }

    /// The index of the topmost branch holding `path`, if it is visible
    fn find_branch(&self, path: &Path) -> Option<usize> {
        if path.as_os_str().is_empty() {
            return Some(0);
        }
        if self.is_hidden(path) {
            return None;
        }
        let find = || {
            if self.is_deleted(path) {
                // only something recreated since the deletion is visible
                return exists(&self.writable_root().join(path)).then_some(0);
            }
            self.branches.iter().position(|b| exists(&b.join(path)))
        };
        match &self.branch_cache {
            Some(cache) => cache.get_with(path.to_owned(), find),
            None => find(),
        }
    }

    fn locate(&self, path: &Path) -> Result<PathBuf> {
        match self.find_branch(path) {
            Some(branch) => Ok(self.branches[branch].join(path)),
            None => Err(Error::not_found(path)),
        }
    }

    fn exists_below(&self, path: &Path) -> bool {
        self.read_only_roots()
            .iter()
            .any(|b| exists(&b.join(path)))
    }

    fn reject_hidden(&self, path: &Path) -> Result<()> {
        if path.as_os_str().is_empty() || self.is_hidden(path) {
            return Err(Error::new_errno(
                libc::EPERM,
                format!("{path:?} is reserved by the union"),
            ));
        }
        Ok(())
    }

    fn reject_existing(&self, path: &Path) -> Result<()> {
        if self.find_branch(path).is_some() {
            return Err(Error::new_errno(libc::EEXIST, format!("{path:?} exists")));
        }
        Ok(())
    }

    /// Make sure that the directory exists in the writable branch,
    /// copying the modes of read-only directories as needed
    fn ensure_dir(&self, dir: &Path) -> Result<()> {
        let target = self.writable_root().join(dir);
        if target.is_dir() {
            return Ok(());
        }
        if let Some(parent) = dir.parent() {
            self.ensure_dir(parent)?;
        }
        let metadata = self.stat(dir)?;
        if !metadata.is_dir() {
            return Err(Error::new_errno(
                libc::ENOTDIR,
                format!("{dir:?} is not a directory"),
            ));
        }
        let mode = metadata.permissions().mode() & 0o7777;
        match DirBuilder::new().mode(mode).create(&target) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
            Err(err) => return Err(Error::Io("create directory", target, err)),
        }
        // the umask may have limited what was created
        std::fs::set_permissions(&target, Permissions::from_mode(mode))
            .map_err(io_err("set directory mode", &target))?;
        self.invalidate(dir);
        Ok(())
    }

    fn ensure_parent(&self, path: &Path) -> Result<()> {
        match path.parent() {
            Some(parent) => self.ensure_dir(parent),
            None => Ok(()),
        }
    }

    /// Copy `path` into the writable branch if it only exists
    /// below, returning its location in the writable branch
    fn promote(&self, path: &Path) -> Result<PathBuf> {
        let branch = self
            .find_branch(path)
            .ok_or_else(|| Error::not_found(path))?;
        let target = self.writable_root().join(path);
        if branch == 0 {
            return Ok(target);
        }
        self.ensure_parent(path)?;
        let source = self.branches[branch].join(path);
        let metadata = source
            .symlink_metadata()
            .map_err(io_err("stat", &source))?;
        tracing::debug!(?path, branch, "copying up into the writable branch");
        let file_type = metadata.file_type();
        if file_type.is_symlink() {
            let link = std::fs::read_link(&source).map_err(io_err("read link", &source))?;
            std::os::unix::fs::symlink(link, &target).map_err(io_err("copy link", &target))?;
        } else if file_type.is_dir() {
            self.ensure_dir(path)?;
        } else {
            // the permission bits are copied along with the content
            std::fs::copy(&source, &target).map_err(io_err("copy up", &target))?;
        }
        self.invalidate(path);
        Ok(target)
    }

    /// Mark every name under a read-only directory as deleted, so
    /// that a directory recreated in its place starts out empty
    fn hide_read_only_children(&self, dir: &Path) -> Result<()> {
        for branch in self.read_only_roots() {
            let lower = branch.join(dir);
            if !lower.is_dir() {
                continue;
            }
            let entries = std::fs::read_dir(&lower).map_err(io_err("list directory", &lower))?;
            for entry in entries {
                let entry = entry.map_err(io_err("list directory", &lower))?;
                self.mark_deleted(&dir.join(entry.file_name()))?;
            }
        }
        self.invalidate_all();
        Ok(())
    }
}

impl UnionFileSystem for BranchUnion {
    fn stat(&self, path: &Path) -> Result<std::fs::Metadata> {
        let real = self.locate(path)?;
        real.symlink_metadata().map_err(io_err("stat", &real))
    }

    fn source(&self, path: &Path) -> Result<Option<SourceFile>> {
        if path.as_os_str().is_empty() || self.is_hidden(path) || self.is_deleted(path) {
            return Ok(None);
        }
        for branch in self.read_only_roots() {
            let candidate = branch.join(path);
            match candidate.symlink_metadata() {
                Ok(metadata) if metadata.is_file() => {
                    let modified = metadata
                        .modified()
                        .map_err(io_err("read modification time", &candidate))?;
                    return Ok(Some(SourceFile {
                        mode: metadata.permissions().mode() & 0o7777,
                        path: candidate,
                        modified,
                    }));
                }
                // anything other than a regular file masks lower branches
                Ok(_) => return Ok(None),
                Err(err) if is_missing(&err) => continue,
                Err(err) => return Err(Error::Io("stat source", candidate, err)),
            }
        }
        Ok(None)
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        let real = self.locate(path)?;
        std::fs::read(&real).map_err(io_err("read", &real))
    }

    fn write_file(&self, path: &Path, data: &[u8], mode: u32) -> Result<()> {
        self.reject_hidden(path)?;
        self.ensure_parent(path)?;
        let target = self.writable_root().join(path);

        // staged in the deletion directory, which is on the same
        // device but never listed, then moved over the target
        let staging = self.deletion_dir();
        std::fs::create_dir_all(&staging).map_err(io_err("create staging directory", &staging))?;
        let mut temp = tempfile::NamedTempFile::new_in(&staging)
            .map_err(io_err("create temporary file", &staging))?;
        temp.write_all(data)
            .map_err(io_err("write temporary file", temp.path()))?;
        temp.as_file()
            .set_permissions(Permissions::from_mode(mode))
            .map_err(io_err("set file mode", temp.path()))?;
        temp.persist(&target)
            .map_err(|err| Error::Io("replace", target.clone(), err.error))?;

        self.clear_deleted(path)
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<DirEntry>> {
        let winner = self
            .find_branch(path)
            .ok_or_else(|| Error::not_found(path))?;
        let mut entries = BTreeMap::new();
        for (index, branch) in self.branches.iter().enumerate().skip(winner) {
            let dir = branch.join(path);
            match dir.symlink_metadata() {
                Ok(metadata) if metadata.is_dir() => {}
                Ok(_) if index == winner => {
                    return Err(Error::new_errno(
                        libc::ENOTDIR,
                        format!("{path:?} is not a directory"),
                    ));
                }
                // a non-directory masks everything below it
                Ok(_) => break,
                Err(err) if is_missing(&err) => continue,
                Err(err) => return Err(Error::Io("stat", dir, err)),
            }
            let listing = std::fs::read_dir(&dir).map_err(io_err("list directory", &dir))?;
            for entry in listing {
                let entry = entry.map_err(io_err("list directory", &dir))?;
                let name = entry.file_name();
                if entries.contains_key(&name) {
                    continue;
                }
                let child = path.join(&name);
                if self.is_hidden(&child) || (index > 0 && self.is_deleted(&child)) {
                    continue;
                }
                let file_type = entry.file_type().map_err(io_err("stat", &entry.path()))?;
                entries.insert(name, file_type);
            }
        }
        Ok(entries
            .into_iter()
            .map(|(name, file_type)| DirEntry { name, file_type })
            .collect())
    }

    fn open(&self, path: &Path, flags: i32) -> Result<File> {
        let access = flags & libc::O_ACCMODE;
        let writing = access != libc::O_RDONLY;
        let real = if writing {
            self.promote(path)?
        } else {
            self.locate(path)?
        };
        OpenOptions::new()
            .read(access != libc::O_WRONLY)
            .write(writing)
            .append(writing && flags & libc::O_APPEND != 0)
            .truncate(writing && flags & libc::O_TRUNC != 0)
            .custom_flags(flags & (libc::O_SYNC | libc::O_DSYNC))
            .open(&real)
            .map_err(io_err("open", &real))
    }

    fn create(&self, path: &Path, mode: u32, flags: i32) -> Result<File> {
        self.reject_hidden(path)?;
        let target = if self.find_branch(path).is_some() {
            if flags & libc::O_EXCL != 0 {
                return Err(Error::new_errno(libc::EEXIST, format!("{path:?} exists")));
            }
            self.promote(path)?
        } else {
            self.ensure_parent(path)?;
            self.writable_root().join(path)
        };
        let access = flags & libc::O_ACCMODE;
        let file = OpenOptions::new()
            .read(access != libc::O_WRONLY)
            .write(true)
            .create(true)
            .append(flags & libc::O_APPEND != 0)
            .truncate(flags & libc::O_TRUNC != 0)
            .mode(mode)
            .open(&target)
            .map_err(io_err("create", &target))?;
        self.clear_deleted(path)?;
        Ok(file)
    }

    fn mkdir(&self, path: &Path, mode: u32) -> Result<()> {
        self.reject_hidden(path)?;
        self.reject_existing(path)?;
        self.ensure_parent(path)?;
        let was_deleted = self.is_deleted(path);
        let target = self.writable_root().join(path);
        DirBuilder::new()
            .mode(mode)
            .create(&target)
            .map_err(io_err("create directory", &target))?;
        if was_deleted {
            self.hide_read_only_children(path)?;
        }
        self.clear_deleted(path)
    }

    fn unlink(&self, path: &Path) -> Result<()> {
        self.reject_hidden(path)?;
        let metadata = self.stat(path)?;
        if metadata.is_dir() {
            return Err(Error::new_errno(
                libc::EISDIR,
                format!("{path:?} is a directory"),
            ));
        }
        let target = self.writable_root().join(path);
        if exists(&target) {
            std::fs::remove_file(&target).map_err(io_err("remove", &target))?;
        }
        if self.exists_below(path) {
            self.mark_deleted(path)?;
        }
        self.invalidate(path);
        Ok(())
    }

    fn rmdir(&self, path: &Path) -> Result<()> {
        self.reject_hidden(path)?;
        let metadata = self.stat(path)?;
        if !metadata.is_dir() {
            return Err(Error::new_errno(
                libc::ENOTDIR,
                format!("{path:?} is not a directory"),
            ));
        }
        if !self.read_dir(path)?.is_empty() {
            return Err(Error::new_errno(
                libc::ENOTEMPTY,
                format!("{path:?} is not empty"),
            ));
        }
        let target = self.writable_root().join(path);
        if target.is_dir() {
            std::fs::remove_dir(&target).map_err(io_err("remove directory", &target))?;
        }
        if self.exists_below(path) {
            self.mark_deleted(path)?;
        }
        self.invalidate_all();
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        self.reject_hidden(from)?;
        self.reject_hidden(to)?;
        let metadata = self.stat(from)?;
        if let Ok(existing) = self.stat(to) {
            match (metadata.is_dir(), existing.is_dir()) {
                (false, true) => {
                    return Err(Error::new_errno(libc::EISDIR, format!("{to:?} is a directory")));
                }
                (true, false) => {
                    return Err(Error::new_errno(
                        libc::ENOTDIR,
                        format!("{to:?} is not a directory"),
                    ));
                }
                _ => {}
            }
        }
        if metadata.is_dir() && (self.exists_below(from) || self.exists_below(to)) {
            // callers like mv fall back to copy and delete
            return Err(Error::new_errno(
                libc::EXDEV,
                format!("cannot rename read-only directory {from:?}"),
            ));
        }

        self.ensure_parent(to)?;
        let source = self.promote(from)?;
        let target = self.writable_root().join(to);
        std::fs::rename(&source, &target).map_err(io_err("rename", &source))?;
        if self.exists_below(from) {
            self.mark_deleted(from)?;
        }
        self.clear_deleted(to)?;
        self.invalidate_all();
        Ok(())
    }

    fn symlink(&self, target: &Path, link: &Path) -> Result<()> {
        self.reject_hidden(link)?;
        self.reject_existing(link)?;
        self.ensure_parent(link)?;
        let path = self.writable_root().join(link);
        std::os::unix::fs::symlink(target, &path).map_err(io_err("create symlink", &path))?;
        self.clear_deleted(link)
    }

    fn readlink(&self, path: &Path) -> Result<PathBuf> {
        let real = self.locate(path)?;
        std::fs::read_link(&real).map_err(io_err("read link", &real))
    }

    fn link(&self, existing: &Path, new: &Path) -> Result<()> {
        self.reject_hidden(new)?;
        self.reject_existing(new)?;
        let source = self.promote(existing)?;
        self.ensure_parent(new)?;
        let target = self.writable_root().join(new);
        std::fs::hard_link(&source, &target).map_err(io_err("link", &target))?;
        self.clear_deleted(new)
    }

    fn set_mode(&self, path: &Path, mode: u32) -> Result<()> {
        let target = self.promote(path)?;
        std::fs::set_permissions(&target, Permissions::from_mode(mode))
            .map_err(io_err("change mode", &target))
    }

    fn set_owner(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        let target = self.promote(path)?;
        std::os::unix::fs::lchown(&target, uid, gid).map_err(io_err("change owner", &target))
    }

    fn truncate(&self, path: &Path, size: u64) -> Result<()> {
        let target = self.promote(path)?;
        OpenOptions::new()
            .write(true)
            .open(&target)
            .and_then(|f| f.set_len(size))
            .map_err(io_err("truncate", &target))
    }

    fn set_times(
        &self,
        path: &Path,
        accessed: Option<SystemTime>,
        modified: Option<SystemTime>,
    ) -> Result<()> {
        if accessed.is_none() && modified.is_none() {
            return Ok(());
        }
        let target = self.promote(path)?;
        let mut times = FileTimes::new();
        if let Some(accessed) = accessed {
            times = times.set_accessed(accessed);
        }
        if let Some(modified) = modified {
            times = times.set_modified(modified);
        }
        File::open(&target)
            .and_then(|f| f.set_times(times))
            .map_err(io_err("set times", &target))
    }

    // the field types of statvfs vary by platform
    #[allow(clippy::unnecessary_cast)]
    fn statfs(&self) -> Result<StatFs> {
        let root = self.writable_root();
        let stat = nix::sys::statvfs::statvfs(root)
            .map_err(|errno| Error::Io("statfs", root.to_owned(), errno.into()))?;
        Ok(StatFs {
            blocks: stat.blocks() as u64,
            blocks_free: stat.blocks_free() as u64,
            blocks_available: stat.blocks_available() as u64,
            files: stat.files() as u64,
            files_free: stat.files_free() as u64,
            block_size: stat.block_size() as u32,
            name_max: stat.name_max() as u32,
            fragment_size: stat.fragment_size() as u32,
        })
    }
}

fn ttl_cache<V>(ttl: Duration) -> Option<Cache<PathBuf, V>>
where
    V: Clone + Send + Sync + 'static,
{
    if ttl.is_zero() {
        return None;
    }
    Some(
        Cache::builder()
            .max_capacity(CACHE_CAPACITY)
            .time_to_live(ttl.min(config::MAX_TTL))
            .build(),
    )
}

fn exists(path: &Path) -> bool {
    path.symlink_metadata().is_ok()
}

fn is_missing(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotFound || err.raw_os_error() == Some(libc::ENOTDIR)
}

fn io_err(action: &'static str, path: &Path) -> impl FnOnce(io::Error) -> Error + use<> {
    let path = path.to_owned();
    move |err| Error::Io(action, path, err)
}
