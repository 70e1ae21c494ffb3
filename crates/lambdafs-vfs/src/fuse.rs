// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::collections::HashSet;
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileExt, FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use fuser::consts::{FOPEN_DIRECT_IO, FUSE_ASYNC_READ, FUSE_ATOMIC_O_TRUNC, FUSE_BIG_WRITES};
use fuser::{
    FileAttr,
    FileType,
    MountOption,
    ReplyAttr,
    ReplyCreate,
    ReplyData,
    ReplyDirectory,
    ReplyEmpty,
    ReplyEntry,
    ReplyOpen,
    ReplyStatfs,
    ReplyWrite,
    Request,
    TimeOrNow,
};
use lambdafs::{Error, Freshness, MountContext, OsError, UnionFileSystem};

use crate::inodes::{InodeTable, ROOT_INODE};

/// Options to configure the FUSE filesystem and
/// its behavior at runtime
#[derive(Debug, Clone)]
pub struct Config {
    /// How long the kernel may cache names that exist
    pub entry_ttl: Duration,
    /// How long the kernel may cache file attributes
    pub attr_ttl: Duration,
    /// How long the kernel may cache names that do not exist,
    /// where zero disables negative entries entirely
    pub negative_ttl: Duration,
    /// Keep all inode numbers within 32 bits
    pub portable_inodes: bool,
    /// Mount options to be used when setting up
    pub mount_options: HashSet<MountOption>,
}

impl Config {
    /// Build options from the fuse section of the lambdafs config
    pub fn from_settings(settings: &lambdafs::settings::Fuse) -> Self {
        Self {
            entry_ttl: settings.entry_ttl(),
            attr_ttl: settings.entry_ttl(),
            negative_ttl: settings.negative_ttl(),
            portable_inodes: settings.portable,
            mount_options: HashSet::new(),
        }
    }
}

/// Handles the allocation of inodes and file handles, and
/// answers each FUSE request from the union and its layer
struct Filesystem {
    context: Arc<MountContext>,
    opts: Config,

    inodes: InodeTable,
    next_handle: AtomicU64,
    handles: DashMap<u64, Arc<Handle>>,
}

/// Extract the ok value from a result, or reply with an error in FUSE
macro_rules! unwrap {
    ($reply:ident, $op:expr) => {{
        match $op {
            Ok(r) => r,
            Err(err) => err!($reply, err),
        }
    }};
}

/// Reply with an error to FUSE and return
macro_rules! err {
    ($reply:ident, $err:expr) => {{
        let err = $err;
        let errno = err.os_error().unwrap_or(libc::EIO);
        if errno == libc::EIO {
            tracing::error!("{err:?}");
        } else {
            tracing::debug!("{err} [errno={errno}]");
        }
        $reply.error(errno);
        return;
    }};
}

impl Filesystem {
    fn new(context: Arc<MountContext>, opts: Config) -> Self {
        Self {
            context,
            inodes: InodeTable::new(opts.portable_inodes),
            opts,
            // we do not allocate handle 0, so skip it for now
            next_handle: AtomicU64::new(1),
            handles: Default::default(),
        }
    }

    fn union(&self) -> &dyn UnionFileSystem {
        self.context.union().as_ref()
    }

    fn allocate_handle(&self, data: Handle) -> u64 {
        let data = Arc::new(data);
        loop {
            let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
            if id == 0 {
                // the 'empty/zero' handle value is never allocated
                // so that the explicit lack of handle can be detected
                continue;
            }
            match self.handles.entry(id) {
                // continue until we find a vacant entry for this handle
                dashmap::mapref::entry::Entry::Occupied(_) => continue,
                dashmap::mapref::entry::Entry::Vacant(v) => {
                    v.insert(data);
                    break id;
                }
            }
        }
    }

    fn handle(&self, fh: u64) -> Option<Arc<Handle>> {
        self.handles.get(&fh).map(|h| Arc::clone(h.value()))
    }

    fn path(&self, ino: u64) -> lambdafs::Result<PathBuf> {
        self.inodes
            .path(ino)
            .ok_or_else(|| Error::new_errno(libc::ENOENT, format!("no such inode {ino}")))
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> lambdafs::Result<PathBuf> {
        if name.is_empty() || name == "." || name == ".." || name.as_bytes().contains(&b'/') {
            return Err(Error::new_errno(
                libc::EINVAL,
                format!("invalid file name {name:?}"),
            ));
        }
        Ok(self.path(parent)?.join(name))
    }

    /// Bring a file up to date when it is opened for reading, then open it.
    ///
    /// Returns the open file and the flags for the kernel's reply.
    fn open_file(&self, path: &Path, flags: i32) -> lambdafs::Result<(std::fs::File, u32)> {
        let mut open_flags = 0;
        if flags & libc::O_ACCMODE != libc::O_WRONLY {
            if let Freshness::Regenerated { bytes } = self.context.ensure_fresh(path)? {
                tracing::trace!(?path, bytes, "opening regenerated file");
                // the size cached by the kernel predates the
                // new content, so reads must not be clipped to it
                open_flags |= FOPEN_DIRECT_IO;
            }
        }
        let file = self.union().open(path, flags)?;
        Ok((file, open_flags))
    }

    /// Reply with the entry for a path that was just looked up or created
    fn reply_entry(&self, path: &Path, reply: ReplyEntry) {
        let meta = unwrap!(reply, self.union().stat(path));
        let Some(ino) = self.inodes.lookup(path) else {
            reply.error(libc::ENOSPC);
            return;
        };
        reply.entry(&self.opts.entry_ttl, &attr_from_metadata(ino, &meta), 0);
    }
}

// these functions mirror the actual fuse ones and
// so we don't have much control over the shape
#[allow(clippy::too_many_arguments)]
impl Filesystem {
    fn statfs(&self, reply: ReplyStatfs) {
        let stat = unwrap!(reply, self.union().statfs());
        reply.statfs(
            stat.blocks,
            stat.blocks_free,
            stat.blocks_available,
            stat.files,
            stat.files_free,
            stat.block_size,
            stat.name_max,
            stat.fragment_size,
        );
    }

    fn lookup(&self, parent: u64, name: OsString, reply: ReplyEntry) {
        let path = unwrap!(reply, self.child_path(parent, &name));
        tracing::trace!(?path, "lookup");
        match self.union().stat(&path) {
            Ok(_) => self.reply_entry(&path, reply),
            Err(err) if err.is_not_found() && !self.opts.negative_ttl.is_zero() => {
                // an entry with no inode lets the kernel cache the miss
                reply.entry(&self.opts.negative_ttl, &negative_attr(), 0);
            }
            Err(err) => err!(reply, err),
        }
    }

    fn forget(&self, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
        tracing::trace!(ino, nlookup, remaining = self.inodes.len(), "forget");
    }

    fn getattr(&self, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        // an open file may no longer be reachable through its path
        if let Some(handle) = fh.and_then(|fh| self.handle(fh)) {
            if let Handle::File { file } = &*handle {
                let meta = unwrap!(reply, file.metadata());
                reply.attr(&self.opts.attr_ttl, &attr_from_metadata(ino, &meta));
                return;
            }
        }
        let path = unwrap!(reply, self.path(ino));
        let meta = unwrap!(reply, self.union().stat(&path));
        reply.attr(&self.opts.attr_ttl, &attr_from_metadata(ino, &meta));
    }

    fn setattr(
        &self,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        fh: Option<u64>,
        reply: ReplyAttr,
    ) {
        let path = unwrap!(reply, self.path(ino));
        let union = self.union();
        if let Some(mode) = mode {
            unwrap!(reply, union.set_mode(&path, mode & 0o7777));
        }
        if uid.is_some() || gid.is_some() {
            unwrap!(reply, union.set_owner(&path, uid, gid));
        }
        if let Some(size) = size {
            match fh.and_then(|fh| self.handle(fh)).as_deref() {
                Some(Handle::File { file }) => unwrap!(reply, file.set_len(size)),
                Some(Handle::Dir { .. }) => {
                    reply.error(libc::EISDIR);
                    return;
                }
                None => unwrap!(reply, union.truncate(&path, size)),
            }
        }
        if atime.is_some() || mtime.is_some() {
            unwrap!(
                reply,
                union.set_times(&path, atime.map(resolve_time), mtime.map(resolve_time))
            );
        }
        let meta = unwrap!(reply, union.stat(&path));
        reply.attr(&self.opts.attr_ttl, &attr_from_metadata(ino, &meta));
    }

    fn readlink(&self, ino: u64, reply: ReplyData) {
        let path = unwrap!(reply, self.path(ino));
        let target = unwrap!(reply, self.union().readlink(&path));
        reply.data(target.as_os_str().as_bytes());
    }

    fn mknod(&self, parent: u64, name: OsString, mode: u32, umask: u32, reply: ReplyEntry) {
        if mode & libc::S_IFMT != libc::S_IFREG {
            // only regular files can be made in the writable branch
            reply.error(libc::EPERM);
            return;
        }
        let path = unwrap!(reply, self.child_path(parent, &name));
        let flags = libc::O_WRONLY | libc::O_EXCL;
        unwrap!(
            reply,
            self.union().create(&path, mode & !umask & 0o7777, flags)
        );
        self.reply_entry(&path, reply);
    }

    fn mkdir(&self, parent: u64, name: OsString, mode: u32, umask: u32, reply: ReplyEntry) {
        let path = unwrap!(reply, self.child_path(parent, &name));
        unwrap!(reply, self.union().mkdir(&path, mode & !umask & 0o7777));
        self.reply_entry(&path, reply);
    }

    fn unlink(&self, parent: u64, name: OsString, reply: ReplyEmpty) {
        let path = unwrap!(reply, self.child_path(parent, &name));
        unwrap!(reply, self.union().unlink(&path));
        self.inodes.remove(&path);
        reply.ok();
    }

    fn rmdir(&self, parent: u64, name: OsString, reply: ReplyEmpty) {
        let path = unwrap!(reply, self.child_path(parent, &name));
        unwrap!(reply, self.union().rmdir(&path));
        self.inodes.remove(&path);
        reply.ok();
    }

    fn symlink(&self, parent: u64, link_name: OsString, target: PathBuf, reply: ReplyEntry) {
        let path = unwrap!(reply, self.child_path(parent, &link_name));
        unwrap!(reply, self.union().symlink(&target, &path));
        self.reply_entry(&path, reply);
    }

    fn rename(
        &self,
        parent: u64,
        name: OsString,
        newparent: u64,
        newname: OsString,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        if flags & !libc::RENAME_NOREPLACE != 0 {
            // exchanges and whiteouts are not supported
            reply.error(libc::EINVAL);
            return;
        }
        let from = unwrap!(reply, self.child_path(parent, &name));
        let to = unwrap!(reply, self.child_path(newparent, &newname));
        if flags & libc::RENAME_NOREPLACE != 0 && self.union().stat(&to).is_ok() {
            reply.error(libc::EEXIST);
            return;
        }
        unwrap!(reply, self.union().rename(&from, &to));
        self.inodes.rename(&from, &to);
        reply.ok();
    }

    fn link(&self, ino: u64, newparent: u64, newname: OsString, reply: ReplyEntry) {
        let existing = unwrap!(reply, self.path(ino));
        let path = unwrap!(reply, self.child_path(newparent, &newname));
        unwrap!(reply, self.union().link(&existing, &path));
        self.reply_entry(&path, reply);
    }

    fn open(&self, ino: u64, flags: i32, reply: ReplyOpen) {
        let path = unwrap!(reply, self.path(ino));
        let (file, open_flags) = unwrap!(reply, self.open_file(&path, flags));
        let fh = self.allocate_handle(Handle::File { file });
        tracing::trace!("open {ino} = {fh}");
        reply.opened(fh, open_flags);
    }

    fn read(&self, fh: u64, offset: i64, size: u32, reply: ReplyData) {
        let Some(handle) = self.handle(fh) else {
            tracing::debug!("read {fh} = EBADF");
            reply.error(libc::EBADF);
            return;
        };
        let Handle::File { file } = &*handle else {
            reply.error(libc::EISDIR);
            return;
        };
        let offset = unwrap!(reply, file_offset(offset));

        let mut buf = vec![0; size as usize];
        let mut consumed = 0;
        while consumed < buf.len() {
            let count = unwrap!(reply, file.read_at(&mut buf[consumed..], offset + consumed as u64));
            if count == 0 {
                // the end of the file has been reached
                break;
            }
            consumed += count;
        }
        tracing::trace!("read {fh} = {consumed}/{size}");
        reply.data(&buf[..consumed]);
    }

    fn write(&self, fh: u64, offset: i64, data: Vec<u8>, reply: ReplyWrite) {
        let Some(handle) = self.handle(fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let Handle::File { file } = &*handle else {
            reply.error(libc::EISDIR);
            return;
        };
        let offset = unwrap!(reply, file_offset(offset));
        unwrap!(reply, file.write_all_at(&data, offset));
        let Ok(written) = u32::try_from(data.len()) else {
            reply.error(libc::EFBIG);
            return;
        };
        reply.written(written);
    }

    fn fsync(&self, fh: u64, datasync: bool, reply: ReplyEmpty) {
        let Some(handle) = self.handle(fh) else {
            reply.error(libc::EBADF);
            return;
        };
        if let Handle::File { file } = &*handle {
            if datasync {
                unwrap!(reply, file.sync_data());
            } else {
                unwrap!(reply, file.sync_all());
            }
        }
        reply.ok();
    }

    fn release(&self, fh: u64, reply: ReplyEmpty) {
        let Some((_, _handle)) = self.handles.remove(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        reply.ok();
    }

    fn opendir(&self, ino: u64, reply: ReplyOpen) {
        let path = unwrap!(reply, self.path(ino));
        let listing = unwrap!(reply, self.union().read_dir(&path));
        let parent = path
            .parent()
            .and_then(|p| self.inodes.get(p))
            .unwrap_or(ROOT_INODE);

        let mut entries = Vec::with_capacity(listing.len() + 2);
        entries.push(DirEntry {
            ino,
            kind: FileType::Directory,
            name: ".".into(),
        });
        entries.push(DirEntry {
            ino: parent,
            kind: FileType::Directory,
            name: "..".into(),
        });
        for entry in listing {
            let Some(child) = self.inodes.get_or_allocate(&path.join(&entry.name)) else {
                reply.error(libc::ENOSPC);
                return;
            };
            entries.push(DirEntry {
                ino: child,
                kind: file_type(entry.file_type),
                name: entry.name,
            });
        }

        let fh = self.allocate_handle(Handle::Dir { entries });
        tracing::trace!("opendir {ino} = {fh}");
        reply.opened(fh, 0);
    }

    fn readdir(&self, fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let Some(handle) = self.handle(fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let Handle::Dir { entries } = &*handle else {
            reply.error(libc::ENOTDIR);
            return;
        };
        // offsets given to the kernel are one past the index of each
        // entry, so that zero always means the start of the listing
        let start = usize::try_from(offset).unwrap_or(0);
        for (index, entry) in entries.iter().enumerate().skip(start) {
            let next_offset = (index + 1) as i64;
            let buffer_full = reply.add(entry.ino, next_offset, entry.kind, &entry.name);
            if buffer_full {
                break;
            }
        }
        reply.ok();
    }

    fn create(
        &self,
        parent: u64,
        name: OsString,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let path = unwrap!(reply, self.child_path(parent, &name));
        let file = unwrap!(
            reply,
            self.union().create(&path, mode & !umask & 0o7777, flags)
        );
        let meta = unwrap!(reply, file.metadata());
        let Some(ino) = self.inodes.lookup(&path) else {
            reply.error(libc::ENOSPC);
            return;
        };
        let fh = self.allocate_handle(Handle::File { file });
        tracing::trace!(?path, "create {ino} = {fh}");
        reply.created(
            &self.opts.entry_ttl,
            &attr_from_metadata(ino, &meta),
            0,
            fh,
            0,
        );
    }
}

/// Represents a connected FUSE session.
///
/// This implements the [`fuser::Filesystem`] trait, receives
/// all requests and arranges for their execution on the
/// blocking thread pool of the current tokio runtime.
pub struct Session {
    inner: Arc<Filesystem>,
}

impl Session {
    /// Construct a new session which serves the union and
    /// transformed content of the provided mount
    pub fn new(context: Arc<MountContext>, opts: Config) -> Self {
        Self {
            inner: Arc::new(Filesystem::new(context, opts)),
        }
    }
}

impl fuser::Filesystem for Session {
    fn init(
        &mut self,
        _req: &Request<'_>,
        config: &mut fuser::KernelConfig,
    ) -> std::result::Result<(), libc::c_int> {
        let desired = [
            ("FUSE_ASYNC_READ", FUSE_ASYNC_READ),
            ("FUSE_ATOMIC_O_TRUNC", FUSE_ATOMIC_O_TRUNC),
            ("FUSE_BIG_WRITES", FUSE_BIG_WRITES),
        ];
        let all_desired = desired.iter().fold(0, |prev, (_, i)| prev | i);
        if let Err(unsupported) = config.add_capabilities(all_desired) {
            let rejected = desired
                .iter()
                .filter_map(|d| (d.1 & unsupported != 0).then_some(d.0));
            for name in rejected {
                tracing::warn!("FUSE feature rejected: {name}");
            }
            if config
                .add_capabilities(all_desired & !unsupported)
                .is_err()
            {
                tracing::warn!("FUSE features could not be enabled");
            }
        }
        tracing::info!(
            mountpoint = ?self.inner.context.mountpoint(),
            "Filesystem initialized"
        );
        Ok(())
    }

    fn destroy(&mut self) {
        tracing::info!("Filesystem destroyed");
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let fs = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || fs.statfs(reply));
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = name.to_owned();
        let fs = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || fs.lookup(parent, name, reply));
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        // cheap enough to be done inline, and must be
        // ordered with respect to the lookups before it
        self.inner.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        let fs = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || fs.getattr(ino, fh, reply));
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let fs = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            fs.setattr(ino, mode, uid, gid, size, atime, mtime, fh, reply)
        });
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let fs = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || fs.readlink(ino, reply));
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        let name = name.to_owned();
        let fs = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || fs.mknod(parent, name, mode, umask, reply));
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let name = name.to_owned();
        let fs = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || fs.mkdir(parent, name, mode, umask, reply));
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name.to_owned();
        let fs = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || fs.unlink(parent, name, reply));
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name.to_owned();
        let fs = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || fs.rmdir(parent, name, reply));
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let link_name = link_name.to_owned();
        let target = target.to_owned();
        let fs = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || fs.symlink(parent, link_name, target, reply));
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let name = name.to_owned();
        let newname = newname.to_owned();
        let fs = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            fs.rename(parent, name, newparent, newname, flags, reply)
        });
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let newname = newname.to_owned();
        let fs = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || fs.link(ino, newparent, newname, reply));
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let fs = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || fs.open(ino, flags, reply));
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let fs = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || fs.read(fh, offset, size, reply));
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let data = data.to_vec();
        let fs = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || fs.write(fh, offset, data, reply));
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        // writes go straight to the underlying file
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let fs = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || fs.release(fh, reply));
    }

    fn fsync(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        datasync: bool,
        reply: ReplyEmpty,
    ) {
        let fs = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || fs.fsync(fh, datasync, reply));
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let fs = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || fs.opendir(ino, reply));
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        reply: ReplyDirectory,
    ) {
        let fs = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || fs.readdir(fh, offset, reply));
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        let fs = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || fs.release(fh, reply));
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let name = name.to_owned();
        let fs = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || fs.create(parent, name, mode, umask, flags, reply));
    }
}

enum Handle {
    /// A file opened in one of the branches of the union
    File { file: std::fs::File },
    /// A snapshot of a directory listing, taken when it was opened
    Dir { entries: Vec<DirEntry> },
}

struct DirEntry {
    ino: u64,
    kind: FileType,
    name: OsString,
}

fn file_type(file_type: std::fs::FileType) -> FileType {
    if file_type.is_dir() {
        FileType::Directory
    } else if file_type.is_symlink() {
        FileType::Symlink
    } else if file_type.is_fifo() {
        FileType::NamedPipe
    } else if file_type.is_socket() {
        FileType::Socket
    } else if file_type.is_char_device() {
        FileType::CharDevice
    } else if file_type.is_block_device() {
        FileType::BlockDevice
    } else {
        FileType::RegularFile
    }
}

fn attr_from_metadata(ino: u64, meta: &std::fs::Metadata) -> FileAttr {
    let ctime = u64::try_from(meta.ctime())
        .map(|secs| UNIX_EPOCH + Duration::new(secs, meta.ctime_nsec() as u32))
        .unwrap_or(UNIX_EPOCH);
    FileAttr {
        ino,
        size: meta.size(),
        blocks: meta.blocks(),
        atime: meta.accessed().unwrap_or(UNIX_EPOCH),
        mtime: meta.modified().unwrap_or(UNIX_EPOCH),
        ctime,
        crtime: meta.created().unwrap_or(ctime),
        kind: file_type(meta.file_type()),
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        blksize: meta.blksize() as u32,
        flags: 0,
    }
}

/// The attributes sent with a negative entry, only the zero inode matters
fn negative_attr() -> FileAttr {
    FileAttr {
        ino: 0,
        size: 0,
        blocks: 0,
        atime: UNIX_EPOCH,
        mtime: UNIX_EPOCH,
        ctime: UNIX_EPOCH,
        crtime: UNIX_EPOCH,
        kind: FileType::RegularFile,
        perm: 0,
        nlink: 0,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: 0,
        flags: 0,
    }
}

fn resolve_time(time: TimeOrNow) -> SystemTime {
    match time {
        TimeOrNow::SpecificTime(time) => time,
        TimeOrNow::Now => SystemTime::now(),
    }
}

fn file_offset(offset: i64) -> lambdafs::Result<u64> {
    u64::try_from(offset)
        .map_err(|_| Error::new_errno(libc::EINVAL, format!("invalid file offset {offset}")))
}

#[cfg(test)]
#[path = "./fuse_test.rs"]
mod fuse_test;
