//! Operation dispatch
//!
//! [`Overlay`] exposes one method per filesystem operation. Each method
//! works out which object it touches and which [`OperationKind`] it is,
//! passes both through [`Overlay::gate`], and only then forwards to the
//! backing store. Nothing here knows about FUSE replies; the transport
//! binding in `filesystem.rs` turns results into replies.

use std::ffi::{OsStr, OsString};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, warn};

use super::audit::{AuditLogger, AuditRecord, CallerIdentity};
use super::backing::{Backing, BackingStats, LockRange, SetTime};
use super::handle::{HandleTable, OpenFile};
use super::node::{file_attr, Node, NodeKind, NodeTable};
use super::oracle::{Clock, CreationTimeOracle, HostBirthTime, SystemClock, Unavailable};
use super::policy::{decide, OperationKind};
use crate::config::MountConfig;
use crate::error::{Error, Result};

/// Linux `renameat2(2)` flag values as forwarded by the kernel
const RENAME_NOREPLACE: u32 = 1 << 0;
const RENAME_EXCHANGE: u32 = 1 << 1;

/// Largest chunk moved by one copy_file_range call
const MAX_COPY_CHUNK: u64 = 4 * 1024 * 1024;

/// Changes requested by a setattr call
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SetAttrRequest {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<SetTime>,
    pub mtime: Option<SetTime>,
    pub fh: Option<u64>,
}

impl SetAttrRequest {
    /// How the request is classified, or `None` if it changes nothing
    pub fn kind(&self) -> Option<OperationKind> {
        let attrs = self.mode.is_some()
            || self.uid.is_some()
            || self.gid.is_some()
            || self.atime.is_some()
            || self.mtime.is_some();
        match (self.size.is_some(), attrs) {
            (false, false) => None,
            (true, false) => Some(OperationKind::Truncate),
            _ => Some(OperationKind::SetAttr),
        }
    }
}

/// One directory listing entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: u64,
    pub kind: NodeKind,
    pub name: OsString,
}

/// The append-only overlay over one backing directory
pub struct Overlay {
    config: Arc<MountConfig>,
    backing: Backing,
    nodes: NodeTable,
    handles: HandleTable,
    oracle: Arc<dyn CreationTimeOracle>,
    clock: Arc<dyn Clock>,
    audit: AuditLogger,
    /// New objects are handed to the caller (only possible as root)
    chown_new: bool,
}

impl Overlay {
    /// Overlay using host birth times, the wall clock and, if enabled,
    /// the tracing audit logger
    pub fn new(root: PathBuf, config: MountConfig) -> Result<Self> {
        let audit = if config.audit_enabled {
            AuditLogger::tracing()?
        } else {
            AuditLogger::disabled()
        };
        Self::with_sources(
            root,
            config,
            Arc::new(HostBirthTime),
            Arc::new(SystemClock),
            audit,
        )
    }

    /// Overlay with explicit time sources and audit logger
    pub fn with_sources(
        root: PathBuf,
        config: MountConfig,
        oracle: Arc<dyn CreationTimeOracle>,
        clock: Arc<dyn Clock>,
        audit: AuditLogger,
    ) -> Result<Self> {
        let backing = Backing::new(root)?;
        let root_meta = backing.metadata(Path::new(""))?;

        Ok(Self {
            config: Arc::new(config),
            backing,
            nodes: NodeTable::new(root_meta.ino()),
            handles: HandleTable::new(),
            oracle,
            clock,
            audit,
            chown_new: nix::unistd::geteuid().is_root(),
        })
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    fn node(&self, ino: u64) -> Result<Arc<Node>> {
        self.nodes.get(ino).ok_or(Error::InodeNotFound(ino))
    }

    fn path(&self, ino: u64) -> Result<PathBuf> {
        self.nodes.path_of(ino).ok_or(Error::InodeNotFound(ino))
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Result<PathBuf> {
        self.nodes
            .child_path(parent, name)
            .ok_or(Error::InodeNotFound(parent))
    }

    fn handle(&self, fh: u64) -> Result<Arc<OpenFile>> {
        self.handles.get(fh).ok_or(Error::InvalidHandle(fh))
    }

    /// Changes made through the handle a file was created with are part of
    /// creating it, so only a read-only mount refuses them.
    fn through(handle: &OpenFile, op: OperationKind) -> OperationKind {
        if handle.created && op.is_destructive() {
            OperationKind::InitialWrite
        } else {
            op
        }
    }

    /// Birth time of the object at `path`, cached on its node when there is one
    fn creation_time(
        &self,
        path: &Path,
        node: Option<&Node>,
    ) -> std::result::Result<SystemTime, Unavailable> {
        let abs = self.backing.resolve(path);
        match node {
            Some(node) => node.creation_time(&abs, self.oracle.as_ref()),
            None => self.oracle.creation_time(&abs),
        }
    }

    /// The single policy entry point.
    ///
    /// Returns `PermissionDenied` when `op` may not touch the object at
    /// `path`; the backing store is never touched in that case.
    fn gate(
        &self,
        caller: &CallerIdentity,
        op: OperationKind,
        path: &Path,
        node: Option<&Node>,
    ) -> Result<()> {
        let created = if op.is_destructive() {
            self.creation_time(path, node)
        } else {
            Err(Unavailable)
        };
        let verdict = decide(op, self.clock.now(), &self.config, created);

        if self.config.audit_enabled {
            if let Some(record) =
                AuditRecord::from_verdict(&verdict, op, self.backing.resolve(path), *caller)
            {
                self.audit.record(record);
            }
        }

        if verdict.allowed {
            Ok(())
        } else {
            debug!("Denied {} on {:?}: {:?}", op, path, verdict.reason);
            Err(Error::PermissionDenied(format!("{} {}", op, path.display())))
        }
    }

    /// Register a just-created object and pin its birth time
    fn register_new(&self, parent: u64, name: &OsStr, path: &Path) -> Result<fuser::FileAttr> {
        let meta = self.backing.metadata(path)?;
        let node = self.nodes.resolve(parent, name, meta.ino());
        if self.creation_time(path, Some(&node)).is_err() {
            debug!("Birth time of new object {:?} unavailable", path);
        }
        Ok(file_attr(node.ino, &meta, &self.config))
    }

    /// Give a new object to the caller rather than the daemon
    fn hand_over(&self, caller: &CallerIdentity, path: &Path) {
        if !self.chown_new {
            return;
        }
        if let Err(e) = self
            .backing
            .set_owner(path, Some(caller.uid), Some(caller.gid))
        {
            warn!("Failed to hand {:?} to uid {}: {}", path, caller.uid, e);
        }
    }

    pub fn lookup(&self, parent: u64, name: &OsStr) -> Result<fuser::FileAttr> {
        let path = self.child_path(parent, name)?;
        let meta = self.backing.metadata(&path)?;
        let node = self.nodes.resolve(parent, name, meta.ino());
        Ok(file_attr(node.ino, &meta, &self.config))
    }

    pub fn forget(&self, ino: u64, nlookup: u64) {
        self.nodes.forget(ino, nlookup);
    }

    pub fn getattr(&self, ino: u64) -> Result<fuser::FileAttr> {
        let path = self.path(ino)?;
        let meta = self.backing.metadata(&path)?;
        Ok(file_attr(ino, &meta, &self.config))
    }

    pub fn setattr(
        &self,
        caller: &CallerIdentity,
        ino: u64,
        req: SetAttrRequest,
    ) -> Result<fuser::FileAttr> {
        let Some(mut op) = req.kind() else {
            return self.getattr(ino);
        };
        let handle = req.fh.and_then(|fh| self.handles.get(fh));
        if let Some(handle) = handle.as_deref().filter(|h| h.ino == ino) {
            if op == OperationKind::Truncate {
                op = Self::through(handle, op);
            }
        }
        let node = self.node(ino)?;
        let path = self.path(ino)?;
        self.gate(caller, op, &path, Some(&node))?;

        if let Some(mode) = req.mode {
            self.backing.set_mode(&path, mode)?;
        }
        if req.uid.is_some() || req.gid.is_some() {
            self.backing.set_owner(&path, req.uid, req.gid)?;
        }
        if let Some(size) = req.size {
            match handle {
                Some(handle) => handle.file.set_len(size)?,
                None => self.backing.truncate(&path, size)?,
            }
        }
        if req.atime.is_some() || req.mtime.is_some() {
            self.backing.set_times(&path, req.atime, req.mtime)?;
        }

        self.getattr(ino)
    }

    pub fn readlink(&self, ino: u64) -> Result<PathBuf> {
        let path = self.path(ino)?;
        self.backing.readlink(&path)
    }

    pub fn mknod(
        &self,
        caller: &CallerIdentity,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
    ) -> Result<fuser::FileAttr> {
        let path = self.child_path(parent, name)?;
        self.gate(caller, OperationKind::MakeNode, &path, None)?;
        self.backing.mknod(&path, mode & !(umask & 0o7777), rdev)?;
        self.hand_over(caller, &path);
        self.register_new(parent, name, &path)
    }

    pub fn mkdir(
        &self,
        caller: &CallerIdentity,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
    ) -> Result<fuser::FileAttr> {
        let path = self.child_path(parent, name)?;
        self.gate(caller, OperationKind::MakeDir, &path, None)?;
        self.backing.mkdir(&path, mode & !umask & 0o7777)?;
        self.hand_over(caller, &path);
        self.register_new(parent, name, &path)
    }

    pub fn symlink(
        &self,
        caller: &CallerIdentity,
        parent: u64,
        name: &OsStr,
        target: &Path,
    ) -> Result<fuser::FileAttr> {
        let path = self.child_path(parent, name)?;
        self.gate(caller, OperationKind::Symlink, &path, None)?;
        self.backing.symlink(target, &path)?;
        self.hand_over(caller, &path);
        self.register_new(parent, name, &path)
    }

    /// Add a new name for an existing object
    pub fn link(
        &self,
        caller: &CallerIdentity,
        ino: u64,
        new_parent: u64,
        new_name: &OsStr,
    ) -> Result<fuser::FileAttr> {
        let path = self.path(ino)?;
        let new_path = self.child_path(new_parent, new_name)?;
        self.gate(caller, OperationKind::Link, &new_path, None)?;
        self.backing.link(&path, &new_path)?;
        self.lookup(new_parent, new_name)
    }

    pub fn unlink(&self, caller: &CallerIdentity, parent: u64, name: &OsStr) -> Result<()> {
        let path = self.child_path(parent, name)?;
        let node = self.nodes.child(parent, name);
        self.gate(caller, OperationKind::Unlink, &path, node.as_deref())?;
        self.backing.unlink(&path)?;
        self.nodes.unlink(parent, name);
        Ok(())
    }

    pub fn rmdir(&self, caller: &CallerIdentity, parent: u64, name: &OsStr) -> Result<()> {
        let path = self.child_path(parent, name)?;
        let node = self.nodes.child(parent, name);
        self.gate(caller, OperationKind::RemoveDir, &path, node.as_deref())?;
        self.backing.rmdir(&path)?;
        self.nodes.unlink(parent, name);
        Ok(())
    }

    /// Rename gates the object being moved and, when one would be replaced
    /// or swapped, the object at the destination as well.
    pub fn rename(
        &self,
        caller: &CallerIdentity,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
        flags: u32,
    ) -> Result<()> {
        let path = self.child_path(parent, name)?;
        let new_path = self.child_path(new_parent, new_name)?;

        let node = self.nodes.child(parent, name);
        self.gate(caller, OperationKind::Rename, &path, node.as_deref())?;

        let exchange = flags & RENAME_EXCHANGE != 0;
        if exchange && !self.backing.exists(&new_path) {
            return Err(Error::PathNotFound(new_path.display().to_string()));
        }
        let replaces = flags & RENAME_NOREPLACE == 0 && self.backing.exists(&new_path);
        if exchange || replaces {
            let target = self.nodes.child(new_parent, new_name);
            self.gate(caller, OperationKind::Overwrite, &new_path, target.as_deref())?;
        }

        self.backing.rename(&path, &new_path, flags)?;
        if exchange {
            self.nodes.exchange(parent, name, new_parent, new_name);
        } else {
            self.nodes.rename(parent, name, new_parent, new_name);
        }
        Ok(())
    }

    /// Open an existing object. Any write intent in `flags` is destructive.
    pub fn open(&self, caller: &CallerIdentity, ino: u64, flags: i32) -> Result<u64> {
        let node = self.node(ino)?;
        let path = self.path(ino)?;
        self.gate(caller, OperationKind::for_open(flags), &path, Some(&node))?;

        let file = self.backing.open(&path, flags)?;
        Ok(self.handles.insert(OpenFile::new(ino, flags, file)))
    }

    /// Create-and-open.
    ///
    /// The backing store performs an exclusive create. If the name turns out
    /// to be taken, the request is an overwrite of that existing object and
    /// is gated on its birth time instead, whatever the open flags say.
    pub fn create(
        &self,
        caller: &CallerIdentity,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
    ) -> Result<(fuser::FileAttr, u64)> {
        let path = self.child_path(parent, name)?;
        self.gate(caller, OperationKind::CreateFile, &path, None)?;

        match self.backing.create_new(&path, flags, mode & !umask & 0o7777) {
            Ok(file) => {
                self.hand_over(caller, &path);
                let attr = self.register_new(parent, name, &path)?;
                let fh = self
                    .handles
                    .insert(OpenFile::created(attr.ino, flags, file));
                Ok((attr, fh))
            }
            Err(e) if e.is_already_exists() && flags & libc::O_EXCL == 0 => {
                self.open_existing(caller, parent, name, &path, flags)
            }
            Err(e) => Err(e),
        }
    }

    fn open_existing(
        &self,
        caller: &CallerIdentity,
        parent: u64,
        name: &OsStr,
        path: &Path,
        flags: i32,
    ) -> Result<(fuser::FileAttr, u64)> {
        let meta = self.backing.metadata(path)?;
        let node = self.nodes.resolve(parent, name, meta.ino());

        let refused = || {
            Error::PermissionDenied(format!("{} {}", OperationKind::Overwrite, path.display()))
        };
        // Symlinks are not followed, and the name must still refer to the
        // object that was gated.
        let opened = self
            .gate(caller, OperationKind::Overwrite, path, Some(&node))
            .and_then(|_| {
                self.backing.open(path, flags).map_err(|e| {
                    if e.errno() == libc::ELOOP {
                        refused()
                    } else {
                        e
                    }
                })
            })
            .and_then(|file| {
                if file.metadata()?.ino() == meta.ino() {
                    Ok(file)
                } else {
                    Err(refused())
                }
            });
        let file = match opened {
            Ok(file) => file,
            Err(e) => {
                // The kernel never sees this entry, so drop the lookup we took.
                self.nodes.forget(node.ino, 1);
                return Err(e);
            }
        };

        let meta = self.backing.metadata(path)?;
        let attr = file_attr(node.ino, &meta, &self.config);
        let fh = self.handles.insert(OpenFile::new(node.ino, flags, file));
        Ok((attr, fh))
    }

    pub fn read(&self, fh: u64, offset: u64, size: u32) -> Result<Vec<u8>> {
        let handle = self.handle(fh)?;
        Backing::read_at(&handle.file, offset, size)
    }

    /// Writes are gated per call, so a handle opened inside the grace
    /// window stops working once the window closes. The handle returned by
    /// the create that made the file keeps working.
    pub fn write(
        &self,
        caller: &CallerIdentity,
        fh: u64,
        offset: u64,
        data: &[u8],
    ) -> Result<u32> {
        let handle = self.handle(fh)?;
        if !handle.is_writable() {
            return Err(Error::InvalidHandle(fh));
        }
        let node = self.node(handle.ino)?;
        let path = self.path(handle.ino)?;
        let op = if handle.is_append() {
            OperationKind::Append
        } else {
            OperationKind::Write
        };
        self.gate(caller, Self::through(&handle, op), &path, Some(&node))?;
        Backing::write_at(&handle.file, offset, data)
    }

    pub fn flush(&self, fh: u64) -> Result<()> {
        if self.handles.is_valid(fh) {
            Ok(())
        } else {
            Err(Error::InvalidHandle(fh))
        }
    }

    pub fn fsync(&self, fh: u64, datasync: bool) -> Result<()> {
        let handle = self.handle(fh)?;
        Backing::fsync(&handle.file, datasync)
    }

    pub fn release(&self, fh: u64) {
        self.handles.remove(fh);
    }

    /// Entries of directory `ino`, `.` and `..` first
    pub fn readdir(&self, ino: u64) -> Result<Vec<DirEntry>> {
        let node = self.node(ino)?;
        let path = self.path(ino)?;

        let mut entries = vec![
            DirEntry {
                ino,
                kind: NodeKind::Directory,
                name: OsString::from("."),
            },
            DirEntry {
                ino: node.parent(),
                kind: NodeKind::Directory,
                name: OsString::from(".."),
            },
        ];
        entries.extend(self.backing.readdir(&path)?.into_iter().map(|e| DirEntry {
            ino: e.ino,
            kind: e.kind,
            name: e.name,
        }));
        Ok(entries)
    }

    pub fn statfs(&self, ino: u64) -> Result<BackingStats> {
        let path = self.path(ino).unwrap_or_default();
        self.backing.statfs(&path)
    }

    pub fn access(&self, ino: u64, mask: i32) -> Result<()> {
        let path = self.path(ino)?;
        self.backing.access(&path, mask)
    }

    pub fn getxattr(&self, ino: u64, name: &OsStr) -> Result<Vec<u8>> {
        let path = self.path(ino)?;
        self.backing.getxattr(&path, name)
    }

    pub fn listxattr(&self, ino: u64) -> Result<Vec<u8>> {
        let path = self.path(ino)?;
        self.backing.listxattr(&path)
    }

    pub fn setxattr(
        &self,
        caller: &CallerIdentity,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
    ) -> Result<()> {
        let node = self.node(ino)?;
        let path = self.path(ino)?;
        self.gate(caller, OperationKind::SetXattr, &path, Some(&node))?;
        self.backing.setxattr(&path, name, value, flags)
    }

    pub fn removexattr(&self, caller: &CallerIdentity, ino: u64, name: &OsStr) -> Result<()> {
        let node = self.node(ino)?;
        let path = self.path(ino)?;
        self.gate(caller, OperationKind::RemoveXattr, &path, Some(&node))?;
        self.backing.removexattr(&path, name)
    }

    pub fn getlk(&self, fh: u64, lock: LockRange) -> Result<LockRange> {
        let handle = self.handle(fh)?;
        Backing::get_lock(&handle.file, lock)
    }

    /// Taking a write lock signals intent to modify and is gated like a write
    pub fn setlk(
        &self,
        caller: &CallerIdentity,
        fh: u64,
        lock: LockRange,
        sleep: bool,
    ) -> Result<()> {
        let handle = self.handle(fh)?;
        let node = self.node(handle.ino)?;
        let path = self.path(handle.ino)?;
        self.gate(caller, OperationKind::for_lock(lock.typ), &path, Some(&node))?;
        Backing::set_lock(&handle.file, lock, sleep)
    }

    pub fn fallocate(
        &self,
        caller: &CallerIdentity,
        fh: u64,
        offset: u64,
        length: u64,
        mode: i32,
    ) -> Result<()> {
        let handle = self.handle(fh)?;
        let node = self.node(handle.ino)?;
        let path = self.path(handle.ino)?;
        let op = Self::through(&handle, OperationKind::Allocate);
        self.gate(caller, op, &path, Some(&node))?;
        Backing::allocate(&handle.file, offset, length, mode)
    }

    /// Copy between two open files; gated on the destination
    pub fn copy_file_range(
        &self,
        caller: &CallerIdentity,
        fh_in: u64,
        offset_in: u64,
        fh_out: u64,
        offset_out: u64,
        len: u64,
    ) -> Result<u32> {
        let input = self.handle(fh_in)?;
        let output = self.handle(fh_out)?;
        let node = self.node(output.ino)?;
        let path = self.path(output.ino)?;
        let op = Self::through(&output, OperationKind::CopyInto);
        self.gate(caller, op, &path, Some(&node))?;

        let data = Backing::read_at(&input.file, offset_in, len.min(MAX_COPY_CHUNK) as u32)?;
        Backing::write_at(&output.file, offset_out, &data)
    }

    /// Number of nodes the kernel currently holds
    pub fn node_count(&self) -> usize {
        self.nodes.count()
    }
}

impl Drop for Overlay {
    fn drop(&mut self) {
        self.audit.shutdown();
        debug!("Overlay over {:?} released", self.backing.root());
    }
}
