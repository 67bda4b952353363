//! FUSE binding
//!
//! Translates kernel requests into [`Overlay`] calls and results into
//! replies. All policy lives behind the overlay; this layer only carries
//! arguments across.

use fuser::{
    Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyLock, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request,
    TimeOrNow,
};
use libc::c_int;
use std::ffi::OsStr;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};

use super::audit::CallerIdentity;
use super::backing::LockRange;
use super::dispatch::{Overlay, SetAttrRequest};
use crate::error::Error;

/// Attribute and entry cache lifetime handed to the kernel
const TTL: Duration = Duration::from_secs(1);

/// Append-only filesystem served over FUSE
pub struct ImmutFs {
    overlay: Overlay,
}

impl ImmutFs {
    pub fn new(overlay: Overlay) -> Self {
        Self { overlay }
    }

    pub fn overlay(&self) -> &Overlay {
        &self.overlay
    }
}

fn caller(req: &Request) -> CallerIdentity {
    CallerIdentity {
        pid: req.pid(),
        uid: req.uid(),
        gid: req.gid(),
    }
}

/// Errno for a failed operation, logging the unexpected ones
fn errno(op: &str, e: Error) -> c_int {
    let code = e.errno();
    match code {
        libc::EACCES | libc::ENOENT | libc::EEXIST | libc::ENOTEMPTY | libc::ENODATA => {
            debug!("{} failed: {}", op, e)
        }
        _ => error!("{} failed: {}", op, e),
    }
    code
}

impl Filesystem for ImmutFs {
    fn init(&mut self, _req: &Request, config: &mut KernelConfig) -> Result<(), c_int> {
        if config
            .add_capabilities(fuser::consts::FUSE_POSIX_LOCKS)
            .is_err()
        {
            debug!("Kernel does not support POSIX locks over FUSE");
        }
        info!(
            "Serving {:?} with grace period {:?}",
            self.overlay.backing().root(),
            self.overlay.config().grace_period
        );
        Ok(())
    }

    fn destroy(&mut self) {
        info!("Unmounting {:?}", self.overlay.backing().root());
        let audit = self.overlay.audit();
        if audit.is_enabled() {
            audit.shutdown();
            if audit.dropped() > 0 {
                warn!("{} audit records were dropped", audit.dropped());
            }
        }
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup(parent={}, name={:?})", parent, name);

        match self.overlay.lookup(parent, name) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(errno("lookup", e)),
        }
    }

    fn forget(&mut self, _req: &Request, ino: u64, nlookup: u64) {
        debug!("forget(ino={}, nlookup={})", ino, nlookup);
        self.overlay.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        debug!("getattr(ino={})", ino);

        match self.overlay.getattr(ino) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(errno("getattr", e)),
        }
    }

    fn setattr(
        &mut self,
        req: &Request,
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
        debug!(
            "setattr(ino={}, mode={:?}, uid={:?}, gid={:?}, size={:?})",
            ino, mode, uid, gid, size
        );

        let request = SetAttrRequest {
            mode,
            uid,
            gid,
            size,
            atime: atime.map(Into::into),
            mtime: mtime.map(Into::into),
            fh,
        };
        match self.overlay.setattr(&caller(req), ino, request) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(errno("setattr", e)),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        debug!("readlink(ino={})", ino);

        match self.overlay.readlink(ino) {
            Ok(target) => reply.data(target.as_os_str().as_encoded_bytes()),
            Err(e) => reply.error(errno("readlink", e)),
        }
    }

    fn mknod(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        debug!("mknod(parent={}, name={:?}, mode={:o})", parent, name, mode);

        match self
            .overlay
            .mknod(&caller(req), parent, name, mode, umask, rdev)
        {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(errno("mknod", e)),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        debug!("mkdir(parent={}, name={:?}, mode={:o})", parent, name, mode);

        match self.overlay.mkdir(&caller(req), parent, name, mode, umask) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(errno("mkdir", e)),
        }
    }

    fn unlink(&mut self, req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("unlink(parent={}, name={:?})", parent, name);

        match self.overlay.unlink(&caller(req), parent, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("unlink", e)),
        }
    }

    fn rmdir(&mut self, req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("rmdir(parent={}, name={:?})", parent, name);

        match self.overlay.rmdir(&caller(req), parent, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("rmdir", e)),
        }
    }

    fn symlink(
        &mut self,
        req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        debug!(
            "symlink(parent={}, name={:?}, target={:?})",
            parent, link_name, target
        );

        match self.overlay.symlink(&caller(req), parent, link_name, target) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(errno("symlink", e)),
        }
    }

    fn rename(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        debug!(
            "rename(parent={}, name={:?}, newparent={}, newname={:?}, flags={})",
            parent, name, newparent, newname, flags
        );

        match self
            .overlay
            .rename(&caller(req), parent, name, newparent, newname, flags)
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("rename", e)),
        }
    }

    fn link(
        &mut self,
        req: &Request,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        debug!("link(ino={}, newparent={}, newname={:?})", ino, newparent, newname);

        match self.overlay.link(&caller(req), ino, newparent, newname) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(e) => reply.error(errno("link", e)),
        }
    }

    fn open(&mut self, req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open(ino={}, flags={:#o})", ino, flags);

        match self.overlay.open(&caller(req), ino, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(errno("open", e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);

        match self.overlay.read(fh, offset as u64, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno("read", e)),
        }
    }

    fn write(
        &mut self,
        req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!(
            "write(ino={}, fh={}, offset={}, size={})",
            ino,
            fh,
            offset,
            data.len()
        );

        match self.overlay.write(&caller(req), fh, offset as u64, data) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(errno("write", e)),
        }
    }

    fn flush(&mut self, _req: &Request, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        debug!("flush(ino={}, fh={})", ino, fh);

        match self.overlay.flush(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("flush", e)),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release(ino={}, fh={})", ino, fh);
        self.overlay.release(fh);
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        debug!("fsync(ino={}, fh={}, datasync={})", ino, fh, datasync);

        match self.overlay.fsync(fh, datasync) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("fsync", e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir(ino={}, offset={})", ino, offset);

        let entries = match self.overlay.readdir(ino) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(errno("readdir", e));
                return;
            }
        };

        for (i, entry) in entries.iter().enumerate().skip(offset as usize) {
            let buffer_full = reply.add(
                entry.ino,
                (i + 1) as i64,
                entry.kind.to_fuser_type(),
                &entry.name,
            );
            if buffer_full {
                break;
            }
        }

        reply.ok();
    }

    fn statfs(&mut self, _req: &Request, ino: u64, reply: ReplyStatfs) {
        match self.overlay.statfs(ino) {
            Ok(s) => reply.statfs(
                s.blocks, s.bfree, s.bavail, s.files, s.ffree, s.bsize, s.namelen, s.frsize,
            ),
            Err(e) => reply.error(errno("statfs", e)),
        }
    }

    fn setxattr(
        &mut self,
        req: &Request,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        debug!("setxattr(ino={}, name={:?})", ino, name);

        match self.overlay.setxattr(&caller(req), ino, name, value, flags) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("setxattr", e)),
        }
    }

    fn getxattr(&mut self, _req: &Request, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        debug!("getxattr(ino={}, name={:?}, size={})", ino, name, size);

        match self.overlay.getxattr(ino, name) {
            Ok(value) => reply_xattr(reply, &value, size),
            Err(e) => reply.error(errno("getxattr", e)),
        }
    }

    fn listxattr(&mut self, _req: &Request, ino: u64, size: u32, reply: ReplyXattr) {
        debug!("listxattr(ino={}, size={})", ino, size);

        match self.overlay.listxattr(ino) {
            Ok(names) => reply_xattr(reply, &names, size),
            Err(e) => reply.error(errno("listxattr", e)),
        }
    }

    fn removexattr(&mut self, req: &Request, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("removexattr(ino={}, name={:?})", ino, name);

        match self.overlay.removexattr(&caller(req), ino, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("removexattr", e)),
        }
    }

    fn access(&mut self, _req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        debug!("access(ino={}, mask={})", ino, mask);

        match self.overlay.access(ino, mask) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("access", e)),
        }
    }

    fn create(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        debug!(
            "create(parent={}, name={:?}, mode={:o}, flags={:#o})",
            parent, name, mode, flags
        );

        match self
            .overlay
            .create(&caller(req), parent, name, mode, umask, flags)
        {
            Ok((attr, fh)) => reply.created(&TTL, &attr, 0, fh, 0),
            Err(e) => reply.error(errno("create", e)),
        }
    }

    fn getlk(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        reply: ReplyLock,
    ) {
        debug!("getlk(ino={}, fh={}, typ={})", ino, fh, typ);

        match self.overlay.getlk(fh, LockRange { start, end, typ, pid }) {
            Ok(lock) => reply.locked(lock.start, lock.end, lock.typ, lock.pid),
            Err(e) => reply.error(errno("getlk", e)),
        }
    }

    fn setlk(
        &mut self,
        req: &Request,
        ino: u64,
        fh: u64,
        _lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        sleep: bool,
        reply: ReplyEmpty,
    ) {
        debug!("setlk(ino={}, fh={}, typ={}, sleep={})", ino, fh, typ, sleep);

        let lock = LockRange { start, end, typ, pid };
        match self.overlay.setlk(&caller(req), fh, lock, sleep) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("setlk", e)),
        }
    }

    fn fallocate(
        &mut self,
        req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        length: i64,
        mode: i32,
        reply: ReplyEmpty,
    ) {
        debug!(
            "fallocate(ino={}, fh={}, offset={}, length={}, mode={})",
            ino, fh, offset, length, mode
        );

        match self
            .overlay
            .fallocate(&caller(req), fh, offset as u64, length as u64, mode)
        {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("fallocate", e)),
        }
    }

    fn copy_file_range(
        &mut self,
        req: &Request,
        ino_in: u64,
        fh_in: u64,
        offset_in: i64,
        ino_out: u64,
        fh_out: u64,
        offset_out: i64,
        len: u64,
        _flags: u32,
        reply: ReplyWrite,
    ) {
        debug!(
            "copy_file_range(ino_in={}, ino_out={}, len={})",
            ino_in, ino_out, len
        );

        match self.overlay.copy_file_range(
            &caller(req),
            fh_in,
            offset_in as u64,
            fh_out,
            offset_out as u64,
            len,
        ) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(errno("copy_file_range", e)),
        }
    }
}

/// Answer an xattr query: the size alone when `size` is 0, the data when it
/// fits, `ERANGE` otherwise
fn reply_xattr(reply: ReplyXattr, data: &[u8], size: u32) {
    match xattr_reply_kind(data.len(), size) {
        XattrReply::Size(len) => reply.size(len),
        XattrReply::Data => reply.data(data),
        XattrReply::TooSmall => reply.error(libc::ERANGE),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum XattrReply {
    Size(u32),
    Data,
    TooSmall,
}

fn xattr_reply_kind(len: usize, size: u32) -> XattrReply {
    if size == 0 {
        XattrReply::Size(len as u32)
    } else if len <= size as usize {
        XattrReply::Data
    } else {
        XattrReply::TooSmall
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xattr_reply_kind() {
        assert_eq!(xattr_reply_kind(12, 0), XattrReply::Size(12));
        assert_eq!(xattr_reply_kind(12, 12), XattrReply::Data);
        assert_eq!(xattr_reply_kind(12, 64), XattrReply::Data);
        assert_eq!(xattr_reply_kind(12, 4), XattrReply::TooSmall);
        assert_eq!(xattr_reply_kind(0, 0), XattrReply::Size(0));
    }

    #[test]
    fn test_errno_passes_code_through() {
        assert_eq!(
            errno("unlink", Error::PermissionDenied("a".into())),
            libc::EACCES
        );
        assert_eq!(errno("read", Error::InvalidHandle(3)), libc::EBADF);
    }
}
