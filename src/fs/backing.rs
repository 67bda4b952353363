//! Backing store pass-through
//!
//! Performs the real I/O against the directory tree being protected. All
//! paths handed to [`Backing`] are relative to its root. Nothing here makes
//! policy decisions; callers gate destructive operations first.

use crate::error::{Error, Result};
use nix::fcntl::FcntlArg;
use nix::sys::stat::{Mode, SFlag, UtimensatFlags};
use nix::sys::time::TimeSpec;
use std::ffi::{OsStr, OsString};
use std::fs::{self, File, Metadata, OpenOptions};
use std::os::unix::fs::{DirBuilderExt, FileExt, OpenOptionsExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use super::node::NodeKind;

/// Directory entry from the backing store
#[derive(Debug, Clone)]
pub struct BackingDirEntry {
    pub name: OsString,
    pub kind: NodeKind,
    /// Host inode number
    pub ino: u64,
}

/// Filesystem statistics of the backing store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackingStats {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// Timestamp update requested by setattr
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetTime {
    Now,
    At(SystemTime),
}

impl From<fuser::TimeOrNow> for SetTime {
    fn from(t: fuser::TimeOrNow) -> Self {
        match t {
            fuser::TimeOrNow::Now => SetTime::Now,
            fuser::TimeOrNow::SpecificTime(at) => SetTime::At(at),
        }
    }
}

/// A byte-range lock as seen by `fcntl(2)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRange {
    pub start: u64,
    /// Inclusive end; `u64::MAX` or `i64::MAX` means "to end of file"
    pub end: u64,
    pub typ: i32,
    pub pid: u32,
}

/// Pass-through interface to the backing directory tree
pub struct Backing {
    root: PathBuf,
}

impl Backing {
    /// Open the backing store rooted at `root`, which must be a directory
    pub fn new(root: PathBuf) -> Result<Self> {
        let meta = fs::metadata(&root)
            .map_err(|_| Error::PathNotFound(root.to_string_lossy().to_string()))?;
        if !meta.is_dir() {
            return Err(Error::InvalidConfig(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    /// Get the root path
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative path to an absolute backing path
    pub fn resolve(&self, path: &Path) -> PathBuf {
        let relative = path.strip_prefix("/").unwrap_or(path);
        if relative.as_os_str().is_empty() {
            self.root.clone()
        } else {
            self.root.join(relative)
        }
    }

    /// Metadata of the object itself (symlinks are not followed)
    pub fn metadata(&self, path: &Path) -> Result<Metadata> {
        Ok(fs::symlink_metadata(self.resolve(path))?)
    }

    pub fn exists(&self, path: &Path) -> bool {
        fs::symlink_metadata(self.resolve(path)).is_ok()
    }

    /// Read directory entries
    pub fn readdir(&self, path: &Path) -> Result<Vec<BackingDirEntry>> {
        use std::os::unix::fs::DirEntryExt;

        let mut entries = Vec::new();
        for entry in fs::read_dir(self.resolve(path))? {
            let entry = entry?;
            entries.push(BackingDirEntry {
                name: entry.file_name(),
                kind: NodeKind::from(entry.file_type()?),
                ino: entry.ino(),
            });
        }
        Ok(entries)
    }

    /// Read symlink target
    pub fn readlink(&self, path: &Path) -> Result<PathBuf> {
        Ok(fs::read_link(self.resolve(path))?)
    }

    /// Open an existing object with the kernel's open flags.
    ///
    /// A symlink at `path` is never followed; opening one fails with `ELOOP`.
    pub fn open(&self, path: &Path, flags: i32) -> Result<File> {
        let extra = flags & !(libc::O_CREAT | libc::O_EXCL) | libc::O_NOFOLLOW;
        Ok(open_options(flags, extra).open(self.resolve(path))?)
    }

    /// Create a file only if nothing exists at `path` yet.
    ///
    /// Existence check and creation are one atomic `O_CREAT | O_EXCL` open,
    /// so an existing object (a dangling symlink included) always surfaces
    /// as `EEXIST`.
    pub fn create_new(&self, path: &Path, flags: i32, mode: u32) -> Result<File> {
        let extra = flags & !libc::O_TRUNC | libc::O_CREAT | libc::O_EXCL | libc::O_NOFOLLOW;
        Ok(open_options(flags, extra)
            .mode(mode)
            .open(self.resolve(path))?)
    }

    pub fn mkdir(&self, path: &Path, mode: u32) -> Result<()> {
        fs::DirBuilder::new().mode(mode).create(self.resolve(path))?;
        Ok(())
    }

    /// Create a special file (or a regular one) with `mknod(2)`
    pub fn mknod(&self, path: &Path, mode: u32, rdev: u32) -> Result<()> {
        let kind = SFlag::from_bits_truncate((mode & libc::S_IFMT as u32) as libc::mode_t);
        let perm = Mode::from_bits_truncate((mode & 0o7777) as libc::mode_t);
        nix::sys::stat::mknod(&self.resolve(path), kind, perm, rdev as libc::dev_t)?;
        Ok(())
    }

    pub fn symlink(&self, target: &Path, path: &Path) -> Result<()> {
        std::os::unix::fs::symlink(target, self.resolve(path))?;
        Ok(())
    }

    /// Add a new name `new_path` for the object at `path`
    pub fn link(&self, path: &Path, new_path: &Path) -> Result<()> {
        fs::hard_link(self.resolve(path), self.resolve(new_path))?;
        Ok(())
    }

    pub fn unlink(&self, path: &Path) -> Result<()> {
        fs::remove_file(self.resolve(path))?;
        Ok(())
    }

    pub fn rmdir(&self, path: &Path) -> Result<()> {
        fs::remove_dir(self.resolve(path))?;
        Ok(())
    }

    /// Rename, honouring `RENAME_NOREPLACE`/`RENAME_EXCHANGE` where the host has them
    pub fn rename(&self, from: &Path, to: &Path, flags: u32) -> Result<()> {
        let (from, to) = (self.resolve(from), self.resolve(to));
        if flags == 0 {
            fs::rename(from, to)?;
            return Ok(());
        }
        rename_with_flags(&from, &to, flags)
    }

    pub fn set_mode(&self, path: &Path, mode: u32) -> Result<()> {
        fs::set_permissions(self.resolve(path), fs::Permissions::from_mode(mode & 0o7777))?;
        Ok(())
    }

    pub fn set_owner(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        std::os::unix::fs::lchown(self.resolve(path), uid, gid)?;
        Ok(())
    }

    pub fn truncate(&self, path: &Path, size: u64) -> Result<()> {
        nix::unistd::truncate(&self.resolve(path), size as libc::off_t)?;
        Ok(())
    }

    /// Update access and/or modification time without following symlinks
    pub fn set_times(&self, path: &Path, atime: Option<SetTime>, mtime: Option<SetTime>) -> Result<()> {
        nix::sys::stat::utimensat(
            None,
            &self.resolve(path),
            &timespec(atime),
            &timespec(mtime),
            UtimensatFlags::NoFollowSymlink,
        )?;
        Ok(())
    }

    /// Read from an open backing file
    pub fn read_at(file: &File, offset: u64, size: u32) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; size as usize];
        let mut filled = 0;
        while filled < buffer.len() {
            match file.read_at(&mut buffer[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        buffer.truncate(filled);
        Ok(buffer)
    }

    /// Write to an open backing file
    pub fn write_at(file: &File, offset: u64, data: &[u8]) -> Result<u32> {
        file.write_all_at(data, offset)?;
        Ok(data.len() as u32)
    }

    pub fn fsync(file: &File, datasync: bool) -> Result<()> {
        if datasync {
            file.sync_data()?;
        } else {
            file.sync_all()?;
        }
        Ok(())
    }

    pub fn allocate(file: &File, offset: u64, length: u64, mode: i32) -> Result<()> {
        #[cfg(target_os = "linux")]
        {
            let flags = nix::fcntl::FallocateFlags::from_bits_truncate(mode);
            nix::fcntl::fallocate(
                file.as_raw_fd(),
                flags,
                offset as libc::off_t,
                length as libc::off_t,
            )?;
            Ok(())
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = (file, offset, length, mode);
            Err(Error::Sys(nix::errno::Errno::EOPNOTSUPP))
        }
    }

    /// Test for a conflicting lock
    pub fn get_lock(file: &File, lock: LockRange) -> Result<LockRange> {
        let mut fl = to_flock(&lock);
        nix::fcntl::fcntl(file.as_raw_fd(), FcntlArg::F_GETLK(&mut fl))?;
        if fl.l_type as i32 == libc::F_UNLCK {
            return Ok(LockRange {
                typ: libc::F_UNLCK,
                pid: 0,
                ..lock
            });
        }
        let start = fl.l_start as u64;
        let end = if fl.l_len == 0 {
            i64::MAX as u64
        } else {
            start + fl.l_len as u64 - 1
        };
        Ok(LockRange {
            start,
            end,
            typ: fl.l_type as i32,
            pid: fl.l_pid as u32,
        })
    }

    /// Acquire or release a lock, waiting for it when `sleep` is set
    pub fn set_lock(file: &File, lock: LockRange, sleep: bool) -> Result<()> {
        let fl = to_flock(&lock);
        let arg = if sleep {
            FcntlArg::F_SETLKW(&fl)
        } else {
            FcntlArg::F_SETLK(&fl)
        };
        nix::fcntl::fcntl(file.as_raw_fd(), arg)?;
        Ok(())
    }

    /// Check the daemon's access to an object
    pub fn access(&self, path: &Path, mask: i32) -> Result<()> {
        let flags = nix::unistd::AccessFlags::from_bits_truncate(mask);
        nix::unistd::access(&self.resolve(path), flags)?;
        Ok(())
    }

    pub fn statfs(&self, path: &Path) -> Result<BackingStats> {
        let st = nix::sys::statvfs::statvfs(&self.resolve(path))?;
        Ok(BackingStats {
            blocks: st.blocks() as u64,
            bfree: st.blocks_free() as u64,
            bavail: st.blocks_available() as u64,
            files: st.files() as u64,
            ffree: st.files_free() as u64,
            bsize: st.block_size() as u32,
            namelen: st.name_max() as u32,
            frsize: st.fragment_size() as u32,
        })
    }

    pub fn getxattr(&self, path: &Path, name: &OsStr) -> Result<Vec<u8>> {
        xattr::get(&self.resolve(path), name)
    }

    /// NUL separated attribute names
    pub fn listxattr(&self, path: &Path) -> Result<Vec<u8>> {
        xattr::list(&self.resolve(path))
    }

    pub fn setxattr(&self, path: &Path, name: &OsStr, value: &[u8], flags: i32) -> Result<()> {
        xattr::set(&self.resolve(path), name, value, flags)
    }

    pub fn removexattr(&self, path: &Path, name: &OsStr) -> Result<()> {
        xattr::remove(&self.resolve(path), name)
    }
}

fn timespec(t: Option<SetTime>) -> TimeSpec {
    match t {
        None => TimeSpec::new(0, libc::UTIME_OMIT as _),
        Some(SetTime::Now) => TimeSpec::new(0, libc::UTIME_NOW as _),
        Some(SetTime::At(at)) => match at.duration_since(UNIX_EPOCH) {
            Ok(d) => TimeSpec::from(d),
            Err(_) => TimeSpec::new(0, 0),
        },
    }
}

fn to_flock(lock: &LockRange) -> libc::flock {
    // SAFETY: flock is plain old data; zero is a valid value for every field.
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = lock.typ as _;
    fl.l_whence = libc::SEEK_SET as _;
    fl.l_start = lock.start as libc::off_t;
    fl.l_len = if lock.end >= i64::MAX as u64 {
        0
    } else {
        (lock.end.saturating_sub(lock.start) + 1) as libc::off_t
    };
    fl.l_pid = lock.pid as libc::pid_t;
    fl
}

/// Options for an open with the kernel's flags. The access mode picks
/// read/write; every other bit is passed through as-is.
fn open_options(flags: i32, extra: i32) -> OpenOptions {
    let accmode = flags & libc::O_ACCMODE;
    let mut options = OpenOptions::new();
    options
        .read(accmode == libc::O_RDONLY || accmode == libc::O_RDWR)
        .write(accmode == libc::O_WRONLY || accmode == libc::O_RDWR)
        .custom_flags(extra & !libc::O_ACCMODE);
    options
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn rename_with_flags(from: &Path, to: &Path, flags: u32) -> Result<()> {
    use nix::fcntl::RenameFlags;

    let flags = RenameFlags::from_bits(flags).ok_or(nix::errno::Errno::EINVAL)?;
    nix::fcntl::renameat2(None, from, None, to, flags)?;
    Ok(())
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
fn rename_with_flags(_from: &Path, _to: &Path, _flags: u32) -> Result<()> {
    Err(Error::Sys(nix::errno::Errno::EINVAL))
}

#[cfg(target_os = "linux")]
mod xattr {
    //! Extended attributes via the `l*xattr` family (no symlink following)

    use crate::error::{Error, Result};
    use nix::errno::Errno;
    use std::ffi::{CString, OsStr};
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    fn cpath(path: &Path) -> Result<CString> {
        CString::new(path.as_os_str().as_bytes()).map_err(|_| Error::Sys(Errno::EINVAL))
    }

    fn cname(name: &OsStr) -> Result<CString> {
        CString::new(name.as_bytes()).map_err(|_| Error::Sys(Errno::EINVAL))
    }

    fn check(rc: libc::ssize_t) -> Result<usize> {
        if rc < 0 {
            Err(Error::Sys(Errno::last()))
        } else {
            Ok(rc as usize)
        }
    }

    pub fn get(path: &Path, name: &OsStr) -> Result<Vec<u8>> {
        let (p, n) = (cpath(path)?, cname(name)?);
        loop {
            // SAFETY: a null buffer with size 0 asks only for the value's length.
            let len = check(unsafe { libc::lgetxattr(p.as_ptr(), n.as_ptr(), std::ptr::null_mut(), 0) })?;
            let mut buf = vec![0u8; len];
            // SAFETY: `buf` is valid for `len` bytes.
            match check(unsafe {
                libc::lgetxattr(p.as_ptr(), n.as_ptr(), buf.as_mut_ptr().cast(), buf.len())
            }) {
                Ok(got) => {
                    buf.truncate(got);
                    return Ok(buf);
                }
                // Value grew between the two calls.
                Err(Error::Sys(Errno::ERANGE)) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn list(path: &Path) -> Result<Vec<u8>> {
        let p = cpath(path)?;
        loop {
            // SAFETY: a null buffer with size 0 asks only for the list's length.
            let len = check(unsafe { libc::llistxattr(p.as_ptr(), std::ptr::null_mut(), 0) })?;
            let mut buf = vec![0u8; len];
            // SAFETY: `buf` is valid for `len` bytes.
            match check(unsafe { libc::llistxattr(p.as_ptr(), buf.as_mut_ptr().cast(), buf.len()) }) {
                Ok(got) => {
                    buf.truncate(got);
                    return Ok(buf);
                }
                Err(Error::Sys(Errno::ERANGE)) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn set(path: &Path, name: &OsStr, value: &[u8], flags: i32) -> Result<()> {
        let (p, n) = (cpath(path)?, cname(name)?);
        // SAFETY: all pointers are valid for the lengths given.
        let rc = unsafe {
            libc::lsetxattr(p.as_ptr(), n.as_ptr(), value.as_ptr().cast(), value.len(), flags)
        };
        if rc < 0 {
            return Err(Error::Sys(Errno::last()));
        }
        Ok(())
    }

    pub fn remove(path: &Path, name: &OsStr) -> Result<()> {
        let (p, n) = (cpath(path)?, cname(name)?);
        // SAFETY: both strings are NUL terminated.
        let rc = unsafe { libc::lremovexattr(p.as_ptr(), n.as_ptr()) };
        if rc < 0 {
            return Err(Error::Sys(Errno::last()));
        }
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
mod xattr {
    use crate::error::{Error, Result};
    use nix::errno::Errno;
    use std::ffi::OsStr;
    use std::path::Path;

    pub fn get(_path: &Path, _name: &OsStr) -> Result<Vec<u8>> {
        Err(Error::Sys(Errno::ENOTSUP))
    }

    pub fn list(_path: &Path) -> Result<Vec<u8>> {
        Err(Error::Sys(Errno::ENOTSUP))
    }

    pub fn set(_path: &Path, _name: &OsStr, _value: &[u8], _flags: i32) -> Result<()> {
        Err(Error::Sys(Errno::ENOTSUP))
    }

    pub fn remove(_path: &Path, _name: &OsStr) -> Result<()> {
        Err(Error::Sys(Errno::ENOTSUP))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn backing() -> (tempfile::TempDir, Backing) {
        let dir = tempdir().unwrap();
        let backing = Backing::new(dir.path().to_path_buf()).unwrap();
        (dir, backing)
    }

    #[test]
    fn test_requires_directory() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("file");
        fs::write(&file, b"x").unwrap();
        assert!(Backing::new(file).is_err());
        assert!(matches!(
            Backing::new(dir.path().join("missing")),
            Err(Error::PathNotFound(_))
        ));
    }

    #[test]
    fn test_resolve() {
        let (dir, backing) = backing();
        assert_eq!(backing.resolve(Path::new("")), dir.path());
        assert_eq!(backing.resolve(Path::new("/a/b")), dir.path().join("a/b"));
        assert_eq!(backing.resolve(Path::new("a")), dir.path().join("a"));
    }

    #[test]
    fn test_create_new_is_exclusive() {
        let (_dir, backing) = backing();
        let file = backing
            .create_new(Path::new("a"), libc::O_WRONLY, 0o644)
            .unwrap();
        Backing::write_at(&file, 0, b"hello").unwrap();

        let err = backing
            .create_new(Path::new("a"), libc::O_WRONLY, 0o644)
            .unwrap_err();
        assert!(err.is_already_exists());

        let file = backing.open(Path::new("a"), libc::O_RDONLY).unwrap();
        assert_eq!(Backing::read_at(&file, 0, 100).unwrap(), b"hello");
        assert_eq!(Backing::read_at(&file, 3, 100).unwrap(), b"lo");
    }

    #[test]
    fn test_open_does_not_follow_symlinks() {
        let (dir, backing) = backing();
        fs::write(dir.path().join("target"), b"keep").unwrap();
        backing.symlink(Path::new("target"), Path::new("s")).unwrap();

        let err = backing
            .open(Path::new("s"), libc::O_WRONLY | libc::O_TRUNC)
            .unwrap_err();
        assert_eq!(err.errno(), libc::ELOOP);
        assert_eq!(fs::read(dir.path().join("target")).unwrap(), b"keep");

        // A dangling link still occupies the name.
        backing.symlink(Path::new("nowhere"), Path::new("d")).unwrap();
        let err = backing
            .create_new(Path::new("d"), libc::O_WRONLY, 0o644)
            .unwrap_err();
        assert!(err.is_already_exists());
        assert!(!dir.path().join("nowhere").exists());
    }

    #[test]
    fn test_open_keeps_status_flags() {
        let (dir, backing) = backing();
        fs::write(dir.path().join("log"), b"ab").unwrap();
        let file = backing
            .open(Path::new("log"), libc::O_WRONLY | libc::O_APPEND)
            .unwrap();
        Backing::write_at(&file, 0, b"cd").unwrap();
        assert_eq!(fs::read(dir.path().join("log")).unwrap(), b"abcd");

        let file = backing
            .create_new(Path::new("ro"), libc::O_RDONLY, 0o600)
            .unwrap();
        assert!(Backing::write_at(&file, 0, b"x").is_err());
        let mode = backing.metadata(Path::new("ro")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_create_new_ignores_truncate() {
        let (_dir, backing) = backing();
        let file = backing
            .create_new(Path::new("a"), libc::O_WRONLY | libc::O_TRUNC, 0o600)
            .unwrap();
        Backing::write_at(&file, 0, b"x").unwrap();
        assert_eq!(backing.metadata(Path::new("a")).unwrap().len(), 1);
    }

    #[test]
    fn test_readdir() {
        let (dir, backing) = backing();
        fs::write(dir.path().join("file1.txt"), b"1").unwrap();
        fs::write(dir.path().join("file2.txt"), b"2").unwrap();
        fs::create_dir(dir.path().join("subdir")).unwrap();

        let mut entries = backing.readdir(Path::new("")).unwrap();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].kind, NodeKind::Directory);
        assert_eq!(entries[0].kind, NodeKind::RegularFile);
    }

    #[test]
    fn test_namespace_operations() {
        let (dir, backing) = backing();
        backing.mkdir(Path::new("d"), 0o755).unwrap();
        fs::write(dir.path().join("d/f"), b"data").unwrap();

        backing.symlink(Path::new("f"), Path::new("d/l")).unwrap();
        assert_eq!(backing.readlink(Path::new("d/l")).unwrap(), PathBuf::from("f"));

        backing.link(Path::new("d/f"), Path::new("d/h")).unwrap();
        assert_eq!(fs::read(dir.path().join("d/h")).unwrap(), b"data");

        backing.rename(Path::new("d/h"), Path::new("h2"), 0).unwrap();
        assert!(backing.exists(Path::new("h2")));
        assert!(!backing.exists(Path::new("d/h")));

        backing.unlink(Path::new("h2")).unwrap();
        backing.unlink(Path::new("d/l")).unwrap();
        backing.unlink(Path::new("d/f")).unwrap();
        backing.rmdir(Path::new("d")).unwrap();
        assert!(!backing.exists(Path::new("d")));
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    #[test]
    fn test_rename_noreplace() {
        let (dir, backing) = backing();
        fs::write(dir.path().join("a"), b"a").unwrap();
        fs::write(dir.path().join("b"), b"b").unwrap();
        let err = backing
            .rename(Path::new("a"), Path::new("b"), libc::RENAME_NOREPLACE)
            .unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(fs::read(dir.path().join("b")).unwrap(), b"b");
    }

    #[test]
    fn test_attributes() {
        let (dir, backing) = backing();
        fs::write(dir.path().join("f"), b"0123456789").unwrap();

        backing.truncate(Path::new("f"), 4).unwrap();
        assert_eq!(fs::read(dir.path().join("f")).unwrap(), b"0123");

        backing.set_mode(Path::new("f"), 0o600).unwrap();
        let mode = backing.metadata(Path::new("f")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let at = UNIX_EPOCH + std::time::Duration::from_secs(1_000_000);
        backing
            .set_times(Path::new("f"), None, Some(SetTime::At(at)))
            .unwrap();
        assert_eq!(backing.metadata(Path::new("f")).unwrap().modified().unwrap(), at);
    }

    #[test]
    fn test_statfs() {
        let (_dir, backing) = backing();
        let stats = backing.statfs(Path::new("")).unwrap();
        assert!(stats.bsize > 0);
    }

    #[test]
    fn test_flock_conversion() {
        let fl = to_flock(&LockRange {
            start: 10,
            end: 19,
            typ: libc::F_WRLCK,
            pid: 7,
        });
        assert_eq!(fl.l_start, 10);
        assert_eq!(fl.l_len, 10);

        let to_eof = to_flock(&LockRange {
            start: 0,
            end: u64::MAX,
            typ: libc::F_RDLCK,
            pid: 0,
        });
        assert_eq!(to_eof.l_len, 0);
    }
}
