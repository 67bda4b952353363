//! Open file handle management

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::File;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A backing file opened on behalf of the kernel
#[derive(Debug)]
pub struct OpenFile {
    /// Overlay inode the handle was opened for
    pub ino: u64,
    /// Open flags as passed by the kernel
    pub flags: i32,
    /// Backing file
    pub file: File,
    /// The handle came from the create call that brought the file into being
    pub created: bool,
}

impl OpenFile {
    pub fn new(ino: u64, flags: i32, file: File) -> Self {
        OpenFile {
            ino,
            flags,
            file,
            created: false,
        }
    }

    /// Handle returned by an exclusive create of a new file
    pub fn created(ino: u64, flags: i32, file: File) -> Self {
        OpenFile {
            created: true,
            ..OpenFile::new(ino, flags, file)
        }
    }

    /// Check if opened for writing
    pub fn is_writable(&self) -> bool {
        let accmode = self.flags & libc::O_ACCMODE;
        accmode == libc::O_WRONLY || accmode == libc::O_RDWR
    }

    /// Check if opened for append
    pub fn is_append(&self) -> bool {
        self.flags & libc::O_APPEND != 0
    }
}

/// Table of open handles, keyed by the handle id given to the kernel
pub struct HandleTable {
    next_fh: AtomicU64,
    handles: RwLock<HashMap<u64, Arc<OpenFile>>>,
}

impl HandleTable {
    pub fn new() -> Self {
        HandleTable {
            next_fh: AtomicU64::new(1),
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// Register an open file and return its handle id
    pub fn insert(&self, handle: OpenFile) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        self.handles.write().insert(fh, Arc::new(handle));
        fh
    }

    pub fn get(&self, fh: u64) -> Option<Arc<OpenFile>> {
        self.handles.read().get(&fh).cloned()
    }

    /// Forget a handle. The backing file closes once no call still uses it.
    pub fn remove(&self, fh: u64) -> Option<Arc<OpenFile>> {
        self.handles.write().remove(&fh)
    }

    pub fn is_valid(&self, fh: u64) -> bool {
        self.handles.read().contains_key(&fh)
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempfile;

    #[test]
    fn test_handle_flags() {
        let read = OpenFile::new(1, libc::O_RDONLY, tempfile().unwrap());
        assert!(!read.is_writable());
        assert!(!read.is_append());

        let write = OpenFile::new(1, libc::O_WRONLY | libc::O_APPEND, tempfile().unwrap());
        assert!(write.is_writable());
        assert!(write.is_append());

        let rw = OpenFile::new(1, libc::O_RDWR, tempfile().unwrap());
        assert!(rw.is_writable());
        assert!(!rw.created);

        let fresh = OpenFile::created(1, libc::O_WRONLY, tempfile().unwrap());
        assert!(fresh.created);
        assert!(fresh.is_writable());
    }

    #[test]
    fn test_handle_table() {
        let table = HandleTable::new();

        let fh1 = table.insert(OpenFile::new(1, libc::O_RDONLY, tempfile().unwrap()));
        let fh2 = table.insert(OpenFile::new(2, libc::O_RDWR, tempfile().unwrap()));
        assert_ne!(fh1, fh2);

        assert!(table.is_valid(fh1));
        assert!(table.is_valid(fh2));
        assert!(!table.is_valid(999));
        assert_eq!(table.get(fh2).unwrap().ino, 2);

        table.remove(fh1);
        assert!(!table.is_valid(fh1));
        assert!(table.is_valid(fh2));
        assert!(table.remove(fh1).is_none());
    }
}
