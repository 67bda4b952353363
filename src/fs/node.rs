//! Overlay node table
//!
//! One [`Node`] per backing object the kernel currently knows about. Nodes
//! remember their parent and entry name only; the backing path is derived
//! on demand so renames never leave a stale copy behind. Each node carries
//! its own lock around the cached birth time, so unrelated objects never
//! contend.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::ffi::{OsStr, OsString};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use super::oracle::{CreationTimeOracle, Unavailable};
use crate::config::MountConfig;

/// Inode number of the mount root
pub const ROOT_INO: u64 = fuser::FUSE_ROOT_ID;

/// File type of a backing object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    RegularFile,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl From<std::fs::FileType> for NodeKind {
    fn from(ft: std::fs::FileType) -> Self {
        use std::os::unix::fs::FileTypeExt;
        if ft.is_dir() {
            NodeKind::Directory
        } else if ft.is_symlink() {
            NodeKind::Symlink
        } else if ft.is_block_device() {
            NodeKind::BlockDevice
        } else if ft.is_char_device() {
            NodeKind::CharDevice
        } else if ft.is_fifo() {
            NodeKind::Fifo
        } else if ft.is_socket() {
            NodeKind::Socket
        } else {
            NodeKind::RegularFile
        }
    }
}

impl NodeKind {
    pub fn to_fuser_type(self) -> fuser::FileType {
        match self {
            NodeKind::RegularFile => fuser::FileType::RegularFile,
            NodeKind::Directory => fuser::FileType::Directory,
            NodeKind::Symlink => fuser::FileType::Symlink,
            NodeKind::BlockDevice => fuser::FileType::BlockDevice,
            NodeKind::CharDevice => fuser::FileType::CharDevice,
            NodeKind::Fifo => fuser::FileType::NamedPipe,
            NodeKind::Socket => fuser::FileType::Socket,
        }
    }
}

/// Build kernel attributes for `ino` from backing metadata.
///
/// With `null_permissions`, objects carrying no permission bits at all are
/// shown as 0644 (0755 for directories).
pub fn file_attr(ino: u64, meta: &std::fs::Metadata, config: &MountConfig) -> fuser::FileAttr {
    use std::os::unix::fs::MetadataExt;

    let kind = NodeKind::from(meta.file_type());
    let mut perm = (meta.mode() & 0o7777) as u16;
    if config.null_permissions && perm & 0o777 == 0 {
        perm |= if kind == NodeKind::Directory { 0o755 } else { 0o644 };
    }

    fuser::FileAttr {
        ino,
        size: meta.size(),
        blocks: meta.blocks(),
        atime: unix_time(meta.atime(), meta.atime_nsec()),
        mtime: unix_time(meta.mtime(), meta.mtime_nsec()),
        ctime: unix_time(meta.ctime(), meta.ctime_nsec()),
        crtime: meta.created().unwrap_or(SystemTime::UNIX_EPOCH),
        kind: kind.to_fuser_type(),
        perm,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        blksize: meta.blksize() as u32,
        flags: 0,
    }
}

fn unix_time(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        SystemTime::UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        SystemTime::UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
            + Duration::from_nanos(nsecs as u64)
    }
}

/// Where a node hangs in the tree
#[derive(Debug, Clone)]
struct NodeLink {
    parent: u64,
    name: OsString,
}

/// One backing object known to the kernel
#[derive(Debug)]
pub struct Node {
    /// Overlay inode number
    pub ino: u64,
    /// Host inode number seen when the node was resolved
    pub backing_ino: u64,
    link: RwLock<NodeLink>,
    lookups: AtomicU64,
    birth: RwLock<Option<SystemTime>>,
}

impl Node {
    fn new(ino: u64, backing_ino: u64, parent: u64, name: OsString) -> Self {
        Node {
            ino,
            backing_ino,
            link: RwLock::new(NodeLink { parent, name }),
            lookups: AtomicU64::new(0),
            birth: RwLock::new(None),
        }
    }

    pub fn parent(&self) -> u64 {
        self.link.read().parent
    }

    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::SeqCst)
    }

    /// Cached birth time, if one has been observed
    pub fn cached_creation_time(&self) -> Option<SystemTime> {
        *self.birth.read()
    }

    /// Birth time of this node, asking `oracle` about `path` on first use.
    ///
    /// A successful answer is cached for the node's lifetime and never
    /// replaced. Failures are not cached, so a later call may succeed.
    pub fn creation_time(
        &self,
        path: &std::path::Path,
        oracle: &dyn CreationTimeOracle,
    ) -> Result<SystemTime, Unavailable> {
        if let Some(born) = *self.birth.read() {
            return Ok(born);
        }

        let queried = oracle.creation_time(path)?;
        let mut birth = self.birth.write();
        Ok(*birth.get_or_insert(queried))
    }
}

/// Arena of live nodes plus the (parent, name) index used for lookups
pub struct NodeTable {
    next_ino: AtomicU64,
    nodes: DashMap<u64, Arc<Node>>,
    children: DashMap<(u64, OsString), u64>,
}

impl NodeTable {
    /// Create a table holding only the root, backed by host inode `root_backing_ino`
    pub fn new(root_backing_ino: u64) -> Self {
        let table = NodeTable {
            next_ino: AtomicU64::new(ROOT_INO + 1),
            nodes: DashMap::new(),
            children: DashMap::new(),
        };
        let root = Node::new(ROOT_INO, root_backing_ino, ROOT_INO, OsString::new());
        root.lookups.store(1, Ordering::SeqCst);
        table.nodes.insert(ROOT_INO, Arc::new(root));
        table
    }

    pub fn get(&self, ino: u64) -> Option<Arc<Node>> {
        self.nodes.get(&ino).map(|n| Arc::clone(n.value()))
    }

    pub fn exists(&self, ino: u64) -> bool {
        self.nodes.contains_key(&ino)
    }

    /// Number of registered nodes, the root included
    pub fn count(&self) -> usize {
        self.nodes.len()
    }

    /// Node currently registered under `name` in `parent`
    pub fn child(&self, parent: u64, name: &OsStr) -> Option<Arc<Node>> {
        let ino = *self.children.get(&(parent, name.to_os_string()))?;
        self.get(ino)
    }

    /// Backing path of `ino`, relative to the backing root
    pub fn path_of(&self, ino: u64) -> Option<PathBuf> {
        let mut parts = Vec::new();
        let mut current = ino;
        while current != ROOT_INO {
            let node = self.get(current)?;
            let link = node.link.read().clone();
            parts.push(link.name);
            current = link.parent;
            if parts.len() > 4096 {
                return None;
            }
        }
        Some(parts.iter().rev().collect())
    }

    /// Backing path of `name` inside directory `parent`
    pub fn child_path(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        Some(self.path_of(parent)?.join(name))
    }

    /// Resolve `name` in `parent` to a node and count one kernel lookup.
    ///
    /// An existing node is reused only while it still refers to the same
    /// host object; if something else now lives at that name a fresh node
    /// (with no cached birth time) takes its place.
    pub fn resolve(&self, parent: u64, name: &OsStr, backing_ino: u64) -> Arc<Node> {
        let key = (parent, name.to_os_string());
        if let Some(existing) = self.children.get(&key).map(|e| *e.value()) {
            if let Some(node) = self.get(existing) {
                if node.backing_ino == backing_ino {
                    node.lookups.fetch_add(1, Ordering::SeqCst);
                    return node;
                }
            }
        }

        let ino = self.next_ino.fetch_add(1, Ordering::SeqCst);
        let node = Arc::new(Node::new(ino, backing_ino, parent, name.to_os_string()));
        node.lookups.store(1, Ordering::SeqCst);
        self.nodes.insert(ino, Arc::clone(&node));
        self.children.insert(key, ino);
        node
    }

    /// Drop `nlookup` kernel references; the node goes away at zero
    pub fn forget(&self, ino: u64, nlookup: u64) {
        if ino == ROOT_INO {
            return;
        }
        let Some(node) = self.get(ino) else {
            return;
        };

        let prev = node
            .lookups
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(nlookup)))
            .unwrap_or(0);
        if prev > nlookup {
            return;
        }

        self.nodes.remove(&ino);
        let link = node.link.read().clone();
        self.children
            .remove_if(&(link.parent, link.name), |_, child| *child == ino);
    }

    /// The entry `name` in `parent` was removed from the backing store
    pub fn unlink(&self, parent: u64, name: &OsStr) {
        self.children.remove(&(parent, name.to_os_string()));
    }

    /// The entry `name` in `parent` now lives at `new_name` in `new_parent`
    pub fn rename(&self, parent: u64, name: &OsStr, new_parent: u64, new_name: &OsStr) {
        let old_key = (parent, name.to_os_string());
        let new_key = (new_parent, new_name.to_os_string());

        let moved = self.children.remove(&old_key).map(|(_, ino)| ino);
        self.children.remove(&new_key);

        if let Some(ino) = moved {
            if let Some(node) = self.get(ino) {
                *node.link.write() = NodeLink {
                    parent: new_parent,
                    name: new_name.to_os_string(),
                };
            }
            self.children.insert(new_key, ino);
        }
    }

    /// Both entries traded places (`RENAME_EXCHANGE`)
    pub fn exchange(&self, parent: u64, name: &OsStr, new_parent: u64, new_name: &OsStr) {
        let a_key = (parent, name.to_os_string());
        let b_key = (new_parent, new_name.to_os_string());

        let a = self.children.remove(&a_key).map(|(_, ino)| ino);
        let b = self.children.remove(&b_key).map(|(_, ino)| ino);

        if let Some(ino) = a {
            if let Some(node) = self.get(ino) {
                *node.link.write() = NodeLink {
                    parent: new_parent,
                    name: new_name.to_os_string(),
                };
            }
            self.children.insert(b_key, ino);
        }
        if let Some(ino) = b {
            if let Some(node) = self.get(ino) {
                *node.link.write() = NodeLink {
                    parent,
                    name: name.to_os_string(),
                };
            }
            self.children.insert(a_key, ino);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::oracle::testing::{FirstSightOracle, ManualClock};
    use std::path::Path;

    #[test]
    fn test_root_path() {
        let table = NodeTable::new(2);
        assert_eq!(table.path_of(ROOT_INO), Some(PathBuf::new()));
        assert_eq!(table.count(), 1);
    }

    #[test]
    fn test_resolve_and_path() {
        let table = NodeTable::new(2);
        let dir = table.resolve(ROOT_INO, OsStr::new("dir"), 100);
        let file = table.resolve(dir.ino, OsStr::new("file"), 101);

        assert_eq!(table.path_of(file.ino), Some(PathBuf::from("dir/file")));
        assert_eq!(
            table.child_path(dir.ino, OsStr::new("other")),
            Some(PathBuf::from("dir/other"))
        );
        assert_eq!(table.child(dir.ino, OsStr::new("file")).unwrap().ino, file.ino);
    }

    #[test]
    fn test_resolve_reuses_same_object() {
        let table = NodeTable::new(2);
        let a = table.resolve(ROOT_INO, OsStr::new("a"), 100);
        let again = table.resolve(ROOT_INO, OsStr::new("a"), 100);
        assert_eq!(a.ino, again.ino);
        assert_eq!(again.lookups(), 2);

        // A different host object under the same name gets a new node.
        let replaced = table.resolve(ROOT_INO, OsStr::new("a"), 200);
        assert_ne!(replaced.ino, a.ino);
        assert_eq!(table.child(ROOT_INO, OsStr::new("a")).unwrap().ino, replaced.ino);
    }

    #[test]
    fn test_forget() {
        let table = NodeTable::new(2);
        let a = table.resolve(ROOT_INO, OsStr::new("a"), 100);
        table.resolve(ROOT_INO, OsStr::new("a"), 100);

        table.forget(a.ino, 1);
        assert!(table.exists(a.ino));
        table.forget(a.ino, 1);
        assert!(!table.exists(a.ino));
        assert!(table.child(ROOT_INO, OsStr::new("a")).is_none());

        table.forget(ROOT_INO, 10);
        assert!(table.exists(ROOT_INO));
    }

    #[test]
    fn test_forget_keeps_newer_entry() {
        let table = NodeTable::new(2);
        let old = table.resolve(ROOT_INO, OsStr::new("a"), 100);
        let new = table.resolve(ROOT_INO, OsStr::new("a"), 200);
        table.forget(old.ino, 1);
        assert_eq!(table.child(ROOT_INO, OsStr::new("a")).unwrap().ino, new.ino);
    }

    #[test]
    fn test_rename_moves_subtree() {
        let table = NodeTable::new(2);
        let dir = table.resolve(ROOT_INO, OsStr::new("dir"), 100);
        let file = table.resolve(dir.ino, OsStr::new("file"), 101);
        let other = table.resolve(ROOT_INO, OsStr::new("other"), 102);

        table.rename(ROOT_INO, OsStr::new("dir"), other.ino, OsStr::new("moved"));
        assert_eq!(table.path_of(file.ino), Some(PathBuf::from("other/moved/file")));
        assert!(table.child(ROOT_INO, OsStr::new("dir")).is_none());
    }

    #[test]
    fn test_exchange() {
        let table = NodeTable::new(2);
        let a = table.resolve(ROOT_INO, OsStr::new("a"), 100);
        let b = table.resolve(ROOT_INO, OsStr::new("b"), 101);
        table.exchange(ROOT_INO, OsStr::new("a"), ROOT_INO, OsStr::new("b"));
        assert_eq!(table.path_of(a.ino), Some(PathBuf::from("b")));
        assert_eq!(table.path_of(b.ino), Some(PathBuf::from("a")));
    }

    #[test]
    fn test_unlink() {
        let table = NodeTable::new(2);
        let a = table.resolve(ROOT_INO, OsStr::new("a"), 100);
        table.unlink(ROOT_INO, OsStr::new("a"));
        assert!(table.child(ROOT_INO, OsStr::new("a")).is_none());
        // Still reachable by inode until the kernel forgets it.
        assert!(table.exists(a.ino));
    }

    #[test]
    fn test_creation_time_cached_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"x").unwrap();

        let clock = ManualClock::new();
        let oracle = FirstSightOracle::new(clock.clone());
        let table = NodeTable::new(2);
        let node = table.resolve(ROOT_INO, OsStr::new("f"), 100);

        assert!(node.cached_creation_time().is_none());
        let born = node.creation_time(&path, &oracle).unwrap();
        assert_eq!(node.cached_creation_time(), Some(born));

        // Even if the oracle would now answer differently, the anchor holds.
        oracle.seed(&path, born + Duration::from_secs(100));
        assert_eq!(node.creation_time(&path, &oracle), Ok(born));
    }

    #[test]
    fn test_unavailable_not_cached() {
        let clock = ManualClock::new();
        let oracle = FirstSightOracle::new(clock);
        let table = NodeTable::new(2);
        let node = table.resolve(ROOT_INO, OsStr::new("missing"), 100);
        assert_eq!(
            node.creation_time(Path::new("/nonexistent/missing"), &oracle),
            Err(Unavailable)
        );
        assert!(node.cached_creation_time().is_none());
    }

    #[test]
    fn test_null_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"x").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0)).unwrap();
        let meta = std::fs::symlink_metadata(&path).unwrap();

        let plain = file_attr(5, &meta, &MountConfig::default());
        assert_eq!(plain.perm, 0);

        let relaxed = MountConfig {
            null_permissions: true,
            ..Default::default()
        };
        let attr = file_attr(5, &meta, &relaxed);
        assert_eq!(attr.perm, 0o644);
        assert_eq!(attr.ino, 5);
        assert_eq!(attr.size, 1);

        let dmeta = std::fs::symlink_metadata(dir.path()).unwrap();
        let dattr = file_attr(6, &dmeta, &relaxed);
        assert_eq!(dattr.kind, fuser::FileType::Directory);
    }
}
