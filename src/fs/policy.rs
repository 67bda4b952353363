//! Write-denial decision engine
//!
//! Every filesystem operation is mapped to an [`OperationKind`], and every
//! kind belongs to exactly one [`OpClass`]. Only destructive operations
//! consult the grace window, which is anchored to the birth time of the
//! object being changed:
//!
//! ```text
//! read_only ──> deny
//! grace == 0 ──> deny
//! birth time unavailable ──> deny
//! now - born <  grace ──> allow (within grace)
//! now - born >= grace ──> deny
//! ```
//!
//! [`decide`] is a pure function of its inputs; it holds no state and may
//! be called from any number of threads at once.

use crate::config::{MountConfig, XattrRemovalPolicy};
use std::fmt;
use std::time::{Duration, SystemTime};

use super::oracle::Unavailable;

/// Whether an operation can alter existing content
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    /// Never changes anything; always forwarded
    Passthrough,
    /// Brings a new object into existence
    Create,
    /// Modifies or removes an existing object
    Destructive,
}

/// Every operation the overlay distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Lookup,
    GetAttr,
    ReadLink,
    OpenRead,
    Read,
    ReadDir,
    StatFs,
    GetXattr,
    ListXattr,
    Access,
    GetLock,
    ReadLock,
    Unlock,
    Flush,
    Fsync,
    Release,

    CreateFile,
    MakeDir,
    MakeNode,
    Symlink,
    Link,
    /// Write, append or allocation through the handle that created the file
    InitialWrite,

    Unlink,
    RemoveDir,
    Rename,
    Truncate,
    Write,
    Append,
    OpenWrite,
    /// A create or rename that landed on an object which already existed
    Overwrite,
    SetAttr,
    SetXattr,
    RemoveXattr,
    WriteLock,
    Allocate,
    CopyInto,
}

impl OperationKind {
    /// The classification table
    pub fn class(self) -> OpClass {
        use OperationKind::*;
        match self {
            Lookup | GetAttr | ReadLink | OpenRead | Read | ReadDir | StatFs | GetXattr
            | ListXattr | Access | GetLock | ReadLock | Unlock | Flush | Fsync | Release => {
                OpClass::Passthrough
            }
            CreateFile | MakeDir | MakeNode | Symlink | Link | InitialWrite => OpClass::Create,
            Unlink | RemoveDir | Rename | Truncate | Write | Append | OpenWrite | Overwrite
            | SetAttr | SetXattr | RemoveXattr | WriteLock | Allocate | CopyInto => {
                OpClass::Destructive
            }
        }
    }

    pub fn is_destructive(self) -> bool {
        self.class() == OpClass::Destructive
    }

    /// Classify an `open(2)` by its flags. Any write intent is destructive,
    /// even though open is nominally a read path.
    pub fn for_open(flags: i32) -> Self {
        let accmode = flags & libc::O_ACCMODE;
        if flags & libc::O_TRUNC != 0 {
            OperationKind::Truncate
        } else if flags & libc::O_APPEND != 0 {
            OperationKind::Append
        } else if accmode == libc::O_WRONLY || accmode == libc::O_RDWR {
            OperationKind::OpenWrite
        } else {
            OperationKind::OpenRead
        }
    }

    /// Classify a byte-range lock request by its `l_type`
    pub fn for_lock(typ: i32) -> Self {
        match typ {
            libc::F_WRLCK => OperationKind::WriteLock,
            libc::F_UNLCK => OperationKind::Unlock,
            _ => OperationKind::ReadLock,
        }
    }

    /// Short name used in logs and audit records
    pub fn name(self) -> &'static str {
        use OperationKind::*;
        match self {
            Lookup => "lookup",
            GetAttr => "getattr",
            ReadLink => "readlink",
            OpenRead => "open-read",
            Read => "read",
            ReadDir => "readdir",
            StatFs => "statfs",
            GetXattr => "getxattr",
            ListXattr => "listxattr",
            Access => "access",
            GetLock => "getlk",
            ReadLock => "read-lock",
            Unlock => "unlock",
            Flush => "flush",
            Fsync => "fsync",
            Release => "release",
            CreateFile => "create",
            MakeDir => "mkdir",
            MakeNode => "mknod",
            Symlink => "symlink",
            Link => "link",
            InitialWrite => "initial-write",
            Unlink => "unlink",
            RemoveDir => "rmdir",
            Rename => "rename",
            Truncate => "truncate",
            Write => "write",
            Append => "append",
            OpenWrite => "open-write",
            Overwrite => "overwrite",
            SetAttr => "setattr",
            SetXattr => "setxattr",
            RemoveXattr => "removexattr",
            WriteLock => "write-lock",
            Allocate => "fallocate",
            CopyInto => "copy-into",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a verdict came out the way it did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// The operation cannot change existing content
    NonDestructive,
    /// The operation creates an object that did not exist before
    NewObject,
    /// Destructive, but the object is still inside its grace window
    WithinGrace { elapsed: Duration, remaining: Duration },
    /// Destructive and no grace applies: either grace is disabled or the
    /// window has closed (`elapsed` is known in the latter case)
    NoGrace { elapsed: Option<Duration> },
    /// Destructive and the object's birth time could not be established
    CreationTimeUnavailable,
    /// The mount refuses every mutation
    ReadOnly,
}

/// Outcome of [`decide`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub allowed: bool,
    pub reason: Reason,
}

impl Verdict {
    fn allow(reason: Reason) -> Self {
        Verdict { allowed: true, reason }
    }

    fn deny(reason: Reason) -> Self {
        Verdict { allowed: false, reason }
    }

    /// Allowed only because the grace window is still open
    pub fn via_grace(&self) -> bool {
        self.allowed && matches!(self.reason, Reason::WithinGrace { .. })
    }
}

/// Decide whether `op` may proceed on an object born at `created`.
///
/// `created` is only consulted for destructive operations; callers may pass
/// `Err(Unavailable)` for anything else.
pub fn decide(
    op: OperationKind,
    now: SystemTime,
    cfg: &MountConfig,
    created: Result<SystemTime, Unavailable>,
) -> Verdict {
    match op.class() {
        OpClass::Passthrough => return Verdict::allow(Reason::NonDestructive),
        OpClass::Create if cfg.read_only => return Verdict::deny(Reason::ReadOnly),
        OpClass::Create => return Verdict::allow(Reason::NewObject),
        OpClass::Destructive => {}
    }

    if cfg.read_only {
        return Verdict::deny(Reason::ReadOnly);
    }
    if op == OperationKind::RemoveXattr && cfg.xattr_removal == XattrRemovalPolicy::Deny {
        return Verdict::deny(Reason::NoGrace { elapsed: None });
    }
    if cfg.grace_period.is_zero() {
        return Verdict::deny(Reason::NoGrace { elapsed: None });
    }
    let born = match created {
        Ok(born) => born,
        Err(Unavailable) => return Verdict::deny(Reason::CreationTimeUnavailable),
    };

    // A birth time ahead of the clock counts as just born.
    let elapsed = now.duration_since(born).unwrap_or(Duration::ZERO);
    if elapsed < cfg.grace_period {
        Verdict::allow(Reason::WithinGrace {
            elapsed,
            remaining: cfg.grace_period - elapsed,
        })
    } else {
        Verdict::deny(Reason::NoGrace { elapsed: Some(elapsed) })
    }
}
