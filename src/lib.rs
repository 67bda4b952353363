//! immutfs - append-only overlay filesystem
//!
//! This library provides a FUSE filesystem that mirrors an existing
//! directory tree and refuses to modify, rename or delete anything in it.
//! New objects may be created, and stay mutable for a configurable grace
//! period measured from their birth time.

pub mod config;
pub mod error;
pub mod fs;

pub use config::MountConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::MountConfig;
    pub use crate::error::{Error, Result};
    pub use crate::fs::{decide, ImmutFs, OperationKind, Overlay, Verdict};
}
