//! Append-only overlay filesystem
//!
//! [`Overlay`] decides and forwards every operation against the backing
//! directory; [`ImmutFs`] serves it to the kernel over FUSE.

pub mod audit;
pub mod backing;
pub mod dispatch;
mod filesystem;
mod handle;
pub mod node;
pub mod oracle;
pub mod policy;

pub use audit::{AuditLogger, AuditRecord, CallerIdentity};
pub use dispatch::Overlay;
pub use filesystem::ImmutFs;
pub use policy::{decide, OperationKind, Verdict};
