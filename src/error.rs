//! Error types for immutfs

use thiserror::Error;

/// Result type alias for immutfs operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for immutfs
#[derive(Error, Debug)]
pub enum Error {
    /// Error reported by the backing store through std
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Error reported by the backing store through a raw syscall
    #[error("System error: {0}")]
    Sys(#[from] nix::errno::Errno),

    /// Refused by the write-denial policy
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Inode not found: {0}")]
    InodeNotFound(u64),

    #[error("Invalid file handle: {0}")]
    InvalidHandle(u64),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid duration: {0}")]
    InvalidDuration(String),

    #[error("Mount failed: {0}")]
    Mount(String),
}

impl Error {
    /// Errno replied to the kernel for this error.
    ///
    /// Backing-store failures keep their original errno so callers see the
    /// same error the underlying filesystem produced.
    pub fn errno(&self) -> libc::c_int {
        match self {
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::Sys(errno) => *errno as libc::c_int,
            Error::PermissionDenied(_) => libc::EACCES,
            Error::PathNotFound(_) | Error::InodeNotFound(_) => libc::ENOENT,
            Error::InvalidHandle(_) => libc::EBADF,
            Error::InvalidDuration(_) | Error::InvalidConfig(_) => libc::EINVAL,
            Error::Config(_) | Error::Mount(_) => libc::EIO,
        }
    }

    /// True when the backing store reported that the object already exists
    pub fn is_already_exists(&self) -> bool {
        self.errno() == libc::EEXIST
    }
}
