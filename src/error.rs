//! Error types for unionfs

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the union filesystem
#[derive(Error, Debug)]
pub enum Error {
    /// Name exceeds the maximum, or could never be expressed as a whiteout
    #[error("Name too long: {0}")]
    NameTooLong(String),

    /// Name collides with the whiteout namespace
    #[error("Reserved name: {0}")]
    ReservedName(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not a directory: {0}")]
    NotDirectory(String),

    #[error("Is a directory: {0}")]
    IsDirectory(String),

    #[error("Directory not empty: {0}")]
    NotEmpty(String),

    /// Parent/branch resolution raced with a concurrent mutation
    #[error("Stale branch state: {0}")]
    StaleConsistency(String),

    #[error("Busy: {0}")]
    Busy(String),

    /// No writable branch can receive the operation
    #[error("Read-only: {0}")]
    ReadOnly(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Invalid branch: {0}")]
    InvalidBranch(String),

    /// The backing branch operation itself failed
    #[error("{op} failed on branch: {source}")]
    UnderlyingIo {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// Compensation after a failed operation could not restore prior state
    #[error("Reverting {op} of {name} failed ({cause}; revert: {revert})")]
    RevertFailed {
        op: &'static str,
        name: String,
        cause: Box<Error>,
        revert: Box<Error>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap a branch driver error
    pub fn underlying(op: &'static str, source: io::Error) -> Self {
        Error::UnderlyingIo { op, source }
    }

    /// Errno a VFS front end should hand back for this error
    pub fn errno(&self) -> i32 {
        match self {
            Error::NameTooLong(_) => libc::ENAMETOOLONG,
            Error::ReservedName(_) => libc::EPERM,
            Error::AlreadyExists(_) => libc::EEXIST,
            Error::NotFound(_) => libc::ENOENT,
            Error::NotDirectory(_) => libc::ENOTDIR,
            Error::IsDirectory(_) => libc::EISDIR,
            Error::NotEmpty(_) => libc::ENOTEMPTY,
            Error::StaleConsistency(_) => libc::EIO,
            Error::Busy(_) => libc::EBUSY,
            Error::ReadOnly(_) => libc::EROFS,
            Error::NotSupported(_) => libc::EOPNOTSUPP,
            Error::InvalidBranch(_) => libc::EINVAL,
            Error::UnderlyingIo { source, .. } => source.raw_os_error().unwrap_or(libc::EIO),
            Error::RevertFailed { .. } => libc::EIO,
            Error::Config(_) | Error::InvalidConfig(_) => libc::EINVAL,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::Internal(_) => libc::EIO,
        }
    }
}
