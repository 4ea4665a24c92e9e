//! Error types for the CloudFS core.
//!
//! Defines `FsError` and conversions to libc errno values.

use cloudfs_core::{domain::DomainError, ports::BackendError};
use thiserror::Error;

/// Errors returned by filesystem entry points.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    /// The namespace changed under a mutation (e.g. the source was renamed away).
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("name too long: {0}")]
    NameTooLong(String),

    /// Backend timeout or 5xx-class failure that survived internal retries.
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    #[error("I/O error: {0}")]
    PermanentIo(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("operation not supported: {0}")]
    Unsupported(String),
}

/// Result alias for filesystem operations.
pub type FsResult<T> = Result<T, FsError>;

impl From<FsError> for libc::c_int {
    fn from(err: FsError) -> libc::c_int {
        match err {
            FsError::NotFound(_) => libc::ENOENT,
            FsError::AlreadyExists(_) => libc::EEXIST,
            FsError::NotEmpty(_) => libc::ENOTEMPTY,
            FsError::Conflict(_) => libc::EBUSY,
            FsError::NotADirectory(_) => libc::ENOTDIR,
            FsError::IsADirectory(_) => libc::EISDIR,
            FsError::InvalidArgument(_) => libc::EINVAL,
            FsError::NameTooLong(_) => libc::ENAMETOOLONG,
            FsError::TransientIo(_) => libc::EAGAIN,
            FsError::PermanentIo(_) => libc::EIO,
            FsError::QuotaExceeded(_) => libc::ENOSPC,
            FsError::PermissionDenied(_) => libc::EACCES,
            FsError::Unsupported(_) => libc::ENOTSUP,
        }
    }
}

impl From<BackendError> for FsError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NotFound(msg) => FsError::NotFound(msg),
            BackendError::Conflict(msg) => FsError::Conflict(msg),
            BackendError::QuotaExceeded(msg) => FsError::QuotaExceeded(msg),
            BackendError::PermissionDenied(msg) => FsError::PermissionDenied(msg),
            e @ (BackendError::Timeout(_) | BackendError::Unavailable(_)) => {
                FsError::TransientIo(e.to_string())
            }
            BackendError::Other(msg) => FsError::PermanentIo(msg),
        }
    }
}

impl From<DomainError> for FsError {
    fn from(err: DomainError) -> Self {
        FsError::InvalidArgument(err.to_string())
    }
}

impl From<std::io::Error> for FsError {
    fn from(err: std::io::Error) -> Self {
        FsError::PermanentIo(err.to_string())
    }
}
