//! Remote backend port (driven/secondary port)
//!
//! This module defines the interface the filesystem core uses to reach the
//! cloud object store. Authentication, HTTP semantics and endpoint details
//! are the adapter's business; the core only sees objects addressed by
//! [`RemoteId`].
//!
//! ## Design Notes
//!
//! - Errors are a typed [`BackendError`] rather than `anyhow::Error`: the
//!   content cache must tell transient failures (retry) from permanent ones
//!   (surface immediately), so the classification is part of the contract.
//! - Uses `#[async_trait]` for async trait methods.
//! - Implementations must not retry internally; retry policy belongs to the
//!   flush engine so that the retry budget is configured in one place.

use std::time::{Duration, SystemTime};

use thiserror::Error;

use crate::domain::newtypes::{ObjectVersion, RemoteId};

// ============================================================================
// Errors
// ============================================================================

/// Failure reported by a remote backend call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The object does not exist (or no longer exists) remotely
    #[error("object not found: {0}")]
    NotFound(String),

    /// Name collision or concurrent modification on the remote side
    #[error("conflict: {0}")]
    Conflict(String),

    /// The account has no room for the write
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Credentials do not allow the operation
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The call did not complete within the configured timeout
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Network failure, throttling or a 5xx-class response
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// Any other permanent failure
    #[error("backend error: {0}")]
    Other(String),
}

impl BackendError {
    /// Returns true if retrying the same call may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Timeout(_) | BackendError::Unavailable(_))
    }
}

/// Result alias for backend calls
pub type BackendResult<T> = Result<T, BackendError>;

// ============================================================================
// DTOs
// ============================================================================

/// Kind of remote object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    File,
    Directory,
}

/// Metadata of a remote object as reported by the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Provider-specific identifier
    pub id: RemoteId,
    /// Object name within its parent
    pub name: String,
    /// File or directory
    pub kind: ObjectKind,
    /// Content length in bytes (0 for directories)
    pub size: u64,
    /// Version token, changes on every content or metadata update
    pub version: ObjectVersion,
    /// Last modification time
    pub modified: SystemTime,
}

/// Half-open byte interval `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    #[must_use]
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end, "inverted range {start}..{end}");
        Self { start, end }
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// How a `put` applies its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutMode {
    /// Replace the whole object content with the payload
    Whole,
    /// Write the payload at `offset` and set the object length to `total_size`
    ///
    /// Bytes outside `[offset, offset + payload.len())` and below `total_size`
    /// keep their previous content (zero if the object grows).
    Chunk { offset: u64, total_size: u64 },
}

/// Storage quota of the account
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    /// Total storage in bytes
    pub total: u64,
    /// Used storage in bytes
    pub used: u64,
}

impl Quota {
    /// Bytes still available (never negative)
    #[must_use]
    pub fn free(&self) -> u64 {
        self.total.saturating_sub(self.used)
    }
}

// ============================================================================
// IRemoteBackend trait
// ============================================================================

/// Port trait for remote object storage
///
/// Every method may fail transiently (network, throttling, timeouts) or
/// permanently (not found, conflict, quota). See [`BackendError::is_transient`].
#[async_trait::async_trait]
pub trait IRemoteBackend: Send + Sync {
    /// Returns the metadata of the account's root directory
    async fn root(&self) -> BackendResult<ObjectMeta>;

    /// Retrieves metadata for a single object without touching its content
    async fn stat(&self, id: &RemoteId) -> BackendResult<ObjectMeta>;

    /// Lists the direct children of a directory
    async fn list(&self, dir: &RemoteId) -> BackendResult<Vec<ObjectMeta>>;

    /// Downloads the bytes of `range`
    ///
    /// The result is shorter than `range.len()` when the range extends past
    /// the end of the object, and empty when it starts at or after the end.
    async fn get(&self, id: &RemoteId, range: ByteRange) -> BackendResult<Vec<u8>>;

    /// Uploads content, either as a whole-object replace or as one chunk
    async fn put(&self, id: &RemoteId, data: &[u8], mode: PutMode) -> BackendResult<ObjectMeta>;

    /// Creates an empty file or directory named `name` under `parent`
    async fn create(
        &self,
        parent: &RemoteId,
        name: &str,
        kind: ObjectKind,
    ) -> BackendResult<ObjectMeta>;

    /// Deletes an object (directories must be empty)
    async fn delete(&self, id: &RemoteId) -> BackendResult<()>;

    /// Moves an object under `new_parent` with `new_name`
    ///
    /// Fails with [`BackendError::Conflict`] if the destination name is taken.
    async fn rename(
        &self,
        id: &RemoteId,
        new_parent: &RemoteId,
        new_name: &str,
    ) -> BackendResult<ObjectMeta>;

    /// Sets the modification time of an object
    async fn set_mtime(&self, id: &RemoteId, mtime: SystemTime) -> BackendResult<ObjectMeta>;

    /// Queries the account's storage quota
    async fn quota(&self) -> BackendResult<Quota>;
}
