//! Domain newtypes with validation
//!
//! This module provides strongly-typed wrappers for remote identifiers and values.
//! Each newtype ensures data validity at construction time.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::DomainError;

/// Maximum length of a single path segment in bytes (POSIX NAME_MAX).
pub const NAME_MAX: usize = 255;

// ============================================================================
// Remote object identity
// ============================================================================

/// Backend object identifier
///
/// Opaque to the core. Backends are free to use paths, URLs or generated
/// tokens; the only requirement is a non-empty string without NUL bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RemoteId(String);

impl RemoteId {
    /// Create a new RemoteId
    ///
    /// # Errors
    /// Returns error if the ID is empty or contains a NUL byte
    pub fn new(id: String) -> Result<Self, DomainError> {
        if id.is_empty() {
            return Err(DomainError::InvalidRemoteId(
                "Remote ID cannot be empty".to_string(),
            ));
        }

        if id.contains('\0') {
            return Err(DomainError::InvalidRemoteId(format!(
                "Remote ID contains a NUL byte: {id:?}"
            )));
        }

        Ok(Self(id))
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RemoteId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RemoteId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for RemoteId {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<RemoteId> for String {
    fn from(id: RemoteId) -> Self {
        id.0
    }
}

/// Remote object version (etag or revision counter rendered as text)
///
/// Compared only for equality; the core never interprets its contents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectVersion(String);

impl ObjectVersion {
    /// Create a new ObjectVersion
    ///
    /// # Errors
    /// Returns error if the token is empty or contains whitespace
    pub fn new(token: String) -> Result<Self, DomainError> {
        if token.is_empty() {
            return Err(DomainError::InvalidVersion(
                "Version token cannot be empty".to_string(),
            ));
        }
        if token.chars().any(char::is_whitespace) {
            return Err(DomainError::InvalidVersion(format!(
                "Version token contains whitespace: {token:?}"
            )));
        }
        Ok(Self(token))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ObjectVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for ObjectVersion {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<ObjectVersion> for String {
    fn from(v: ObjectVersion) -> Self {
        v.0
    }
}

// ============================================================================
// Path segments
// ============================================================================

/// Validates a single path segment.
///
/// Rejects empty names, `.`/`..`, names containing `/` or NUL, and names
/// longer than [`NAME_MAX`] bytes.
///
/// # Errors
/// Returns [`DomainError::InvalidName`] describing the first violation found
pub fn validate_name(name: &str) -> Result<(), DomainError> {
    if name.is_empty() {
        return Err(DomainError::InvalidName("name cannot be empty".to_string()));
    }
    if name == "." || name == ".." {
        return Err(DomainError::InvalidName(format!("reserved name: {name}")));
    }
    if name.contains('/') || name.contains('\0') {
        return Err(DomainError::InvalidName(format!(
            "name contains a separator or NUL: {name:?}"
        )));
    }
    if name.len() > NAME_MAX {
        return Err(DomainError::InvalidName(format!(
            "name exceeds {NAME_MAX} bytes ({} bytes)",
            name.len()
        )));
    }
    Ok(())
}

/// Splits an absolute path into its segments.
///
/// Repeated separators and a trailing separator are ignored, so `"/"` yields
/// no segments and `"//a/b/"` yields `["a", "b"]`.
///
/// # Errors
/// Returns [`DomainError::InvalidPath`] for relative paths and for `.`/`..`
/// segments, which the adapter layer is expected to have normalized away
pub fn split_path(path: &str) -> Result<Vec<&str>, DomainError> {
    if !path.starts_with('/') {
        return Err(DomainError::InvalidPath(format!(
            "path must be absolute: {path}"
        )));
    }
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.iter().any(|s| *s == "." || *s == "..") {
        return Err(DomainError::InvalidPath(format!(
            "path must be normalized: {path}"
        )));
    }
    Ok(segments)
}
