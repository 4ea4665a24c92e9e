//! Domain error types
//!
//! This module defines error types raised while validating domain values
//! such as remote identifiers, version tokens and path segments.

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid remote ID format
    #[error("Invalid remote ID: {0}")]
    InvalidRemoteId(String),

    /// Invalid version token
    #[error("Invalid version token: {0}")]
    InvalidVersion(String),

    /// Invalid path format or content
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Invalid entry name (path segment)
    #[error("Invalid name: {0}")]
    InvalidName(String),
}
