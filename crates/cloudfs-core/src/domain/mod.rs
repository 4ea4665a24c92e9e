//! Domain types
//!
//! This module contains the core domain types for CloudFS:
//! - Newtypes for remote object identifiers and version tokens
//! - Domain-specific error types

pub mod errors;
pub mod newtypes;

// Re-export commonly used types
pub use errors::DomainError;
pub use newtypes::*;
