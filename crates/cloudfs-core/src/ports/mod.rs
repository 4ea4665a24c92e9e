//! Port definitions (hexagonal architecture interfaces)
//!
//! This module defines the port traits that form the boundaries of the
//! filesystem core. Ports are interfaces that the entry tree and content
//! cache depend on, but whose production implementations live in adapter crates.
//!
//! ## Ports Overview
//!
//! - [`IRemoteBackend`] - Remote object storage (CRUD, ranged reads, chunked writes, quota)
//! - [`InMemoryBackend`] - In-process implementation with fault injection for tests

pub mod memory_backend;
pub mod remote_backend;

pub use memory_backend::InMemoryBackend;
pub use remote_backend::{
    BackendError, BackendResult, ByteRange, IRemoteBackend, ObjectKind, ObjectMeta, PutMode,
    Quota,
};
