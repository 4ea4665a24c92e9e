//! CloudFS Core - configuration, domain types and ports
//!
//! This crate holds everything the cache-backed filesystem core depends on
//! that is not itself part of the entry tree:
//! - **Configuration** - `Config` with mount capabilities, cache, backend and retry settings
//! - **Logging** - `tracing-subscriber` bootstrap
//! - **Domain types** - `RemoteId`, `ObjectVersion` and validation errors
//! - **Ports** - the `IRemoteBackend` trait and an in-memory adapter
//!
//! # Architecture
//!
//! The remote protocol (authentication, HTTP, quota endpoints) is not implemented
//! here. Adapters implement [`ports::IRemoteBackend`] and the filesystem core in
//! `cloudfs-fuse` only ever talks to that trait.

pub mod config;
pub mod domain;
pub mod logging;
pub mod ports;
