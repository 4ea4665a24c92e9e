//! CloudFS FUSE core - a cache-backed filesystem over a remote object store
//!
//! Provides:
//! - A lazily populated entry tree mirroring the remote namespace
//! - Per-file content caches with range-based residency and dirty tracking
//! - A flush engine uploading whole objects or chunks with retries
//! - Delete-while-open semantics via orphaned entries
//!
//! # Architecture
//!
//! - [`CloudFs`] is the operation surface a kernel adapter calls into
//! - [`EntryTree`] resolves paths and performs namespace mutations
//! - [`Entry`] holds per-node metadata and reference counts
//! - [`ContentCache`] buffers reads and writes of one open file
//! - [`RemoteClient`] wraps the backend with timeouts, retries and a transfer limit
//!
//! # Usage
//!
//! ```ignore
//! use cloudfs_core::{config::Config, ports::InMemoryBackend};
//! use cloudfs_fuse::CloudFs;
//!
//! let fs = CloudFs::mount(Arc::new(InMemoryBackend::new()), &Config::default()).await?;
//! let (fh, _) = fs.create(1, "notes.txt").await?;
//! fs.write(fh, 0, b"hello")?;
//! fs.release(fh).await?;
//! fs.destroy().await?;
//! ```

pub mod cache;
pub mod context;
pub mod entry;
pub mod error;
pub mod filesystem;
pub mod inode;
pub mod ranges;
pub mod remote;
pub mod storage;
pub mod tree;
pub mod xattr;

pub use cache::{CacheLimits, ContentCache};
pub use entry::{Entry, EntryKind, InodeNumber, Lifecycle};
pub use error::{FsError, FsResult};
pub use filesystem::{CloudFs, FsStats, MountCapabilities};
pub use ranges::RangeSet;
pub use remote::{RemoteClient, RetryPolicy};
pub use tree::EntryTree;
