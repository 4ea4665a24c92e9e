//! State shared by every entry of one mounted filesystem.

use std::{sync::Arc, time::Duration};

use tokio_util::task::TaskTracker;

use crate::{cache::CacheLimits, inode::InodeTable, remote::RemoteClient, storage::StoreFactory};

/// Default time a directory listing is trusted before it is fetched again.
const DEFAULT_LISTING_TTL: Duration = Duration::from_secs(30);

/// Collaborators reachable from entry and tree operations.
pub struct MountContext {
    /// Backend access (timeouts, retries, transfer limit).
    pub remote: Arc<RemoteClient>,
    /// Local storage for newly opened files.
    pub stores: StoreFactory,
    pub limits: CacheLimits,
    /// Every live entry, including orphans that are still open.
    pub inodes: InodeTable,
    /// Background flushes started by `release`.
    pub tracker: TaskTracker,
    pub listing_ttl: Duration,
}

impl MountContext {
    pub fn new(remote: Arc<RemoteClient>, stores: StoreFactory, limits: CacheLimits) -> Self {
        Self {
            remote,
            stores,
            limits,
            inodes: InodeTable::new(),
            tracker: TaskTracker::new(),
            listing_ttl: DEFAULT_LISTING_TTL,
        }
    }

    pub fn with_listing_ttl(mut self, ttl: Duration) -> Self {
        self.listing_ttl = ttl;
        self
    }
}
