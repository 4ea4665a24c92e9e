//! The mounted filesystem.
//!
//! [`CloudFs`] is the surface a kernel adapter drives: every operation is
//! addressed by inode number or file handle, returns an [`FsResult`] whose
//! error converts into an errno, and maps onto the [`EntryTree`] and the
//! per-file content caches.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        CloudFs                           │
//! │  ┌────────────┐   ┌──────────────┐   ┌───────────────┐   │
//! │  │ EntryTree  │   │ file handles │   │ statfs cache  │   │
//! │  │ (entries)  │   │ (fh → Entry) │   │ (quota, TTL)  │   │
//! │  └─────┬──────┘   └──────┬───────┘   └───────┬───────┘   │
//! │        └─────────────────┼───────────────────┘           │
//! │                   MountContext                           │
//! │        RemoteClient · StoreFactory · TaskTracker         │
//! └──────────────────────────────────────────────────────────┘
//! ```

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

use cloudfs_core::{
    config::Config,
    domain::NAME_MAX,
    ports::{BackendError, IRemoteBackend, Quota},
};
use dashmap::DashMap;
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, error, info, warn};

use crate::{
    cache::CacheLimits,
    context::MountContext,
    entry::{Entry, EntryKind, Lifecycle},
    error::{FsError, FsResult},
    remote::{RemoteClient, RetryPolicy},
    storage::StoreFactory,
    tree::EntryTree,
    xattr,
};

/// Block size reported by `statfs`.
const BLOCK_SIZE: u32 = 4096;

/// Limits negotiated at mount time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountCapabilities {
    /// Concurrent backend transfers.
    pub max_background: u16,
    /// Largest upload chunk; also the whole-object upload threshold.
    pub max_write: u32,
    /// Read-ahead window and largest download chunk.
    pub max_readahead: u32,
}

/// Filesystem usage as reported by `statfs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStats {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub block_size: u32,
    pub name_max: u32,
}

impl FsStats {
    fn from_quota(quota: Quota) -> Self {
        Self {
            total_bytes: quota.total,
            used_bytes: quota.used,
            free_bytes: quota.free(),
            block_size: BLOCK_SIZE,
            name_max: NAME_MAX as u32,
        }
    }

    pub fn total_blocks(&self) -> u64 {
        self.total_bytes / u64::from(self.block_size)
    }

    pub fn free_blocks(&self) -> u64 {
        self.free_bytes / u64::from(self.block_size)
    }
}

/// A mounted cloud filesystem.
pub struct CloudFs {
    tree: EntryTree,
    ctx: Arc<MountContext>,
    handles: DashMap<u64, Arc<Entry>>,
    next_fh: AtomicU64,
    capabilities: MountCapabilities,
    statfs_ttl: Duration,
    statfs_cache: Mutex<Option<(Instant, Quota)>>,
}

impl CloudFs {
    /// Mounts `backend` with the given configuration.
    ///
    /// Fetches the root object; nothing else is listed until first accessed.
    pub async fn mount(backend: Arc<dyn IRemoteBackend>, config: &Config) -> FsResult<Self> {
        let problems = config.validate();
        if let Some(first) = problems.first() {
            return Err(FsError::InvalidArgument(format!("invalid configuration: {first}")));
        }

        let capabilities = MountCapabilities {
            max_background: config.mount.max_background,
            max_write: config.mount.max_write,
            max_readahead: config.mount.max_readahead,
        };
        let policy = RetryPolicy::from_config(&config.retry, &config.backend);
        let remote = Arc::new(RemoteClient::new(
            backend,
            policy,
            usize::from(capabilities.max_background),
        ));
        let stores = StoreFactory::from_config(&config.cache)?;
        let limits = CacheLimits {
            max_write: u64::from(capabilities.max_write),
            max_readahead: u64::from(capabilities.max_readahead),
        };

        let root = remote.root().await?;
        let ctx = Arc::new(
            MountContext::new(remote, stores, limits).with_listing_ttl(config.backend.listing_ttl()),
        );
        let tree = EntryTree::new(&root, Arc::clone(&ctx));
        info!(
            root = %root.id,
            max_background = capabilities.max_background,
            max_write = capabilities.max_write,
            max_readahead = capabilities.max_readahead,
            "Mounted cloud filesystem"
        );

        Ok(Self {
            tree,
            ctx,
            handles: DashMap::new(),
            next_fh: AtomicU64::new(1),
            capabilities,
            statfs_ttl: config.backend.statfs_ttl(),
            statfs_cache: Mutex::new(None),
        })
    }

    pub fn capabilities(&self) -> MountCapabilities {
        self.capabilities
    }

    pub fn tree(&self) -> &EntryTree {
        &self.tree
    }

    /// Number of open file and directory handles.
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    fn entry(&self, ino: u64) -> FsResult<Arc<Entry>> {
        self.tree.get(ino)
    }

    fn handle(&self, fh: u64) -> FsResult<Arc<Entry>> {
        self.handles
            .get(&fh)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| FsError::InvalidArgument(format!("unknown file handle {fh}")))
    }

    fn register_handle(&self, entry: Arc<Entry>) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        self.handles.insert(fh, entry);
        fh
    }

    // ========================================================================
    // Namespace
    // ========================================================================

    /// Resolves an absolute path to its attributes.
    pub async fn resolve(&self, path: &str) -> FsResult<fuser::FileAttr> {
        debug!(path, "resolve");
        Ok(self.tree.resolve(path).await?.attr().await)
    }

    pub async fn lookup(&self, parent: u64, name: &str) -> FsResult<fuser::FileAttr> {
        debug!(parent, name, "lookup");
        let parent = self.entry(parent)?;
        Ok(self.tree.lookup(&parent, name).await?.attr().await)
    }

    pub async fn getattr(&self, ino: u64) -> FsResult<fuser::FileAttr> {
        debug!(ino, "getattr");
        Ok(self.entry(ino)?.attr().await)
    }

    /// Attributes through an open handle; works for orphaned files too.
    pub async fn fgetattr(&self, fh: u64) -> FsResult<fuser::FileAttr> {
        debug!(fh, "fgetattr");
        Ok(self.handle(fh)?.attr().await)
    }

    pub async fn readdir(&self, ino: u64) -> FsResult<Vec<(String, fuser::FileAttr)>> {
        debug!(ino, "readdir");
        let dir = self.entry(ino)?;
        self.tree.list_children(&dir).await
    }

    pub async fn mkdir(&self, parent: u64, name: &str) -> FsResult<fuser::FileAttr> {
        debug!(parent, name, "mkdir");
        let parent = self.entry(parent)?;
        let dir = self
            .tree
            .create_child(&parent, name, EntryKind::Directory)
            .await?;
        Ok(dir.attr().await)
    }

    /// Creates a file and opens it.
    pub async fn create(&self, parent: u64, name: &str) -> FsResult<(u64, fuser::FileAttr)> {
        debug!(parent, name, "create");
        let parent = self.entry(parent)?;
        let file = self.tree.create_child(&parent, name, EntryKind::File).await?;
        file.open(&self.ctx).await?;
        let attr = file.attr().await;
        Ok((self.register_handle(file), attr))
    }

    pub async fn unlink(&self, parent: u64, name: &str) -> FsResult<()> {
        debug!(parent, name, "unlink");
        let parent = self.entry(parent)?;
        if self.tree.lookup(&parent, name).await?.is_dir() {
            return Err(FsError::IsADirectory(name.to_string()));
        }
        self.tree.remove_child(&parent, name).await
    }

    pub async fn rmdir(&self, parent: u64, name: &str) -> FsResult<()> {
        debug!(parent, name, "rmdir");
        let parent = self.entry(parent)?;
        if !self.tree.lookup(&parent, name).await?.is_dir() {
            return Err(FsError::NotADirectory(name.to_string()));
        }
        self.tree.remove_child(&parent, name).await
    }

    pub async fn rename(
        &self,
        parent: u64,
        name: &str,
        new_parent: u64,
        new_name: &str,
    ) -> FsResult<()> {
        debug!(parent, name, new_parent, new_name, "rename");
        let parent = self.entry(parent)?;
        let new_parent = self.entry(new_parent)?;
        let entry = self.tree.lookup(&parent, name).await?;
        self.tree.move_entry(&entry, &new_parent, new_name).await
    }

    /// Reports quota-based usage, refreshed at most once per TTL.
    pub async fn statfs(&self) -> FsResult<FsStats> {
        let mut cached = self.statfs_cache.lock().await;
        if let Some((at, quota)) = *cached {
            if at.elapsed() < self.statfs_ttl {
                return Ok(FsStats::from_quota(quota));
            }
        }
        let quota = self.ctx.remote.quota().await?;
        debug!(total = quota.total, used = quota.used, "Refreshed quota");
        *cached = Some((Instant::now(), quota));
        Ok(FsStats::from_quota(quota))
    }

    // ========================================================================
    // Handles
    // ========================================================================

    /// Opens a file and returns a new handle.
    pub async fn open(&self, ino: u64) -> FsResult<u64> {
        debug!(ino, "open");
        let entry = self.entry(ino)?;
        if entry.is_dir() {
            return Err(FsError::IsADirectory(format!("inode {ino}")));
        }
        entry.open(&self.ctx).await?;
        Ok(self.register_handle(entry))
    }

    pub async fn opendir(&self, ino: u64) -> FsResult<u64> {
        debug!(ino, "opendir");
        let entry = self.entry(ino)?;
        if !entry.is_dir() {
            return Err(FsError::NotADirectory(format!("inode {ino}")));
        }
        entry.open(&self.ctx).await?;
        Ok(self.register_handle(entry))
    }

    pub async fn release(&self, fh: u64) -> FsResult<()> {
        debug!(fh, "release");
        let (_, entry) = self
            .handles
            .remove(&fh)
            .ok_or_else(|| FsError::InvalidArgument(format!("unknown file handle {fh}")))?;
        entry.release(&self.ctx).await
    }

    pub async fn releasedir(&self, fh: u64) -> FsResult<()> {
        debug!(fh, "releasedir");
        self.release(fh).await
    }

    // ========================================================================
    // Content
    // ========================================================================

    pub async fn read(&self, fh: u64, offset: u64, size: u32) -> FsResult<Vec<u8>> {
        debug!(fh, offset, size, "read");
        self.handle(fh)?.read(offset, size).await
    }

    /// Buffers `data` at `offset`; returns the number of bytes accepted.
    pub fn write(&self, fh: u64, offset: u64, data: &[u8]) -> FsResult<usize> {
        debug!(fh, offset, len = data.len(), "write");
        self.handle(fh)?.write(offset, data)
    }

    pub async fn truncate(&self, ino: u64, length: u64) -> FsResult<fuser::FileAttr> {
        debug!(ino, length, "truncate");
        let entry = self.entry(ino)?;
        entry.truncate(&self.ctx, length).await?;
        Ok(entry.attr().await)
    }

    pub async fn ftruncate(&self, fh: u64, length: u64) -> FsResult<fuser::FileAttr> {
        debug!(fh, length, "ftruncate");
        let entry = self.handle(fh)?;
        entry.set_length(length)?;
        Ok(entry.attr().await)
    }

    pub async fn flush(&self, fh: u64) -> FsResult<()> {
        debug!(fh, "flush");
        self.handle(fh)?.flush().await
    }

    pub async fn fsync(&self, fh: u64, datasync: bool) -> FsResult<()> {
        debug!(fh, datasync, "fsync");
        self.handle(fh)?.sync(&self.ctx, datasync).await
    }

    pub async fn utimens(
        &self,
        ino: u64,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> FsResult<fuser::FileAttr> {
        debug!(ino, "utimens");
        let entry = self.entry(ino)?;
        entry.utime(atime, mtime).await;
        Ok(entry.attr().await)
    }

    // ========================================================================
    // Extended attributes
    // ========================================================================

    pub fn getxattr(&self, ino: u64, name: &str) -> FsResult<Vec<u8>> {
        debug!(ino, name, "getxattr");
        let entry = self.entry(ino)?;
        xattr::get(&entry, name)
    }

    pub fn setxattr(&self, ino: u64, name: &str, value: &[u8]) -> FsResult<()> {
        debug!(ino, name, "setxattr");
        let entry = self.entry(ino)?;
        xattr::set(&entry, name, value)
    }

    pub fn listxattr(&self, ino: u64) -> FsResult<Vec<String>> {
        debug!(ino, "listxattr");
        let entry = self.entry(ino)?;
        xattr::list(&entry)
    }

    pub fn removexattr(&self, ino: u64, name: &str) -> FsResult<()> {
        debug!(ino, name, "removexattr");
        let entry = self.entry(ino)?;
        xattr::remove(&entry, name)
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Waits for background flushes, flushes every dirty file and deletes
    /// parked orphans whose remote delete was still pending.
    ///
    /// Keeps going after a failure and returns the first one.
    pub async fn destroy(&self) -> FsResult<()> {
        info!(
            entries = self.ctx.inodes.len(),
            handles = self.handles.len(),
            "Cloud filesystem shutting down"
        );
        self.ctx.tracker.close();
        self.ctx.tracker.wait().await;

        let mut first_error = None;
        for entry in self.ctx.inodes.entries() {
            let result = match entry.lifecycle().await {
                Lifecycle::Active if entry.is_dir() => Ok(()),
                Lifecycle::Active => entry.flush().await,
                Lifecycle::Orphaned { remote_deleted: true } => Ok(()),
                Lifecycle::Orphaned { remote_deleted: false } => {
                    let remote_id = entry.attributes().await.remote_id;
                    entry.free_content();
                    self.ctx.inodes.remove(entry.ino().get());
                    match self.ctx.remote.delete(&remote_id).await {
                        Ok(()) | Err(BackendError::NotFound(_)) => Ok(()),
                        Err(e) => Err(e.into()),
                    }
                }
            };
            if let Err(e) = result {
                error!(ino = %entry.ino(), error = %e, "Shutdown flush failed");
                first_error.get_or_insert(e);
            }
        }

        if !self.handles.is_empty() {
            warn!(handles = self.handles.len(), "Handles still open at shutdown");
            self.handles.clear();
        }
        first_error.map_or(Ok(()), Err)
    }
}
