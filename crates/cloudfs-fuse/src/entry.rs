//! Namespace entries.
//!
//! An [`Entry`] is one file or directory node of the tree. Directories own
//! their children; files own a [`ContentCache`] once first opened. Each entry
//! carries its own `tokio::sync::RwLock` guarding name, parent link,
//! attributes, children and lifecycle. The lock may be held across backend
//! calls; structural mutations that touch several entries take their locks in
//! ascending inode order (see [`crate::tree`]).
//!
//! ## Reference Counting
//!
//! `open_count` tracks live handles (`open`/`opendir` vs. `release`/
//! `releasedir`). It is only changed while the entry's lock is held, so a
//! concurrent unlink sees a stable count when deciding between deleting the
//! remote object now and orphaning the entry until the last release.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
    time::SystemTime,
};

use cloudfs_core::{
    domain::{ObjectVersion, RemoteId},
    ports::{BackendError, ObjectKind, ObjectMeta},
};
use tokio::{sync::RwLock, time::Instant};
use tracing::{debug, error, warn};

use crate::{
    cache::ContentCache,
    context::MountContext,
    error::{FsError, FsResult},
};

/// Size reported for every directory.
pub const DIRECTORY_SIZE: u64 = 4096;

/// Default permission bits for files.
pub const FILE_PERM: u16 = 0o644;

/// Default permission bits for directories.
pub const DIR_PERM: u16 = 0o755;

/// A newtype wrapper for inode numbers.
///
/// Doubles as the global lock order for namespace mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InodeNumber(u64);

impl InodeNumber {
    /// Root inode number (always 1 per FUSE convention)
    pub const ROOT: InodeNumber = InodeNumber(1);

    pub fn new(val: u64) -> Self {
        InodeNumber(val)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl From<InodeNumber> for u64 {
    fn from(ino: InodeNumber) -> Self {
        ino.0
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// File or directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

impl EntryKind {
    pub fn file_type(self) -> fuser::FileType {
        match self {
            EntryKind::File => fuser::FileType::RegularFile,
            EntryKind::Directory => fuser::FileType::Directory,
        }
    }
}

impl From<ObjectKind> for EntryKind {
    fn from(kind: ObjectKind) -> Self {
        match kind {
            ObjectKind::File => EntryKind::File,
            ObjectKind::Directory => EntryKind::Directory,
        }
    }
}

impl From<EntryKind> for ObjectKind {
    fn from(kind: EntryKind) -> Self {
        match kind {
            EntryKind::File => ObjectKind::File,
            EntryKind::Directory => ObjectKind::Directory,
        }
    }
}

/// Whether an entry is still reachable from the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Active,
    /// Detached from its parent. `remote_deleted` is false while the remote
    /// delete is deferred to the last release.
    Orphaned { remote_deleted: bool },
}

/// Cached metadata of an entry.
#[derive(Debug, Clone)]
pub struct Attributes {
    pub remote_id: RemoteId,
    pub version: ObjectVersion,
    /// Size as last reported by the backend (files without a cache).
    pub size: u64,
    pub perm: u16,
    pub mtime: SystemTime,
    pub atime: SystemTime,
    pub ctime: SystemTime,
    /// Set by `utime`; pushed to the backend on the next full `sync`.
    pub mtime_pending: bool,
}

/// Lock-protected part of an [`Entry`].
#[derive(Debug)]
pub struct EntryMeta {
    pub(crate) name: String,
    pub(crate) parent: Weak<Entry>,
    pub(crate) attrs: Attributes,
    /// `Some` for directories.
    pub(crate) children: Option<BTreeMap<String, Arc<Entry>>>,
    /// When the backend listing was last merged into `children`.
    pub(crate) listed_at: Option<Instant>,
    pub(crate) lifecycle: Lifecycle,
}

impl EntryMeta {
    pub fn is_active(&self) -> bool {
        self.lifecycle == Lifecycle::Active
    }

    pub(crate) fn child(&self, name: &str) -> Option<Arc<Entry>> {
        self.children.as_ref()?.get(name).cloned()
    }

    pub(crate) fn children_mut(&mut self) -> &mut BTreeMap<String, Arc<Entry>> {
        self.children.get_or_insert_with(BTreeMap::new)
    }

    pub(crate) fn has_children(&self) -> bool {
        self.children.as_ref().is_some_and(|c| !c.is_empty())
    }

    /// Records a namespace change in this directory.
    pub(crate) fn touch(&mut self) {
        let now = SystemTime::now();
        self.attrs.mtime = now;
        self.attrs.ctime = now;
    }
}

/// A file or directory node.
pub struct Entry {
    ino: InodeNumber,
    kind: EntryKind,
    pub(crate) meta: RwLock<EntryMeta>,
    open_count: AtomicU64,
    content: Mutex<Option<Arc<ContentCache>>>,
}

impl Entry {
    /// Creates an entry for a backend object.
    ///
    /// `loaded` marks a directory whose (empty) listing is already known,
    /// as for directories this mount has just created.
    pub fn new(ino: InodeNumber, parent: Weak<Entry>, object: &ObjectMeta, loaded: bool) -> Arc<Self> {
        let kind = EntryKind::from(object.kind);
        let now = SystemTime::now();
        Arc::new(Self {
            ino,
            kind,
            meta: RwLock::new(EntryMeta {
                name: object.name.clone(),
                parent,
                attrs: Attributes {
                    remote_id: object.id.clone(),
                    version: object.version.clone(),
                    size: object.size,
                    perm: match kind {
                        EntryKind::File => FILE_PERM,
                        EntryKind::Directory => DIR_PERM,
                    },
                    mtime: object.modified,
                    atime: now,
                    ctime: object.modified,
                    mtime_pending: false,
                },
                children: (kind == EntryKind::Directory).then(BTreeMap::new),
                listed_at: loaded.then(Instant::now),
                lifecycle: Lifecycle::Active,
            }),
            open_count: AtomicU64::new(0),
            content: Mutex::new(None),
        })
    }

    // ========================================================================
    // Getters
    // ========================================================================

    pub fn ino(&self) -> InodeNumber {
        self.ino
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Number of live handles.
    pub fn open_count(&self) -> u64 {
        self.open_count.load(Ordering::SeqCst)
    }

    /// The file's content cache, if it has been opened.
    pub fn content(&self) -> Option<Arc<ContentCache>> {
        self.content_slot().clone()
    }

    pub async fn name(&self) -> String {
        self.meta.read().await.name.clone()
    }

    /// Containing directory; `None` for the root and for orphans.
    pub async fn parent(&self) -> Option<Arc<Entry>> {
        self.meta.read().await.parent.upgrade()
    }

    pub async fn lifecycle(&self) -> Lifecycle {
        self.meta.read().await.lifecycle
    }

    pub async fn attributes(&self) -> Attributes {
        self.meta.read().await.attrs.clone()
    }

    pub(crate) fn set_content(&self, cache: Arc<ContentCache>) {
        *self.content_slot() = Some(cache);
    }

    pub(crate) fn free_content(&self) {
        self.content_slot().take();
    }

    fn content_slot(&self) -> MutexGuard<'_, Option<Arc<ContentCache>>> {
        self.content.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_cache(&self) -> FsResult<Arc<ContentCache>> {
        if self.is_dir() {
            return Err(FsError::IsADirectory(format!("inode {}", self.ino)));
        }
        self.content()
            .ok_or_else(|| FsError::InvalidArgument(format!("inode {} is not open", self.ino)))
    }

    // ========================================================================
    // Attribute projection
    // ========================================================================

    /// Projects the entry into the attribute record the kernel expects.
    pub async fn attr(&self) -> fuser::FileAttr {
        let meta = self.meta.read().await;
        self.project(&meta)
    }

    fn project(&self, meta: &EntryMeta) -> fuser::FileAttr {
        let attrs = &meta.attrs;
        let (size, mtime, nlink) = match (self.kind, self.content()) {
            (EntryKind::Directory, _) => (DIRECTORY_SIZE, attrs.mtime, 2),
            (EntryKind::File, Some(cache)) => {
                (cache.length(), cache.modified().unwrap_or(attrs.mtime), 1)
            }
            (EntryKind::File, None) => (attrs.size, attrs.mtime, 1),
        };
        fuser::FileAttr {
            ino: self.ino.get(),
            size,
            blocks: size.div_ceil(512),
            atime: attrs.atime,
            mtime,
            ctime: attrs.ctime,
            crtime: attrs.ctime,
            kind: self.kind.file_type(),
            perm: attrs.perm,
            nlink,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }

    /// Sets access and modification times locally; a new mtime is pushed to
    /// the backend by the next full `sync`.
    pub async fn utime(&self, atime: Option<SystemTime>, mtime: Option<SystemTime>) {
        let mut meta = self.meta.write().await;
        if let Some(atime) = atime {
            meta.attrs.atime = atime;
        }
        if let Some(mtime) = mtime {
            meta.attrs.mtime = mtime;
            meta.attrs.mtime_pending = true;
            if let Some(cache) = self.content() {
                cache.clear_modified();
            }
        }
        meta.attrs.ctime = SystemTime::now();
    }

    // ========================================================================
    // Handle lifecycle
    // ========================================================================

    /// Registers a new handle.
    ///
    /// The first open of a file fetches its current size and version with
    /// `stat` (no content is downloaded) and creates the content cache. The
    /// first open of a later session checks the object again and drops cached
    /// content that changed remotely. A failure leaves the open count
    /// unchanged.
    pub async fn open(&self, ctx: &MountContext) -> FsResult<()> {
        if self.is_dir() {
            let _meta = self.meta.read().await;
            self.open_count.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }
        {
            let _meta = self.meta.read().await;
            // Joining a session that is already open needs no backend call.
            let joined = self
                .open_count
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n > 0).then_some(n + 1))
                .is_ok();
            if joined {
                return Ok(());
            }
        }

        let mut meta = self.meta.write().await;
        if self.open_count() == 0 {
            if !meta.is_active() {
                return Err(FsError::NotFound(format!("inode {} was removed", self.ino)));
            }
            match self.content() {
                Some(cache) => {
                    if let Some(remote) = cache.revalidate().await? {
                        meta.attrs.size = remote.size;
                        meta.attrs.version = remote.version;
                        meta.attrs.mtime = remote.modified;
                    }
                }
                None => {
                    let remote = ctx.remote.stat(&meta.attrs.remote_id).await?;
                    debug!(ino = %self.ino, size = remote.size, version = %remote.version, "Opened remote object");
                    meta.attrs.size = remote.size;
                    meta.attrs.version = remote.version.clone();
                    let store = ctx.stores.create(&meta.attrs.remote_id)?;
                    self.set_content(Arc::new(ContentCache::new(
                        meta.attrs.remote_id.clone(),
                        Arc::clone(&ctx.remote),
                        store,
                        ctx.limits,
                        remote.size,
                        Some(remote.version),
                    )));
                }
            }
        }
        self.open_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Drops a handle.
    ///
    /// When the last handle goes away an orphaned entry is deleted remotely
    /// (unless that already happened) and its cache is freed; an active entry
    /// with unflushed changes gets a background flush. Never waits for a flush.
    pub async fn release(self: &Arc<Self>, ctx: &MountContext) -> FsResult<()> {
        let meta = self.meta.read().await;
        let previous = self
            .open_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .map_err(|_| FsError::InvalidArgument(format!("inode {} has no open handle", self.ino)))?;
        if previous > 1 {
            return Ok(());
        }
        if let Some(cache) = self.content() {
            cache.end_session();
        }
        let lifecycle = meta.lifecycle;
        let remote_id = meta.attrs.remote_id.clone();
        drop(meta);

        match lifecycle {
            Lifecycle::Orphaned { remote_deleted } => {
                if self.is_dir() {
                    return Ok(());
                }
                self.free_content();
                ctx.inodes.remove(self.ino.get());
                if !remote_deleted {
                    debug!(ino = %self.ino, %remote_id, "Deleting orphan after last release");
                    match ctx.remote.delete(&remote_id).await {
                        Ok(()) | Err(BackendError::NotFound(_)) => {}
                        Err(e) => {
                            error!(ino = %self.ino, %remote_id, error = %e, "Deferred delete failed");
                            return Err(e.into());
                        }
                    }
                }
                Ok(())
            }
            Lifecycle::Active => {
                if let Some(cache) = self.content() {
                    if cache.is_dirty() {
                        let entry = Arc::clone(self);
                        ctx.tracker.spawn(async move {
                            if let Err(e) = entry.flush().await {
                                error!(ino = %entry.ino, error = %e, "Background flush failed, data stays dirty");
                            }
                        });
                    }
                }
                Ok(())
            }
        }
    }

    // ========================================================================
    // Content operations
    // ========================================================================

    pub async fn read(&self, offset: u64, size: u32) -> FsResult<Vec<u8>> {
        self.open_cache()?.read(offset, size).await
    }

    /// Buffers a write locally. Never blocks on the network.
    pub fn write(&self, offset: u64, data: &[u8]) -> FsResult<usize> {
        self.open_cache()?.write(offset, data)
    }

    /// Truncates an open file.
    pub fn set_length(&self, length: u64) -> FsResult<()> {
        self.open_cache()?.truncate(length)
    }

    /// Truncates a file whether or not it is open.
    pub async fn truncate(self: &Arc<Self>, ctx: &MountContext, length: u64) -> FsResult<()> {
        if self.is_dir() {
            return Err(FsError::IsADirectory(format!("inode {}", self.ino)));
        }
        self.open(ctx).await?;
        let result = self.set_length(length);
        let released = self.release(ctx).await;
        result.and(released)
    }

    /// Uploads pending changes. Orphans are skipped: their content is going away.
    pub async fn flush(&self) -> FsResult<()> {
        let Some(cache) = self.content() else {
            return Ok(());
        };
        if !self.meta.read().await.is_active() {
            return Ok(());
        }
        if cache.flush().await? {
            debug!(ino = %self.ino, "Flushed content");
        }
        Ok(())
    }

    /// Flushes content; unless `datasync`, also pushes a pending mtime and
    /// confirms the remote size matches the local length.
    pub async fn sync(&self, ctx: &MountContext, datasync: bool) -> FsResult<()> {
        self.flush().await?;
        if datasync || self.is_dir() {
            return Ok(());
        }

        let (remote_id, pending_mtime) = {
            let meta = self.meta.read().await;
            if !meta.is_active() {
                return Ok(());
            }
            let attrs = &meta.attrs;
            (attrs.remote_id.clone(), attrs.mtime_pending.then_some(attrs.mtime))
        };

        if let Some(mtime) = pending_mtime {
            let updated = ctx.remote.set_mtime(&remote_id, mtime).await?;
            let mut meta = self.meta.write().await;
            if meta.attrs.mtime == mtime {
                meta.attrs.mtime_pending = false;
            }
            meta.attrs.version = updated.version.clone();
            if let Some(cache) = self.content() {
                cache.set_remote_version(updated.version);
            }
        }

        let remote = ctx.remote.stat(&remote_id).await?;
        if let Some(cache) = self.content() {
            if !cache.is_dirty() && remote.size != cache.length() {
                warn!(ino = %self.ino, remote_size = remote.size, local_length = cache.length(), "Remote size mismatch after sync");
                return Err(FsError::PermanentIo(format!(
                    "remote size {} does not match local length {}",
                    remote.size,
                    cache.length()
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("ino", &self.ino)
            .field("kind", &self.kind)
            .field("open_count", &self.open_count())
            .finish_non_exhaustive()
    }
}
