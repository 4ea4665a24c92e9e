//! The entry tree: path resolution and namespace mutations.
//!
//! Directories are populated lazily from the backend listing the first time
//! they are traversed, and listed again once the listing is older than the
//! mount's listing TTL. Every mutation that touches more than one entry
//! acquires the entries' write locks through [`LockSet`], which sorts by inode
//! number so that two concurrent mutations can never wait on each other in a
//! cycle. Read-only paths never hold more than one entry lock at a time.
//!
//! Backend calls that change the namespace (`create`, `delete`, `rename`) are
//! issued while the affected entries are locked, so the local tree is only
//! updated once the backend has accepted the change.
//!
//! ## Parking
//!
//! A removed file that is still open, and the target of a replacing rename,
//! are not deleted right away. Their remote object is renamed into the root
//! directory under a hidden per-inode name (see [`parked_name`]), which frees
//! the original name for new objects and lets a failed rename put the target
//! back. Parked objects are deleted on their last release or at shutdown.

use std::{
    collections::BTreeMap,
    sync::{Arc, Weak},
    time::SystemTime,
};

use cloudfs_core::{
    domain::{split_path, validate_name, RemoteId, NAME_MAX},
    ports::{BackendError, ObjectMeta},
};
use tokio::{sync::RwLockWriteGuard, time::Instant};
use tracing::{debug, error, warn};

use crate::{
    cache::ContentCache,
    context::MountContext,
    entry::{Entry, EntryKind, EntryMeta, InodeNumber, Lifecycle},
    error::{FsError, FsResult},
};

/// Prefix of the hidden names parked objects wait under.
pub const PARKED_PREFIX: &str = ".cloudfs-parked.";

/// Hidden name for the parked object of `ino`, unique per mount process.
pub fn parked_name(ino: InodeNumber) -> String {
    format!("{PARKED_PREFIX}{}.{ino}", std::process::id())
}

/// Checks a single name for use in the namespace.
pub fn check_name(name: &str) -> FsResult<()> {
    if name.len() > NAME_MAX {
        return Err(FsError::NameTooLong(format!(
            "{} bytes exceeds {NAME_MAX}",
            name.len()
        )));
    }
    validate_name(name)?;
    if name.starts_with(PARKED_PREFIX) {
        return Err(FsError::InvalidArgument(format!("reserved name: {name}")));
    }
    Ok(())
}

/// Write locks on several entries, acquired in ascending inode order.
struct LockSet<'a> {
    guards: Vec<(InodeNumber, RwLockWriteGuard<'a, EntryMeta>)>,
}

impl<'a> LockSet<'a> {
    async fn acquire(entries: &[&'a Arc<Entry>]) -> LockSet<'a> {
        let mut order = entries.to_vec();
        order.sort_by_key(|entry| entry.ino());
        order.dedup_by_key(|entry| entry.ino());

        let mut guards = Vec::with_capacity(order.len());
        for entry in order {
            guards.push((entry.ino(), entry.meta.write().await));
        }
        LockSet { guards }
    }

    fn meta(&mut self, entry: &Entry) -> FsResult<&mut EntryMeta> {
        self.guards
            .iter_mut()
            .find(|(ino, _)| *ino == entry.ino())
            .map(|(_, guard)| &mut **guard)
            .ok_or_else(|| FsError::InvalidArgument(format!("inode {} is not locked", entry.ino())))
    }
}

/// The namespace of one mount.
pub struct EntryTree {
    root: Arc<Entry>,
    /// Remote directory parked objects are moved into.
    root_id: RemoteId,
    ctx: Arc<MountContext>,
}

impl EntryTree {
    /// Creates a tree whose root is the backend object `root`.
    pub fn new(root: &ObjectMeta, ctx: Arc<MountContext>) -> Self {
        let root_id = root.id.clone();
        let root = Entry::new(InodeNumber::ROOT, Weak::new(), root, false);
        ctx.inodes.insert(Arc::clone(&root));
        Self { root, root_id, ctx }
    }

    pub fn root(&self) -> &Arc<Entry> {
        &self.root
    }

    pub fn context(&self) -> &Arc<MountContext> {
        &self.ctx
    }

    /// Looks up a live entry by inode number.
    pub fn get(&self, ino: u64) -> FsResult<Arc<Entry>> {
        self.ctx
            .inodes
            .get(ino)
            .ok_or_else(|| FsError::NotFound(format!("inode {ino}")))
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Resolves an absolute path.
    pub async fn resolve(&self, path: &str) -> FsResult<Arc<Entry>> {
        let segments = split_path(path)?;
        let mut current = Arc::clone(&self.root);
        for segment in segments {
            if !current.is_dir() {
                return Err(FsError::NotFound(format!("{path}: not a directory on the way")));
            }
            self.ensure_loaded(&current).await?;
            let next = {
                let meta = current.meta.read().await;
                meta.child(segment)
            };
            current = next.ok_or_else(|| FsError::NotFound(path.to_string()))?;
        }
        Ok(current)
    }

    /// Finds `name` in `parent`.
    pub async fn lookup(&self, parent: &Arc<Entry>, name: &str) -> FsResult<Arc<Entry>> {
        check_name(name)?;
        if !parent.is_dir() {
            return Err(FsError::NotADirectory(format!("inode {}", parent.ino())));
        }
        self.ensure_loaded(parent).await?;
        let meta = parent.meta.read().await;
        meta.child(name)
            .ok_or_else(|| FsError::NotFound(format!("{name} in inode {}", parent.ino())))
    }

    /// Sorted listing of a directory with each child's attributes.
    pub async fn list_children(&self, dir: &Arc<Entry>) -> FsResult<Vec<(String, fuser::FileAttr)>> {
        if !dir.is_dir() {
            return Err(FsError::NotADirectory(format!("inode {}", dir.ino())));
        }
        self.ensure_loaded(dir).await?;
        let children: Vec<(String, Arc<Entry>)> = {
            let meta = dir.meta.read().await;
            meta.children
                .iter()
                .flatten()
                .map(|(name, child)| (name.clone(), Arc::clone(child)))
                .collect()
        };

        let mut listing = Vec::with_capacity(children.len());
        for (name, child) in children {
            listing.push((name, child.attr().await));
        }
        Ok(listing)
    }

    fn listing_fresh(&self, meta: &EntryMeta) -> bool {
        meta.listed_at
            .is_some_and(|at| at.elapsed() < self.ctx.listing_ttl)
    }

    /// Merges the backend listing into a directory that was never listed or
    /// whose listing has expired.
    ///
    /// New remote objects are added; children whose object disappeared (or
    /// now has a different identity) are detached as already deleted, unless
    /// they are busy, hold unflushed data or have listed children. Unopened
    /// files pick up the remote size and version.
    pub async fn ensure_loaded(&self, dir: &Arc<Entry>) -> FsResult<()> {
        if !dir.is_dir() {
            return Err(FsError::NotADirectory(format!("inode {}", dir.ino())));
        }
        if self.listing_fresh(&*dir.meta.read().await) {
            return Ok(());
        }

        let mut meta = dir.meta.write().await;
        if !meta.is_active() || self.listing_fresh(&meta) {
            return Ok(());
        }
        let remote_id = meta.attrs.remote_id.clone();
        let listing = self.ctx.remote.list(&remote_id).await?;

        let mut remote: BTreeMap<String, ObjectMeta> = BTreeMap::new();
        for object in listing {
            if object.name.starts_with(PARKED_PREFIX) {
                continue;
            }
            if let Err(e) = validate_name(&object.name) {
                warn!(dir = %dir.ino(), name = ?object.name, error = %e, "Skipping unusable remote name");
                continue;
            }
            remote.insert(object.name.clone(), object);
        }

        let parent = Arc::downgrade(dir);
        let children = meta.children_mut();
        let mut vanished = Vec::new();
        for (name, child) in children.iter() {
            // Never wait on a child while holding its parent: that would
            // invert the inode lock order. A busy child is revisited on the
            // next listing.
            let Ok(mut child_meta) = child.meta.try_write() else {
                remote.remove(name);
                continue;
            };
            match remote.remove(name) {
                Some(object) if object.id == child_meta.attrs.remote_id => {
                    if child.content().is_none() {
                        child_meta.attrs.size = object.size;
                        child_meta.attrs.version = object.version;
                        child_meta.attrs.mtime = object.modified;
                    }
                }
                replaced => {
                    let dirty = child.content().is_some_and(|cache| cache.is_dirty());
                    if dirty || child_meta.has_children() {
                        if let Some(object) = replaced {
                            warn!(dir = %dir.ino(), name = %object.name, "Remote object shadowed by local changes");
                        }
                        continue;
                    }
                    if let Some(object) = replaced {
                        // Re-added below under a fresh inode.
                        remote.insert(name.clone(), object);
                    }
                    child_meta.lifecycle = Lifecycle::Orphaned {
                        remote_deleted: true,
                    };
                    child_meta.parent = Weak::new();
                    vanished.push((name.clone(), Arc::clone(child)));
                }
            }
        }
        for (name, child) in &vanished {
            children.remove(name);
            if child.is_dir() || child.open_count() == 0 {
                child.free_content();
                self.ctx.inodes.remove(child.ino().get());
            }
            debug!(dir = %dir.ino(), ino = %child.ino(), %name, "Entry disappeared remotely");
        }
        for (name, object) in remote {
            if children.contains_key(&name) {
                continue;
            }
            let child = Entry::new(self.ctx.inodes.allocate(), parent.clone(), &object, false);
            self.ctx.inodes.insert(Arc::clone(&child));
            children.insert(name, child);
        }
        let count = children.len();
        meta.listed_at = Some(Instant::now());
        debug!(dir = %dir.ino(), %remote_id, children = count, removed = vanished.len(), "Loaded directory listing");
        Ok(())
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Creates a file or directory named `name` in `parent`.
    #[tracing::instrument(skip(self, parent), fields(parent_ino = %parent.ino()))]
    pub async fn create_child(
        &self,
        parent: &Arc<Entry>,
        name: &str,
        kind: EntryKind,
    ) -> FsResult<Arc<Entry>> {
        check_name(name)?;
        if !parent.is_dir() {
            return Err(FsError::NotADirectory(format!("inode {}", parent.ino())));
        }
        self.ensure_loaded(parent).await?;

        let mut meta = parent.meta.write().await;
        if !meta.is_active() {
            return Err(FsError::NotFound(format!("inode {} was removed", parent.ino())));
        }
        if meta.child(name).is_some() {
            return Err(FsError::AlreadyExists(name.to_string()));
        }

        let object = self
            .ctx
            .remote
            .create(&meta.attrs.remote_id, name, kind.into())
            .await
            .map_err(|e| match e {
                BackendError::Conflict(msg) => FsError::AlreadyExists(msg),
                other => other.into(),
            })?;

        let child = Entry::new(self.ctx.inodes.allocate(), Arc::downgrade(parent), &object, true);
        if kind == EntryKind::File {
            match self.ctx.stores.create(&object.id) {
                Ok(store) => child.set_content(Arc::new(ContentCache::new(
                    object.id.clone(),
                    Arc::clone(&self.ctx.remote),
                    store,
                    self.ctx.limits,
                    object.size,
                    Some(object.version.clone()),
                ))),
                Err(e) => {
                    warn!(ino = %child.ino(), error = %e, "Could not prepare local storage, deferring to open");
                }
            }
        }
        self.ctx.inodes.insert(Arc::clone(&child));
        meta.children_mut().insert(name.to_string(), Arc::clone(&child));
        meta.touch();
        debug!(ino = %child.ino(), remote_id = %object.id, "Created entry");
        Ok(child)
    }

    /// Removes `name` from `parent`.
    ///
    /// A file that is still open is parked and orphaned: it stays readable
    /// and writable through its handles and is deleted remotely on its last
    /// release. The name is free for reuse right away.
    #[tracing::instrument(skip(self, parent), fields(parent_ino = %parent.ino()))]
    pub async fn remove_child(&self, parent: &Arc<Entry>, name: &str) -> FsResult<()> {
        check_name(name)?;
        if !parent.is_dir() {
            return Err(FsError::NotADirectory(format!("inode {}", parent.ino())));
        }
        self.ensure_loaded(parent).await?;

        loop {
            let child = {
                let meta = parent.meta.read().await;
                meta.child(name)
            }
            .ok_or_else(|| FsError::NotFound(name.to_string()))?;
            if child.is_dir() {
                self.ensure_loaded(&child).await?;
            }

            let mut locks = LockSet::acquire(&[parent, &child]).await;
            let current = locks.meta(parent)?.child(name);
            match current {
                Some(current) if Arc::ptr_eq(&current, &child) => {}
                // The name changed hands while unlocked; look again.
                Some(_) => continue,
                None => return Err(FsError::NotFound(name.to_string())),
            }

            if !child.is_dir() && child.open_count() > 0 {
                return self.park_locked(&mut locks, parent, &child, name).await;
            }
            return self.delete_locked(&mut locks, parent, &child, name).await;
        }
    }

    /// Moves `entry` to `new_parent` under `new_name`, replacing any entry
    /// already there.
    ///
    /// A replaced entry is parked before the rename is issued. If the rename
    /// fails it is moved back and re-attached, so the tree is unchanged;
    /// otherwise it is deleted, or left parked until its last release when
    /// it is an open file.
    #[tracing::instrument(skip(self, entry, new_parent), fields(ino = %entry.ino(), new_parent_ino = %new_parent.ino()))]
    pub async fn move_entry(
        &self,
        entry: &Arc<Entry>,
        new_parent: &Arc<Entry>,
        new_name: &str,
    ) -> FsResult<()> {
        check_name(new_name)?;
        if entry.ino() == InodeNumber::ROOT {
            return Err(FsError::InvalidArgument("cannot move the root".to_string()));
        }
        if !new_parent.is_dir() {
            return Err(FsError::NotADirectory(format!("inode {}", new_parent.ino())));
        }
        self.ensure_loaded(new_parent).await?;

        let (old_parent, old_name) = {
            let meta = entry.meta.read().await;
            if !meta.is_active() {
                return Err(FsError::NotFound(format!("inode {} was removed", entry.ino())));
            }
            let parent = meta
                .parent
                .upgrade()
                .ok_or_else(|| FsError::NotFound(format!("inode {} has no parent", entry.ino())))?;
            (parent, meta.name.clone())
        };

        if entry.is_dir() {
            let mut cursor = Some(Arc::clone(new_parent));
            while let Some(dir) = cursor {
                if Arc::ptr_eq(&dir, entry) {
                    return Err(FsError::InvalidArgument(format!(
                        "cannot move {old_name} beneath itself"
                    )));
                }
                cursor = dir.parent().await;
            }
        }

        let target = new_parent.meta.read().await.child(new_name);
        if let Some(target) = &target {
            if Arc::ptr_eq(target, entry) {
                return Ok(());
            }
            if target.is_dir() {
                self.ensure_loaded(target).await?;
            }
        }

        let mut involved = vec![&old_parent, new_parent, entry];
        if let Some(target) = &target {
            involved.push(target);
        }
        let mut locks = LockSet::acquire(&involved).await;

        let still_in_place = {
            let meta = locks.meta(entry)?;
            meta.is_active()
                && meta.name == old_name
                && meta
                    .parent
                    .upgrade()
                    .is_some_and(|p| Arc::ptr_eq(&p, &old_parent))
        };
        let new_parent_meta = locks.meta(new_parent)?;
        let target_unchanged = match (new_parent_meta.child(new_name), &target) {
            (None, None) => true,
            (Some(current), Some(target)) => Arc::ptr_eq(&current, target),
            _ => false,
        };
        if !still_in_place || !new_parent_meta.is_active() || !target_unchanged {
            return Err(FsError::Conflict(format!(
                "{old_name} changed during rename to {new_name}"
            )));
        }

        if let Some(target) = &target {
            match (entry.is_dir(), target.is_dir()) {
                (false, true) => return Err(FsError::IsADirectory(new_name.to_string())),
                (true, false) => return Err(FsError::NotADirectory(new_name.to_string())),
                _ => {}
            }
            self.park_locked(&mut locks, new_parent, target, new_name)
                .await?;
        }

        let remote_id = locks.meta(entry)?.attrs.remote_id.clone();
        let new_parent_id = locks.meta(new_parent)?.attrs.remote_id.clone();
        let updated = match self
            .ctx
            .remote
            .rename(&remote_id, &new_parent_id, new_name)
            .await
        {
            Ok(updated) => updated,
            Err(e) => {
                if let Some(target) = &target {
                    self.unpark_locked(&mut locks, new_parent, target, new_name)
                        .await;
                }
                return Err(e.into());
            }
        };

        let old_parent_meta = locks.meta(&old_parent)?;
        old_parent_meta.children_mut().remove(&old_name);
        old_parent_meta.touch();

        let new_parent_meta = locks.meta(new_parent)?;
        new_parent_meta
            .children_mut()
            .insert(new_name.to_string(), Arc::clone(entry));
        new_parent_meta.touch();

        let meta = locks.meta(entry)?;
        meta.name = new_name.to_string();
        meta.parent = Arc::downgrade(new_parent);
        meta.attrs.remote_id = updated.id.clone();
        meta.attrs.version = updated.version.clone();
        meta.attrs.ctime = SystemTime::now();
        if let Some(cache) = entry.content() {
            cache.track_remote(&updated);
        }
        debug!(%remote_id, from = %old_name, to = %new_name, "Moved entry");

        if let Some(target) = &target {
            self.discard_parked_locked(&mut locks, target).await;
        }
        Ok(())
    }

    /// Deletes `child` (locked together with `parent`) remotely and frees it.
    async fn delete_locked(
        &self,
        locks: &mut LockSet<'_>,
        parent: &Arc<Entry>,
        child: &Arc<Entry>,
        name: &str,
    ) -> FsResult<()> {
        let (remote_id, has_children) = {
            let meta = locks.meta(child)?;
            (meta.attrs.remote_id.clone(), meta.has_children())
        };
        if child.is_dir() && has_children {
            return Err(FsError::NotEmpty(name.to_string()));
        }
        match self.ctx.remote.delete(&remote_id).await {
            Ok(()) | Err(BackendError::NotFound(_)) => {}
            Err(BackendError::Conflict(msg)) if child.is_dir() => {
                return Err(FsError::NotEmpty(msg));
            }
            Err(e) => return Err(e.into()),
        }

        let meta = locks.meta(child)?;
        meta.lifecycle = Lifecycle::Orphaned {
            remote_deleted: true,
        };
        meta.parent = Weak::new();

        let parent_meta = locks.meta(parent)?;
        parent_meta.children_mut().remove(name);
        parent_meta.touch();

        child.free_content();
        self.ctx.inodes.remove(child.ino().get());
        debug!(ino = %child.ino(), %remote_id, "Removed entry");
        Ok(())
    }

    /// Moves the object of `child` to its parked name and detaches `child`
    /// from `parent` as an orphan whose remote delete is still pending.
    async fn park_locked(
        &self,
        locks: &mut LockSet<'_>,
        parent: &Arc<Entry>,
        child: &Arc<Entry>,
        name: &str,
    ) -> FsResult<()> {
        let (remote_id, has_children) = {
            let meta = locks.meta(child)?;
            (meta.attrs.remote_id.clone(), meta.has_children())
        };
        if child.is_dir() && has_children {
            return Err(FsError::NotEmpty(name.to_string()));
        }
        let parked = self
            .ctx
            .remote
            .rename(&remote_id, &self.root_id, &parked_name(child.ino()))
            .await?;

        let meta = locks.meta(child)?;
        meta.lifecycle = Lifecycle::Orphaned {
            remote_deleted: false,
        };
        meta.parent = Weak::new();
        meta.attrs.remote_id = parked.id.clone();
        meta.attrs.version = parked.version.clone();
        if let Some(cache) = child.content() {
            cache.track_remote(&parked);
        }

        let parent_meta = locks.meta(parent)?;
        parent_meta.children_mut().remove(name);
        parent_meta.touch();
        debug!(ino = %child.ino(), remote_id = %parked.id, "Parked entry");
        Ok(())
    }

    /// Puts a parked `child` back under `name` in `parent`.
    ///
    /// If the backend refuses, the entry stays an orphan and its object is
    /// deleted like any other parked object.
    async fn unpark_locked(
        &self,
        locks: &mut LockSet<'_>,
        parent: &Arc<Entry>,
        child: &Arc<Entry>,
        name: &str,
    ) {
        let Ok(parent_id) = locks.meta(parent).map(|m| m.attrs.remote_id.clone()) else {
            return;
        };
        let Ok(remote_id) = locks.meta(child).map(|m| m.attrs.remote_id.clone()) else {
            return;
        };
        let restored = match self.ctx.remote.rename(&remote_id, &parent_id, name).await {
            Ok(restored) => restored,
            Err(e) => {
                error!(ino = %child.ino(), %remote_id, %name, error = %e, "Could not restore replaced entry");
                return;
            }
        };

        if let Ok(meta) = locks.meta(child) {
            meta.lifecycle = Lifecycle::Active;
            meta.parent = Arc::downgrade(parent);
            meta.attrs.remote_id = restored.id.clone();
            meta.attrs.version = restored.version.clone();
        }
        if let Some(cache) = child.content() {
            cache.track_remote(&restored);
        }
        if let Ok(parent_meta) = locks.meta(parent) {
            parent_meta
                .children_mut()
                .insert(name.to_string(), Arc::clone(child));
        }
        debug!(ino = %child.ino(), %name, "Restored replaced entry");
    }

    /// Deletes a parked entry that has no open handles.
    ///
    /// Open files keep their parked object until the last release. A failed
    /// delete leaves the entry pending, to be retried at shutdown.
    async fn discard_parked_locked(&self, locks: &mut LockSet<'_>, child: &Arc<Entry>) {
        if !child.is_dir() && child.open_count() > 0 {
            return;
        }
        let Ok(remote_id) = locks.meta(child).map(|m| m.attrs.remote_id.clone()) else {
            return;
        };
        match self.ctx.remote.delete(&remote_id).await {
            Ok(()) | Err(BackendError::NotFound(_)) => {
                if let Ok(meta) = locks.meta(child) {
                    meta.lifecycle = Lifecycle::Orphaned {
                        remote_deleted: true,
                    };
                }
                child.free_content();
                self.ctx.inodes.remove(child.ino().get());
                debug!(ino = %child.ino(), %remote_id, "Deleted replaced entry");
            }
            Err(e) => {
                warn!(ino = %child.ino(), %remote_id, error = %e, "Replaced entry stays parked until shutdown");
            }
        }
    }
}
