//! In-memory [`IRemoteBackend`] implementation.
//!
//! Holds the whole object store in a `HashMap` behind a mutex. Besides
//! serving memory-only mounts it is the backend stub for the filesystem
//! test suites, so it also provides:
//! - per-operation call counters
//! - fault injection (`fail_next`) returning a chosen error N times
//! - artificial latency to widen race windows

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, PoisonError,
    },
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use tracing::trace;

use crate::{
    domain::newtypes::{ObjectVersion, RemoteId},
    ports::remote_backend::{
        BackendError, BackendResult, ByteRange, IRemoteBackend, ObjectKind, ObjectMeta, PutMode,
        Quota,
    },
};

/// Default account size reported by [`InMemoryBackend::quota`] (15 GiB).
const DEFAULT_TOTAL_QUOTA: u64 = 15 * 1024 * 1024 * 1024;

/// Backend operations, used to address call counters and injected faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendOp {
    Root,
    Stat,
    List,
    Get,
    Put,
    Create,
    Delete,
    Rename,
    SetMtime,
    Quota,
}

#[derive(Debug, Clone)]
struct StoredObject {
    name: String,
    parent: Option<RemoteId>,
    kind: ObjectKind,
    data: Vec<u8>,
    version: u64,
    modified: SystemTime,
}

#[derive(Debug, Default)]
struct Store {
    objects: HashMap<RemoteId, StoredObject>,
    faults: HashMap<BackendOp, (u32, BackendError)>,
    calls: HashMap<BackendOp, u64>,
}

/// Object store kept entirely in memory.
pub struct InMemoryBackend {
    root_id: RemoteId,
    store: Mutex<Store>,
    next_id: AtomicU64,
    total_quota: AtomicU64,
    latency: Mutex<Option<Duration>>,
}

impl InMemoryBackend {
    /// Creates an empty store containing only the root directory.
    pub fn new() -> Self {
        let root_id = RemoteId::new("root".to_string()).expect("static id is valid");
        let mut store = Store::default();
        store.objects.insert(
            root_id.clone(),
            StoredObject {
                name: String::new(),
                parent: None,
                kind: ObjectKind::Directory,
                data: Vec::new(),
                version: 1,
                modified: SystemTime::now(),
            },
        );
        Self {
            root_id,
            store: Mutex::new(store),
            next_id: AtomicU64::new(1),
            total_quota: AtomicU64::new(DEFAULT_TOTAL_QUOTA),
            latency: Mutex::new(None),
        }
    }

    /// Identifier of the root directory.
    pub fn root_id(&self) -> RemoteId {
        self.root_id.clone()
    }

    /// Sets the total quota reported by `quota()`.
    pub fn set_total_quota(&self, total: u64) {
        self.total_quota.store(total, Ordering::SeqCst);
    }

    /// Adds latency to every subsequent call.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    /// Makes the next `count` calls of `op` fail with `error`.
    pub fn fail_next(&self, op: BackendOp, count: u32, error: BackendError) {
        self.lock().faults.insert(op, (count, error));
    }

    /// Number of calls made to `op` so far (including failed ones).
    pub fn calls(&self, op: BackendOp) -> u64 {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Seeds a file directly into the store, bypassing counters and faults.
    pub fn insert_file(&self, parent: &RemoteId, name: &str, data: &[u8]) -> RemoteId {
        self.insert_object(parent, name, ObjectKind::File, data.to_vec())
    }

    /// Seeds a directory directly into the store, bypassing counters and faults.
    pub fn insert_dir(&self, parent: &RemoteId, name: &str) -> RemoteId {
        self.insert_object(parent, name, ObjectKind::Directory, Vec::new())
    }

    /// Drops an object and its descendants, bypassing counters and faults.
    pub fn remove(&self, id: &RemoteId) {
        let mut store = self.lock();
        let mut pending = vec![id.clone()];
        while let Some(next) = pending.pop() {
            store.objects.remove(&next);
            pending.extend(
                store
                    .objects
                    .iter()
                    .filter(|(_, o)| o.parent.as_ref() == Some(&next))
                    .map(|(id, _)| id.clone()),
            );
        }
    }

    /// Current content of a file, if it exists.
    pub fn contents(&self, id: &RemoteId) -> Option<Vec<u8>> {
        self.lock().objects.get(id).map(|o| o.data.clone())
    }

    /// Returns true if the object exists.
    pub fn exists(&self, id: &RemoteId) -> bool {
        self.lock().objects.contains_key(id)
    }

    /// Looks up a child of `parent` by name.
    pub fn find_child(&self, parent: &RemoteId, name: &str) -> Option<RemoteId> {
        self.lock()
            .objects
            .iter()
            .find(|(_, o)| o.parent.as_ref() == Some(parent) && o.name == name)
            .map(|(id, _)| id.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert_object(
        &self,
        parent: &RemoteId,
        name: &str,
        kind: ObjectKind,
        data: Vec<u8>,
    ) -> RemoteId {
        let id = self.allocate_id();
        self.lock().objects.insert(
            id.clone(),
            StoredObject {
                name: name.to_string(),
                parent: Some(parent.clone()),
                kind,
                data,
                version: 1,
                modified: SystemTime::now(),
            },
        );
        id
    }

    fn allocate_id(&self) -> RemoteId {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        RemoteId::new(format!("obj{n}")).expect("generated id is valid")
    }

    /// Records the call, applies latency and returns an injected fault if armed.
    async fn enter(&self, op: BackendOp) -> BackendResult<()> {
        let latency = *self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut store = self.lock();
        *store.calls.entry(op).or_insert(0) += 1;
        if let Some((remaining, error)) = store.faults.get_mut(&op) {
            let error = error.clone();
            *remaining -= 1;
            if *remaining == 0 {
                store.faults.remove(&op);
            }
            trace!(?op, %error, "Injected backend fault");
            return Err(error);
        }
        Ok(())
    }

    fn meta(id: &RemoteId, object: &StoredObject) -> ObjectMeta {
        ObjectMeta {
            id: id.clone(),
            name: object.name.clone(),
            kind: object.kind,
            size: object.data.len() as u64,
            version: ObjectVersion::new(format!("v{}", object.version))
                .expect("generated version is valid"),
            modified: object.modified,
        }
    }

    fn used(store: &Store) -> u64 {
        store.objects.values().map(|o| o.data.len() as u64).sum()
    }

    fn name_taken(store: &Store, parent: &RemoteId, name: &str) -> bool {
        store
            .objects
            .values()
            .any(|o| o.parent.as_ref() == Some(parent) && o.name == name)
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IRemoteBackend for InMemoryBackend {
    async fn root(&self) -> BackendResult<ObjectMeta> {
        self.enter(BackendOp::Root).await?;
        let store = self.lock();
        let root = store
            .objects
            .get(&self.root_id)
            .ok_or_else(|| BackendError::NotFound(self.root_id.to_string()))?;
        Ok(Self::meta(&self.root_id, root))
    }

    async fn stat(&self, id: &RemoteId) -> BackendResult<ObjectMeta> {
        self.enter(BackendOp::Stat).await?;
        let store = self.lock();
        let object = store
            .objects
            .get(id)
            .ok_or_else(|| BackendError::NotFound(id.to_string()))?;
        Ok(Self::meta(id, object))
    }

    async fn list(&self, dir: &RemoteId) -> BackendResult<Vec<ObjectMeta>> {
        self.enter(BackendOp::List).await?;
        let store = self.lock();
        match store.objects.get(dir) {
            Some(o) if o.kind == ObjectKind::Directory => {}
            Some(_) => return Err(BackendError::Other(format!("not a directory: {dir}"))),
            None => return Err(BackendError::NotFound(dir.to_string())),
        }
        Ok(store
            .objects
            .iter()
            .filter(|(_, o)| o.parent.as_ref() == Some(dir))
            .map(|(id, o)| Self::meta(id, o))
            .collect())
    }

    async fn get(&self, id: &RemoteId, range: ByteRange) -> BackendResult<Vec<u8>> {
        self.enter(BackendOp::Get).await?;
        let store = self.lock();
        let object = store
            .objects
            .get(id)
            .ok_or_else(|| BackendError::NotFound(id.to_string()))?;
        let len = object.data.len() as u64;
        let start = range.start.min(len) as usize;
        let end = range.end.min(len) as usize;
        Ok(object.data[start..end].to_vec())
    }

    async fn put(&self, id: &RemoteId, data: &[u8], mode: PutMode) -> BackendResult<ObjectMeta> {
        self.enter(BackendOp::Put).await?;
        let total_quota = self.total_quota.load(Ordering::SeqCst);
        let mut store = self.lock();
        let used = Self::used(&store);
        let object = store
            .objects
            .get_mut(id)
            .ok_or_else(|| BackendError::NotFound(id.to_string()))?;
        if object.kind == ObjectKind::Directory {
            return Err(BackendError::Other(format!("cannot write a directory: {id}")));
        }

        let new_len = match mode {
            PutMode::Whole => data.len() as u64,
            PutMode::Chunk { offset, total_size } => {
                total_size.max(offset + data.len() as u64)
            }
        };
        let old_len = object.data.len() as u64;
        if new_len > old_len && used - old_len + new_len > total_quota {
            return Err(BackendError::QuotaExceeded(format!(
                "{new_len} bytes do not fit in the remaining quota"
            )));
        }

        match mode {
            PutMode::Whole => object.data = data.to_vec(),
            PutMode::Chunk { offset, .. } => {
                object.data.resize(new_len as usize, 0);
                let start = offset as usize;
                object.data[start..start + data.len()].copy_from_slice(data);
            }
        }
        object.version += 1;
        object.modified = SystemTime::now();
        Ok(Self::meta(id, object))
    }

    async fn create(
        &self,
        parent: &RemoteId,
        name: &str,
        kind: ObjectKind,
    ) -> BackendResult<ObjectMeta> {
        self.enter(BackendOp::Create).await?;
        let id = self.allocate_id();
        let mut store = self.lock();
        match store.objects.get(parent) {
            Some(o) if o.kind == ObjectKind::Directory => {}
            Some(_) => return Err(BackendError::Other(format!("not a directory: {parent}"))),
            None => return Err(BackendError::NotFound(parent.to_string())),
        }
        if Self::name_taken(&store, parent, name) {
            return Err(BackendError::Conflict(format!("{name} already exists")));
        }
        let object = StoredObject {
            name: name.to_string(),
            parent: Some(parent.clone()),
            kind,
            data: Vec::new(),
            version: 1,
            modified: SystemTime::now(),
        };
        let meta = Self::meta(&id, &object);
        store.objects.insert(id, object);
        Ok(meta)
    }

    async fn delete(&self, id: &RemoteId) -> BackendResult<()> {
        self.enter(BackendOp::Delete).await?;
        let mut store = self.lock();
        if !store.objects.contains_key(id) {
            return Err(BackendError::NotFound(id.to_string()));
        }
        if store.objects.values().any(|o| o.parent.as_ref() == Some(id)) {
            return Err(BackendError::Conflict(format!("directory not empty: {id}")));
        }
        store.objects.remove(id);
        Ok(())
    }

    async fn rename(
        &self,
        id: &RemoteId,
        new_parent: &RemoteId,
        new_name: &str,
    ) -> BackendResult<ObjectMeta> {
        self.enter(BackendOp::Rename).await?;
        let mut store = self.lock();
        if !store.objects.contains_key(new_parent) {
            return Err(BackendError::NotFound(new_parent.to_string()));
        }
        if Self::name_taken(&store, new_parent, new_name) {
            return Err(BackendError::Conflict(format!("{new_name} already exists")));
        }
        let object = store
            .objects
            .get_mut(id)
            .ok_or_else(|| BackendError::NotFound(id.to_string()))?;
        object.parent = Some(new_parent.clone());
        object.name = new_name.to_string();
        object.version += 1;
        Ok(Self::meta(id, object))
    }

    async fn set_mtime(&self, id: &RemoteId, mtime: SystemTime) -> BackendResult<ObjectMeta> {
        self.enter(BackendOp::SetMtime).await?;
        let mut store = self.lock();
        let object = store
            .objects
            .get_mut(id)
            .ok_or_else(|| BackendError::NotFound(id.to_string()))?;
        object.modified = mtime;
        object.version += 1;
        Ok(Self::meta(id, object))
    }

    async fn quota(&self) -> BackendResult<Quota> {
        self.enter(BackendOp::Quota).await?;
        let store = self.lock();
        Ok(Quota {
            total: self.total_quota.load(Ordering::SeqCst),
            used: Self::used(&store),
        })
    }
}
