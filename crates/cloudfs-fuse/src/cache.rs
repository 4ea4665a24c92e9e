//! Per-file content cache and flush engine.
//!
//! A [`ContentCache`] makes random-access reads and writes on a remote object
//! possible by materializing byte ranges locally:
//!
//! - **Resident ranges**: bytes present in local storage (fetched or written)
//! - **Dirty ranges**: bytes written locally and not yet uploaded; always a
//!   subset of the resident ranges
//! - **In-flight fetches**: ranges being downloaded; a read that needs an
//!   in-flight range waits for it instead of downloading it again
//!
//! ```text
//!   read ──► missing ranges ──► in flight? ──yes──► wait on watch channel
//!                                   │ no
//!                                   ▼
//!                     register + RemoteClient::get ──► apply to non-resident bytes
//!
//!   write ──► local storage + resident + dirty        (never touches the network)
//!
//!   flush ──► length <= max_write ? put(Whole) : put(Chunk) per dirty piece
//! ```
//!
//! The range bookkeeping lives behind a `std::sync::Mutex` that is never held
//! across an `.await`. Local storage sits behind its own `RwLock`: reads share
//! it, writes and truncation take it exclusively. Lock order is state, then
//! storage.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::SystemTime,
};

use cloudfs_core::{
    domain::{ObjectVersion, RemoteId},
    ports::{ByteRange, ObjectMeta, PutMode},
};
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::{
    error::{FsError, FsResult},
    ranges::{split_range, RangeSet},
    remote::RemoteClient,
    storage::LocalStore,
};

/// Transfer size bounds taken from the mount capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLimits {
    /// Largest single upload; files up to this size are uploaded whole.
    pub max_write: u64,
    /// Read-ahead window and largest single download.
    pub max_readahead: u64,
}

struct InFlight {
    id: u64,
    range: ByteRange,
    done: watch::Receiver<()>,
}

struct CacheState {
    /// Follows the object through renames for backends whose IDs are paths.
    remote_id: RemoteId,
    length: u64,
    remote_size: u64,
    remote_version: Option<ObjectVersion>,
    modified: Option<SystemTime>,
    dirty: RangeSet,
    resident: RangeSet,
    in_flight: Vec<InFlight>,
    next_fetch_id: u64,
    /// Bytes written since the current upload snapshot; `None` when no
    /// upload is running.
    rewritten: Option<RangeSet>,
    /// Whether `remote_version` has been checked for the current session.
    validated: bool,
}

impl CacheState {
    fn needs_flush(&self) -> bool {
        !self.dirty.is_empty() || self.length != self.remote_size
    }

    fn mark_written(&mut self, range: ByteRange) {
        self.resident.insert(range);
        self.dirty.insert(range);
        if let Some(rewritten) = self.rewritten.as_mut() {
            rewritten.insert(range);
        }
    }

    /// Applies a successful upload of `uploaded` to the dirty set.
    fn commit_upload(&mut self, uploaded: ByteRange, meta: &ObjectMeta) {
        self.dirty.remove(uploaded);
        if let Some(rewritten) = self.rewritten.as_ref() {
            for range in rewritten.intersection(uploaded) {
                self.dirty.insert(range);
            }
        }
        self.remote_size = meta.size;
        self.remote_version = Some(meta.version.clone());
    }
}

/// Cached content of one file.
pub struct ContentCache {
    remote: Arc<RemoteClient>,
    limits: CacheLimits,
    state: Mutex<CacheState>,
    store: RwLock<LocalStore>,
    /// Serializes flushes of this file.
    flush_lock: tokio::sync::Mutex<()>,
}

impl ContentCache {
    /// Creates an empty cache for an object of `remote_size` bytes.
    pub fn new(
        remote_id: RemoteId,
        remote: Arc<RemoteClient>,
        store: LocalStore,
        limits: CacheLimits,
        remote_size: u64,
        remote_version: Option<ObjectVersion>,
    ) -> Self {
        Self {
            remote,
            limits,
            state: Mutex::new(CacheState {
                remote_id,
                length: remote_size,
                remote_size,
                remote_version,
                modified: None,
                dirty: RangeSet::new(),
                resident: RangeSet::new(),
                in_flight: Vec::new(),
                next_fetch_id: 0,
                rewritten: None,
                validated: true,
            }),
            store: RwLock::new(store),
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Logical file size.
    pub fn length(&self) -> u64 {
        self.state().length
    }

    /// Returns true if a flush would upload something.
    pub fn is_dirty(&self) -> bool {
        self.state().needs_flush()
    }

    pub fn remote_version(&self) -> Option<ObjectVersion> {
        self.state().remote_version.clone()
    }

    /// Time of the last local write or truncate.
    pub fn modified(&self) -> Option<SystemTime> {
        self.state().modified
    }

    /// Forgets the local modification time so an explicit `utime` wins.
    pub fn clear_modified(&self) {
        self.state().modified = None;
    }

    pub fn set_remote_version(&self, version: ObjectVersion) {
        self.state().remote_version = Some(version);
    }

    pub fn remote_id(&self) -> RemoteId {
        self.state().remote_id.clone()
    }

    /// Points the cache at the object as returned by a rename.
    pub fn track_remote(&self, meta: &ObjectMeta) {
        let mut state = self.state();
        state.remote_id = meta.id.clone();
        state.remote_version = Some(meta.version.clone());
    }

    /// Marks the end of an open session; the next session revalidates.
    pub fn end_session(&self) {
        self.state().validated = false;
    }

    /// Checks the remote object before a new open session starts.
    ///
    /// When the object changed remotely since the cache last saw it and no
    /// local change is pending, the local content is dropped and the length
    /// reset to the remote size. Returns the fresh metadata in that case.
    /// A cache created from fresh metadata skips the check for its first
    /// session.
    pub async fn revalidate(&self) -> FsResult<Option<ObjectMeta>> {
        if self.state().validated {
            return Ok(None);
        }
        let _serial = self.flush_lock.lock().await;
        let remote_id = self.remote_id();
        let remote = self.remote.stat(&remote_id).await?;

        let mut state = self.state();
        state.validated = true;
        if state.needs_flush() || state.remote_version.as_ref() == Some(&remote.version) {
            return Ok(None);
        }
        self.store_write().shrink_to(0)?;
        state.resident = RangeSet::new();
        state.length = remote.size;
        state.remote_size = remote.size;
        state.remote_version = Some(remote.version.clone());
        state.modified = None;
        debug!(%remote_id, size = remote.size, version = %remote.version, "Remote object changed, dropped cached content");
        Ok(Some(remote))
    }

    pub fn dirty_ranges(&self) -> RangeSet {
        self.state().dirty.clone()
    }

    pub fn resident_ranges(&self) -> RangeSet {
        self.state().resident.clone()
    }

    // ========================================================================
    // Read path
    // ========================================================================

    /// Reads up to `size` bytes at `offset`, fetching what is not resident.
    ///
    /// Returns an empty buffer at or after end of file.
    pub async fn read(&self, offset: u64, size: u32) -> FsResult<Vec<u8>> {
        let end = offset.saturating_add(u64::from(size));
        if offset >= self.length() || size == 0 {
            return Ok(Vec::new());
        }

        self.ensure_resident(ByteRange::new(offset, end)).await?;

        let state = self.state();
        if offset >= state.length {
            return Ok(Vec::new());
        }
        let end = end.min(state.length);
        let store = self.store_read();
        drop(state);

        let mut buf = vec![0u8; (end - offset) as usize];
        store.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    /// Makes every byte of `want` (clipped to the file length) resident.
    async fn ensure_resident(&self, want: ByteRange) -> FsResult<()> {
        let remote_id = self.remote_id();
        loop {
            let plan = {
                let mut state = self.state();
                let want = ByteRange::new(
                    want.start.min(state.length),
                    want.end.min(state.length),
                );
                // Past the remote object's end there is nothing to download.
                let fetch_limit = state.length.min(state.remote_size);
                if want.end > fetch_limit {
                    let tail = ByteRange::new(want.start.max(fetch_limit), want.end);
                    state.resident.insert(tail);
                }

                let missing = state.resident.gaps(want);
                if missing.is_empty() {
                    return Ok(());
                }

                let waits: Vec<watch::Receiver<()>> = state
                    .in_flight
                    .iter()
                    .filter(|f| missing.iter().any(|m| overlap(f.range, *m)))
                    .map(|f| f.done.clone())
                    .collect();
                if waits.is_empty() {
                    FetchPlan::Fetch(self.register_fetches(&mut state, want, fetch_limit))
                } else {
                    FetchPlan::Wait(waits)
                }
            };

            match plan {
                FetchPlan::Wait(waits) => {
                    trace!(%remote_id, count = waits.len(), "Waiting on in-flight fetches");
                    for mut done in waits {
                        // The sender is dropped when the fetch finishes or fails.
                        let _ = done.changed().await;
                    }
                }
                FetchPlan::Fetch(guard) => {
                    for range in guard.ranges.clone() {
                        let data = self.remote.get(&remote_id, range).await?;
                        self.apply_fetched(range, &data)?;
                    }
                    drop(guard);
                }
            }
        }
    }

    /// Plans downloads for the non-resident parts of `want` extended by the
    /// read-ahead window, skipping ranges another reader is already fetching.
    fn register_fetches(
        &self,
        state: &mut CacheState,
        want: ByteRange,
        fetch_limit: u64,
    ) -> FetchGuard<'_> {
        let window_end = want
            .end
            .max(want.start.saturating_add(self.limits.max_readahead))
            .min(fetch_limit);
        let window = ByteRange::new(want.start, window_end.max(want.start));

        let in_flight: RangeSet = state.in_flight.iter().map(|f| f.range).collect();
        let mut ranges = Vec::new();
        let mut ids = Vec::new();
        let mut senders = Vec::new();
        for gap in state.resident.gaps(window) {
            for piece in in_flight.gaps(gap) {
                for chunk in split_range(piece, self.limits.max_readahead) {
                    let (tx, rx) = watch::channel(());
                    let id = state.next_fetch_id;
                    state.next_fetch_id += 1;
                    state.in_flight.push(InFlight {
                        id,
                        range: chunk,
                        done: rx,
                    });
                    ranges.push(chunk);
                    ids.push(id);
                    senders.push(tx);
                }
            }
        }
        debug!(remote_id = %state.remote_id, chunks = ranges.len(), "Fetching ranges");
        FetchGuard {
            cache: self,
            ranges,
            ids,
            _senders: senders,
        }
    }

    /// Stores fetched bytes into the parts of `range` that are still not
    /// resident, so bytes written during the download are kept.
    fn apply_fetched(&self, range: ByteRange, data: &[u8]) -> FsResult<()> {
        let mut state = self.state();
        let range = ByteRange::new(range.start, range.end.min(state.length).max(range.start));
        let targets = state.resident.gaps(range);
        if targets.is_empty() {
            return Ok(());
        }

        let mut store = self.store_write();
        for target in targets {
            let from = (target.start - range.start) as usize;
            let to = (target.end - range.start) as usize;
            if to <= data.len() {
                store.write_at(target.start, &data[from..to])?;
            } else {
                // The object shrank remotely; the missing tail reads as zeros.
                let mut padded = vec![0u8; to - from];
                if from < data.len() {
                    padded[..data.len() - from].copy_from_slice(&data[from..]);
                }
                store.write_at(target.start, &padded)?;
            }
            state.resident.insert(target);
        }
        Ok(())
    }

    // ========================================================================
    // Write path
    // ========================================================================

    /// Buffers `data` at `offset`. A gap between the old end of file and
    /// `offset` becomes zero-filled dirty content.
    pub fn write(&self, offset: u64, data: &[u8]) -> FsResult<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| FsError::InvalidArgument(format!("write past u64::MAX at {offset}")))?;

        let mut state = self.state();
        let mut store = self.store_write();
        store.write_at(offset, data)?;
        drop(store);

        let start = offset.min(state.length);
        state.mark_written(ByteRange::new(start, end));
        state.length = state.length.max(end);
        state.modified = Some(SystemTime::now());
        Ok(data.len())
    }

    /// Sets the logical length. Growth is zero-filled and dirty; shrinking
    /// drops residency and dirtiness past the new end.
    pub fn truncate(&self, new_length: u64) -> FsResult<()> {
        let mut state = self.state();
        let old_length = state.length;
        if new_length < old_length {
            self.store_write().shrink_to(new_length)?;
            state.resident.truncate(new_length);
            state.dirty.truncate(new_length);
        } else if new_length > old_length {
            state.mark_written(ByteRange::new(old_length, new_length));
        }
        state.length = new_length;
        state.modified = Some(SystemTime::now());
        Ok(())
    }

    // ========================================================================
    // Flush engine
    // ========================================================================

    /// Uploads local changes. Returns `Ok(false)` when there was nothing to do.
    ///
    /// On failure the dirty ranges that were not uploaded stay dirty.
    pub async fn flush(&self) -> FsResult<bool> {
        let _serial = self.flush_lock.lock().await;
        let whole = {
            let state = self.state();
            if !state.needs_flush() {
                return Ok(false);
            }
            state.length <= self.limits.max_write
        };

        let result = if whole {
            self.upload_whole().await
        } else {
            self.upload_chunks().await
        };
        self.state().rewritten = None;
        result.map(|()| true)
    }

    async fn upload_whole(&self) -> FsResult<()> {
        let length = self.length();
        self.ensure_resident(ByteRange::new(0, length)).await?;

        let (remote_id, data, snapshot) = {
            let mut state = self.state();
            let snapshot = ByteRange::new(0, state.length);
            let mut data = vec![0u8; state.length as usize];
            self.store_read().read_at(0, &mut data)?;
            state.rewritten = Some(RangeSet::new());
            (state.remote_id.clone(), data, snapshot)
        };

        debug!(%remote_id, bytes = data.len(), "Uploading whole object");
        let meta = self
            .remote
            .put(&remote_id, &data, PutMode::Whole)
            .await?;
        self.state().commit_upload(snapshot, &meta);
        Ok(())
    }

    async fn upload_chunks(&self) -> FsResult<()> {
        let chunks: Vec<ByteRange> = {
            let state = self.state();
            state
                .dirty
                .iter()
                .flat_map(|r| split_range(*r, self.limits.max_write))
                .collect()
        };

        for chunk in chunks {
            self.upload_chunk(chunk).await?;
        }

        // A pure shrink leaves nothing dirty but the remote size still differs.
        let tail = {
            let state = self.state();
            (state.dirty.is_empty() && state.length != state.remote_size)
                .then(|| ByteRange::new(state.length, state.length))
        };
        if let Some(tail) = tail {
            self.upload_chunk(tail).await?;
        }
        Ok(())
    }

    async fn upload_chunk(&self, chunk: ByteRange) -> FsResult<()> {
        let (remote_id, data, range, total_size) = {
            let mut state = self.state();
            let range = ByteRange::new(chunk.start.min(state.length), chunk.end.min(state.length));
            if range.is_empty() && !chunk.is_empty() {
                // Truncated away since the flush started.
                return Ok(());
            }
            let mut data = vec![0u8; range.len() as usize];
            self.store_read().read_at(range.start, &mut data)?;
            state.rewritten = Some(RangeSet::new());
            (state.remote_id.clone(), data, range, state.length)
        };

        debug!(
            %remote_id,
            offset = range.start,
            bytes = data.len(),
            total_size,
            "Uploading chunk"
        );
        let meta = self
            .remote
            .put(
                &remote_id,
                &data,
                PutMode::Chunk {
                    offset: range.start,
                    total_size,
                },
            )
            .await?;
        self.state().commit_upload(range, &meta);
        Ok(())
    }

    // ========================================================================
    // Lock helpers
    // ========================================================================

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn store_read(&self) -> RwLockReadGuard<'_, LocalStore> {
        self.store.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn store_write(&self) -> RwLockWriteGuard<'_, LocalStore> {
        self.store.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ContentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("ContentCache")
            .field("remote_id", &state.remote_id)
            .field("length", &state.length)
            .field("remote_size", &state.remote_size)
            .field("dirty", &state.dirty)
            .field("resident", &state.resident)
            .finish()
    }
}

enum FetchPlan<'a> {
    Wait(Vec<watch::Receiver<()>>),
    Fetch(FetchGuard<'a>),
}

/// Unregisters a reader's in-flight fetches when it finishes or fails,
/// waking every waiter by dropping the watch senders.
struct FetchGuard<'a> {
    cache: &'a ContentCache,
    ranges: Vec<ByteRange>,
    ids: Vec<u64>,
    _senders: Vec<watch::Sender<()>>,
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        self.cache
            .state()
            .in_flight
            .retain(|f| !self.ids.contains(&f.id));
    }
}

fn overlap(a: ByteRange, b: ByteRange) -> bool {
    a.start < b.end && b.start < a.end
}
