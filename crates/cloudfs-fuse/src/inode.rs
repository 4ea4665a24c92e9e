//! Inode table: inode number → live entry.
//!
//! Provides lock-free concurrent access for filesystem operations and hands
//! out inode numbers, which stay stable for the lifetime of the process.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use dashmap::DashMap;

use crate::entry::{Entry, InodeNumber};

/// Mapping from inode numbers to entries.
///
/// Uses DashMap for lock-free concurrent access from many callers.
pub struct InodeTable {
    by_inode: DashMap<u64, Arc<Entry>>,
    next_ino: AtomicU64,
}

impl InodeTable {
    /// Create a new empty inode table. The first allocated number follows
    /// [`InodeNumber::ROOT`].
    pub fn new() -> Self {
        Self {
            by_inode: DashMap::new(),
            next_ino: AtomicU64::new(InodeNumber::ROOT.get() + 1),
        }
    }

    /// Reserves a fresh inode number.
    pub fn allocate(&self) -> InodeNumber {
        InodeNumber::new(self.next_ino.fetch_add(1, Ordering::SeqCst))
    }

    /// Registers an entry under its inode number.
    pub fn insert(&self, entry: Arc<Entry>) {
        self.by_inode.insert(entry.ino().get(), entry);
    }

    /// Retrieve an entry by its inode number.
    pub fn get(&self, ino: u64) -> Option<Arc<Entry>> {
        self.by_inode.get(&ino).map(|r| Arc::clone(&r))
    }

    /// Remove an entry by its inode number.
    pub fn remove(&self, ino: u64) -> Option<Arc<Entry>> {
        self.by_inode.remove(&ino).map(|(_, entry)| entry)
    }

    /// Snapshot of every registered entry.
    pub fn entries(&self) -> Vec<Arc<Entry>> {
        self.by_inode.iter().map(|r| Arc::clone(r.value())).collect()
    }

    /// Get the total number of entries in the table.
    pub fn len(&self) -> usize {
        self.by_inode.len()
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.by_inode.is_empty()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
