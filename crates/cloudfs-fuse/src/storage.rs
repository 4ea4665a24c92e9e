//! Local backing storage for cached file content.
//!
//! Content lives either in process memory or in a sparse file under the
//! cache directory. Disk files use a hash-based directory structure:
//! `{cache_dir}/content/{first_2_chars_of_hash}/{rest_of_hash}`
//!
//! Bytes that were never written read back as zeros, in both modes.
//!
//! Memory storage is a dense buffer: a write at offset `n` allocates every
//! byte below `n`. Writes ending past [`MEMORY_STORE_MAX`] are rejected in
//! that mode; use disk storage for large sparse files.

use std::{
    fs::{self, File, OpenOptions},
    io,
    os::unix::fs::FileExt,
    path::PathBuf,
    sync::Arc,
};

use cloudfs_core::{
    config::{CacheConfig, StorageKind},
    domain::RemoteId,
};
use sha2::{Digest, Sha256};
use tracing::warn;

/// Largest end offset accepted by memory storage (4 GiB).
pub const MEMORY_STORE_MAX: u64 = 4 * 1024 * 1024 * 1024;

/// Resolves cache file locations under `{cache_dir}/content`.
#[derive(Debug)]
pub struct CacheLayout {
    content_dir: PathBuf,
}

impl CacheLayout {
    /// Create a new layout, creating the content directory if needed.
    pub fn new(cache_dir: PathBuf) -> io::Result<Self> {
        let content_dir = cache_dir.join("content");
        fs::create_dir_all(&content_dir)?;
        Ok(Self { content_dir })
    }

    /// Compute the cache path for a remote ID using SHA-256 hash.
    pub fn cache_path(&self, remote_id: &RemoteId) -> PathBuf {
        let hash = Self::hash_remote_id(remote_id);
        let (prefix, rest) = hash.split_at(2);
        self.content_dir.join(prefix).join(rest)
    }

    fn hash_remote_id(remote_id: &RemoteId) -> String {
        let mut hasher = Sha256::new();
        hasher.update(remote_id.as_str().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Creates a [`LocalStore`] for each newly cached file.
#[derive(Debug, Clone)]
pub enum StoreFactory {
    Memory,
    Disk(Arc<CacheLayout>),
}

impl StoreFactory {
    pub fn from_config(config: &CacheConfig) -> io::Result<Self> {
        match config.storage {
            StorageKind::Memory => Ok(StoreFactory::Memory),
            StorageKind::Disk => Ok(StoreFactory::Disk(Arc::new(CacheLayout::new(
                config.cache_path(),
            )?))),
        }
    }

    /// Opens empty storage for `remote_id`, discarding any stale cache file.
    pub fn create(&self, remote_id: &RemoteId) -> io::Result<LocalStore> {
        match self {
            StoreFactory::Memory => Ok(LocalStore::Memory(Vec::new())),
            StoreFactory::Disk(layout) => {
                let path = layout.cache_path(remote_id);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&path)?;
                Ok(LocalStore::Disk { path, file })
            }
        }
    }
}

/// Byte storage for one file's cached content.
#[derive(Debug)]
pub enum LocalStore {
    Memory(Vec<u8>),
    Disk { path: PathBuf, file: File },
}

impl LocalStore {
    /// Fills `buf` with the bytes at `offset`; bytes past the stored end are zero.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        match self {
            LocalStore::Memory(data) => {
                let len = data.len() as u64;
                let start = offset.min(len) as usize;
                let end = (offset + buf.len() as u64).min(len) as usize;
                let n = end - start;
                buf[..n].copy_from_slice(&data[start..end]);
                buf[n..].fill(0);
                Ok(())
            }
            LocalStore::Disk { file, .. } => {
                let mut filled = 0;
                while filled < buf.len() {
                    match file.read_at(&mut buf[filled..], offset + filled as u64) {
                        Ok(0) => break,
                        Ok(n) => filled += n,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => return Err(e),
                    }
                }
                buf[filled..].fill(0);
                Ok(())
            }
        }
    }

    /// Writes `data` at `offset`, growing the storage (zero-filled) as needed.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        match self {
            LocalStore::Memory(buf) => {
                let end = offset.saturating_add(data.len() as u64);
                if end > MEMORY_STORE_MAX {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("memory storage cannot hold bytes up to offset {end}"),
                    ));
                }
                let start = offset as usize;
                let end = end as usize;
                if buf.len() < end {
                    buf.resize(end, 0);
                }
                buf[start..end].copy_from_slice(data);
                Ok(())
            }
            LocalStore::Disk { file, .. } => file.write_all_at(data, offset),
        }
    }

    /// Discards stored bytes at or beyond `len`; never grows the storage.
    pub fn shrink_to(&mut self, len: u64) -> io::Result<()> {
        match self {
            LocalStore::Memory(buf) => {
                if (buf.len() as u64) > len {
                    buf.truncate(len as usize);
                }
                Ok(())
            }
            LocalStore::Disk { file, .. } => {
                if file.metadata()?.len() > len {
                    file.set_len(len)?;
                }
                Ok(())
            }
        }
    }
}

impl Drop for LocalStore {
    fn drop(&mut self) {
        if let LocalStore::Disk { path, .. } = self {
            if let Err(e) = fs::remove_file(&*path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Failed to remove cache file");
                }
            }
        }
    }
}
