//! Shared helpers: a mount over [`InMemoryBackend`] with memory storage and
//! millisecond retry delays.

use std::sync::Arc;

use cloudfs_core::{
    config::{Config, ConfigBuilder, StorageKind},
    ports::InMemoryBackend,
};
use cloudfs_fuse::CloudFs;

/// Inode of the mount root.
pub const ROOT: u64 = 1;

pub fn test_config() -> Config {
    ConfigBuilder::new()
        .cache_storage(StorageKind::Memory)
        .retry_max_retries(2)
        .retry_base_delay_ms(1)
        .retry_max_delay_ms(4)
        .backend_timeout_secs(5)
        .build()
}

pub struct TestMount {
    pub backend: Arc<InMemoryBackend>,
    pub fs: CloudFs,
}

pub async fn mount() -> TestMount {
    mount_with(Arc::new(InMemoryBackend::new()), &test_config()).await
}

pub async fn mount_with(backend: Arc<InMemoryBackend>, config: &Config) -> TestMount {
    let fs = CloudFs::mount(Arc::clone(&backend) as _, config)
        .await
        .expect("mount should succeed");
    TestMount { backend, fs }
}

/// Inode number of the entry at `path`.
pub async fn ino_of(fs: &CloudFs, path: &str) -> u64 {
    fs.resolve(path).await.expect("path should resolve").ino
}

/// Names listed in directory `ino`.
pub async fn names(fs: &CloudFs, ino: u64) -> Vec<String> {
    fs.readdir(ino)
        .await
        .expect("readdir should succeed")
        .into_iter()
        .map(|(name, _)| name)
        .collect()
}
