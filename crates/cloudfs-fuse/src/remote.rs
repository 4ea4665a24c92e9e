//! Backend access with timeouts, retries and a concurrency limit.
//!
//! Every backend call made by the filesystem goes through [`RemoteClient`]:
//! - each attempt is bounded by the configured timeout; an elapsed timeout
//!   becomes [`BackendError::Timeout`], a transient error
//! - idempotent calls (`stat`, `list`, `get`, `put`, `set_mtime`, `quota`)
//!   are retried on transient errors with exponential backoff
//! - namespace mutations (`create`, `delete`, `rename`) get a single attempt,
//!   since replaying them after a timeout may act twice
//! - content transfers (`get`, `put`) hold a permit of the background
//!   operation semaphore (mount capability `max_background`)

use std::{future::Future, sync::Arc, time::Duration};

use cloudfs_core::{
    config::{BackendConfig, RetryConfig},
    domain::RemoteId,
    ports::{
        BackendError, BackendResult, ByteRange, IRemoteBackend, ObjectKind, ObjectMeta, PutMode,
        Quota,
    },
};
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// Timeout and backoff settings for backend calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(retry: &RetryConfig, backend: &BackendConfig) -> Self {
        Self {
            max_retries: retry.max_retries,
            base_delay: Duration::from_millis(retry.base_delay_ms),
            max_delay: Duration::from_millis(retry.max_delay_ms),
            timeout: backend.timeout(),
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay)
    }
}

/// Runs one backend call under `timeout`.
pub async fn with_timeout<Fut, T>(timeout: Duration, fut: Fut) -> BackendResult<T>
where
    Fut: Future<Output = BackendResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Timeout(timeout)),
    }
}

/// Retries `f` on transient errors with exponential backoff.
///
/// Each attempt is individually bounded by `policy.timeout`. Permanent errors
/// and the error of the last attempt are returned unchanged.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, operation: &str, f: F) -> BackendResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = BackendResult<T>>,
{
    let mut attempt = 0;
    loop {
        match with_timeout(policy.timeout, f()).await {
            Ok(value) => {
                if attempt > 0 {
                    info!(operation, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if attempt < policy.max_retries && err.is_transient() => {
                let delay = policy.delay_for(attempt);
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// The filesystem's handle on the remote backend.
pub struct RemoteClient {
    backend: Arc<dyn IRemoteBackend>,
    policy: RetryPolicy,
    transfers: Semaphore,
}

impl RemoteClient {
    pub fn new(backend: Arc<dyn IRemoteBackend>, policy: RetryPolicy, max_background: usize) -> Self {
        Self {
            backend,
            policy,
            transfers: Semaphore::new(max_background.max(1)),
        }
    }

    pub async fn root(&self) -> BackendResult<ObjectMeta> {
        with_retry(&self.policy, "root", || async move {
            self.backend.root().await
        })
        .await
    }

    pub async fn stat(&self, id: &RemoteId) -> BackendResult<ObjectMeta> {
        with_retry(&self.policy, "stat", || async move {
            self.backend.stat(id).await
        })
        .await
    }

    pub async fn list(&self, dir: &RemoteId) -> BackendResult<Vec<ObjectMeta>> {
        with_retry(&self.policy, "list", || async move {
            self.backend.list(dir).await
        })
        .await
    }

    pub async fn get(&self, id: &RemoteId, range: ByteRange) -> BackendResult<Vec<u8>> {
        with_retry(&self.policy, "get", || async move {
            let _permit = self.permit().await?;
            self.backend.get(id, range).await
        })
        .await
    }

    pub async fn put(&self, id: &RemoteId, data: &[u8], mode: PutMode) -> BackendResult<ObjectMeta> {
        with_retry(&self.policy, "put", || async move {
            let _permit = self.permit().await?;
            self.backend.put(id, data, mode).await
        })
        .await
    }

    pub async fn set_mtime(
        &self,
        id: &RemoteId,
        mtime: std::time::SystemTime,
    ) -> BackendResult<ObjectMeta> {
        with_retry(&self.policy, "set_mtime", || async move {
            self.backend.set_mtime(id, mtime).await
        })
        .await
    }

    pub async fn quota(&self) -> BackendResult<Quota> {
        with_retry(&self.policy, "quota", || async move {
            self.backend.quota().await
        })
        .await
    }

    pub async fn create(
        &self,
        parent: &RemoteId,
        name: &str,
        kind: ObjectKind,
    ) -> BackendResult<ObjectMeta> {
        with_timeout(self.policy.timeout, self.backend.create(parent, name, kind)).await
    }

    pub async fn delete(&self, id: &RemoteId) -> BackendResult<()> {
        with_timeout(self.policy.timeout, self.backend.delete(id)).await
    }

    pub async fn rename(
        &self,
        id: &RemoteId,
        new_parent: &RemoteId,
        new_name: &str,
    ) -> BackendResult<ObjectMeta> {
        with_timeout(
            self.policy.timeout,
            self.backend.rename(id, new_parent, new_name),
        )
        .await
    }

    async fn permit(&self) -> BackendResult<tokio::sync::SemaphorePermit<'_>> {
        self.transfers
            .acquire()
            .await
            .map_err(|_| BackendError::Unavailable("transfer semaphore closed".to_string()))
    }
}
