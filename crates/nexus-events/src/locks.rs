//! Advisory locks, lease-based or same-box.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use nexus_cas::Backend;
use nexus_config::{log_events_debug, log_events_warn};
use nexus_meta::{LogCommand, LogTransport};

use crate::Result;

/// Retry interval while waiting for a contended lock.
const ACQUIRE_RETRY: Duration = Duration::from_millis(100);

/// Advisory lock seam. `max_holders = 1` is a mutex, greater a counting
/// semaphore. `lock` returns `None` when the deadline passes.
#[async_trait]
pub trait LockManager: Send + Sync {
    async fn lock(
        &self,
        path: &str,
        timeout: Duration,
        ttl: Duration,
        max_holders: u32,
    ) -> Result<Option<String>>;

    /// Refresh the lease. No-op (true) on the same-box track, which has
    /// no TTL.
    async fn extend_lock(&self, lock_id: &str, path: &str, ttl: Duration) -> Result<bool>;

    /// Release. `false` for an unknown lock id; never an error.
    async fn unlock(&self, lock_id: &str, path: &str) -> Result<bool>;
}

// ============================================================================
// Distributed track: leases through the replicated log
// ============================================================================

/// Lease locks serialized by the replicated log. Acquisition polls the log
/// until a slot frees or the deadline passes; expiry is enforced by the
/// log's state machine, so a crashed holder's lease simply lapses.
pub struct LeaseLockManager {
    transport: Arc<dyn LogTransport>,
    holder_id: String,
}

impl LeaseLockManager {
    pub fn new(transport: Arc<dyn LogTransport>, holder_id: impl Into<String>) -> Self {
        Self {
            transport,
            holder_id: holder_id.into(),
        }
    }
}

#[async_trait]
impl LockManager for LeaseLockManager {
    async fn lock(
        &self,
        path: &str,
        timeout: Duration,
        ttl: Duration,
        max_holders: u32,
    ) -> Result<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            let reply = self
                .transport
                .propose(
                    LogCommand::AcquireLock {
                        path: path.to_string(),
                        holder_id: self.holder_id.clone(),
                        ttl_ms: ttl.as_millis() as u64,
                        max_holders,
                    },
                    None,
                )
                .await?;

            if let Some(result) = reply.result.as_ref().filter(|_| reply.success) {
                if result["acquired"].as_bool().unwrap_or(false) {
                    let lock_id = result["lock_id"].as_str().unwrap_or_default().to_string();
                    log_events_debug!("lease acquired", path = path, lock_id = lock_id.as_str());
                    return Ok(Some(lock_id));
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                log_events_warn!(
                    "lease acquisition timed out",
                    path = path,
                    timeout_ms = timeout.as_millis() as u64,
                );
                return Ok(None);
            }
            tokio::time::sleep(ACQUIRE_RETRY.min(remaining)).await;
        }
    }

    async fn extend_lock(&self, lock_id: &str, path: &str, ttl: Duration) -> Result<bool> {
        let reply = self
            .transport
            .propose(
                LogCommand::ExtendLock {
                    path: path.to_string(),
                    lock_id: lock_id.to_string(),
                    ttl_ms: ttl.as_millis() as u64,
                },
                None,
            )
            .await?;
        Ok(reply
            .result
            .map(|r| r["extended"].as_bool().unwrap_or(false))
            .unwrap_or(false))
    }

    async fn unlock(&self, lock_id: &str, path: &str) -> Result<bool> {
        let reply = self
            .transport
            .propose(
                LogCommand::ReleaseLock {
                    path: path.to_string(),
                    lock_id: lock_id.to_string(),
                },
                None,
            )
            .await?;
        Ok(reply
            .result
            .map(|r| r["released"].as_bool().unwrap_or(false))
            .unwrap_or(false))
    }
}

// ============================================================================
// Same-box track: the backend's in-memory table
// ============================================================================

/// In-process locks backed by the passthrough backend's table. The
/// spin-wait happens on the blocking pool so the runtime stays free.
pub struct SameBoxLockManager {
    backend: Arc<dyn Backend>,
}

impl SameBoxLockManager {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl LockManager for SameBoxLockManager {
    async fn lock(
        &self,
        path: &str,
        timeout: Duration,
        _ttl: Duration,
        max_holders: u32,
    ) -> Result<Option<String>> {
        let backend = self.backend.clone();
        let path = path.to_string();
        let result = tokio::task::spawn_blocking(move || {
            backend.lock(&path, timeout, max_holders)
        })
        .await
        .expect("lock task panicked")?;
        Ok(result)
    }

    async fn extend_lock(&self, _lock_id: &str, _path: &str, _ttl: Duration) -> Result<bool> {
        // No TTL to refresh in-process
        Ok(true)
    }

    async fn unlock(&self, lock_id: &str, _path: &str) -> Result<bool> {
        Ok(self.backend.unlock(lock_id))
    }
}

// ============================================================================
// RAII guard
// ============================================================================

/// Holds a lock and guarantees release on every exit path: call
/// [`LockGuard::release`] for a confirmed release, or let the drop
/// best-effort it on a background task.
pub struct LockGuard {
    manager: Arc<dyn LockManager>,
    lock_id: Option<String>,
    path: String,
}

impl LockGuard {
    pub fn new(manager: Arc<dyn LockManager>, lock_id: String, path: impl Into<String>) -> Self {
        Self {
            manager,
            lock_id: Some(lock_id),
            path: path.into(),
        }
    }

    pub fn lock_id(&self) -> Option<&str> {
        self.lock_id.as_deref()
    }

    pub async fn release(mut self) -> Result<bool> {
        match self.lock_id.take() {
            Some(id) => self.manager.unlock(&id, &self.path).await,
            None => Ok(false),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(id) = self.lock_id.take() {
            let manager = self.manager.clone();
            let path = std::mem::take(&mut self.path);
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = manager.unlock(&id, &path).await;
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_meta::{LocalLog, MetadataStore};
    use tempfile::TempDir;

    fn lease_manager(holder: &str, temp: &TempDir) -> LeaseLockManager {
        let store = Arc::new(MetadataStore::open(temp.path().join("meta")).unwrap());
        LeaseLockManager::new(Arc::new(LocalLog::new(store)), holder)
    }

    #[tokio::test]
    async fn lease_lock_mutex_and_timeout() {
        let temp = TempDir::new().unwrap();
        let manager = lease_manager("agent-1", &temp);

        let id = manager
            .lock("/l", Duration::from_secs(1), Duration::from_secs(30), 1)
            .await
            .unwrap()
            .expect("first acquire");

        // Contended acquire with a tiny deadline returns None
        let second = manager
            .lock("/l", Duration::from_millis(50), Duration::from_secs(30), 1)
            .await
            .unwrap();
        assert!(second.is_none());

        assert!(manager.unlock(&id, "/l").await.unwrap());
        assert!(!manager.unlock(&id, "/l").await.unwrap());
    }

    #[tokio::test]
    async fn lease_extend_refreshes() {
        let temp = TempDir::new().unwrap();
        let manager = lease_manager("agent-1", &temp);

        let id = manager
            .lock("/e", Duration::from_secs(1), Duration::from_secs(30), 1)
            .await
            .unwrap()
            .unwrap();
        assert!(manager
            .extend_lock(&id, "/e", Duration::from_secs(60))
            .await
            .unwrap());
        assert!(!manager
            .extend_lock("bogus", "/e", Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn same_box_lock_roundtrip() {
        let temp = TempDir::new().unwrap();
        let backend: Arc<dyn Backend> =
            Arc::new(nexus_cas::PassthroughBackend::new(temp.path()).unwrap());
        let manager = SameBoxLockManager::new(backend);

        let id = manager
            .lock("/s", Duration::from_millis(200), Duration::ZERO, 1)
            .await
            .unwrap()
            .expect("acquire");
        assert!(manager.extend_lock(&id, "/s", Duration::ZERO).await.unwrap());
        assert!(manager.unlock(&id, "/s").await.unwrap());
    }

    #[tokio::test]
    async fn guard_releases_on_drop() {
        let temp = TempDir::new().unwrap();
        let manager: Arc<dyn LockManager> = Arc::new(lease_manager("agent-1", &temp));

        let id = manager
            .lock("/g", Duration::from_secs(1), Duration::from_secs(30), 1)
            .await
            .unwrap()
            .unwrap();
        {
            let _guard = LockGuard::new(manager.clone(), id, "/g");
        }
        // Drop spawned the release; give it a beat
        tokio::time::sleep(Duration::from_millis(50)).await;

        let reacquired = manager
            .lock("/g", Duration::from_millis(200), Duration::from_secs(30), 1)
            .await
            .unwrap();
        assert!(reacquired.is_some());
    }
}
