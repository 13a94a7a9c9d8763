//! Dual-track events service.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use nexus_cas::Backend;
use nexus_config::{log_events_debug, log_events_info, log_events_warn};
use nexus_meta::ReplicatedMetadataStore;

use crate::bus::{EventBus, EventStream};
use crate::event::{path_matches, ChangeEvent};
use crate::locks::{LockGuard, LockManager};
use crate::watcher::PointerWatcher;
use crate::{EventError, Result};

/// Selects between the distributed track (event bus + lease locks) and the
/// same-box track (pointer watcher + in-memory locks) while exposing one
/// contract for both.
pub struct EventsService {
    backend: Arc<dyn Backend>,
    meta: Arc<ReplicatedMetadataStore>,
    locks: Arc<dyn LockManager>,
    bus: Option<Arc<dyn EventBus>>,
    watchers: DashMap<String, Arc<PointerWatcher>>,
    /// Last revision seen per zone; startup sync compares it with the
    /// store's revision to decide whether caches must be dropped.
    cursors: DashMap<String, u64>,
}

impl EventsService {
    pub fn new(
        backend: Arc<dyn Backend>,
        meta: Arc<ReplicatedMetadataStore>,
        locks: Arc<dyn LockManager>,
        bus: Option<Arc<dyn EventBus>>,
    ) -> Self {
        Self {
            backend,
            meta,
            locks,
            bus,
            watchers: DashMap::new(),
            cursors: DashMap::new(),
        }
    }

    pub fn is_same_box(&self) -> bool {
        self.backend.is_passthrough()
    }

    pub fn has_distributed_events(&self) -> bool {
        self.bus.is_some()
    }

    fn watcher_for(&self, zone: &str) -> Result<Arc<PointerWatcher>> {
        if let Some(existing) = self.watchers.get(zone) {
            return Ok(existing.clone());
        }
        let root = self
            .backend
            .physical_path("/")
            .ok_or(EventError::NoEventSource)?;
        let watcher = Arc::new(PointerWatcher::new(&root, zone)?);
        self.watchers.insert(zone.to_string(), watcher.clone());
        Ok(watcher)
    }

    /// Subscribe to a zone's change stream on whichever track is wired.
    pub async fn subscribe(&self, zone: &str) -> Result<EventStream> {
        if let Some(bus) = &self.bus {
            return bus.subscribe(zone).await;
        }
        if self.is_same_box() {
            return Ok(self.watcher_for(zone)?.subscribe());
        }
        Err(EventError::NoEventSource)
    }

    /// Publish a kernel-originated event: invalidates the metadata cache
    /// for the affected path(s), advances the zone cursor, and fans out to
    /// the bus when one is configured. Same-box subscribers hear about the
    /// change from the OS watcher instead.
    pub async fn publish(&self, event: ChangeEvent) -> Result<()> {
        self.apply_event(&event);
        if let Some(bus) = &self.bus {
            bus.publish(event).await?;
        }
        Ok(())
    }

    fn apply_event(&self, event: &ChangeEvent) {
        self.meta.invalidate(&event.path);
        if let Some(old) = &event.old_path {
            self.meta.invalidate(old);
        }
        self.cursors
            .entry(event.zone.clone())
            .and_modify(|c| *c = (*c).max(event.revision))
            .or_insert(event.revision);
    }

    /// Wait for one change matching `pattern` (exact path, `*`/`?`
    /// wildcards, or a trailing `/` subtree watch). Events with revision
    /// ≤ `since_revision` are filtered. `timeout = 0` polls nothing and
    /// returns `None` immediately. Dropping the future releases the
    /// subscription, which is how cooperative cancellation lands here.
    pub async fn wait_for_changes(
        &self,
        pattern: &str,
        timeout: Duration,
        since_revision: u64,
        zone: &str,
    ) -> Result<Option<ChangeEvent>> {
        if timeout.is_zero() {
            return Ok(None);
        }

        let mut stream = self.subscribe(zone).await?;
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            match tokio::time::timeout(remaining, stream.next()).await {
                Ok(Some(event)) => {
                    if event.zone != zone || event.revision <= since_revision {
                        continue;
                    }
                    let matches = path_matches(pattern, &event.path)
                        || event
                            .old_path
                            .as_deref()
                            .map(|old| path_matches(pattern, old))
                            .unwrap_or(false);
                    if matches {
                        return Ok(Some(event));
                    }
                }
                Ok(None) => return Ok(None),
                Err(_) => return Ok(None),
            }
        }
    }

    // === Locks ===

    pub async fn lock(
        &self,
        path: &str,
        timeout: Duration,
        ttl: Duration,
        max_holders: u32,
    ) -> Result<Option<String>> {
        self.locks.lock(path, timeout, ttl, max_holders).await
    }

    pub async fn extend_lock(&self, lock_id: &str, path: &str, ttl: Duration) -> Result<bool> {
        self.locks.extend_lock(lock_id, path, ttl).await
    }

    pub async fn unlock(&self, lock_id: &str, path: &str) -> Result<bool> {
        self.locks.unlock(lock_id, path).await
    }

    /// Acquire and wrap in an RAII guard that releases on all exit paths.
    pub async fn lock_guard(
        self: &Arc<Self>,
        path: &str,
        timeout: Duration,
        ttl: Duration,
        max_holders: u32,
    ) -> Result<Option<LockGuard>> {
        match self.locks.lock(path, timeout, ttl, max_holders).await? {
            Some(lock_id) => Ok(Some(LockGuard::new(self.locks.clone(), lock_id, path))),
            None => Ok(None),
        }
    }

    // === Startup sync ===

    /// Reconcile after a restart or partition: if the store's zone
    /// revision moved past our cursor, drop cached metadata so reads
    /// refetch. Failures are logged and startup proceeds.
    pub async fn startup_sync(&self, zone: &str) {
        let cursor = self.cursors.get(zone).map(|c| *c).unwrap_or(0);
        match self.meta.zone_revision(zone).await {
            Ok(current) if current > cursor => {
                log_events_info!(
                    "startup sync: invalidating stale cache",
                    zone = zone,
                    cursor = cursor,
                    current = current,
                );
                self.meta.invalidate_all();
                self.cursors.insert(zone.to_string(), current);
            }
            Ok(_) => log_events_debug!("startup sync: cache current", zone = zone, cursor = cursor),
            Err(e) => log_events_warn!(
                "startup sync failed, proceeding",
                zone = zone,
                error = e.to_string().as_str(),
            ),
        }
    }

    /// Spawn the background subscriber that keeps the metadata cache
    /// coherent with events from either track.
    pub fn start_invalidation_task(self: &Arc<Self>, zone: &str) -> tokio::task::JoinHandle<()> {
        let service = Arc::clone(self);
        let zone = zone.to_string();
        tokio::spawn(async move {
            let mut stream = match service.subscribe(&zone).await {
                Ok(stream) => stream,
                Err(e) => {
                    log_events_warn!(
                        "cache invalidation task has no event source",
                        zone = zone.as_str(),
                        error = e.to_string().as_str(),
                    );
                    return;
                }
            };
            while let Some(event) = stream.next().await {
                service.apply_event(&event);
            }
        })
    }

    pub fn cursor(&self, zone: &str) -> u64 {
        self.cursors.get(zone).map(|c| *c).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryEventBus;
    use crate::event::EventKind;
    use crate::locks::LeaseLockManager;
    use nexus_cas::PassthroughBackend;
    use nexus_meta::{LocalLog, MetadataStore};
    use tempfile::TempDir;

    fn service_with_bus() -> (TempDir, Arc<EventsService>) {
        let temp = TempDir::new().unwrap();
        let backend: Arc<dyn Backend> =
            Arc::new(PassthroughBackend::new(temp.path().join("data")).unwrap());
        let store = Arc::new(MetadataStore::open(temp.path().join("meta")).unwrap());
        let log = Arc::new(LocalLog::new(store));
        let meta = Arc::new(ReplicatedMetadataStore::new(log.clone()));
        let locks = Arc::new(LeaseLockManager::new(log, "test-holder"));
        let bus = Arc::new(InMemoryEventBus::new());
        let service = Arc::new(EventsService::new(backend, meta, locks, Some(bus)));
        (temp, service)
    }

    #[tokio::test]
    async fn zero_timeout_returns_none_immediately() {
        let (_t, service) = service_with_bus();
        let result = service
            .wait_for_changes("/any", Duration::ZERO, 0, "z")
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn wait_matches_pattern_and_revision() {
        let (_t, service) = service_with_bus();

        let waiter = {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .wait_for_changes("/logs/*.txt", Duration::from_secs(5), 10, "z")
                    .await
                    .unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Filtered: revision at or below the floor
        service
            .publish(ChangeEvent::new(EventKind::FileWrite, "/logs/a.txt", 10, "z"))
            .await
            .unwrap();
        // Filtered: pattern mismatch
        service
            .publish(ChangeEvent::new(EventKind::FileWrite, "/other/b.txt", 11, "z"))
            .await
            .unwrap();
        // Delivered
        service
            .publish(ChangeEvent::new(EventKind::FileWrite, "/logs/c.txt", 12, "z"))
            .await
            .unwrap();

        let event = waiter.await.unwrap().expect("event");
        assert_eq!(event.path, "/logs/c.txt");
        assert_eq!(event.revision, 12);
    }

    #[tokio::test]
    async fn wait_times_out_quietly() {
        let (_t, service) = service_with_bus();
        let result = service
            .wait_for_changes("/never", Duration::from_millis(50), 0, "z")
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn cursor_advances_with_published_events() {
        let (_t, service) = service_with_bus();
        service
            .publish(ChangeEvent::new(EventKind::FileWrite, "/a", 3, "z"))
            .await
            .unwrap();
        service
            .publish(ChangeEvent::new(EventKind::FileWrite, "/b", 7, "z"))
            .await
            .unwrap();
        assert_eq!(service.cursor("z"), 7);
    }

    #[tokio::test]
    async fn lock_contract_over_lease_track() {
        let (_t, service) = service_with_bus();

        let id = service
            .lock("/p", Duration::from_secs(1), Duration::from_secs(30), 1)
            .await
            .unwrap()
            .expect("acquire");
        assert!(service
            .extend_lock(&id, "/p", Duration::from_secs(60))
            .await
            .unwrap());
        assert!(service.unlock(&id, "/p").await.unwrap());
        assert!(!service.unlock(&id, "/p").await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn same_box_track_watches_pointer_tree() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(PassthroughBackend::new(temp.path().join("data")).unwrap());
        let store = Arc::new(MetadataStore::open(temp.path().join("meta")).unwrap());
        let log = Arc::new(LocalLog::new(store));
        let meta = Arc::new(ReplicatedMetadataStore::new(log));
        let locks = Arc::new(crate::locks::SameBoxLockManager::new(
            backend.clone() as Arc<dyn Backend>
        ));
        // No bus: the service must fall back to the watcher
        let service = Arc::new(EventsService::new(
            backend.clone(),
            meta,
            locks,
            None,
        ));
        assert!(service.is_same_box());
        assert!(!service.has_distributed_events());

        let waiter = {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .wait_for_changes("/inbox/", Duration::from_secs(5), 0, "default")
                    .await
                    .unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        use nexus_cas::Backend as _;
        backend
            .write_content(b"watched", Some("/inbox/w.txt"))
            .unwrap();

        let event = waiter.await.unwrap().expect("watcher event");
        assert_eq!(event.path, "/inbox/w.txt");
    }
}
