//! Directory-grant pre-materialization.
//!
//! Granting a permission on a directory reaches every existing and future
//! descendant. The graph already answers that through `parent` edges; this
//! layer walks the descendant set asynchronously and precomputes a bitmap
//! per `(subject, permission)` so hot checks skip the traversal.
//!
//! The bitmap is positive-only: a set bit means granted, a miss falls back
//! to the graph. Rebuilds run under a revision counter compare-and-swap so
//! an invalidation during expansion restarts the walk instead of leaving
//! stale bits behind.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use nexus_meta::{now_millis, ReplicatedMetadataStore};

use crate::bitmap::IdBitmap;
use crate::engine::ReBacEngine;
use crate::tuple::Entity;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpansionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// One recorded directory grant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryGrant {
    pub id: u64,
    pub subject: Entity,
    pub relation: String,
    /// Normalized, no trailing slash (root is "/").
    pub dir_path: String,
    pub zone: String,
    pub status: ExpansionStatus,
    pub error: Option<String>,
    pub created_at: u64,
}

/// Counters exposed for observability.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GrantMetrics {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub last_error: Option<String>,
}

/// Interns paths to dense u32 ids so bitmaps stay small.
#[derive(Default)]
struct ResourceArena {
    ids: DashMap<String, u32>,
    next: AtomicU32,
}

impl ResourceArena {
    fn id_for(&self, path: &str) -> u32 {
        *self
            .ids
            .entry(path.to_string())
            .or_insert_with(|| self.next.fetch_add(1, Ordering::SeqCst))
    }

    fn get(&self, path: &str) -> Option<u32> {
        self.ids.get(path).map(|id| *id)
    }
}

#[derive(Default)]
struct BitmapState {
    revision: u64,
    bitmap: IdBitmap,
}

fn bitmap_key(zone: &str, subject: &Entity, relation: &str) -> String {
    format!("{zone}|{}|{relation}|file", subject.key())
}

fn normalize_dir(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn dir_prefix(dir: &str) -> String {
    if dir == "/" {
        "/".to_string()
    } else {
        format!("{dir}/")
    }
}

pub struct DirectoryGrantManager {
    engine: Arc<ReBacEngine>,
    meta: Arc<ReplicatedMetadataStore>,
    grants: DashMap<u64, DirectoryGrant>,
    bitmaps: DashMap<String, BitmapState>,
    arena: ResourceArena,
    next_grant_id: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl DirectoryGrantManager {
    const LIST_BATCH: usize = 500;
    const EXPANSION_RETRIES: usize = 3;

    pub fn new(engine: Arc<ReBacEngine>, meta: Arc<ReplicatedMetadataStore>) -> Arc<Self> {
        let manager = Arc::new(Self {
            engine: engine.clone(),
            meta,
            grants: DashMap::new(),
            bitmaps: DashMap::new(),
            arena: ResourceArena::default(),
            next_grant_id: AtomicU64::new(0),
            last_error: Mutex::new(None),
        });

        // Tuple deletions can revoke what a bitmap pre-computed; a
        // deletion clears the zone's bitmaps and later checks fall back
        // to the graph. Insertions only ever add permissions, so only
        // bitmaps keyed by the written subject need a rebuild.
        let hook_manager = Arc::downgrade(&manager);
        engine.on_write(move |tuple| {
            if let Some(manager) = hook_manager.upgrade() {
                if tuple.id == 0 {
                    manager.clear_zone_bitmaps(&tuple.zone);
                } else {
                    manager.clear_subject_bitmaps(&tuple.zone, &tuple.subject);
                }
            }
        });

        manager
    }

    /// Record a grant, write its tuple, and kick off the descendant walk.
    /// Expansion failures never block the write.
    pub async fn grant(
        self: &Arc<Self>,
        subject: Entity,
        relation: &str,
        dir_path: &str,
        zone: &str,
    ) -> Result<u64> {
        let dir = normalize_dir(dir_path);
        self.engine.write(
            subject.clone(),
            relation,
            Entity::file(dir.clone()),
            zone,
            None,
            None,
            None,
        )?;

        let id = self.next_grant_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.grants.insert(
            id,
            DirectoryGrant {
                id,
                subject,
                relation: relation.to_string(),
                dir_path: dir,
                zone: zone.to_string(),
                status: ExpansionStatus::Pending,
                error: None,
                created_at: now_millis(),
            },
        );

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.expand_grant(id).await;
        });

        Ok(id)
    }

    /// Run (or re-run) the expansion for a grant row.
    pub async fn expand_grant(self: &Arc<Self>, grant_id: u64) {
        let Some(grant) = self.grants.get(&grant_id).map(|g| g.clone()) else {
            return;
        };
        self.set_status(grant_id, ExpansionStatus::Running, None);

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.materialize(&grant).await {
                Ok(true) => {
                    self.set_status(grant_id, ExpansionStatus::Completed, None);
                    return;
                }
                Ok(false) if attempts < Self::EXPANSION_RETRIES => {
                    debug!(grant_id, attempts, "bitmap invalidated mid-expansion, retrying");
                    continue;
                }
                Ok(false) => {
                    let msg = "bitmap repeatedly invalidated during expansion".to_string();
                    self.record_failure(grant_id, msg);
                    return;
                }
                Err(e) => {
                    self.record_failure(grant_id, e.to_string());
                    return;
                }
            }
        }
    }

    /// One expansion attempt. Returns `Ok(false)` when the bitmap revision
    /// moved underneath us and the walk must restart.
    async fn materialize(&self, grant: &DirectoryGrant) -> Result<bool> {
        let key = bitmap_key(&grant.zone, &grant.subject, &grant.relation);
        let start_revision = self
            .bitmaps
            .entry(key.clone())
            .or_default()
            .revision;

        let prefix = dir_prefix(&grant.dir_path);
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .meta
                .list(&prefix, true, Self::LIST_BATCH, cursor.clone())
                .await?;

            let mut bits = Vec::with_capacity(page.entries.len());
            for entry in &page.entries {
                if entry.is_directory {
                    continue;
                }
                bits.push(self.arena.id_for(&entry.path));
            }

            {
                let mut state = self.bitmaps.entry(key.clone()).or_default();
                if state.revision != start_revision {
                    return Ok(false);
                }
                for bit in bits {
                    state.bitmap.insert(bit);
                }
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
            tokio::task::yield_now().await;
        }

        let state = self.bitmaps.entry(key).or_default();
        Ok(state.revision == start_revision)
    }

    fn set_status(&self, grant_id: u64, status: ExpansionStatus, error: Option<String>) {
        if let Some(mut grant) = self.grants.get_mut(&grant_id) {
            grant.status = status;
            grant.error = error;
        }
    }

    fn record_failure(&self, grant_id: u64, message: String) {
        warn!(grant_id, error = %message, "directory grant expansion failed");
        *self.last_error.lock().expect("last_error poisoned") = Some(message.clone());
        self.set_status(grant_id, ExpansionStatus::Failed, Some(message));
    }

    // === Accelerated checks ===

    /// Fast path: `true` means the pre-materialized bitmap grants this
    /// permission. `false` only means "consult the graph".
    pub fn bitmap_allows(
        &self,
        subject: &Entity,
        relation: &str,
        path: &str,
        zone: &str,
    ) -> bool {
        let Some(bit) = self.arena.get(path) else {
            return false;
        };
        self.bitmaps
            .get(&bitmap_key(zone, subject, relation))
            .map(|state| state.bitmap.contains(bit))
            .unwrap_or(false)
    }

    // === Metadata-store notifications ===

    /// Extend covering bitmaps when a file appears.
    pub fn on_file_created(&self, path: &str, zone: &str) {
        let covering: Vec<DirectoryGrant> = self
            .grants
            .iter()
            .filter(|g| g.zone == zone && path.starts_with(&dir_prefix(&g.dir_path)))
            .map(|g| g.clone())
            .collect();
        if covering.is_empty() {
            return;
        }

        let bit = self.arena.id_for(path);
        for grant in covering {
            let key = bitmap_key(&grant.zone, &grant.subject, &grant.relation);
            let mut state = self.bitmaps.entry(key).or_default();
            state.bitmap.insert(bit);
        }
    }

    /// Re-home a file across parent chains on rename: drop it from every
    /// bitmap, then re-insert under grants covering the new path.
    pub fn on_renamed(&self, old_path: &str, new_path: &str, zone: &str) {
        if let Some(old_bit) = self.arena.get(old_path) {
            for mut state in self.bitmaps.iter_mut() {
                state.bitmap.remove(old_bit);
            }
        }
        self.on_file_created(new_path, zone);
    }

    // === Invalidation ===

    fn clear_zone_bitmaps(&self, zone: &str) {
        let prefix = format!("{zone}|");
        for mut state in self.bitmaps.iter_mut() {
            if state.key().starts_with(&prefix) {
                state.revision += 1;
                state.bitmap.clear();
            }
        }
    }

    fn clear_subject_bitmaps(&self, zone: &str, subject: &Entity) {
        let prefix = format!("{zone}|{}|", subject.key());
        for mut state in self.bitmaps.iter_mut() {
            if state.key().starts_with(&prefix) {
                state.revision += 1;
                state.bitmap.clear();
            }
        }
    }

    // === Introspection ===

    pub fn get_grant(&self, id: u64) -> Option<DirectoryGrant> {
        self.grants.get(&id).map(|g| g.clone())
    }

    pub fn metrics(&self) -> GrantMetrics {
        let mut metrics = GrantMetrics::default();
        for grant in self.grants.iter() {
            match grant.status {
                ExpansionStatus::Pending => metrics.pending += 1,
                ExpansionStatus::Running => metrics.running += 1,
                ExpansionStatus::Completed => metrics.completed += 1,
                ExpansionStatus::Failed => metrics.failed += 1,
            }
        }
        metrics.last_error = self.last_error.lock().expect("last_error poisoned").clone();
        metrics
    }

    /// Block until a grant leaves the pending/running states. Test helper
    /// and admin-surface convenience.
    pub async fn wait_for_expansion(&self, grant_id: u64) -> Option<ExpansionStatus> {
        for _ in 0..200 {
            match self.get_grant(grant_id).map(|g| g.status) {
                Some(ExpansionStatus::Pending) | Some(ExpansionStatus::Running) => {
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                }
                other => return other,
            }
        }
        self.get_grant(grant_id).map(|g| g.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_meta::{FileMetadata, LocalLog, MetadataPut, MetadataStore};
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Arc<ReBacEngine>, Arc<ReplicatedMetadataStore>, Arc<DirectoryGrantManager>) {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(MetadataStore::open(temp.path().join("meta")).unwrap());
        let meta = Arc::new(ReplicatedMetadataStore::new(Arc::new(LocalLog::new(store))));
        let engine = Arc::new(ReBacEngine::new());
        let grants = DirectoryGrantManager::new(engine.clone(), meta.clone());
        (temp, engine, meta, grants)
    }

    async fn create_file(meta: &ReplicatedMetadataStore, path: &str) {
        meta.put(MetadataPut::new(FileMetadata::new_file(
            path,
            "passthrough",
            format!("etag-{path}"),
            1,
            "default",
            "alice",
            "eng",
        )))
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn grant_materializes_existing_files() {
        let (_t, _engine, meta, grants) = setup().await;
        create_file(&meta, "/d/a.txt").await;
        create_file(&meta, "/d/b.txt").await;

        let id = grants
            .grant(Entity::user("bob"), "reader", "/d/", "default")
            .await
            .unwrap();
        let status = grants.wait_for_expansion(id).await;
        assert_eq!(status, Some(ExpansionStatus::Completed));

        assert!(grants.bitmap_allows(&Entity::user("bob"), "reader", "/d/a.txt", "default"));
        assert!(grants.bitmap_allows(&Entity::user("bob"), "reader", "/d/b.txt", "default"));
        assert!(!grants.bitmap_allows(&Entity::user("bob"), "reader", "/other.txt", "default"));
    }

    #[tokio::test]
    async fn new_file_extends_bitmap() {
        let (_t, _engine, meta, grants) = setup().await;
        create_file(&meta, "/d/a.txt").await;

        let id = grants
            .grant(Entity::user("bob"), "reader", "/d", "default")
            .await
            .unwrap();
        grants.wait_for_expansion(id).await;

        create_file(&meta, "/d/c.txt").await;
        grants.on_file_created("/d/c.txt", "default");

        assert!(grants.bitmap_allows(&Entity::user("bob"), "reader", "/d/c.txt", "default"));
    }

    #[tokio::test]
    async fn rename_moves_between_parent_chains() {
        let (_t, _engine, meta, grants) = setup().await;
        create_file(&meta, "/dir_a/m.txt").await;

        let ga = grants
            .grant(Entity::user("alice"), "reader", "/dir_a", "default")
            .await
            .unwrap();
        let gb = grants
            .grant(Entity::user("bob"), "reader", "/dir_b", "default")
            .await
            .unwrap();
        grants.wait_for_expansion(ga).await;
        grants.wait_for_expansion(gb).await;

        assert!(grants.bitmap_allows(&Entity::user("alice"), "reader", "/dir_a/m.txt", "default"));
        assert!(!grants.bitmap_allows(&Entity::user("bob"), "reader", "/dir_a/m.txt", "default"));

        grants.on_renamed("/dir_a/m.txt", "/dir_b/m.txt", "default");

        assert!(!grants.bitmap_allows(&Entity::user("alice"), "reader", "/dir_a/m.txt", "default"));
        assert!(grants.bitmap_allows(&Entity::user("bob"), "reader", "/dir_b/m.txt", "default"));
    }

    #[tokio::test]
    async fn bitmap_agrees_with_graph() {
        let (_t, engine, meta, grants) = setup().await;
        create_file(&meta, "/d/a.txt").await;

        let id = grants
            .grant(Entity::user("bob"), "reader", "/d", "default")
            .await
            .unwrap();
        grants.wait_for_expansion(id).await;

        // Graph needs the parent edge the kernel writes on file create
        engine
            .write(
                Entity::file("/d/a.txt"),
                "parent",
                Entity::file("/d"),
                "default",
                None,
                None,
                None,
            )
            .unwrap();

        let via_bitmap =
            grants.bitmap_allows(&Entity::user("bob"), "reader", "/d/a.txt", "default");
        let via_graph = engine.check(
            &Entity::user("bob"),
            "read",
            &Entity::file("/d/a.txt"),
            "default",
        );
        assert!(via_bitmap);
        assert_eq!(via_bitmap, via_graph);
    }

    #[tokio::test]
    async fn revocation_clears_bitmaps() {
        let (_t, engine, meta, grants) = setup().await;
        create_file(&meta, "/d/a.txt").await;

        let id = grants
            .grant(Entity::user("bob"), "reader", "/d", "default")
            .await
            .unwrap();
        grants.wait_for_expansion(id).await;
        assert!(grants.bitmap_allows(&Entity::user("bob"), "reader", "/d/a.txt", "default"));

        engine.delete(&Entity::user("bob"), "reader", &Entity::file("/d"), "default");
        assert!(!grants.bitmap_allows(&Entity::user("bob"), "reader", "/d/a.txt", "default"));
    }

    #[tokio::test]
    async fn metrics_track_outcomes() {
        let (_t, _engine, meta, grants) = setup().await;
        create_file(&meta, "/m/a.txt").await;

        let id = grants
            .grant(Entity::user("bob"), "reader", "/m", "default")
            .await
            .unwrap();
        grants.wait_for_expansion(id).await;

        let metrics = grants.metrics();
        assert_eq!(metrics.completed, 1);
        assert_eq!(metrics.failed, 0);
        assert!(metrics.last_error.is_none());
    }
}
