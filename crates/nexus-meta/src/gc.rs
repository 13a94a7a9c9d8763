//! Background pruning of version history.
//!
//! A sweep walks version rows in small batches (yielding between batches so
//! it never monopolizes the runtime) and prunes rows that are past the
//! retention window or beyond the per-path cap. The latest version of a
//! path is always kept. Pruning releases content references, which is what
//! lets the CAS sweep reclaim blobs.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use nexus_config::VersionGcConfig;
use tracing::{debug, info, warn};

use crate::model::now_millis;
use crate::store::MetadataStore;
use crate::Result;

#[derive(Debug, Clone, Copy, Default)]
pub struct GcStats {
    pub paths_scanned: u64,
    pub versions_pruned: u64,
}

pub struct VersionGc {
    store: Arc<MetadataStore>,
    config: VersionGcConfig,
}

impl VersionGc {
    pub fn new(store: Arc<MetadataStore>, config: VersionGcConfig) -> Self {
        Self { store, config }
    }

    /// One full sweep over the version table.
    pub async fn sweep_once(&self) -> Result<GcStats> {
        let mut stats = GcStats::default();
        let retention_ms = self.config.retention_days as u64 * 24 * 60 * 60 * 1000;
        let now = now_millis();

        let mut cursor: Option<String> = None;
        loop {
            let (records, next) = self
                .store
                .versions_page(cursor.as_deref(), self.config.batch_size)?;
            if records.is_empty() {
                break;
            }

            // Rows are grouped by path; a path split across batches is
            // simply processed twice, which is idempotent.
            let paths: BTreeSet<String> = records.into_iter().map(|r| r.path).collect();
            for path in paths {
                stats.versions_pruned += self.prune_path(&path, retention_ms, now)?;
                stats.paths_scanned += 1;
            }

            match next {
                Some(key) => cursor = Some(key),
                None => break,
            }
            tokio::task::yield_now().await;
        }

        if stats.versions_pruned > 0 {
            info!(
                pruned = stats.versions_pruned,
                scanned = stats.paths_scanned,
                "version gc sweep complete"
            );
        }
        Ok(stats)
    }

    fn prune_path(&self, path: &str, retention_ms: u64, now: u64) -> Result<u64> {
        let records = self.store.list_versions(path)?;
        if records.len() <= 1 {
            return Ok(0);
        }

        let max_versions = self.config.max_versions as usize;
        let excess = records.len().saturating_sub(max_versions.max(1));

        let mut pruned = 0u64;
        let last = records.len() - 1;
        for (i, record) in records.iter().enumerate() {
            // Latest version survives unconditionally
            if i == last {
                break;
            }
            let beyond_cap = i < excess;
            let past_retention = record.created_at.saturating_add(retention_ms) <= now;
            if beyond_cap || past_retention {
                if self.store.prune_version(path, record.version)? {
                    pruned += 1;
                }
            }
        }

        if pruned > 0 {
            debug!(path, pruned, "pruned version history");
        }
        Ok(pruned)
    }

    /// Spawn the periodic sweep. Returns immediately; the task runs until
    /// the runtime shuts down.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = Duration::from_secs(self.config.interval_hours as u64 * 3600);
        tokio::spawn(async move {
            if !self.config.enabled {
                return;
            }
            let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; skip it so startup stays quiet.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep_once().await {
                    warn!(error = %e, "version gc sweep failed");
                }
            }
        })
    }
}
