//! Public metadata contract, speaking to the store through the log.
//!
//! Writes become proposals; a follower's refusal is surfaced as
//! [`MetaError::NotLeader`] with the leader's address so callers can
//! redirect. Reads go to whichever replica the transport points at, with a
//! short-TTL cache in front that the events layer invalidates.

use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::log::{LogCommand, LogQuery, LogTransport, MetadataPut, ProposeReply, QueryReply};
use crate::model::{now_millis, FileMetadata, Page, SourceType, VersionRecord};
use crate::{LeaseInfo, MetaError, Result};

/// Difference between two versions of a path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionDiff {
    pub path: String,
    pub from_version: u64,
    pub to_version: u64,
    pub from_etag: String,
    pub to_etag: String,
    pub content_changed: bool,
    pub size_delta: i64,
}

pub struct ReplicatedMetadataStore {
    transport: Arc<dyn LogTransport>,
    cache: Cache<String, FileMetadata>,
}

impl ReplicatedMetadataStore {
    /// Metadata read-cache TTL; events invalidate sooner.
    const CACHE_TTL: Duration = Duration::from_secs(5);
    const CACHE_CAPACITY: u64 = 100_000;

    pub fn new(transport: Arc<dyn LogTransport>) -> Self {
        Self {
            transport,
            cache: Cache::builder()
                .max_capacity(Self::CACHE_CAPACITY)
                .time_to_live(Self::CACHE_TTL)
                .build(),
        }
    }

    pub fn transport(&self) -> &Arc<dyn LogTransport> {
        &self.transport
    }

    fn unwrap_propose(reply: ProposeReply, path: &str) -> Result<Value> {
        if reply.success {
            return reply
                .result
                .ok_or_else(|| MetaError::Transport("propose reply missing result".into()));
        }
        if let Some(leader) = reply.leader_address {
            return Err(MetaError::NotLeader {
                leader_address: Some(leader),
            });
        }
        match reply.error {
            Some(err) => Err(err.into_meta(path)),
            None => Err(MetaError::Transport("propose failed without error".into())),
        }
    }

    fn unwrap_query(reply: QueryReply, path: &str) -> Result<Value> {
        if reply.success {
            return reply
                .result
                .ok_or_else(|| MetaError::Transport("query reply missing result".into()));
        }
        if let Some(leader) = reply.leader_address {
            return Err(MetaError::NotLeader {
                leader_address: Some(leader),
            });
        }
        match reply.error {
            Some(err) => Err(err.into_meta(path)),
            None => Err(MetaError::Transport("query failed without error".into())),
        }
    }

    // === Writes ===

    /// Propose a put. Returns the stored record and the zone revision.
    pub async fn put(&self, put: MetadataPut) -> Result<(FileMetadata, u64)> {
        let path = put.metadata.path.clone();
        let reply = self
            .transport
            .propose(LogCommand::PutMetadata(put), None)
            .await?;
        let result = Self::unwrap_propose(reply, &path)?;
        let metadata: FileMetadata = serde_json::from_value(result["metadata"].clone())?;
        let revision = result["revision"].as_u64().unwrap_or(0);
        self.cache.insert(path, metadata.clone());
        Ok((metadata, revision))
    }

    /// Propose a batch as one log transaction; all land or none do. An
    /// empty batch commits nothing and succeeds.
    pub async fn put_batch(&self, puts: Vec<MetadataPut>) -> Result<Vec<(FileMetadata, u64)>> {
        if puts.is_empty() {
            return Ok(Vec::new());
        }
        let first_path = puts[0].metadata.path.clone();
        let reply = self
            .transport
            .propose(LogCommand::PutMetadataBatch(puts), None)
            .await?;
        let result = Self::unwrap_propose(reply, &first_path)?;
        let items = result["items"]
            .as_array()
            .cloned()
            .unwrap_or_default();

        let mut out = Vec::with_capacity(items.len());
        for item in items {
            let metadata: FileMetadata = serde_json::from_value(item["metadata"].clone())?;
            let revision = item["revision"].as_u64().unwrap_or(0);
            self.cache.insert(metadata.path.clone(), metadata.clone());
            out.push((metadata, revision));
        }
        Ok(out)
    }

    /// Tombstone a path.
    pub async fn delete(&self, path: &str) -> Result<(FileMetadata, u64)> {
        let reply = self
            .transport
            .propose(
                LogCommand::DeleteMetadata {
                    path: path.to_string(),
                },
                None,
            )
            .await?;
        let result = Self::unwrap_propose(reply, path)?;
        let metadata: FileMetadata = serde_json::from_value(result["metadata"].clone())?;
        let revision = result["revision"].as_u64().unwrap_or(0);
        self.cache.invalidate(path);
        Ok((metadata, revision))
    }

    // === Reads ===

    pub async fn get(&self, path: &str) -> Result<Option<FileMetadata>> {
        self.get_with(path, false).await
    }

    /// `leader_read` requests a linearizable read from the leader and
    /// bypasses the local cache.
    pub async fn get_with(&self, path: &str, leader_read: bool) -> Result<Option<FileMetadata>> {
        if !leader_read {
            if let Some(hit) = self.cache.get(path) {
                return Ok(Some(hit));
            }
        }

        let reply = self
            .transport
            .query(
                LogQuery::GetMetadata {
                    path: path.to_string(),
                },
                leader_read,
            )
            .await?;
        let result = Self::unwrap_query(reply, path)?;
        let metadata: Option<FileMetadata> = serde_json::from_value(result["metadata"].clone())?;
        if let Some(meta) = &metadata {
            self.cache.insert(path.to_string(), meta.clone());
        }
        Ok(metadata)
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.get(path).await?.is_some())
    }

    pub async fn get_batch(&self, paths: &[String]) -> Result<Vec<Option<FileMetadata>>> {
        let reply = self
            .transport
            .query(
                LogQuery::GetMetadataBatch {
                    paths: paths.to_vec(),
                },
                false,
            )
            .await?;
        let result = Self::unwrap_query(reply, "")?;
        Ok(serde_json::from_value(result["metadatas"].clone())?)
    }

    pub async fn is_implicit_directory(&self, path: &str) -> Result<bool> {
        let reply = self
            .transport
            .query(
                LogQuery::IsImplicitDirectory {
                    path: path.to_string(),
                },
                false,
            )
            .await?;
        let result = Self::unwrap_query(reply, path)?;
        Ok(result["value"].as_bool().unwrap_or(false))
    }

    pub async fn list(
        &self,
        prefix: &str,
        recursive: bool,
        limit: usize,
        cursor: Option<String>,
    ) -> Result<Page> {
        let reply = self
            .transport
            .query(
                LogQuery::ListMetadata {
                    prefix: prefix.to_string(),
                    recursive,
                    limit,
                    cursor,
                },
                false,
            )
            .await?;
        let result = Self::unwrap_query(reply, prefix)?;
        Ok(serde_json::from_value(result["page"].clone())?)
    }

    pub async fn zone_revision(&self, zone: &str) -> Result<u64> {
        let reply = self
            .transport
            .query(
                LogQuery::ZoneRevision {
                    zone: zone.to_string(),
                },
                false,
            )
            .await?;
        let result = Self::unwrap_query(reply, "")?;
        Ok(result["revision"].as_u64().unwrap_or(0))
    }

    pub async fn lock_info(&self, path: &str) -> Result<LeaseInfo> {
        let reply = self
            .transport
            .query(
                LogQuery::GetLockInfo {
                    path: path.to_string(),
                },
                false,
            )
            .await?;
        let result = Self::unwrap_query(reply, path)?;
        Ok(serde_json::from_value(result["lock"].clone())?)
    }

    // === Version history ===

    pub async fn list_versions(&self, path: &str) -> Result<Vec<VersionRecord>> {
        let reply = self
            .transport
            .query(
                LogQuery::ListVersions {
                    path: path.to_string(),
                },
                false,
            )
            .await?;
        let result = Self::unwrap_query(reply, path)?;
        Ok(serde_json::from_value(result["versions"].clone())?)
    }

    pub async fn get_version(&self, path: &str, version: u64) -> Result<VersionRecord> {
        let reply = self
            .transport
            .query(
                LogQuery::GetVersion {
                    path: path.to_string(),
                    version,
                },
                false,
            )
            .await?;
        let result = Self::unwrap_query(reply, path)?;
        Ok(serde_json::from_value(result["version"].clone())?)
    }

    /// Restore the content of an earlier version as a new version. History
    /// is preserved; the new record points back at what it restored.
    pub async fn rollback(&self, path: &str, version: u64) -> Result<(FileMetadata, u64)> {
        let target = self.get_version(path, version).await?;
        let current = self
            .get_with(path, true)
            .await?
            .ok_or_else(|| MetaError::NotFound {
                path: path.to_string(),
            })?;

        let mut metadata = current;
        metadata.etag = target.etag.clone();
        metadata.physical_key = target.etag.clone();
        metadata.size = target.size;
        metadata.modified_at = now_millis();

        let mut put = MetadataPut::new(metadata);
        put.source = SourceType::Rollback;
        put.parent_override = Some(version);
        put.change_reason = Some(format!("rollback to version {version}"));

        debug!(path, version, "rolling back");
        self.put(put).await
    }

    pub async fn diff_versions(&self, path: &str, from: u64, to: u64) -> Result<VersionDiff> {
        let a = self.get_version(path, from).await?;
        let b = self.get_version(path, to).await?;
        Ok(VersionDiff {
            path: path.to_string(),
            from_version: from,
            to_version: to,
            content_changed: a.etag != b.etag,
            size_delta: b.size as i64 - a.size as i64,
            from_etag: a.etag,
            to_etag: b.etag,
        })
    }

    // === Cache invalidation (driven by the events layer) ===

    pub fn invalidate(&self, path: &str) {
        self.cache.invalidate(path);
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::LocalLog;
    use crate::store::MetadataStore;
    use tempfile::TempDir;

    fn replicated() -> (TempDir, ReplicatedMetadataStore) {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(MetadataStore::open(temp.path().join("meta")).unwrap());
        let log = Arc::new(LocalLog::new(store));
        (temp, ReplicatedMetadataStore::new(log))
    }

    fn meta(path: &str, etag: &str) -> MetadataPut {
        MetadataPut::new(FileMetadata::new_file(
            path,
            "passthrough",
            etag,
            etag.len() as u64,
            "default",
            "alice",
            "eng",
        ))
    }

    #[tokio::test]
    async fn put_get_roundtrip() {
        let (_t, store) = replicated();

        let (written, revision) = store.put(meta("/a", "e1")).await.unwrap();
        assert_eq!(written.version, 1);
        assert!(revision > 0);

        let read = store.get("/a").await.unwrap().unwrap();
        assert_eq!(read.etag, "e1");
    }

    #[tokio::test]
    async fn delete_then_get_is_none() {
        let (_t, store) = replicated();
        store.put(meta("/d", "e1")).await.unwrap();
        store.delete("/d").await.unwrap();
        assert!(store.get("/d").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_batch_commits_nothing() {
        let (_t, store) = replicated();
        let out = store.put_batch(Vec::new()).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn rollback_restores_old_etag() {
        let (_t, store) = replicated();
        store.put(meta("/r", "old")).await.unwrap();
        store.put(meta("/r", "new")).await.unwrap();

        let (rolled, _) = store.rollback("/r", 1).await.unwrap();
        assert_eq!(rolled.etag, "old");
        assert_eq!(rolled.version, 3);

        let versions = store.list_versions("/r").await.unwrap();
        assert_eq!(versions.len(), 3);
        assert_eq!(versions[2].source_type, SourceType::Rollback);
        assert_eq!(versions[2].parent_version, Some(1));
    }

    #[tokio::test]
    async fn diff_versions_reports_change() {
        let (_t, store) = replicated();
        store.put(meta("/v", "aa")).await.unwrap();
        store.put(meta("/v", "bbbb")).await.unwrap();

        let diff = store.diff_versions("/v", 1, 2).await.unwrap();
        assert!(diff.content_changed);
        assert_eq!(diff.size_delta, 2);
    }

    #[tokio::test]
    async fn stale_cache_is_invalidated() {
        let (_t, store) = replicated();
        store.put(meta("/s", "e1")).await.unwrap();
        store.get("/s").await.unwrap();

        // Simulate an externally-applied write the cache hasn't seen
        store.invalidate("/s");
        assert!(store.get("/s").await.unwrap().is_some());
    }
}
