//! LMDB-backed metadata store.
//!
//! This is the state machine behind the replicated log: every mutation
//! arrives as an applied log command, so the store itself only needs local
//! ACID transactions.

use std::collections::BTreeSet;
use std::ops::Bound;
use std::path::Path;

use heed::types::{SerdeBincode, Str};
use heed::{Database, Env, EnvOpenOptions, RwTxn};
use tracing::debug;

use crate::log::MetadataPut;
use crate::model::{now_millis, FileMetadata, Page, SourceType, VersionRecord};
use crate::{MetaError, Result};

/// Key for a version row: `<path>\0<version zero-padded>` keeps rows
/// grouped by path and ordered by version under lexicographic order.
fn version_key(path: &str, version: u64) -> String {
    format!("{path}\x00{version:020}")
}

pub struct MetadataStore {
    env: Env,
    entries: Database<Str, SerdeBincode<FileMetadata>>,
    versions: Database<Str, SerdeBincode<VersionRecord>>,
    refcounts: Database<Str, SerdeBincode<u64>>,
    zones: Database<Str, SerdeBincode<u64>>,
}

impl MetadataStore {
    const DEFAULT_MAP_SIZE: usize = 1024 * 1024 * 1024;
    const MAX_READERS: u32 = 128;

    /// Open or create the store. `path` is a directory for the LMDB files.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(Self::DEFAULT_MAP_SIZE)
                .max_readers(Self::MAX_READERS)
                .max_dbs(4)
                .open(path)?
        };

        let mut wtxn = env.write_txn()?;
        let entries = env.create_database(&mut wtxn, Some("entries"))?;
        let versions = env.create_database(&mut wtxn, Some("versions"))?;
        let refcounts = env.create_database(&mut wtxn, Some("refcounts"))?;
        let zones = env.create_database(&mut wtxn, Some("zones"))?;
        wtxn.commit()?;

        debug!("opened metadata store at {:?}", path);

        Ok(Self {
            env,
            entries,
            versions,
            refcounts,
            zones,
        })
    }

    // === Applied log commands ===

    /// Apply one put. Returns the stored record (version assigned) and the
    /// zone revision after the write.
    pub fn apply_put(&self, put: &MetadataPut) -> Result<(FileMetadata, u64)> {
        let mut wtxn = self.env.write_txn()?;
        let result = self.put_in_txn(&mut wtxn, put)?;
        wtxn.commit()?;
        Ok(result)
    }

    /// Apply a batch atomically: either every put lands or none does.
    pub fn apply_put_batch(&self, puts: &[MetadataPut]) -> Result<Vec<(FileMetadata, u64)>> {
        let mut wtxn = self.env.write_txn()?;
        let mut results = Vec::with_capacity(puts.len());
        for put in puts {
            results.push(self.put_in_txn(&mut wtxn, put)?);
        }
        wtxn.commit()?;
        Ok(results)
    }

    fn put_in_txn(&self, wtxn: &mut RwTxn<'_>, put: &MetadataPut) -> Result<(FileMetadata, u64)> {
        let path = put.metadata.path.as_str();
        let old = self.entries.get(wtxn, path)?;
        let live_old = old.as_ref().filter(|m| !m.tombstone);

        if put.if_none_match {
            if let Some(current) = live_old {
                return Err(MetaError::Conflict {
                    path: path.to_string(),
                    current_etag: Some(current.etag.clone()),
                });
            }
        }
        if let Some(expected) = &put.if_match {
            match live_old {
                Some(current) if &current.etag == expected => {}
                Some(current) => {
                    return Err(MetaError::Conflict {
                        path: path.to_string(),
                        current_etag: Some(current.etag.clone()),
                    })
                }
                None => {
                    return Err(MetaError::NotFound {
                        path: path.to_string(),
                    })
                }
            }
        }

        let mut meta = put.metadata.clone();
        let source = match &old {
            Some(prev) => {
                meta.version = prev.version + 1;
                meta.created_at = prev.created_at;
                put.source
            }
            None => {
                meta.version = 1;
                SourceType::Original
            }
        };
        meta.tombstone = false;

        self.entries.put(wtxn, path, &meta)?;

        let record = VersionRecord {
            path: path.to_string(),
            version: meta.version,
            etag: meta.etag.clone(),
            size: meta.size,
            source_type: source,
            parent_version: put
                .parent_override
                .or_else(|| old.as_ref().map(|p| p.version)),
            created_at: meta.modified_at,
            change_reason: put.change_reason.clone(),
        };
        self.versions
            .put(wtxn, &version_key(path, meta.version), &record)?;

        if !meta.etag.is_empty() {
            let count = self.refcounts.get(wtxn, &meta.etag)?.unwrap_or(0);
            self.refcounts.put(wtxn, &meta.etag, &(count + 1))?;
        }

        let revision = self.bump_zone(wtxn, &meta.zone_id)?;
        Ok((meta, revision))
    }

    /// Tombstone a path. Version history stays until GC prunes it.
    pub fn apply_delete(&self, path: &str) -> Result<(FileMetadata, u64)> {
        let mut wtxn = self.env.write_txn()?;

        let old = self
            .entries
            .get(&wtxn, path)?
            .filter(|m| !m.tombstone)
            .ok_or_else(|| MetaError::NotFound {
                path: path.to_string(),
            })?;

        let mut meta = old;
        meta.version += 1;
        meta.modified_at = now_millis();
        meta.tombstone = true;
        self.entries.put(&mut wtxn, path, &meta)?;

        let revision = self.bump_zone(&mut wtxn, &meta.zone_id)?;
        wtxn.commit()?;
        Ok((meta, revision))
    }

    fn bump_zone(&self, wtxn: &mut RwTxn<'_>, zone: &str) -> Result<u64> {
        let revision = self.zones.get(wtxn, zone)?.unwrap_or(0) + 1;
        self.zones.put(wtxn, zone, &revision)?;
        Ok(revision)
    }

    // === Reads ===

    /// Live metadata (tombstones read as missing).
    pub fn get(&self, path: &str) -> Result<Option<FileMetadata>> {
        let rtxn = self.env.read_txn()?;
        Ok(self.entries.get(&rtxn, path)?.filter(|m| !m.tombstone))
    }

    /// Metadata including tombstones; the version APIs need it.
    pub fn get_raw(&self, path: &str) -> Result<Option<FileMetadata>> {
        let rtxn = self.env.read_txn()?;
        Ok(self.entries.get(&rtxn, path)?)
    }

    pub fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.get(path)?.is_some())
    }

    pub fn get_batch(&self, paths: &[String]) -> Result<Vec<Option<FileMetadata>>> {
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::with_capacity(paths.len());
        for path in paths {
            out.push(self.entries.get(&rtxn, path)?.filter(|m| !m.tombstone));
        }
        Ok(out)
    }

    /// A directory exists implicitly iff at least one live file has it as
    /// a path prefix.
    pub fn is_implicit_directory(&self, path: &str) -> Result<bool> {
        let prefix = normalize_dir_prefix(path);
        let rtxn = self.env.read_txn()?;
        let range = (Bound::Included(prefix.as_str()), Bound::<&str>::Unbounded);
        for item in self.entries.range(&rtxn, &range)? {
            let (key, meta) = item?;
            if !key.starts_with(prefix.as_str()) {
                break;
            }
            if !meta.tombstone {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Paginated listing under a directory prefix.
    ///
    /// Non-recursive scans surface immediate child files as entries and
    /// deeper paths as `directories`. `limit = 0` returns an empty page
    /// with no cursor.
    pub fn list(
        &self,
        prefix: &str,
        recursive: bool,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<Page> {
        if limit == 0 {
            return Ok(Page::default());
        }

        let dir_prefix = normalize_dir_prefix(prefix);
        let rtxn = self.env.read_txn()?;

        let start = match cursor {
            Some(c) => Bound::Excluded(c),
            None => Bound::Included(dir_prefix.as_str()),
        };
        let range = (start, Bound::<&str>::Unbounded);

        let mut entries: Vec<FileMetadata> = Vec::new();
        let mut directories: BTreeSet<String> = BTreeSet::new();
        let mut next_cursor = None;
        let mut last_key: Option<String> = None;

        for item in self.entries.range(&rtxn, &range)? {
            let (key, meta) = item?;
            if !key.starts_with(dir_prefix.as_str()) {
                break;
            }
            if meta.tombstone {
                continue;
            }

            let rest = &key[dir_prefix.len()..];
            if rest.is_empty() {
                continue;
            }
            if !recursive {
                if let Some(slash) = rest.find('/') {
                    directories.insert(rest[..slash].to_string());
                    continue;
                }
            }

            if entries.len() == limit {
                next_cursor = last_key;
                return Ok(Page {
                    entries,
                    directories: directories.into_iter().collect(),
                    next_cursor,
                });
            }
            last_key = Some(key.to_string());
            entries.push(meta);
        }

        Ok(Page {
            entries,
            directories: directories.into_iter().collect(),
            next_cursor,
        })
    }

    // === Version history ===

    pub fn list_versions(&self, path: &str) -> Result<Vec<VersionRecord>> {
        let prefix = format!("{path}\x00");
        let rtxn = self.env.read_txn()?;
        let range = (Bound::Included(prefix.as_str()), Bound::<&str>::Unbounded);
        let mut records = Vec::new();
        for item in self.versions.range(&rtxn, &range)? {
            let (key, record) = item?;
            if !key.starts_with(prefix.as_str()) {
                break;
            }
            records.push(record);
        }
        Ok(records)
    }

    pub fn get_version(&self, path: &str, version: u64) -> Result<VersionRecord> {
        let rtxn = self.env.read_txn()?;
        self.versions
            .get(&rtxn, &version_key(path, version))?
            .ok_or(MetaError::VersionNotFound {
                path: path.to_string(),
                version,
            })
    }

    /// One batch of version rows for the GC sweep, resuming from `cursor`
    /// (the last key of the previous batch).
    pub fn versions_page(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<(Vec<VersionRecord>, Option<String>)> {
        let rtxn = self.env.read_txn()?;
        let start = match cursor {
            Some(c) => Bound::Excluded(c),
            None => Bound::<&str>::Unbounded,
        };
        let range = (start, Bound::<&str>::Unbounded);

        let mut records = Vec::new();
        let mut last_key = None;
        for item in self.versions.range(&rtxn, &range)? {
            let (key, record) = item?;
            records.push(record);
            last_key = Some(key.to_string());
            if records.len() >= limit {
                return Ok((records, last_key));
            }
        }
        Ok((records, None))
    }

    /// Remove one version row and release its content reference.
    pub fn prune_version(&self, path: &str, version: u64) -> Result<bool> {
        let mut wtxn = self.env.write_txn()?;
        let key = version_key(path, version);
        let record = match self.versions.get(&wtxn, &key)? {
            Some(r) => r,
            None => return Ok(false),
        };
        self.versions.delete(&mut wtxn, &key)?;

        if !record.etag.is_empty() {
            let count = self.refcounts.get(&wtxn, &record.etag)?.unwrap_or(0);
            if count <= 1 {
                self.refcounts.delete(&mut wtxn, &record.etag)?;
            } else {
                self.refcounts.put(&mut wtxn, &record.etag, &(count - 1))?;
            }
        }

        wtxn.commit()?;
        Ok(true)
    }

    // === Reference counting and revisions ===

    /// Number of version rows naming this etag (across all paths).
    pub fn ref_count(&self, etag: &str) -> Result<u64> {
        let rtxn = self.env.read_txn()?;
        Ok(self.refcounts.get(&rtxn, etag)?.unwrap_or(0))
    }

    pub fn is_referenced(&self, etag: &str) -> bool {
        self.ref_count(etag).map(|c| c > 0).unwrap_or(true)
    }

    /// Monotonic per-zone write revision, used to order change events.
    pub fn zone_revision(&self, zone: &str) -> Result<u64> {
        let rtxn = self.env.read_txn()?;
        Ok(self.zones.get(&rtxn, zone)?.unwrap_or(0))
    }
}

fn normalize_dir_prefix(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("{trimmed}/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MetadataPut;
    use tempfile::TempDir;

    fn store() -> (TempDir, MetadataStore) {
        let temp = TempDir::new().unwrap();
        let store = MetadataStore::open(temp.path().join("meta")).unwrap();
        (temp, store)
    }

    fn put_for(path: &str, etag: &str) -> MetadataPut {
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

    #[test]
    fn put_assigns_increasing_versions() {
        let (_t, store) = store();

        let (v1, _) = store.apply_put(&put_for("/a", "e1")).unwrap();
        assert_eq!(v1.version, 1);

        let (v2, _) = store.apply_put(&put_for("/a", "e2")).unwrap();
        assert_eq!(v2.version, 2);

        let versions = store.list_versions("/a").unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].source_type, SourceType::Original);
        assert_eq!(versions[1].source_type, SourceType::Update);
        assert_eq!(versions[1].parent_version, Some(1));
    }

    #[test]
    fn if_match_enforced() {
        let (_t, store) = store();
        store.apply_put(&put_for("/x", "e1")).unwrap();

        let mut put = put_for("/x", "e2");
        put.if_match = Some("wrong".to_string());
        let err = store.apply_put(&put).unwrap_err();
        match err {
            MetaError::Conflict { current_etag, .. } => {
                assert_eq!(current_etag.as_deref(), Some("e1"));
            }
            other => panic!("expected conflict, got {other:?}"),
        }

        let mut put = put_for("/x", "e2");
        put.if_match = Some("e1".to_string());
        let (meta, _) = store.apply_put(&put).unwrap();
        assert_eq!(meta.version, 2);
    }

    #[test]
    fn if_none_match_rejects_existing() {
        let (_t, store) = store();
        store.apply_put(&put_for("/y", "e1")).unwrap();

        let mut put = put_for("/y", "e2");
        put.if_none_match = true;
        assert!(matches!(
            store.apply_put(&put),
            Err(MetaError::Conflict { .. })
        ));
    }

    #[test]
    fn delete_tombstones_and_versions_survive() {
        let (_t, store) = store();
        store.apply_put(&put_for("/d", "e1")).unwrap();
        let (meta, _) = store.apply_delete("/d").unwrap();
        assert!(meta.tombstone);
        assert_eq!(meta.version, 2);

        assert!(store.get("/d").unwrap().is_none());
        assert!(store.get_raw("/d").unwrap().is_some());
        assert_eq!(store.list_versions("/d").unwrap().len(), 1);
        assert!(store.is_referenced("e1"));
    }

    #[test]
    fn delete_after_delete_is_not_found() {
        let (_t, store) = store();
        store.apply_put(&put_for("/d2", "e1")).unwrap();
        store.apply_delete("/d2").unwrap();
        assert!(matches!(
            store.apply_delete("/d2"),
            Err(MetaError::NotFound { .. })
        ));
    }

    #[test]
    fn implicit_directories() {
        let (_t, store) = store();
        store.apply_put(&put_for("/docs/guide/a.md", "e1")).unwrap();

        assert!(store.is_implicit_directory("/docs").unwrap());
        assert!(store.is_implicit_directory("/docs/guide").unwrap());
        assert!(!store.is_implicit_directory("/docs/other").unwrap());
    }

    #[test]
    fn list_non_recursive_synthesizes_dirs() {
        let (_t, store) = store();
        store.apply_put(&put_for("/p/a.txt", "e1")).unwrap();
        store.apply_put(&put_for("/p/sub/b.txt", "e2")).unwrap();
        store.apply_put(&put_for("/p/sub/c.txt", "e3")).unwrap();

        let page = store.list("/p", false, 100, None).unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].path, "/p/a.txt");
        assert_eq!(page.directories, vec!["sub".to_string()]);

        let page = store.list("/p", true, 100, None).unwrap();
        assert_eq!(page.entries.len(), 3);
    }

    #[test]
    fn list_paginates_with_cursor() {
        let (_t, store) = store();
        for i in 0..5 {
            store
                .apply_put(&put_for(&format!("/pg/f{i}.txt"), &format!("e{i}")))
                .unwrap();
        }

        let first = store.list("/pg", true, 2, None).unwrap();
        assert_eq!(first.entries.len(), 2);
        let cursor = first.next_cursor.clone().expect("cursor");

        let second = store.list("/pg", true, 10, Some(&cursor)).unwrap();
        assert_eq!(second.entries.len(), 3);
        assert!(second.next_cursor.is_none());

        let mut all: Vec<_> = first
            .entries
            .iter()
            .chain(second.entries.iter())
            .map(|m| m.path.clone())
            .collect();
        all.sort();
        assert_eq!(all.len(), 5);
        all.dedup();
        assert_eq!(all.len(), 5, "no duplicates across pages");
    }

    #[test]
    fn list_limit_zero_is_empty() {
        let (_t, store) = store();
        store.apply_put(&put_for("/z/a", "e1")).unwrap();
        let page = store.list("/z", true, 0, None).unwrap();
        assert!(page.entries.is_empty());
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn refcounts_follow_versions() {
        let (_t, store) = store();
        store.apply_put(&put_for("/r/a", "shared")).unwrap();
        store.apply_put(&put_for("/r/b", "shared")).unwrap();
        assert_eq!(store.ref_count("shared").unwrap(), 2);

        assert!(store.prune_version("/r/a", 1).unwrap());
        assert_eq!(store.ref_count("shared").unwrap(), 1);

        assert!(store.prune_version("/r/b", 1).unwrap());
        assert_eq!(store.ref_count("shared").unwrap(), 0);
        assert!(!store.is_referenced("shared"));
    }

    #[test]
    fn zone_revision_is_monotonic() {
        let (_t, store) = store();
        let (_, r1) = store.apply_put(&put_for("/m/1", "e1")).unwrap();
        let (_, r2) = store.apply_put(&put_for("/m/2", "e2")).unwrap();
        assert!(r2 > r1);
        assert_eq!(store.zone_revision("default").unwrap(), r2);
    }

    #[test]
    fn batch_is_atomic() {
        let (_t, store) = store();
        store.apply_put(&put_for("/b/exists", "e1")).unwrap();

        let mut conflicting = put_for("/b/exists", "e2");
        conflicting.if_none_match = true;
        let batch = vec![put_for("/b/new", "e3"), conflicting];

        assert!(store.apply_put_batch(&batch).is_err());
        // First put must have been rolled back with the failed batch
        assert!(store.get("/b/new").unwrap().is_none());
    }
}
