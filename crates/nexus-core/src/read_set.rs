//! Read-set tracking for precise cache invalidation.
//!
//! Instead of coarse path patterns that notify every subscriber, each
//! query records exactly which resources it read. A write then maps to
//! the affected queries in O(1) for direct paths plus O(depth) walking
//! the ancestor chain.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use nexus_config::log_kernel_debug;
use serde::{Deserialize, Serialize};

use crate::path::parent_of;

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

static NEXT_QUERY_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessType {
    Content,
    Metadata,
    List,
    Exists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    File,
    Directory,
    Metadata,
}

/// One recorded access.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadSetEntry {
    pub resource_type: ResourceType,
    pub resource_id: String,
    /// Revision at read time, for staleness comparison.
    pub revision: u64,
    pub access_type: AccessType,
    pub timestamp: f64,
}

impl ReadSetEntry {
    pub fn is_stale(&self, current_revision: u64) -> bool {
        current_revision > self.revision
    }

    fn is_directory_read(&self) -> bool {
        self.resource_type == ResourceType::Directory || self.access_type == AccessType::List
    }
}

/// Everything one query observed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadSet {
    pub query_id: String,
    pub zone_id: String,
    pub entries: Vec<ReadSetEntry>,
    pub created_at: f64,
    pub expires_at: Option<f64>,

    // Indexes rebuilt on deserialization, O(1) membership
    #[serde(skip)]
    path_set: HashSet<String>,
    #[serde(skip)]
    directory_set: HashSet<String>,
}

fn dir_key(path: &str) -> String {
    format!("{}/", path.trim_end_matches('/'))
}

impl ReadSet {
    pub fn new(query_id: impl Into<String>, zone_id: impl Into<String>) -> Self {
        Self {
            query_id: query_id.into(),
            zone_id: zone_id.into(),
            entries: Vec::new(),
            created_at: now_secs(),
            expires_at: None,
            path_set: HashSet::new(),
            directory_set: HashSet::new(),
        }
    }

    /// Fresh read set with a generated query id.
    pub fn create(zone_id: impl Into<String>, ttl: Option<Duration>) -> Self {
        let id = NEXT_QUERY_ID.fetch_add(1, Ordering::Relaxed);
        let mut set = Self::new(format!("q-{id:08x}"), zone_id);
        set.expires_at = ttl.map(|t| set.created_at + t.as_secs_f64());
        set
    }

    pub fn record_read(
        &mut self,
        resource_type: ResourceType,
        resource_id: &str,
        revision: u64,
        access_type: AccessType,
    ) {
        let entry = ReadSetEntry {
            resource_type,
            resource_id: resource_id.to_string(),
            revision,
            access_type,
            timestamp: now_secs(),
        };
        self.index_entry(&entry);
        self.entries.push(entry);
    }

    fn index_entry(&mut self, entry: &ReadSetEntry) {
        self.path_set.insert(entry.resource_id.clone());
        if entry.is_directory_read() {
            self.directory_set.insert(dir_key(&entry.resource_id));
        }
    }

    /// Rebuild the internal indexes (after deserialization).
    pub fn reindex(&mut self) {
        self.path_set.clear();
        self.directory_set.clear();
        let entries = self.entries.clone();
        for entry in &entries {
            self.index_entry(entry);
        }
    }

    /// Does a write at `write_path` affect anything this query read?
    /// O(1) for the direct path, O(d) over the recorded directories.
    pub fn overlaps_with_write(&self, write_path: &str, write_revision: u64) -> bool {
        if self.path_set.contains(write_path) {
            let direct_stale = self
                .entries
                .iter()
                .any(|e| e.resource_id == write_path && write_revision > e.revision);
            if direct_stale {
                return true;
            }
            // The same path may still sit inside a directory whose
            // listing is stale; fall through.
        }

        let normalized = write_path.trim_end_matches('/');
        self.directory_set
            .iter()
            .any(|dir| normalized.starts_with(dir.as_str()) || format!("{normalized}/") == *dir)
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.expires_at, Some(exp) if now_secs() > exp)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryStats {
    pub read_sets_count: usize,
    pub paths_indexed: usize,
    pub directories_indexed: usize,
    pub zones_count: usize,
    pub registers: u64,
    pub unregisters: u64,
    pub lookups: u64,
    pub hits: u64,
    pub cleanups: u64,
}

#[derive(Default)]
struct RegistryInner {
    read_sets: HashMap<String, ReadSet>,
    /// path → query ids
    reverse_index: HashMap<String, HashSet<String>>,
    /// directory (with trailing slash) → query ids
    directory_index: HashMap<String, HashSet<String>>,
    /// zone → query ids
    zone_index: HashMap<String, HashSet<String>>,
    stats: RegistryStats,
    last_sweep: Option<Instant>,
}

/// Registry of active read sets with reverse indexes. One lock guards the
/// three indexes; snapshots handed out are copies.
pub struct ReadSetRegistry {
    inner: Mutex<RegistryInner>,
    default_ttl: Duration,
    /// Expired sets are swept when the registry has been idle this long.
    sweep_idle: Duration,
}

impl ReadSetRegistry {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            default_ttl,
            sweep_idle: Duration::from_secs(60),
        }
    }

    pub fn register(&self, mut read_set: ReadSet) {
        if read_set.expires_at.is_none() {
            read_set.expires_at = Some(read_set.created_at + self.default_ttl.as_secs_f64());
        }

        let mut inner = self.inner.lock().expect("registry poisoned");
        let query_id = read_set.query_id.clone();
        if inner.read_sets.contains_key(&query_id) {
            Self::unregister_inner(&mut inner, &query_id);
        }

        for entry in &read_set.entries {
            inner
                .reverse_index
                .entry(entry.resource_id.clone())
                .or_default()
                .insert(query_id.clone());
            if entry.is_directory_read() {
                inner
                    .directory_index
                    .entry(dir_key(&entry.resource_id))
                    .or_default()
                    .insert(query_id.clone());
            }
        }
        inner
            .zone_index
            .entry(read_set.zone_id.clone())
            .or_default()
            .insert(query_id.clone());

        log_kernel_debug!(
            "registered read set",
            query_id = query_id.as_str(),
            entries = read_set.entries.len(),
        );
        inner.stats.registers += 1;
        inner.read_sets.insert(query_id, read_set);
    }

    pub fn unregister(&self, query_id: &str) -> bool {
        let mut inner = self.inner.lock().expect("registry poisoned");
        Self::unregister_inner(&mut inner, query_id)
    }

    fn unregister_inner(inner: &mut RegistryInner, query_id: &str) -> bool {
        let Some(read_set) = inner.read_sets.remove(query_id) else {
            return false;
        };
        inner.stats.unregisters += 1;

        for entry in &read_set.entries {
            if let Some(set) = inner.reverse_index.get_mut(&entry.resource_id) {
                set.remove(query_id);
                if set.is_empty() {
                    inner.reverse_index.remove(&entry.resource_id);
                }
            }
            if entry.is_directory_read() {
                let key = dir_key(&entry.resource_id);
                if let Some(set) = inner.directory_index.get_mut(&key) {
                    set.remove(query_id);
                    if set.is_empty() {
                        inner.directory_index.remove(&key);
                    }
                }
            }
        }
        if let Some(set) = inner.zone_index.get_mut(&read_set.zone_id) {
            set.remove(query_id);
            if set.is_empty() {
                inner.zone_index.remove(&read_set.zone_id);
            }
        }
        true
    }

    /// Every query whose read set overlaps a write: direct path hit in
    /// O(1), then the ancestor-directory walk in O(depth).
    pub fn get_affected_queries(
        &self,
        write_path: &str,
        write_revision: u64,
        zone_id: Option<&str>,
    ) -> HashSet<String> {
        let mut inner = self.inner.lock().expect("registry poisoned");
        inner.stats.lookups += 1;
        self.maybe_sweep(&mut inner);

        let mut affected = HashSet::new();

        if let Some(query_ids) = inner.reverse_index.get(write_path) {
            for query_id in query_ids {
                if let Some(read_set) = inner.read_sets.get(query_id) {
                    if read_set.overlaps_with_write(write_path, write_revision)
                        && zone_id.map(|z| read_set.zone_id == z).unwrap_or(true)
                    {
                        affected.insert(query_id.clone());
                    }
                }
            }
        }

        // Walk up the ancestor chain
        let mut current = write_path.trim_end_matches('/').to_string();
        if current.is_empty() {
            current = "/".to_string();
        }
        loop {
            let key = if current == "/" {
                "/".to_string()
            } else {
                format!("{current}/")
            };
            if let Some(query_ids) = inner.directory_index.get(&key) {
                for query_id in query_ids {
                    if let Some(read_set) = inner.read_sets.get(query_id) {
                        if zone_id.map(|z| read_set.zone_id == z).unwrap_or(true) {
                            affected.insert(query_id.clone());
                        }
                    }
                }
            }
            match parent_of(&current) {
                Some(parent) if parent != current => current = parent,
                _ => break,
            }
        }

        if !affected.is_empty() {
            inner.stats.hits += 1;
        }
        affected
    }

    pub fn get_read_set(&self, query_id: &str) -> Option<ReadSet> {
        let inner = self.inner.lock().expect("registry poisoned");
        inner.read_sets.get(query_id).cloned()
    }

    pub fn queries_for_zone(&self, zone_id: &str) -> HashSet<String> {
        let inner = self.inner.lock().expect("registry poisoned");
        inner.zone_index.get(zone_id).cloned().unwrap_or_default()
    }

    /// Drop expired read sets. Returns how many went away.
    pub fn cleanup_expired(&self) -> usize {
        let mut inner = self.inner.lock().expect("registry poisoned");
        Self::cleanup_inner(&mut inner)
    }

    fn cleanup_inner(inner: &mut RegistryInner) -> usize {
        let expired: Vec<String> = inner
            .read_sets
            .values()
            .filter(|rs| rs.is_expired())
            .map(|rs| rs.query_id.clone())
            .collect();
        for query_id in &expired {
            Self::unregister_inner(inner, query_id);
        }
        inner.stats.cleanups += expired.len() as u64;
        expired.len()
    }

    fn maybe_sweep(&self, inner: &mut RegistryInner) {
        let due = inner
            .last_sweep
            .map(|t| t.elapsed() >= self.sweep_idle)
            .unwrap_or(true);
        if due {
            Self::cleanup_inner(inner);
            inner.last_sweep = Some(Instant::now());
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("registry poisoned");
        *inner = RegistryInner {
            stats: inner.stats.clone(),
            ..RegistryInner::default()
        };
    }

    pub fn stats(&self) -> RegistryStats {
        let inner = self.inner.lock().expect("registry poisoned");
        RegistryStats {
            read_sets_count: inner.read_sets.len(),
            paths_indexed: inner.reverse_index.len(),
            directories_indexed: inner.directory_index.len(),
            zones_count: inner.zone_index.len(),
            ..inner.stats.clone()
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("registry poisoned").read_sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ReadSetRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}
