//! Metadata record types.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Epoch milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One ACL entry embedded in a file's metadata. Deny entries take
/// precedence over every grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclEntry {
    /// "user" or "group"
    pub entry_type: String,
    pub identifier: String,
    /// `rwx` form, e.g. "rw-"
    pub permissions: String,
    pub deny: bool,
}

impl AclEntry {
    pub fn grants(&self, bit: char) -> bool {
        !self.deny && self.permissions.contains(bit)
    }
}

/// Metadata for one virtual path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub path: String,
    pub backend_name: String,
    /// Key inside the owning backend (CAS hash for content backends).
    pub physical_key: String,
    pub size: u64,
    /// blake3 hex of the bytes the pointer currently names.
    pub etag: String,
    pub mime_type: Option<String>,
    pub created_at: u64,
    pub modified_at: u64,
    /// Strictly increasing per path; assigned by the store on put.
    pub version: u64,
    pub zone_id: String,
    pub owner: String,
    pub group: String,
    /// POSIX-style bits, e.g. 0o644.
    pub mode: u32,
    pub is_directory: bool,
    /// Soft-deleted; retained for version history until GC.
    #[serde(default)]
    pub tombstone: bool,
    #[serde(default)]
    pub acl: Vec<AclEntry>,
}

impl FileMetadata {
    /// Fresh record for a file about to be created. Version is assigned by
    /// the store when the put is applied.
    pub fn new_file(
        path: impl Into<String>,
        backend_name: impl Into<String>,
        etag: impl Into<String>,
        size: u64,
        zone_id: impl Into<String>,
        owner: impl Into<String>,
        group: impl Into<String>,
    ) -> Self {
        let now = now_millis();
        let etag = etag.into();
        Self {
            path: path.into(),
            backend_name: backend_name.into(),
            physical_key: etag.clone(),
            size,
            etag,
            mime_type: None,
            created_at: now,
            modified_at: now,
            version: 0,
            zone_id: zone_id.into(),
            owner: owner.into(),
            group: group.into(),
            mode: 0o644,
            is_directory: false,
            tombstone: false,
            acl: Vec::new(),
        }
    }
}

/// Where a version row came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Original,
    Update,
    Consolidated,
    Rollback,
}

/// One row per (path, version).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub path: String,
    pub version: u64,
    pub etag: String,
    pub size: u64,
    pub source_type: SourceType,
    pub parent_version: Option<u64>,
    pub created_at: u64,
    pub change_reason: Option<String>,
}

/// One page of a listing. The cursor is opaque to callers and encodes the
/// last emitted key, so listings resume across failures.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Page {
    pub entries: Vec<FileMetadata>,
    /// Immediate child directories observed during a non-recursive scan
    /// (implicit directories included).
    pub directories: Vec<String>,
    pub next_cursor: Option<String>,
}
