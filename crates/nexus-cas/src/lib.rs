//! # nexus-cas
//!
//! Content-addressed storage and the pointer layer for the Nexus kernel.
//!
//! Storage is split in two so the host OS can watch file changes natively:
//!
//! ```text
//! <root>/
//! ├── pointers/           # stable virtual-path tree (watchable)
//! │   └── inbox/
//! │       └── file.txt    # contains: "cas:abcd1234...\n"
//! └── cas/                # content-addressed blobs (dedup)
//!     └── ab/cd/abcd1234...
//! ```
//!
//! Pointer updates go through temp-file + rename so a watcher observes at
//! most one change event per update.

mod locks;
mod passthrough;
mod store;

pub use locks::{LockTable, DEFAULT_LOCK_TIMEOUT};
pub use passthrough::PassthroughBackend;
pub use store::{CasStats, CasStore};

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Prefix marking a valid pointer file body.
pub const POINTER_PREFIX: &str = "cas:";

/// Errors surfaced by backends.
#[derive(Error, Debug)]
pub enum CasError {
    /// OS-level failure, wrapped with the backend name and the path involved.
    #[error("backend {backend} failed at {path}: {source}")]
    Backend {
        backend: &'static str,
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("content not found: {hash}")]
    NotFound { hash: String },

    #[error("path not found: {path}")]
    PathNotFound { path: String },

    #[error("already exists: {path}")]
    AlreadyExists { path: String },

    #[error("not a directory: {path}")]
    NotADirectory { path: String },

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("malformed pointer at {path}")]
    MalformedPointer { path: String },

    #[error("invalid content hash: {hash}")]
    InvalidHash { hash: String },

    #[error("max_holders mismatch for {path}: expected {expected}, got {got}")]
    LockLimitMismatch {
        path: String,
        expected: u32,
        got: u32,
    },

    #[error("max_holders must be >= 1, got {got}")]
    InvalidLockLimit { got: u32 },
}

pub type Result<T> = std::result::Result<T, CasError>;

impl CasError {
    pub(crate) fn backend(backend: &'static str, path: impl Into<String>, source: io::Error) -> Self {
        CasError::Backend {
            backend,
            path: path.into(),
            source,
        }
    }
}

/// Compute the content hash (blake3, hex) of a byte slice.
#[inline]
pub fn compute_hash(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Reference to content: either a CAS hash or a virtual path resolved
/// through the pointer layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentRef<'a> {
    Hash(&'a str),
    VirtualPath(&'a str),
}

/// Storage backend seam consumed by the kernel façade.
///
/// Implementations are synchronous; the façade hops to a blocking pool for
/// the spin-wait lock path.
pub trait Backend: Send + Sync {
    /// Backend identifier used in error context and metadata records.
    fn name(&self) -> &'static str;

    /// Whether this backend exposes a pointer tree the OS can watch and a
    /// process-local lock table.
    fn is_passthrough(&self) -> bool {
        false
    }

    /// Store content, returning its hash. When `virtual_path` is given the
    /// pointer for that path is atomically re-pointed at the new content.
    fn write_content(&self, content: &[u8], virtual_path: Option<&str>) -> Result<String>;

    /// Fetch content by hash or by pointer. Verifies the hash of the bytes
    /// read before returning them.
    fn read_content(&self, reference: ContentRef<'_>) -> Result<Vec<u8>>;

    /// Remove the pointer for a virtual path. Blob removal is deferred to
    /// the GC sweep.
    fn delete_content(&self, virtual_path: &str) -> Result<()>;

    fn content_exists(&self, hash: &str) -> Result<bool>;

    fn get_content_size(&self, hash: &str) -> Result<u64>;

    /// Local reference count: 1 if the blob is present, 0 otherwise. The
    /// authoritative count lives in the metadata store.
    fn get_ref_count(&self, hash: &str) -> Result<u64>;

    fn is_directory(&self, path: &str) -> Result<bool>;

    /// Directory entries, sorted, directories suffixed with `/`.
    fn list_dir(&self, path: &str) -> Result<Vec<String>>;

    fn mkdir(&self, path: &str, parents: bool, exist_ok: bool) -> Result<()>;

    fn rmdir(&self, path: &str, recursive: bool) -> Result<()>;

    /// Atomically move a pointer file, preserving its content reference.
    fn rename_pointer(&self, old_path: &str, new_path: &str) -> Result<()>;

    /// Physical filesystem path of the pointer for `virtual_path`, when the
    /// backend has one. Used to aim the OS watcher.
    fn physical_path(&self, _virtual_path: &str) -> Option<PathBuf> {
        None
    }

    /// Acquire an advisory lock. `Ok(None)` means the deadline passed.
    fn lock(&self, path: &str, timeout: Duration, max_holders: u32) -> Result<Option<String>>;

    /// Release a lock by id. Returns `false` for unknown ids.
    fn unlock(&self, lock_id: &str) -> bool;

    fn is_locked(&self, path: &str) -> bool;

    /// Delete unreferenced blobs older than `retention`. `live` reports
    /// whether the metadata store still references a hash. Returns the
    /// number of blobs removed.
    fn gc_sweep(&self, live: &dyn Fn(&str) -> bool, retention: Duration) -> Result<u64>;
}
