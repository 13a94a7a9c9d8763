//! Blob store: blake3-keyed, two-level fan-out, atomic writes.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, instrument};
use walkdir::WalkDir;

use crate::{compute_hash, CasError, Result};

const BACKEND: &'static str = "cas";

/// Content-addressed blob store.
///
/// Blobs live at `cas/<h[0:2]>/<h[2:4]>/<hash>` and are immutable once
/// written. Writing is temp-file + fsync + rename; a losing racer simply
/// observes the winner's identical blob.
#[derive(Debug, Clone)]
pub struct CasStore {
    root: PathBuf,
}

impl CasStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .map_err(|e| CasError::backend(BACKEND, root.display().to_string(), e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Shard path for a hash: `<root>/ab/cd/abcd…`.
    fn blob_path(&self, hash: &str) -> Result<PathBuf> {
        if hash.len() < 4 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(CasError::InvalidHash {
                hash: hash.to_string(),
            });
        }
        Ok(self.root.join(&hash[..2]).join(&hash[2..4]).join(hash))
    }

    /// Store bytes, returning the content hash. No-op when the blob exists.
    #[instrument(skip(self, data), level = "debug")]
    pub fn store(&self, data: &[u8]) -> Result<String> {
        let hash = compute_hash(data);
        let path = self.blob_path(&hash)?;

        if path.exists() {
            return Ok(hash);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| CasError::backend(BACKEND, hash.clone(), e))?;
        }

        // Unique temp name so parallel writers never collide
        let temp_name = format!("{}.{}.{:?}.tmp", hash, std::process::id(), std::thread::current().id());
        let temp_path = path.with_file_name(&temp_name);

        let write = || -> io::Result<()> {
            let mut file = File::create(&temp_path)?;
            file.write_all(data)?;
            file.sync_all()?;
            Ok(())
        };
        write().map_err(|e| CasError::backend(BACKEND, hash.clone(), e))?;

        if let Err(e) = fs::rename(&temp_path, &path) {
            let _ = fs::remove_file(&temp_path);
            // Lost the race to an identical blob
            if path.exists() {
                return Ok(hash);
            }
            return Err(CasError::backend(BACKEND, hash, e));
        }

        debug!(hash = %hash, "stored blob");
        Ok(hash)
    }

    /// Fetch a blob, re-verifying its hash before returning.
    #[instrument(skip(self), level = "debug")]
    pub fn get(&self, hash: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(hash)?;
        if !path.exists() {
            return Err(CasError::NotFound {
                hash: hash.to_string(),
            });
        }

        let mut data = Vec::new();
        File::open(&path)
            .and_then(|mut f| f.read_to_end(&mut data))
            .map_err(|e| CasError::backend(BACKEND, hash.to_string(), e))?;

        let actual = compute_hash(&data);
        if actual != hash {
            return Err(CasError::HashMismatch {
                expected: hash.to_string(),
                actual,
            });
        }

        Ok(data)
    }

    pub fn exists(&self, hash: &str) -> Result<bool> {
        Ok(self.blob_path(hash)?.exists())
    }

    pub fn size(&self, hash: &str) -> Result<u64> {
        let path = self.blob_path(hash)?;
        let meta = fs::metadata(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                return CasError::NotFound {
                    hash: hash.to_string(),
                };
            }
            CasError::backend(BACKEND, hash.to_string(), e)
        })?;
        Ok(meta.len())
    }

    pub fn delete(&self, hash: &str) -> Result<()> {
        let path = self.blob_path(hash)?;
        if !path.exists() {
            return Err(CasError::NotFound {
                hash: hash.to_string(),
            });
        }
        fs::remove_file(&path).map_err(|e| CasError::backend(BACKEND, hash.to_string(), e))
    }

    /// Remove blobs with no live reference once `retention` has elapsed
    /// since their last modification. Returns the number removed.
    pub fn sweep(&self, live: &dyn Fn(&str) -> bool, retention: Duration) -> Result<u64> {
        let cutoff = SystemTime::now().checked_sub(retention);
        let mut removed = 0u64;

        for entry in WalkDir::new(&self.root).min_depth(3).max_depth(3) {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if name.ends_with(".tmp") {
                continue;
            }
            if live(&name) {
                continue;
            }
            if let Some(cutoff) = cutoff {
                let modified = entry.metadata().ok().and_then(|m| m.modified().ok());
                match modified {
                    Some(m) if m <= cutoff => {}
                    _ => continue,
                }
            }
            if fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }

        if removed > 0 {
            debug!(removed, "cas sweep removed unreferenced blobs");
        }
        Ok(removed)
    }

    /// Aggregate counts and sizes over the shard tree.
    pub fn stats(&self) -> Result<CasStats> {
        let mut stats = CasStats::default();

        for entry in WalkDir::new(&self.root).min_depth(3).max_depth(3) {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.file_name().to_string_lossy().ends_with(".tmp") {
                continue;
            }
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            stats.blob_count += 1;
            stats.total_bytes += size;
        }

        Ok(stats)
    }
}

/// Counters reported by [`CasStore::stats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CasStats {
    pub blob_count: u64,
    pub total_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn store_and_retrieve() {
        let temp = TempDir::new().unwrap();
        let cas = CasStore::new(temp.path()).unwrap();

        let hash = cas.store(b"hello nexus").unwrap();
        assert_eq!(cas.get(&hash).unwrap(), b"hello nexus");
    }

    #[test]
    fn deduplication() {
        let temp = TempDir::new().unwrap();
        let cas = CasStore::new(temp.path()).unwrap();

        let h1 = cas.store(b"same bytes").unwrap();
        let h2 = cas.store(b"same bytes").unwrap();
        assert_eq!(h1, h2);
        assert_eq!(cas.stats().unwrap().blob_count, 1);
    }

    #[test]
    fn not_found() {
        let temp = TempDir::new().unwrap();
        let cas = CasStore::new(temp.path()).unwrap();

        let missing = compute_hash(b"never stored");
        assert!(matches!(cas.get(&missing), Err(CasError::NotFound { .. })));
    }

    #[test]
    fn rejects_bad_hash() {
        let temp = TempDir::new().unwrap();
        let cas = CasStore::new(temp.path()).unwrap();

        assert!(matches!(cas.get("xyz"), Err(CasError::InvalidHash { .. })));
    }

    #[test]
    fn detects_corruption() {
        let temp = TempDir::new().unwrap();
        let cas = CasStore::new(temp.path()).unwrap();

        let hash = cas.store(b"pristine").unwrap();
        let path = temp
            .path()
            .join(&hash[..2])
            .join(&hash[2..4])
            .join(&hash);
        fs::write(&path, b"tampered").unwrap();

        assert!(matches!(
            cas.get(&hash),
            Err(CasError::HashMismatch { .. })
        ));
    }

    #[test]
    fn empty_blob() {
        let temp = TempDir::new().unwrap();
        let cas = CasStore::new(temp.path()).unwrap();

        let hash = cas.store(b"").unwrap();
        assert!(cas.get(&hash).unwrap().is_empty());
        assert_eq!(cas.size(&hash).unwrap(), 0);
    }

    #[test]
    fn sweep_respects_liveness() {
        let temp = TempDir::new().unwrap();
        let cas = CasStore::new(temp.path()).unwrap();

        let keep = cas.store(b"still referenced").unwrap();
        let drop = cas.store(b"orphaned").unwrap();

        let removed = cas
            .sweep(&|h| h == keep, Duration::from_secs(0))
            .unwrap();
        assert_eq!(removed, 1);
        assert!(cas.exists(&keep).unwrap());
        assert!(!cas.exists(&drop).unwrap());
    }
}
