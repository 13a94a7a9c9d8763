//! Passthrough backend: watchable pointer tree over the blob store.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use crate::locks::LockTable;
use crate::store::{CasStats, CasStore};
use crate::{compute_hash, Backend, CasError, ContentRef, Result, POINTER_PREFIX};

const BACKEND: &str = "passthrough";

/// Backend whose pointer layer is plain files on the local filesystem, so
/// inotify/FSEvents can observe updates directly.
///
/// Layout:
///
/// ```text
/// base/
/// ├── pointers/<virtual path tree>   # each file: "cas:<hex>\n"
/// └── cas/<h[0:2]>/<h[2:4]>/<hash>
/// ```
pub struct PassthroughBackend {
    base_path: PathBuf,
    pointers_root: PathBuf,
    cas: CasStore,
    locks: LockTable,
}

impl PassthroughBackend {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        let pointers_root = base_path.join("pointers");
        fs::create_dir_all(&pointers_root)
            .map_err(|e| CasError::backend(BACKEND, base_path.display().to_string(), e))?;
        let cas = CasStore::new(base_path.join("cas"))?;

        Ok(Self {
            base_path,
            pointers_root,
            cas,
            locks: LockTable::new(),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Root of the watchable pointer tree.
    pub fn pointers_root(&self) -> &Path {
        &self.pointers_root
    }

    pub fn cas(&self) -> &CasStore {
        &self.cas
    }

    pub fn stats(&self) -> Result<CasStats> {
        self.cas.stats()
    }

    fn pointer_path(&self, virtual_path: &str) -> PathBuf {
        let clean = virtual_path.trim_start_matches('/');
        if clean.is_empty() {
            self.pointers_root.clone()
        } else {
            self.pointers_root.join(clean)
        }
    }

    /// Atomically (re)write a pointer: temp file + fsync + single rename,
    /// so a watcher sees exactly one event.
    fn write_pointer(&self, virtual_path: &str, hash: &str) -> Result<()> {
        let pointer = self.pointer_path(virtual_path);
        if let Some(parent) = pointer.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| CasError::backend(BACKEND, virtual_path.to_string(), e))?;
        }

        let temp_name = format!(
            ".{}.{}.tmp",
            pointer
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            std::process::id()
        );
        let temp_path = pointer.with_file_name(&temp_name);

        let write = || -> io::Result<()> {
            let mut file = File::create(&temp_path)?;
            file.write_all(format!("{POINTER_PREFIX}{hash}\n").as_bytes())?;
            file.sync_all()?;
            Ok(())
        };
        if let Err(e) = write() {
            let _ = fs::remove_file(&temp_path);
            return Err(CasError::backend(BACKEND, virtual_path.to_string(), e));
        }

        fs::rename(&temp_path, &pointer).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            CasError::backend(BACKEND, virtual_path.to_string(), e)
        })?;

        debug!(path = virtual_path, hash, "pointer updated");
        Ok(())
    }

    /// Read the hash a pointer names. `None` for missing pointers; a
    /// malformed body is logged and reported the same way.
    fn read_pointer(&self, virtual_path: &str) -> Option<String> {
        let pointer = self.pointer_path(virtual_path);
        if pointer.is_dir() {
            return None;
        }
        let body = match fs::read_to_string(&pointer) {
            Ok(body) => body,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = virtual_path, error = %e, "pointer unreadable");
                }
                return None;
            }
        };

        let trimmed = body.trim();
        match trimmed.strip_prefix(POINTER_PREFIX) {
            Some(hash) if !hash.is_empty() && hash.bytes().all(|b| b.is_ascii_hexdigit()) => {
                Some(hash.to_string())
            }
            _ => {
                warn!(path = virtual_path, "malformed pointer, treating as missing");
                None
            }
        }
    }

    fn delete_pointer(&self, virtual_path: &str) -> Result<bool> {
        let pointer = self.pointer_path(virtual_path);
        if !pointer.exists() {
            return Ok(false);
        }
        fs::remove_file(&pointer)
            .map_err(|e| CasError::backend(BACKEND, virtual_path.to_string(), e))?;
        if let Some(parent) = pointer.parent() {
            self.cleanup_empty_dirs(parent);
        }
        Ok(true)
    }

    /// Prune empty parent directories back up to the pointer root.
    fn cleanup_empty_dirs(&self, from: &Path) {
        let mut current = from.to_path_buf();
        while current != self.pointers_root && current.starts_with(&self.pointers_root) {
            match fs::read_dir(&current) {
                Ok(mut entries) => {
                    if entries.next().is_some() {
                        break;
                    }
                }
                Err(_) => break,
            }
            if fs::remove_dir(&current).is_err() {
                break;
            }
            match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => break,
            }
        }
    }
}

impl Backend for PassthroughBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn is_passthrough(&self) -> bool {
        true
    }

    fn write_content(&self, content: &[u8], virtual_path: Option<&str>) -> Result<String> {
        let hash = self.cas.store(content)?;
        if let Some(path) = virtual_path {
            // Skip the rename when the pointer already names this blob;
            // watchers only hear about real changes.
            if self.read_pointer(path).as_deref() != Some(hash.as_str()) {
                self.write_pointer(path, &hash)?;
            }
        }
        Ok(hash)
    }

    fn read_content(&self, reference: ContentRef<'_>) -> Result<Vec<u8>> {
        let hash = match reference {
            ContentRef::Hash(hash) => hash.to_string(),
            ContentRef::VirtualPath(path) => {
                self.read_pointer(path).ok_or_else(|| CasError::PathNotFound {
                    path: path.to_string(),
                })?
            }
        };
        self.cas.get(&hash)
    }

    fn delete_content(&self, virtual_path: &str) -> Result<()> {
        self.delete_pointer(virtual_path)?;
        Ok(())
    }

    fn content_exists(&self, hash: &str) -> Result<bool> {
        self.cas.exists(hash)
    }

    fn get_content_size(&self, hash: &str) -> Result<u64> {
        self.cas.size(hash)
    }

    fn get_ref_count(&self, hash: &str) -> Result<u64> {
        Ok(if self.cas.exists(hash)? { 1 } else { 0 })
    }

    fn is_directory(&self, path: &str) -> Result<bool> {
        Ok(self.pointer_path(path).is_dir())
    }

    fn list_dir(&self, path: &str) -> Result<Vec<String>> {
        let dir = self.pointer_path(path);
        if !dir.exists() {
            return Err(CasError::PathNotFound {
                path: path.to_string(),
            });
        }
        if !dir.is_dir() {
            return Err(CasError::NotADirectory {
                path: path.to_string(),
            });
        }

        let mut entries = Vec::new();
        let iter =
            fs::read_dir(&dir).map_err(|e| CasError::backend(BACKEND, path.to_string(), e))?;
        for entry in iter {
            let entry = entry.map_err(|e| CasError::backend(BACKEND, path.to_string(), e))?;
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".tmp") {
                continue;
            }
            if entry.path().is_dir() {
                name.push('/');
            }
            entries.push(name);
        }
        entries.sort();
        Ok(entries)
    }

    fn mkdir(&self, path: &str, parents: bool, exist_ok: bool) -> Result<()> {
        let dir = self.pointer_path(path);
        if dir.exists() {
            if exist_ok && dir.is_dir() {
                return Ok(());
            }
            return Err(CasError::AlreadyExists {
                path: path.to_string(),
            });
        }

        let result = if parents {
            fs::create_dir_all(&dir)
        } else {
            fs::create_dir(&dir)
        };
        result.map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => CasError::PathNotFound {
                path: path.to_string(),
            },
            io::ErrorKind::AlreadyExists => CasError::AlreadyExists {
                path: path.to_string(),
            },
            _ => CasError::backend(BACKEND, path.to_string(), e),
        })
    }

    fn rmdir(&self, path: &str, recursive: bool) -> Result<()> {
        let dir = self.pointer_path(path);
        if !dir.exists() {
            return Err(CasError::PathNotFound {
                path: path.to_string(),
            });
        }
        if !dir.is_dir() {
            return Err(CasError::NotADirectory {
                path: path.to_string(),
            });
        }

        let result = if recursive {
            fs::remove_dir_all(&dir)
        } else {
            fs::remove_dir(&dir)
        };
        result.map_err(|e| CasError::backend(BACKEND, path.to_string(), e))
    }

    fn rename_pointer(&self, old_path: &str, new_path: &str) -> Result<()> {
        let old = self.pointer_path(old_path);
        let new = self.pointer_path(new_path);
        if !old.exists() {
            return Err(CasError::PathNotFound {
                path: old_path.to_string(),
            });
        }
        if let Some(parent) = new.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| CasError::backend(BACKEND, new_path.to_string(), e))?;
        }
        fs::rename(&old, &new)
            .map_err(|e| CasError::backend(BACKEND, old_path.to_string(), e))?;
        if let Some(parent) = old.parent() {
            self.cleanup_empty_dirs(parent);
        }
        Ok(())
    }

    fn physical_path(&self, virtual_path: &str) -> Option<PathBuf> {
        Some(self.pointer_path(virtual_path))
    }

    fn lock(&self, path: &str, timeout: Duration, max_holders: u32) -> Result<Option<String>> {
        self.locks.lock(path, timeout, max_holders)
    }

    fn unlock(&self, lock_id: &str) -> bool {
        self.locks.unlock(lock_id)
    }

    fn is_locked(&self, path: &str) -> bool {
        self.locks.is_locked(path)
    }

    fn gc_sweep(&self, live: &dyn Fn(&str) -> bool, retention: Duration) -> Result<u64> {
        self.cas.sweep(live, retention)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn backend() -> (TempDir, PassthroughBackend) {
        let temp = TempDir::new().unwrap();
        let backend = PassthroughBackend::new(temp.path()).unwrap();
        (temp, backend)
    }

    #[test]
    fn write_creates_pointer_and_blob() {
        let (_temp, be) = backend();

        let hash = be.write_content(b"hello", Some("/inbox/a.txt")).unwrap();
        assert_eq!(hash, compute_hash(b"hello"));

        let pointer = be.pointers_root().join("inbox/a.txt");
        let body = fs::read_to_string(pointer).unwrap();
        assert_eq!(body, format!("cas:{hash}\n"));

        assert_eq!(
            be.read_content(ContentRef::VirtualPath("/inbox/a.txt")).unwrap(),
            b"hello"
        );
        assert_eq!(be.read_content(ContentRef::Hash(&hash)).unwrap(), b"hello");
    }

    #[test]
    fn identical_content_dedups() {
        let (_temp, be) = backend();

        let h1 = be.write_content(b"same", Some("/a.txt")).unwrap();
        let h2 = be.write_content(b"same", Some("/b.txt")).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(be.stats().unwrap().blob_count, 1);
    }

    #[test]
    fn malformed_pointer_reads_as_missing() {
        let (_temp, be) = backend();

        be.write_content(b"x", Some("/p.txt")).unwrap();
        fs::write(be.pointers_root().join("p.txt"), "garbage\n").unwrap();

        assert!(matches!(
            be.read_content(ContentRef::VirtualPath("/p.txt")),
            Err(CasError::PathNotFound { .. })
        ));
    }

    #[test]
    fn delete_removes_pointer_not_blob() {
        let (_temp, be) = backend();

        let hash = be.write_content(b"keep blob", Some("/d/f.txt")).unwrap();
        be.delete_content("/d/f.txt").unwrap();

        assert!(matches!(
            be.read_content(ContentRef::VirtualPath("/d/f.txt")),
            Err(CasError::PathNotFound { .. })
        ));
        // Blob survives until the GC sweep decides otherwise
        assert!(be.content_exists(&hash).unwrap());
        // Empty parent directory was pruned
        assert!(!be.pointers_root().join("d").exists());
    }

    #[test]
    fn rename_moves_pointer_keeps_hash() {
        let (_temp, be) = backend();

        let hash = be.write_content(b"payload", Some("/src/m.txt")).unwrap();
        be.rename_pointer("/src/m.txt", "/dst/m.txt").unwrap();

        assert_eq!(
            be.read_content(ContentRef::VirtualPath("/dst/m.txt")).unwrap(),
            b"payload"
        );
        assert_eq!(compute_hash(b"payload"), hash);
        assert!(!be.pointers_root().join("src").exists());
    }

    #[test]
    fn list_dir_marks_directories() {
        let (_temp, be) = backend();

        be.write_content(b"1", Some("/dir/file.txt")).unwrap();
        be.mkdir("/dir/sub", false, false).unwrap();

        let entries = be.list_dir("/dir").unwrap();
        assert_eq!(entries, vec!["file.txt".to_string(), "sub/".to_string()]);
    }

    #[test]
    fn mkdir_existing_conflicts_unless_exist_ok() {
        let (_temp, be) = backend();

        be.mkdir("/d", false, false).unwrap();
        assert!(matches!(
            be.mkdir("/d", false, false),
            Err(CasError::AlreadyExists { .. })
        ));
        be.mkdir("/d", false, true).unwrap();
    }

    #[test]
    fn rewrite_same_content_skips_pointer_rename() {
        let (_temp, be) = backend();

        be.write_content(b"stable", Some("/s.txt")).unwrap();
        let pointer = be.pointers_root().join("s.txt");
        let before = fs::metadata(&pointer).unwrap().modified().unwrap();

        be.write_content(b"stable", Some("/s.txt")).unwrap();
        let after = fs::metadata(&pointer).unwrap().modified().unwrap();
        assert_eq!(before, after);
    }
}
