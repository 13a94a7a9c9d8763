//! Mount-table path routing.

use std::sync::{Arc, RwLock};

use nexus_cas::Backend;

use crate::{NexusError, Result};

/// One mount: a virtual prefix served by a backend. Higher priority wins
/// ties between equal-length prefixes.
#[derive(Clone)]
pub struct Mount {
    pub prefix: String,
    pub backend: Arc<dyn Backend>,
    pub priority: i32,
}

/// Read-mostly mount table. Readers grab the current snapshot; updates
/// build a new sorted table and swap it in under a short write lock.
pub struct Router {
    table: RwLock<Arc<Vec<Mount>>>,
}

impl Router {
    /// A router must anchor `/`.
    pub fn new(root_backend: Arc<dyn Backend>) -> Self {
        let root = Mount {
            prefix: "/".to_string(),
            backend: root_backend,
            priority: 0,
        };
        Self {
            table: RwLock::new(Arc::new(vec![root])),
        }
    }

    fn snapshot(&self) -> Arc<Vec<Mount>> {
        self.table.read().expect("mount table poisoned").clone()
    }

    pub fn add_mount(
        &self,
        prefix: &str,
        backend: Arc<dyn Backend>,
        priority: i32,
    ) -> Result<()> {
        let prefix = crate::path::validate_path(prefix)?;
        let mut table = self.table.write().expect("mount table poisoned");

        let mut next: Vec<Mount> = table.as_ref().clone();
        next.push(Mount {
            prefix,
            backend,
            priority,
        });
        // Longest prefix first; priority breaks ties
        next.sort_by(|a, b| {
            b.prefix
                .len()
                .cmp(&a.prefix.len())
                .then(b.priority.cmp(&a.priority))
        });
        *table = Arc::new(next);
        Ok(())
    }

    fn prefix_matches(prefix: &str, path: &str) -> bool {
        if prefix == "/" {
            return true;
        }
        path == prefix || path.starts_with(&format!("{prefix}/"))
    }

    /// Resolve a virtual path to its backend and the backend-local key
    /// (the path with the mount prefix stripped).
    pub fn resolve(&self, path: &str) -> Result<(Arc<dyn Backend>, String)> {
        let table = self.snapshot();
        for mount in table.iter() {
            if Self::prefix_matches(&mount.prefix, path) {
                let key = if mount.prefix == "/" {
                    path.to_string()
                } else {
                    let rest = &path[mount.prefix.len()..];
                    if rest.is_empty() {
                        "/".to_string()
                    } else {
                        rest.to_string()
                    }
                };
                return Ok((mount.backend.clone(), key));
            }
        }
        Err(NexusError::Internal(format!(
            "no mount matches {path} (missing root mount)"
        )))
    }

    pub fn mounts(&self) -> Vec<(String, i32)> {
        self.snapshot()
            .iter()
            .map(|m| (m.prefix.clone(), m.priority))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_cas::PassthroughBackend;
    use tempfile::TempDir;

    fn backend(temp: &TempDir, name: &str) -> Arc<dyn Backend> {
        Arc::new(PassthroughBackend::new(temp.path().join(name)).unwrap())
    }

    #[test]
    fn longest_prefix_wins() {
        let temp = TempDir::new().unwrap();
        let router = Router::new(backend(&temp, "root"));
        router.add_mount("/special", backend(&temp, "special"), 0).unwrap();

        let (_, key) = router.resolve("/special/a.txt").unwrap();
        assert_eq!(key, "/a.txt");

        let (_, key) = router.resolve("/elsewhere/a.txt").unwrap();
        assert_eq!(key, "/elsewhere/a.txt");
    }

    #[test]
    fn priority_breaks_ties() {
        let temp = TempDir::new().unwrap();
        let router = Router::new(backend(&temp, "root"));
        let low = backend(&temp, "low");
        let high = backend(&temp, "high");
        router.add_mount("/m", low, 1).unwrap();
        router.add_mount("/m", high.clone(), 9).unwrap();

        let (resolved, _) = router.resolve("/m/x").unwrap();
        assert!(Arc::ptr_eq(&resolved, &high));
    }

    #[test]
    fn mount_prefix_does_not_match_siblings() {
        let temp = TempDir::new().unwrap();
        let router = Router::new(backend(&temp, "root"));
        router.add_mount("/data", backend(&temp, "data"), 0).unwrap();

        let (_, key) = router.resolve("/database/x").unwrap();
        assert_eq!(key, "/database/x", "sibling path must fall through to root");
    }
}
