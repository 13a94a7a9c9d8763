//! In-memory advisory lock table for same-box coordination.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::{CasError, Result};

/// Default deadline for lock acquisition.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll interval while waiting for a slot.
const SPIN_SLEEP: Duration = Duration::from_millis(50);

static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
struct Holder {
    lock_id: String,
    #[allow(dead_code)]
    acquired_at: Instant,
}

#[derive(Debug)]
struct PathLocks {
    /// Holder limit fixed at first acquisition; later calls must agree.
    max_holders: u32,
    holders: Vec<Holder>,
}

/// `path → holders` table. `max_holders = 1` is a mutex, `> 1` a counting
/// semaphore. One mutex guards the whole table; every operation is O(1) in
/// the number of paths.
#[derive(Debug, Default)]
pub struct LockTable {
    inner: Mutex<HashMap<String, PathLocks>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spin until a slot frees up or the deadline passes. Returns the lock
    /// id on success, `None` on timeout.
    pub fn lock(
        &self,
        path: &str,
        timeout: Duration,
        max_holders: u32,
    ) -> Result<Option<String>> {
        if max_holders < 1 {
            return Err(CasError::InvalidLockLimit { got: max_holders });
        }

        let lock_id = format!("lk-{:016x}", NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed));
        let deadline = Instant::now() + timeout;

        loop {
            {
                let mut table = self.inner.lock().expect("lock table poisoned");

                if let Some(entry) = table.get(path) {
                    if entry.max_holders != max_holders {
                        return Err(CasError::LockLimitMismatch {
                            path: path.to_string(),
                            expected: entry.max_holders,
                            got: max_holders,
                        });
                    }
                }

                let entry = table.entry(path.to_string()).or_insert_with(|| PathLocks {
                    max_holders,
                    holders: Vec::new(),
                });

                if (entry.holders.len() as u32) < entry.max_holders {
                    entry.holders.push(Holder {
                        lock_id: lock_id.clone(),
                        acquired_at: Instant::now(),
                    });
                    debug!(
                        path,
                        lock_id = %lock_id,
                        holders = entry.holders.len(),
                        max = entry.max_holders,
                        "lock acquired"
                    );
                    return Ok(Some(lock_id));
                }
            }

            if Instant::now() >= deadline {
                warn!(path, ?timeout, "lock timed out");
                return Ok(None);
            }
            std::thread::sleep(SPIN_SLEEP.min(deadline.saturating_duration_since(Instant::now())));
        }
    }

    /// Release one slot. Removes the path entry when the last holder leaves.
    pub fn unlock(&self, lock_id: &str) -> bool {
        let mut table = self.inner.lock().expect("lock table poisoned");

        let mut released = false;
        let mut empty_path: Option<String> = None;
        for (path, entry) in table.iter_mut() {
            if let Some(pos) = entry.holders.iter().position(|h| h.lock_id == lock_id) {
                entry.holders.remove(pos);
                released = true;
                debug!(path, lock_id, remaining = entry.holders.len(), "lock released");
                if entry.holders.is_empty() {
                    empty_path = Some(path.clone());
                }
                break;
            }
        }

        if let Some(path) = empty_path {
            table.remove(&path);
        }
        if !released {
            warn!(lock_id, "unlock of unknown lock id");
        }
        released
    }

    pub fn is_locked(&self, path: &str) -> bool {
        let table = self.inner.lock().expect("lock table poisoned");
        table.get(path).map(|e| !e.holders.is_empty()).unwrap_or(false)
    }

    /// Number of live holders on a path.
    pub fn holder_count(&self, path: &str) -> usize {
        let table = self.inner.lock().expect("lock table poisoned");
        table.get(path).map(|e| e.holders.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutex_blocks_second_holder() {
        let table = LockTable::new();
        let id = table.lock("/a", Duration::from_millis(10), 1).unwrap();
        assert!(id.is_some());

        let second = table.lock("/a", Duration::from_millis(10), 1).unwrap();
        assert!(second.is_none());

        assert!(table.unlock(&id.unwrap()));
        let third = table.lock("/a", Duration::from_millis(10), 1).unwrap();
        assert!(third.is_some());
    }

    #[test]
    fn semaphore_allows_max_holders() {
        let table = LockTable::new();
        let a = table.lock("/s", Duration::from_millis(10), 2).unwrap();
        let b = table.lock("/s", Duration::from_millis(10), 2).unwrap();
        assert!(a.is_some() && b.is_some());

        let c = table.lock("/s", Duration::from_millis(10), 2).unwrap();
        assert!(c.is_none());
    }

    #[test]
    fn max_holders_must_be_consistent() {
        let table = LockTable::new();
        let _a = table.lock("/m", Duration::from_millis(10), 2).unwrap();
        let err = table.lock("/m", Duration::from_millis(10), 3);
        assert!(matches!(err, Err(CasError::LockLimitMismatch { .. })));
    }

    #[test]
    fn unlock_unknown_id_is_false() {
        let table = LockTable::new();
        assert!(!table.unlock("lk-does-not-exist"));
    }

    #[test]
    fn entry_cleaned_up_after_last_unlock() {
        let table = LockTable::new();
        let id = table.lock("/c", Duration::from_millis(10), 1).unwrap().unwrap();
        assert!(table.is_locked("/c"));
        table.unlock(&id);
        assert!(!table.is_locked("/c"));
        // Limit config is gone too: a different max_holders now succeeds
        assert!(table.lock("/c", Duration::from_millis(10), 4).unwrap().is_some());
    }
}
