//! Same-box watcher over the passthrough pointer tree.
//!
//! Because pointer updates are a single rename, one logical write shows up
//! as one event here. Temp files are filtered out. Revisions on
//! watcher-sourced events come from a process-local monotonic counter
//! seeded with wall-clock millis, so they interleave sanely with
//! kernel-assigned revisions without claiming to be them.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind as NotifyKind, RecursiveMode, Watcher};
use tokio::sync::broadcast;

use nexus_config::{log_events_debug, log_events_warn};
use nexus_meta::now_millis;

use crate::event::{ChangeEvent, EventKind};
use crate::{EventStream, Result};

pub struct PointerWatcher {
    // Held for its side effect: dropping it stops the OS watch.
    _watcher: notify::RecommendedWatcher,
    sender: broadcast::Sender<ChangeEvent>,
}

impl PointerWatcher {
    /// Watch `pointers_root` recursively, emitting events tagged with
    /// `zone`.
    pub fn new(pointers_root: &Path, zone: &str) -> Result<Self> {
        let (sender, _) = broadcast::channel(1024);
        let forward = sender.clone();
        let root = pointers_root.to_path_buf();
        let zone = zone.to_string();
        let revision = Arc::new(AtomicU64::new(now_millis()));

        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            let event = match result {
                Ok(event) => event,
                Err(e) => {
                    log_events_warn!("pointer watch error", error = e.to_string().as_str());
                    return;
                }
            };
            for change in map_event(&event, &root, &zone, &revision) {
                let _ = forward.send(change);
            }
        })?;
        watcher.watch(pointers_root, RecursiveMode::Recursive)?;

        log_events_debug!(
            "pointer watcher started",
            root = pointers_root.display().to_string().as_str(),
        );
        Ok(Self {
            _watcher: watcher,
            sender,
        })
    }

    pub fn subscribe(&self) -> EventStream {
        EventStream::new(self.sender.subscribe())
    }
}

fn virtual_path(root: &Path, physical: &Path) -> Option<String> {
    let rel = physical.strip_prefix(root).ok()?;
    let rel = rel.to_str()?;
    if rel.is_empty() || rel.ends_with(".tmp") {
        return None;
    }
    Some(format!("/{rel}"))
}

fn map_event(
    event: &Event,
    root: &Path,
    zone: &str,
    revision: &AtomicU64,
) -> Vec<ChangeEvent> {
    let next_rev = || revision.fetch_add(1, Ordering::SeqCst) + 1;
    let paths: Vec<&PathBuf> = event.paths.iter().collect();

    match &event.kind {
        NotifyKind::Create(kind) => paths
            .iter()
            .filter_map(|p| virtual_path(root, p))
            .map(|path| {
                let kind = match kind {
                    CreateKind::Folder => EventKind::DirCreate,
                    _ => EventKind::FileWrite,
                };
                ChangeEvent::new(kind, path, next_rev(), zone)
            })
            .collect(),
        NotifyKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() == 2 => {
            match (virtual_path(root, paths[0]), virtual_path(root, paths[1])) {
                (Some(old), Some(new)) => {
                    vec![ChangeEvent::rename(old, new, next_rev(), zone)]
                }
                // Temp→final rename: only the destination is a real
                // pointer, so it reads as a write.
                (None, Some(new)) => {
                    vec![ChangeEvent::new(EventKind::FileWrite, new, next_rev(), zone)]
                }
                (Some(old), None) => {
                    vec![ChangeEvent::new(EventKind::FileDelete, old, next_rev(), zone)]
                }
                (None, None) => Vec::new(),
            }
        }
        NotifyKind::Modify(_) => paths
            .iter()
            .filter_map(|p| virtual_path(root, p))
            .map(|path| ChangeEvent::new(EventKind::FileWrite, path, next_rev(), zone))
            .collect(),
        NotifyKind::Remove(kind) => paths
            .iter()
            .filter_map(|p| virtual_path(root, p))
            .map(|path| {
                let kind = match kind {
                    RemoveKind::Folder => EventKind::DirDelete,
                    _ => EventKind::FileDelete,
                };
                ChangeEvent::new(kind, path, next_rev(), zone)
            })
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use nexus_cas::{Backend, PassthroughBackend};
    use std::time::Duration;
    use tempfile::TempDir;

    async fn next_matching(
        stream: &mut EventStream,
        path: &str,
        timeout: Duration,
    ) -> Option<ChangeEvent> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            match tokio::time::timeout(remaining, stream.next()).await {
                Ok(Some(event)) if event.path == path => return Some(event),
                Ok(Some(_)) => continue,
                _ => return None,
            }
        }
    }

    #[tokio::test]
    async fn pointer_update_is_observed_once() {
        let temp = TempDir::new().unwrap();
        let backend = PassthroughBackend::new(temp.path()).unwrap();
        let watcher = PointerWatcher::new(backend.pointers_root(), "z").unwrap();
        let mut stream = watcher.subscribe();

        backend.write_content(b"hello", Some("/w.txt")).unwrap();

        let event = next_matching(&mut stream, "/w.txt", Duration::from_secs(5))
            .await
            .expect("watch event");
        assert!(matches!(event.kind, EventKind::FileWrite));

        // No second event for the same update
        let extra = next_matching(&mut stream, "/w.txt", Duration::from_millis(300)).await;
        assert!(extra.is_none(), "pointer update produced extra event: {extra:?}");
    }

    #[tokio::test]
    async fn delete_is_observed() {
        let temp = TempDir::new().unwrap();
        let backend = PassthroughBackend::new(temp.path()).unwrap();
        backend.write_content(b"x", Some("/gone.txt")).unwrap();

        let watcher = PointerWatcher::new(backend.pointers_root(), "z").unwrap();
        let mut stream = watcher.subscribe();

        backend.delete_content("/gone.txt").unwrap();

        let event = next_matching(&mut stream, "/gone.txt", Duration::from_secs(5))
            .await
            .expect("delete event");
        assert!(matches!(event.kind, EventKind::FileDelete));
    }
}
