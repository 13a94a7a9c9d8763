//! Change event type and pattern matching.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    FileWrite,
    FileDelete,
    DirCreate,
    DirDelete,
    FileRename,
}

/// One observed change. Revisions are monotonic per `(zone, path)`;
/// cross-path ordering is best-effort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub path: String,
    /// Previous path, set for renames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_path: Option<String>,
    pub revision: u64,
    pub zone: String,
}

impl ChangeEvent {
    pub fn new(kind: EventKind, path: impl Into<String>, revision: u64, zone: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            old_path: None,
            revision,
            zone: zone.into(),
        }
    }

    pub fn rename(
        old_path: impl Into<String>,
        new_path: impl Into<String>,
        revision: u64,
        zone: impl Into<String>,
    ) -> Self {
        Self {
            kind: EventKind::FileRename,
            path: new_path.into(),
            old_path: Some(old_path.into()),
            revision,
            zone: zone.into(),
        }
    }
}

/// Match an event path against a watch target.
///
/// - A trailing `/` watches a whole subtree.
/// - `*` matches any run of characters, `?` exactly one.
/// - Anything else is an exact path.
pub fn path_matches(pattern: &str, path: &str) -> bool {
    if pattern.ends_with('/') {
        return path.starts_with(pattern) || path == pattern.trim_end_matches('/');
    }
    if pattern.contains('*') || pattern.contains('?') {
        return wildcard_match(pattern.as_bytes(), path.as_bytes());
    }
    pattern == path
}

fn wildcard_match(pattern: &[u8], text: &[u8]) -> bool {
    match (pattern.first(), text.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            wildcard_match(&pattern[1..], text)
                || (!text.is_empty() && wildcard_match(pattern, &text[1..]))
        }
        (Some(b'?'), Some(_)) => wildcard_match(&pattern[1..], &text[1..]),
        (Some(p), Some(t)) if p == t => wildcard_match(&pattern[1..], &text[1..]),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_and_prefix() {
        assert!(path_matches("/a/b.txt", "/a/b.txt"));
        assert!(!path_matches("/a/b.txt", "/a/c.txt"));
        assert!(path_matches("/inbox/", "/inbox/deep/file.txt"));
        assert!(path_matches("/inbox/", "/inbox"));
        assert!(!path_matches("/inbox/", "/outbox/file.txt"));
    }

    #[test]
    fn wildcards() {
        assert!(path_matches("/logs/*.txt", "/logs/a.txt"));
        assert!(path_matches("/logs/report-?.csv", "/logs/report-1.csv"));
        assert!(!path_matches("/logs/report-?.csv", "/logs/report-10.csv"));
        assert!(path_matches("*", "/anything/at/all"));
    }

    #[test]
    fn event_serializes_kind_as_type() {
        let event = ChangeEvent::new(EventKind::FileWrite, "/a", 7, "z");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "file_write");
        assert!(json.get("old_path").is_none());
    }
}
