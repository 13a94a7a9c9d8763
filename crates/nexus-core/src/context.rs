//! Caller identity and per-query read tracking.

use std::sync::{Arc, Mutex};

use nexus_rebac::Entity;

use crate::read_set::{AccessType, ReadSet, ResourceType};

/// Collects the resources one query observed. Attach to a context before
/// running operations, then register the finished set for invalidation.
#[derive(Debug)]
pub struct ReadTracker {
    inner: Mutex<ReadSet>,
}

impl ReadTracker {
    pub fn new(read_set: ReadSet) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(read_set),
        })
    }

    pub fn record(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
        revision: u64,
        access: AccessType,
    ) {
        self.inner
            .lock()
            .expect("read tracker poisoned")
            .record_read(resource_type, resource_id, revision, access);
    }

    /// Snapshot of the accumulated read set.
    pub fn snapshot(&self) -> ReadSet {
        self.inner.lock().expect("read tracker poisoned").clone()
    }
}

/// Who is performing an operation, and in which zone.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub user: String,
    pub groups: Vec<String>,
    pub zone: String,
    pub agent_id: Option<String>,
    pub is_admin: bool,
    pub is_system: bool,
    /// Capability to cross zone boundaries (zone administration).
    pub zone_management: bool,
    /// When set, reads performed under this context are collected here.
    pub read_tracker: Option<Arc<ReadTracker>>,
}

impl OperationContext {
    pub fn user(user: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            groups: Vec::new(),
            zone: zone.into(),
            agent_id: None,
            is_admin: false,
            is_system: false,
            zone_management: false,
            read_tracker: None,
        }
    }

    /// Internal context used by kernel housekeeping; bypasses permission
    /// checks the way the original system services did.
    pub fn system(zone: impl Into<String>) -> Self {
        Self {
            user: "system".to_string(),
            groups: Vec::new(),
            zone: zone.into(),
            agent_id: None,
            is_admin: false,
            is_system: true,
            zone_management: true,
            read_tracker: None,
        }
    }

    pub fn with_groups(mut self, groups: Vec<String>) -> Self {
        self.groups = groups;
        self
    }

    pub fn with_admin(mut self) -> Self {
        self.is_admin = true;
        self
    }

    pub fn with_tracker(mut self, tracker: Arc<ReadTracker>) -> Self {
        self.read_tracker = Some(tracker);
        self
    }

    /// The caller as a graph subject.
    pub fn subject(&self) -> Entity {
        Entity::user(self.user.clone())
    }

    pub(crate) fn track(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
        revision: u64,
        access: AccessType,
    ) {
        if let Some(tracker) = &self.read_tracker {
            tracker.record(resource_type, resource_id, revision, access);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_collects_reads() {
        let tracker = ReadTracker::new(ReadSet::create("zone-1", None));
        let ctx = OperationContext::user("alice", "zone-1").with_tracker(tracker.clone());

        ctx.track(ResourceType::File, "/a.txt", 4, AccessType::Content);
        ctx.track(ResourceType::Directory, "/d", 2, AccessType::List);

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.entries.len(), 2);
        assert!(snapshot.overlaps_with_write("/d/new.txt", 10));
    }
}
