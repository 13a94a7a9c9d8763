//! Relationship tuples and their in-memory indexes.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use nexus_meta::now_millis;

/// A typed participant in the relationship graph: `(type, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entity {
    pub entity_type: String,
    pub entity_id: String,
}

impl Entity {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self::new("user", id)
    }

    pub fn group(id: impl Into<String>) -> Self {
        Self::new("group", id)
    }

    pub fn file(id: impl Into<String>) -> Self {
        Self::new("file", id)
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.entity_type, self.entity_id)
    }
}

/// One directed edge: `subject --relation--> object`, scoped by zone.
/// Immutable except for deletion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationTuple {
    pub id: u64,
    pub subject: Entity,
    pub relation: String,
    pub object: Entity,
    pub zone: String,
    /// Epoch millis; expired tuples never contribute to a check.
    pub expires_at_ms: Option<u64>,
    pub subject_tenant: Option<String>,
    pub object_tenant: Option<String>,
    pub created_at: u64,
}

impl RelationTuple {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        matches!(self.expires_at_ms, Some(exp) if exp <= now_ms)
    }
}

fn index_key(entity: &Entity, zone: &str) -> String {
    format!("{zone}|{}", entity.key())
}

/// Tuple storage with stable numeric ids and reverse indexes.
///
/// Rows are written once and deleted at most once (single writer per row);
/// reads are lock-free through the dashmap shards.
#[derive(Default)]
pub struct TupleStore {
    tuples: DashMap<u64, RelationTuple>,
    /// zone|subject-key → tuple ids where that entity is the subject
    by_subject: DashMap<String, HashSet<u64>>,
    /// zone|object-key → tuple ids where that entity is the object
    by_object: DashMap<String, HashSet<u64>>,
    next_id: AtomicU64,
}

impl TupleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        subject: Entity,
        relation: impl Into<String>,
        object: Entity,
        zone: impl Into<String>,
        expires_at_ms: Option<u64>,
        subject_tenant: Option<String>,
        object_tenant: Option<String>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let zone = zone.into();
        let tuple = RelationTuple {
            id,
            subject,
            relation: relation.into(),
            object,
            zone,
            expires_at_ms,
            subject_tenant,
            object_tenant,
            created_at: now_millis(),
        };

        self.by_subject
            .entry(index_key(&tuple.subject, &tuple.zone))
            .or_default()
            .insert(id);
        self.by_object
            .entry(index_key(&tuple.object, &tuple.zone))
            .or_default()
            .insert(id);
        self.tuples.insert(id, tuple);
        id
    }

    /// Remove every tuple matching the triple exactly. Returns how many
    /// were removed.
    pub fn remove(&self, subject: &Entity, relation: &str, object: &Entity, zone: &str) -> usize {
        let ids: Vec<u64> = self
            .ids_for_object(object, zone)
            .into_iter()
            .filter(|id| {
                self.tuples
                    .get(id)
                    .map(|t| t.subject == *subject && t.relation == relation)
                    .unwrap_or(false)
            })
            .collect();

        for id in &ids {
            if let Some((_, tuple)) = self.tuples.remove(id) {
                if let Some(mut set) = self.by_subject.get_mut(&index_key(&tuple.subject, zone)) {
                    set.remove(id);
                }
                if let Some(mut set) = self.by_object.get_mut(&index_key(&tuple.object, zone)) {
                    set.remove(id);
                }
            }
        }
        ids.len()
    }

    fn ids_for_subject(&self, subject: &Entity, zone: &str) -> Vec<u64> {
        self.by_subject
            .get(&index_key(subject, zone))
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    fn ids_for_object(&self, object: &Entity, zone: &str) -> Vec<u64> {
        self.by_object
            .get(&index_key(object, zone))
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Is there a live tuple `subject --relation--> object`?
    pub fn has_direct(
        &self,
        subject: &Entity,
        relation: &str,
        object: &Entity,
        zone: &str,
    ) -> bool {
        let now = now_millis();
        self.ids_for_object(object, zone).into_iter().any(|id| {
            self.tuples
                .get(&id)
                .map(|t| {
                    t.relation == relation && t.subject == *subject && !t.is_expired(now)
                })
                .unwrap_or(false)
        })
    }

    /// Live tuples where `subject_entity` is the subject and the relation
    /// matches — the tupleset walk of a tuple-to-userset rule.
    pub fn tuples_from(
        &self,
        subject_entity: &Entity,
        relation: &str,
        zone: &str,
    ) -> Vec<RelationTuple> {
        let now = now_millis();
        self.ids_for_subject(subject_entity, zone)
            .into_iter()
            .filter_map(|id| self.tuples.get(&id).map(|t| t.clone()))
            .filter(|t| t.relation == relation && !t.is_expired(now))
            .collect()
    }

    /// Live tuples pointing at `object` with the given relation — the
    /// reverse walk used by expand.
    pub fn tuples_to(&self, object: &Entity, relation: &str, zone: &str) -> Vec<RelationTuple> {
        let now = now_millis();
        self.ids_for_object(object, zone)
            .into_iter()
            .filter_map(|id| self.tuples.get(&id).map(|t| t.clone()))
            .filter(|t| t.relation == relation && !t.is_expired(now))
            .collect()
    }

    /// All live tuples on an object, any relation.
    pub fn tuples_on_object(&self, object: &Entity, zone: &str) -> Vec<RelationTuple> {
        let now = now_millis();
        self.ids_for_object(object, zone)
            .into_iter()
            .filter_map(|id| self.tuples.get(&id).map(|t| t.clone()))
            .filter(|t| !t.is_expired(now))
            .collect()
    }

    pub fn get(&self, id: u64) -> Option<RelationTuple> {
        self.tuples.get(&id).map(|t| t.clone())
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }
}
