//! Check/expand evaluator over the tuple graph.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use dashmap::DashMap;
use moka::sync::Cache;
use tracing::debug;

use crate::schema::{file_schema, group_schema, NamespaceSchema, RewriteRule};
use crate::tuple::{Entity, RelationTuple, TupleStore};
use crate::{ReBacError, Result};

type WriteHook = Box<dyn Fn(&RelationTuple) + Send + Sync>;

pub struct ReBacEngine {
    store: TupleStore,
    schemas: DashMap<String, NamespaceSchema>,
    check_cache: Cache<String, bool>,
    /// zone|subject|object → generation; bumped on writes so stale cache
    /// keys become unreachable instead of being chased down.
    pair_gen: DashMap<String, u64>,
    /// Bumped on schema change: flushes every cached result at once.
    schema_gen: AtomicU64,
    max_depth: usize,
    write_hooks: RwLock<Vec<WriteHook>>,
}

impl ReBacEngine {
    pub const DEFAULT_MAX_DEPTH: usize = 10;
    pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

    pub fn new() -> Self {
        Self::with_settings(Self::DEFAULT_CACHE_TTL, Self::DEFAULT_MAX_DEPTH)
    }

    pub fn with_settings(cache_ttl: Duration, max_depth: usize) -> Self {
        let engine = Self {
            store: TupleStore::new(),
            schemas: DashMap::new(),
            check_cache: Cache::builder()
                .max_capacity(1_000_000)
                .time_to_live(cache_ttl)
                .build(),
            pair_gen: DashMap::new(),
            schema_gen: AtomicU64::new(0),
            max_depth,
            write_hooks: RwLock::new(Vec::new()),
        };
        engine.schemas.insert("file".into(), file_schema());
        engine.schemas.insert("group".into(), group_schema());
        engine
    }

    pub fn store(&self) -> &TupleStore {
        &self.store
    }

    /// Register a callback fired after every tuple write or delete; the
    /// directory-grant layer uses it to invalidate bitmaps covering the
    /// object.
    pub fn on_write(&self, hook: impl Fn(&RelationTuple) + Send + Sync + 'static) {
        self.write_hooks
            .write()
            .expect("write hooks poisoned")
            .push(Box::new(hook));
    }

    /// Install or replace a namespace schema. Flushes the check cache.
    pub fn create_namespace(&self, schema: NamespaceSchema) {
        self.schemas.insert(schema.object_type.clone(), schema);
        self.schema_gen.fetch_add(1, Ordering::SeqCst);
    }

    fn pair_key(zone: &str, subject: &Entity, object: &Entity) -> String {
        format!("{zone}|{}|{}", subject.key(), object.key())
    }

    fn pair_generation(&self, key: &str) -> u64 {
        self.pair_gen.get(key).map(|g| *g).unwrap_or(0)
    }

    fn bump_pair(&self, zone: &str, subject: &Entity, object: &Entity) {
        *self
            .pair_gen
            .entry(Self::pair_key(zone, subject, object))
            .or_insert(0) += 1;
    }

    // === Write path ===

    /// Insert a tuple. Cross-tenant writes are rejected unless both sides
    /// carry the same tenant.
    #[allow(clippy::too_many_arguments)]
    pub fn write(
        &self,
        subject: Entity,
        relation: impl Into<String>,
        object: Entity,
        zone: impl Into<String>,
        expires_at_ms: Option<u64>,
        subject_tenant: Option<String>,
        object_tenant: Option<String>,
    ) -> Result<u64> {
        match (&subject_tenant, &object_tenant) {
            (None, None) => {}
            (Some(s), Some(o)) if s == o => {}
            _ => {
                return Err(ReBacError::CrossTenant {
                    subject_tenant,
                    object_tenant,
                })
            }
        }

        let zone = zone.into();
        self.bump_pair(&zone, &subject, &object);
        let id = self.store.insert(
            subject,
            relation,
            object,
            zone,
            expires_at_ms,
            subject_tenant,
            object_tenant,
        );

        if let Some(tuple) = self.store.get(id) {
            self.fire_hooks(&tuple);
        }
        Ok(id)
    }

    fn fire_hooks(&self, tuple: &RelationTuple) {
        for hook in self.write_hooks.read().expect("write hooks poisoned").iter() {
            hook(tuple);
        }
    }

    /// Delete tuples matching the triple. Returns how many were removed.
    pub fn delete(&self, subject: &Entity, relation: &str, object: &Entity, zone: &str) -> usize {
        let removed = self.store.remove(subject, relation, object, zone);
        if removed > 0 {
            self.bump_pair(zone, subject, object);
            let tombstone = RelationTuple {
                id: 0,
                subject: subject.clone(),
                relation: relation.to_string(),
                object: object.clone(),
                zone: zone.to_string(),
                expires_at_ms: None,
                subject_tenant: None,
                object_tenant: None,
                created_at: 0,
            };
            self.fire_hooks(&tombstone);
        }
        removed
    }

    // === Check path ===

    /// Depth-bounded, cycle-guarded permission check. Results are cached
    /// with a TTL, keyed so that tuple writes and schema changes make old
    /// entries unreachable.
    pub fn check(&self, subject: &Entity, permission: &str, object: &Entity, zone: &str) -> bool {
        let pair_key = Self::pair_key(zone, subject, object);
        let cache_key = format!(
            "{}|{}|{permission}|{pair_key}",
            self.schema_gen.load(Ordering::SeqCst),
            self.pair_generation(&pair_key),
        );

        if let Some(hit) = self.check_cache.get(&cache_key) {
            return hit;
        }

        let mut visited = HashSet::new();
        let result = self.evaluate(subject, permission, object, zone, 0, &mut visited);
        self.check_cache.insert(cache_key, result);
        result
    }

    fn evaluate(
        &self,
        subject: &Entity,
        relation: &str,
        object: &Entity,
        zone: &str,
        depth: usize,
        visited: &mut HashSet<(String, String)>,
    ) -> bool {
        if depth > self.max_depth {
            debug!(relation, object = %object.key(), "max depth reached");
            return false;
        }
        // Drop back-edges on cyclic graphs
        if !visited.insert((relation.to_string(), object.key())) {
            return false;
        }

        let rule = self
            .schemas
            .get(&object.entity_type)
            .map(|s| s.rule(relation))
            .unwrap_or(RewriteRule::Direct);

        match rule {
            RewriteRule::Direct => self.store.has_direct(subject, relation, object, zone),
            RewriteRule::Union(children) => children.iter().any(|child| {
                self.evaluate(subject, child, object, zone, depth + 1, visited)
            }),
            RewriteRule::TupleToUserset { tupleset, computed } => self
                .store
                .tuples_from(object, &tupleset, zone)
                .iter()
                .any(|t| self.evaluate(subject, &computed, &t.object, zone, depth + 1, visited)),
        }
    }

    // === Expand ===

    /// Every subject holding `permission` on `object`, via the same rules
    /// run in reverse. De-duplicated; honors depth and cycle guards.
    pub fn expand(&self, permission: &str, object: &Entity, zone: &str) -> HashSet<Entity> {
        let mut out = HashSet::new();
        let mut visited = HashSet::new();
        self.expand_into(permission, object, zone, 0, &mut visited, &mut out);
        out
    }

    fn expand_into(
        &self,
        relation: &str,
        object: &Entity,
        zone: &str,
        depth: usize,
        visited: &mut HashSet<(String, String)>,
        out: &mut HashSet<Entity>,
    ) {
        if depth > self.max_depth {
            return;
        }
        if !visited.insert((relation.to_string(), object.key())) {
            return;
        }

        let rule = self
            .schemas
            .get(&object.entity_type)
            .map(|s| s.rule(relation))
            .unwrap_or(RewriteRule::Direct);

        match rule {
            RewriteRule::Direct => {
                for tuple in self.store.tuples_to(object, relation, zone) {
                    out.insert(tuple.subject);
                }
            }
            RewriteRule::Union(children) => {
                for child in children {
                    self.expand_into(&child, object, zone, depth + 1, visited, out);
                }
            }
            RewriteRule::TupleToUserset { tupleset, computed } => {
                for tuple in self.store.tuples_from(object, &tupleset, zone) {
                    self.expand_into(&computed, &tuple.object, zone, depth + 1, visited, out);
                }
            }
        }
    }
}

impl Default for ReBacEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> ReBacEngine {
        ReBacEngine::with_settings(Duration::from_secs(300), 10)
    }

    #[test]
    fn direct_relationship() {
        let e = engine();
        e.write(
            Entity::user("alice"),
            "member",
            Entity::group("eng"),
            "z",
            None,
            None,
            None,
        )
        .unwrap();

        assert!(e.check(&Entity::user("alice"), "member", &Entity::group("eng"), "z"));
        assert!(!e.check(&Entity::user("bob"), "member", &Entity::group("eng"), "z"));
    }

    #[test]
    fn group_grant_gives_write_and_read_not_execute() {
        let e = engine();
        e.write(
            Entity::user("alice"),
            "member",
            Entity::group("eng"),
            "z",
            None,
            None,
            None,
        )
        .unwrap();
        e.write(
            Entity::file("/p"),
            "direct_editor",
            Entity::group("eng"),
            "z",
            None,
            None,
            None,
        )
        .unwrap();

        assert!(e.check(&Entity::user("alice"), "write", &Entity::file("/p"), "z"));
        assert!(e.check(&Entity::user("alice"), "read", &Entity::file("/p"), "z"));
        assert!(!e.check(&Entity::user("alice"), "execute", &Entity::file("/p"), "z"));
    }

    #[test]
    fn parent_chain_inherits_ownership() {
        let e = engine();
        e.write(
            Entity::user("alice"),
            "direct_owner",
            Entity::file("/dir"),
            "z",
            None,
            None,
            None,
        )
        .unwrap();
        e.write(
            Entity::file("/dir/a.txt"),
            "parent",
            Entity::file("/dir"),
            "z",
            None,
            None,
            None,
        )
        .unwrap();

        assert!(e.check(&Entity::user("alice"), "owner", &Entity::file("/dir"), "z"));
        assert!(e.check(&Entity::user("alice"), "owner", &Entity::file("/dir/a.txt"), "z"));
        assert!(e.check(&Entity::user("alice"), "write", &Entity::file("/dir/a.txt"), "z"));
    }

    #[test]
    fn adding_tuple_flips_check_despite_cache() {
        let e = engine();
        assert!(!e.check(&Entity::user("bob"), "read", &Entity::file("/f"), "z"));

        e.write(
            Entity::user("bob"),
            "direct_viewer",
            Entity::file("/f"),
            "z",
            None,
            None,
            None,
        )
        .unwrap();
        // Same pair, new generation: cached false is unreachable
        assert!(e.check(&Entity::user("bob"), "read", &Entity::file("/f"), "z"));
    }

    #[test]
    fn delete_is_anti_monotone() {
        let e = engine();
        e.write(
            Entity::user("bob"),
            "direct_viewer",
            Entity::file("/f"),
            "z",
            None,
            None,
            None,
        )
        .unwrap();
        assert!(e.check(&Entity::user("bob"), "read", &Entity::file("/f"), "z"));

        assert_eq!(
            e.delete(&Entity::user("bob"), "direct_viewer", &Entity::file("/f"), "z"),
            1
        );
        assert!(!e.check(&Entity::user("bob"), "read", &Entity::file("/f"), "z"));
    }

    #[test]
    fn expired_tuple_never_grants() {
        let e = engine();
        e.write(
            Entity::user("bob"),
            "direct_viewer",
            Entity::file("/f"),
            "z",
            Some(1),
            None,
            None,
        )
        .unwrap();
        assert!(!e.check(&Entity::user("bob"), "read", &Entity::file("/f"), "z"));
    }

    #[test]
    fn cyclic_parent_graph_terminates_false() {
        let e = engine();
        e.write(
            Entity::file("/a"),
            "parent",
            Entity::file("/b"),
            "z",
            None,
            None,
            None,
        )
        .unwrap();
        e.write(
            Entity::file("/b"),
            "parent",
            Entity::file("/a"),
            "z",
            None,
            None,
            None,
        )
        .unwrap();

        assert!(!e.check(&Entity::user("x"), "owner", &Entity::file("/a"), "z"));
    }

    #[test]
    fn zone_isolation() {
        let e = engine();
        e.write(
            Entity::user("alice"),
            "direct_viewer",
            Entity::file("/f"),
            "zone-a",
            None,
            None,
            None,
        )
        .unwrap();

        assert!(e.check(&Entity::user("alice"), "read", &Entity::file("/f"), "zone-a"));
        assert!(!e.check(&Entity::user("alice"), "read", &Entity::file("/f"), "zone-b"));
    }

    #[test]
    fn cross_tenant_write_rejected() {
        let e = engine();
        let err = e.write(
            Entity::user("alice"),
            "direct_viewer",
            Entity::file("/f"),
            "z",
            None,
            Some("tenant-a".into()),
            Some("tenant-b".into()),
        );
        assert!(matches!(err, Err(ReBacError::CrossTenant { .. })));

        e.write(
            Entity::user("alice"),
            "direct_viewer",
            Entity::file("/f"),
            "z",
            None,
            Some("tenant-a".into()),
            Some("tenant-a".into()),
        )
        .unwrap();
    }

    #[test]
    fn expand_collects_direct_and_group_members() {
        let e = engine();
        e.write(
            Entity::user("alice"),
            "member",
            Entity::group("eng"),
            "z",
            None,
            None,
            None,
        )
        .unwrap();
        e.write(
            Entity::file("/p"),
            "direct_editor",
            Entity::group("eng"),
            "z",
            None,
            None,
            None,
        )
        .unwrap();
        e.write(
            Entity::user("carol"),
            "direct_editor",
            Entity::file("/p"),
            "z",
            None,
            None,
            None,
        )
        .unwrap();

        let subjects = e.expand("editor", &Entity::file("/p"), "z");
        assert!(subjects.contains(&Entity::user("alice")));
        assert!(subjects.contains(&Entity::user("carol")));
    }

    #[test]
    fn schema_change_flushes_cache() {
        let e = engine();
        e.write(
            Entity::user("u"),
            "special",
            Entity::new("doc", "d1"),
            "z",
            None,
            None,
            None,
        )
        .unwrap();
        // No schema: falls back to direct
        assert!(e.check(&Entity::user("u"), "special", &Entity::new("doc", "d1"), "z"));
        assert!(!e.check(&Entity::user("u"), "alias", &Entity::new("doc", "d1"), "z"));

        // Install a schema making `alias` a union over `special`
        e.create_namespace(
            NamespaceSchema::new("doc")
                .relation("alias", RewriteRule::Union(vec!["special".into()])),
        );
        assert!(e.check(&Entity::user("u"), "alias", &Entity::new("doc", "d1"), "z"));
    }
}
