//! Permission evaluation: zone isolation, ACLs, POSIX mode bits and the
//! relationship graph, folded into one decision.

use std::sync::Arc;

use nexus_config::log_kernel_debug;
use nexus_meta::FileMetadata;
use nexus_rebac::{DirectoryGrantManager, Entity, ReBacEngine};

use crate::context::OperationContext;
use crate::{NexusError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Read,
    Write,
    Execute,
}

impl Permission {
    pub fn as_str(self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::Execute => "execute",
        }
    }

    fn acl_bit(self) -> char {
        match self {
            Permission::Read => 'r',
            Permission::Write => 'w',
            Permission::Execute => 'x',
        }
    }

    fn mode_bits(self) -> (u32, u32, u32) {
        match self {
            Permission::Read => (0o400, 0o040, 0o004),
            Permission::Write => (0o200, 0o020, 0o002),
            Permission::Execute => (0o100, 0o010, 0o001),
        }
    }

    /// Relations whose directory grants pre-materialize this permission.
    fn grant_relations(self) -> &'static [&'static str] {
        match self {
            Permission::Read => &["reader", "viewer", "direct_viewer"],
            Permission::Write => &["editor", "writer", "direct_editor"],
            Permission::Execute => &["executor", "direct_executor"],
        }
    }
}

pub struct PermissionEvaluator {
    rebac: Arc<ReBacEngine>,
    grants: Arc<DirectoryGrantManager>,
}

impl PermissionEvaluator {
    pub fn new(rebac: Arc<ReBacEngine>, grants: Arc<DirectoryGrantManager>) -> Self {
        Self { rebac, grants }
    }

    /// Decide whether `ctx` may perform `perm` on `path`.
    ///
    /// Order: system/admin bypass → zone isolation → ACL deny → ACL grant
    /// → ownership + mode bits → bitmap accelerator → graph traversal.
    /// The bitmap and the graph must agree on positives; the bitmap only
    /// ever short-circuits.
    pub fn check(
        &self,
        metadata: Option<&FileMetadata>,
        path: &str,
        perm: Permission,
        ctx: &OperationContext,
    ) -> Result<()> {
        if ctx.is_system || ctx.is_admin {
            return Ok(());
        }

        if let Some(meta) = metadata {
            // Zone isolation: cross-zone access needs the management
            // capability regardless of any other grant.
            if meta.zone_id != ctx.zone && !ctx.zone_management {
                return Err(NexusError::denied(format!(
                    "cross-zone access to {path} from zone {}",
                    ctx.zone
                )));
            }

            // Deny entries beat everything
            for entry in &meta.acl {
                let applies = (entry.entry_type == "user" && entry.identifier == ctx.user)
                    || (entry.entry_type == "group" && ctx.groups.contains(&entry.identifier));
                if applies && entry.deny {
                    return Err(NexusError::denied(format!(
                        "explicit deny for {} on {path}",
                        ctx.user
                    )));
                }
            }

            for entry in &meta.acl {
                let applies = (entry.entry_type == "user" && entry.identifier == ctx.user)
                    || (entry.entry_type == "group" && ctx.groups.contains(&entry.identifier));
                if applies && entry.grants(perm.acl_bit()) {
                    return Ok(());
                }
            }

            let (owner_bit, group_bit, other_bit) = perm.mode_bits();
            if meta.owner == ctx.user && meta.mode & owner_bit != 0 {
                return Ok(());
            }
            if ctx.groups.contains(&meta.group) && meta.mode & group_bit != 0 {
                return Ok(());
            }
            if meta.mode & other_bit != 0 {
                return Ok(());
            }
        }

        let subject = ctx.subject();

        // Pre-materialized directory grants: positive-only fast path
        for relation in perm.grant_relations() {
            if self.grants.bitmap_allows(&subject, relation, path, &ctx.zone) {
                log_kernel_debug!("allowed via bitmap", path = path, perm = perm.as_str());
                return Ok(());
            }
        }

        if self
            .rebac
            .check(&subject, perm.as_str(), &Entity::file(path), &ctx.zone)
        {
            return Ok(());
        }

        Err(NexusError::denied(format!(
            "{} may not {} {path}",
            ctx.user,
            perm.as_str()
        )))
    }

    /// chmod/chown/ACL mutation rule: owner, admin or system only.
    pub fn check_owner(&self, metadata: &FileMetadata, ctx: &OperationContext) -> Result<()> {
        if ctx.is_admin || ctx.is_system {
            return Ok(());
        }
        if metadata.zone_id != ctx.zone && !ctx.zone_management {
            return Err(NexusError::denied(format!(
                "cross-zone access to {} from zone {}",
                metadata.path, ctx.zone
            )));
        }
        if !metadata.owner.is_empty() && metadata.owner != ctx.user {
            return Err(NexusError::denied(format!(
                "only the owner ('{}') or admin may change {}",
                metadata.owner, metadata.path
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_meta::{AclEntry, LocalLog, MetadataStore, ReplicatedMetadataStore};
    use tempfile::TempDir;

    fn evaluator() -> (TempDir, PermissionEvaluator, Arc<ReBacEngine>) {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(MetadataStore::open(temp.path().join("meta")).unwrap());
        let meta = Arc::new(ReplicatedMetadataStore::new(Arc::new(LocalLog::new(store))));
        let rebac = Arc::new(ReBacEngine::new());
        let grants = DirectoryGrantManager::new(rebac.clone(), meta);
        (temp, PermissionEvaluator::new(rebac.clone(), grants), rebac)
    }

    fn meta_owned_by(owner: &str, mode: u32) -> FileMetadata {
        let mut meta = FileMetadata::new_file("/f", "passthrough", "e", 1, "z", owner, "eng");
        meta.mode = mode;
        meta
    }

    #[tokio::test]
    async fn owner_mode_bits() {
        let (_t, eval, _) = evaluator();
        let meta = meta_owned_by("alice", 0o600);
        let alice = OperationContext::user("alice", "z");
        let bob = OperationContext::user("bob", "z");

        assert!(eval.check(Some(&meta), "/f", Permission::Read, &alice).is_ok());
        assert!(eval.check(Some(&meta), "/f", Permission::Write, &alice).is_ok());
        assert!(eval.check(Some(&meta), "/f", Permission::Read, &bob).is_err());
    }

    #[tokio::test]
    async fn group_and_other_bits() {
        let (_t, eval, _) = evaluator();
        let meta = meta_owned_by("alice", 0o644);
        let carol = OperationContext::user("carol", "z").with_groups(vec!["eng".into()]);
        let dave = OperationContext::user("dave", "z");

        assert!(eval.check(Some(&meta), "/f", Permission::Read, &carol).is_ok());
        // world-readable
        assert!(eval.check(Some(&meta), "/f", Permission::Read, &dave).is_ok());
        assert!(eval.check(Some(&meta), "/f", Permission::Write, &dave).is_err());
    }

    #[tokio::test]
    async fn acl_deny_beats_mode_bits() {
        let (_t, eval, _) = evaluator();
        let mut meta = meta_owned_by("alice", 0o666);
        meta.acl.push(AclEntry {
            entry_type: "user".into(),
            identifier: "intern".into(),
            permissions: "---".into(),
            deny: true,
        });
        let intern = OperationContext::user("intern", "z");

        assert!(eval.check(Some(&meta), "/f", Permission::Read, &intern).is_err());
    }

    #[tokio::test]
    async fn acl_grant_without_mode_bits() {
        let (_t, eval, _) = evaluator();
        let mut meta = meta_owned_by("alice", 0o600);
        meta.acl.push(AclEntry {
            entry_type: "user".into(),
            identifier: "bob".into(),
            permissions: "r--".into(),
            deny: false,
        });
        let bob = OperationContext::user("bob", "z");

        assert!(eval.check(Some(&meta), "/f", Permission::Read, &bob).is_ok());
        assert!(eval.check(Some(&meta), "/f", Permission::Write, &bob).is_err());
    }

    #[tokio::test]
    async fn cross_zone_denied_without_capability() {
        let (_t, eval, _) = evaluator();
        let meta = meta_owned_by("alice", 0o777);
        let outsider = OperationContext::user("alice", "other-zone");
        let err = eval
            .check(Some(&meta), "/f", Permission::Read, &outsider)
            .unwrap_err();
        assert!(matches!(err, NexusError::PermissionDenied { .. }));

        let mut admin = OperationContext::user("alice", "other-zone");
        admin.zone_management = true;
        assert!(eval.check(Some(&meta), "/f", Permission::Read, &admin).is_ok());
    }

    #[tokio::test]
    async fn rebac_tuple_grants_when_posix_does_not() {
        let (_t, eval, rebac) = evaluator();
        let meta = meta_owned_by("alice", 0o600);
        let bob = OperationContext::user("bob", "z");
        assert!(eval.check(Some(&meta), "/f", Permission::Read, &bob).is_err());

        rebac
            .write(
                Entity::user("bob"),
                "direct_viewer",
                Entity::file("/f"),
                "z",
                None,
                None,
                None,
            )
            .unwrap();
        assert!(eval.check(Some(&meta), "/f", Permission::Read, &bob).is_ok());
        assert!(eval.check(Some(&meta), "/f", Permission::Execute, &bob).is_err());
    }

    #[tokio::test]
    async fn owner_rule_for_admin_surface() {
        let (_t, eval, _) = evaluator();
        let meta = meta_owned_by("alice", 0o644);

        assert!(eval
            .check_owner(&meta, &OperationContext::user("alice", "z"))
            .is_ok());
        assert!(eval
            .check_owner(&meta, &OperationContext::user("bob", "z"))
            .is_err());
        assert!(eval
            .check_owner(&meta, &OperationContext::user("bob", "z").with_admin())
            .is_ok());
    }
}
