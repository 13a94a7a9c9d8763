//! Workspace snapshots.
//!
//! A snapshot is a row of `path → etag` pairs for every file under a
//! registered workspace. Restoring re-points the workspace files at the
//! recorded content; nothing is copied, the CAS already holds the bytes.
//!
//! Registrations and snapshot rows live as JSON documents under the
//! reserved `/.nexus/` subtree, so they replicate through the same log as
//! everything else.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use nexus_config::log_kernel_debug;
use nexus_meta::now_millis;

use crate::context::OperationContext;
use crate::fs::{NexusFs, WriteOptions};
use crate::path::validate_path;
use crate::{NexusError, Result};

const WORKSPACES_ROOT: &str = "/.nexus/workspaces";
const SNAPSHOTS_ROOT: &str = "/.nexus/snapshots";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceRegistration {
    pub name: String,
    pub root: String,
    pub registered_at: u64,
}

/// One snapshot row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: String,
    pub workspace: String,
    pub created_at: u64,
    /// path → etag at snapshot time
    pub files: BTreeMap<String, String>,
}

fn workspace_doc(name: &str) -> String {
    format!("{WORKSPACES_ROOT}/{name}.json")
}

fn snapshot_doc(workspace: &str, id: &str) -> String {
    format!("{SNAPSHOTS_ROOT}/{workspace}/{id}.json")
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || !name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return Err(NexusError::invalid(format!(
            "workspace name must be [A-Za-z0-9_-]+, got '{name}'"
        )));
    }
    Ok(())
}

impl NexusFs {
    /// Register a directory as a snapshot-able workspace.
    pub async fn register_workspace(
        &self,
        name: &str,
        root: &str,
        ctx: &OperationContext,
    ) -> Result<()> {
        validate_name(name)?;
        let root = validate_path(root)?;

        let registration = WorkspaceRegistration {
            name: name.to_string(),
            root,
            registered_at: now_millis(),
        };
        let body = serde_json::to_vec(&registration)
            .map_err(|e| NexusError::Internal(e.to_string()))?;

        let system = OperationContext::system(&ctx.zone);
        self.write(&workspace_doc(name), &body, &system, WriteOptions::default())
            .await?;
        Ok(())
    }

    async fn workspace_registration(
        &self,
        name: &str,
        ctx: &OperationContext,
    ) -> Result<WorkspaceRegistration> {
        validate_name(name)?;
        let system = OperationContext::system(&ctx.zone);
        let bytes = self.read(&workspace_doc(name), &system).await.map_err(|e| {
            match e {
                NexusError::NotFound { .. } => {
                    NexusError::not_found(format!("workspace {name}"))
                }
                other => other,
            }
        })?;
        serde_json::from_slice(&bytes).map_err(|e| NexusError::Internal(e.to_string()))
    }

    /// Record the workspace's current files and their etags.
    pub async fn snapshot_workspace(
        &self,
        name: &str,
        ctx: &OperationContext,
    ) -> Result<SnapshotRecord> {
        let registration = self.workspace_registration(name, ctx).await?;

        let mut files = BTreeMap::new();
        let mut cursor = None;
        loop {
            let page = self
                .metadata()
                .list(&registration.root, true, 1000, cursor)
                .await?;
            for meta in &page.entries {
                if !meta.is_directory {
                    files.insert(meta.path.clone(), meta.etag.clone());
                }
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        let created_at = now_millis();
        let record = SnapshotRecord {
            id: format!("snap-{created_at}"),
            workspace: name.to_string(),
            created_at,
            files,
        };

        let body =
            serde_json::to_vec(&record).map_err(|e| NexusError::Internal(e.to_string()))?;
        let system = OperationContext::system(&ctx.zone);
        self.write(
            &snapshot_doc(name, &record.id),
            &body,
            &system,
            WriteOptions::default(),
        )
        .await?;

        log_kernel_debug!(
            "snapshot taken",
            workspace = name,
            id = record.id.as_str(),
            files = record.files.len(),
        );
        Ok(record)
    }

    pub async fn list_snapshots(
        &self,
        name: &str,
        ctx: &OperationContext,
    ) -> Result<Vec<SnapshotRecord>> {
        validate_name(name)?;
        let system = OperationContext::system(&ctx.zone);
        let dir = format!("{SNAPSHOTS_ROOT}/{name}");

        let (entries, _) = match self.list(&dir, &system, false, false, 1000, None).await {
            Ok(page) => page,
            Err(NexusError::NotFound { .. }) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut records = Vec::new();
        for entry in entries {
            if entry.is_directory {
                continue;
            }
            let bytes = self.read(&entry.path, &system).await?;
            let record: SnapshotRecord = serde_json::from_slice(&bytes)
                .map_err(|e| NexusError::Internal(e.to_string()))?;
            records.push(record);
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    /// Re-point the workspace's files at a snapshot's content. Files
    /// created after the snapshot are left alone; restore only touches
    /// what the row names.
    pub async fn restore_workspace(
        &self,
        name: &str,
        snapshot_id: &str,
        ctx: &OperationContext,
    ) -> Result<usize> {
        validate_name(name)?;
        let system = OperationContext::system(&ctx.zone);
        let bytes = self.read(&snapshot_doc(name, snapshot_id), &system).await?;
        let record: SnapshotRecord =
            serde_json::from_slice(&bytes).map_err(|e| NexusError::Internal(e.to_string()))?;

        let mut restored = 0usize;
        for (path, etag) in &record.files {
            let current = self.metadata().get(path).await?;
            if current.as_ref().map(|m| &m.etag) == Some(etag) {
                continue;
            }

            let (backend, _) = self.router().resolve(path)?;
            let content = self.fetch_for_restore(&backend, path, etag).await?;
            self.write(path, &content, &system, WriteOptions::default())
                .await?;
            restored += 1;
        }

        log_kernel_debug!(
            "workspace restored",
            workspace = name,
            snapshot_id = snapshot_id,
            restored = restored,
        );
        Ok(restored)
    }

    async fn fetch_for_restore(
        &self,
        backend: &std::sync::Arc<dyn nexus_cas::Backend>,
        path: &str,
        etag: &str,
    ) -> Result<Vec<u8>> {
        let backend = backend.clone();
        let etag = etag.to_string();
        let path = path.to_string();
        tokio::task::spawn_blocking(move || {
            backend.read_content(nexus_cas::ContentRef::Hash(&etag))
        })
        .await
        .expect("restore read task panicked")
        .map_err(|e| match e {
            nexus_cas::CasError::NotFound { hash } => NexusError::Integrity {
                path,
                reason: format!("snapshot references missing blob {hash}"),
            },
            other => other.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation() {
        assert!(validate_name("ws-1_a").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("bad/name").is_err());
        assert!(validate_name("dots.too").is_err());
    }
}
