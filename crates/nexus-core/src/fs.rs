//! The kernel façade.
//!
//! Each operation follows the same spine: validate the path, resolve it
//! through the router, check permission, touch metadata through the
//! replicated log, touch content through the backend, emit an event,
//! record the access for invalidation.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::instrument;

use nexus_cas::{Backend, ContentRef, PassthroughBackend};
use nexus_config::log_kernel_debug;
use nexus_events::{
    ChangeEvent, EventBus, EventKind, EventsService, LeaseLockManager, LockManager,
    SameBoxLockManager,
};
use nexus_meta::{
    FileMetadata, LocalLog, LogTransport, MetadataPut, MetadataStore, ReplicatedMetadataStore,
    VersionDiff, VersionRecord,
};
use nexus_rebac::{DirectoryGrantManager, Entity, ReBacEngine};

use crate::context::OperationContext;
use crate::path::{ancestors_of, glob_to_regex, parent_of, validate_path};
use crate::perms::{Permission, PermissionEvaluator};
use crate::read_set::{AccessType, ReadSetRegistry, ResourceType};
use crate::router::Router;
use crate::{NexusError, Result};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);
const LOCK_TTL: Duration = Duration::from_secs(30);

/// Options for [`NexusFs::write`].
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Reject unless the stored etag matches (optimistic concurrency).
    pub if_match: Option<String>,
    /// Reject when the path already exists (create-only).
    pub if_none_match: bool,
    /// Skip the etag preconditions.
    pub force: bool,
    /// Serialize the write behind an advisory lock.
    pub lock: bool,
    pub lock_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteResult {
    pub path: String,
    pub etag: String,
    pub version: u64,
    pub revision: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListEntry {
    pub name: String,
    pub path: String,
    pub is_directory: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<FileMetadata>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    Content,
    Files,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrepMatch {
    pub path: String,
    pub line_number: usize,
    pub line: String,
}

/// Wires the cooperating services into a kernel instance.
pub struct NexusFsBuilder {
    backend: Option<Arc<dyn Backend>>,
    transport: Option<Arc<dyn LogTransport>>,
    bus: Option<Arc<dyn EventBus>>,
    default_zone: String,
    lock_holder: String,
}

impl NexusFsBuilder {
    pub fn new() -> Self {
        Self {
            backend: None,
            transport: None,
            bus: None,
            default_zone: "default".to_string(),
            lock_holder: format!("nexus-{}", std::process::id()),
        }
    }

    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn LogTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn event_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn default_zone(mut self, zone: impl Into<String>) -> Self {
        self.default_zone = zone.into();
        self
    }

    pub fn lock_holder(mut self, holder: impl Into<String>) -> Self {
        self.lock_holder = holder.into();
        self
    }

    pub fn build(self) -> Result<Arc<NexusFs>> {
        let backend = self
            .backend
            .ok_or_else(|| NexusError::invalid("builder needs a backend"))?;
        let transport = self
            .transport
            .ok_or_else(|| NexusError::invalid("builder needs a log transport"))?;

        let meta = Arc::new(ReplicatedMetadataStore::new(transport.clone()));
        let rebac = Arc::new(ReBacEngine::new());
        let grants = DirectoryGrantManager::new(rebac.clone(), meta.clone());

        // Lock track selection mirrors the event track: distributed
        // deployments lease through the log, same-box uses the backend
        // table.
        let locks: Arc<dyn LockManager> = if self.bus.is_none() && backend.is_passthrough() {
            Arc::new(SameBoxLockManager::new(backend.clone()))
        } else {
            Arc::new(LeaseLockManager::new(transport, self.lock_holder))
        };

        let events = Arc::new(EventsService::new(
            backend.clone(),
            meta.clone(),
            locks,
            self.bus,
        ));

        Ok(Arc::new(NexusFs {
            router: Router::new(backend),
            meta,
            rebac: rebac.clone(),
            grants: grants.clone(),
            perms: PermissionEvaluator::new(rebac, grants),
            events,
            read_sets: Arc::new(ReadSetRegistry::default()),
            default_zone: self.default_zone,
        }))
    }
}

impl Default for NexusFsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct NexusFs {
    router: Router,
    meta: Arc<ReplicatedMetadataStore>,
    rebac: Arc<ReBacEngine>,
    grants: Arc<DirectoryGrantManager>,
    perms: PermissionEvaluator,
    events: Arc<EventsService>,
    read_sets: Arc<ReadSetRegistry>,
    default_zone: String,
}

impl NexusFs {
    pub fn builder() -> NexusFsBuilder {
        NexusFsBuilder::new()
    }

    /// Single-node kernel: passthrough backend plus an in-process log.
    /// What the daemon runs when no cluster is configured, and what tests
    /// use.
    pub fn single_node(base_dir: &Path, zone: &str) -> Result<Arc<Self>> {
        let backend = Arc::new(PassthroughBackend::new(base_dir.join("data"))?);
        let store = Arc::new(
            MetadataStore::open(base_dir.join("metadata")).map_err(NexusError::from)?,
        );
        NexusFsBuilder::new()
            .backend(backend)
            .transport(Arc::new(LocalLog::new(store)))
            .default_zone(zone)
            .build()
    }

    // === Service accessors (constructor-injected, no singletons) ===

    pub fn metadata(&self) -> &Arc<ReplicatedMetadataStore> {
        &self.meta
    }

    pub fn rebac(&self) -> &Arc<ReBacEngine> {
        &self.rebac
    }

    pub fn grants(&self) -> &Arc<DirectoryGrantManager> {
        &self.grants
    }

    pub fn events(&self) -> &Arc<EventsService> {
        &self.events
    }

    pub fn read_sets(&self) -> &Arc<ReadSetRegistry> {
        &self.read_sets
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn default_zone(&self) -> &str {
        &self.default_zone
    }

    // === Read ===

    #[instrument(skip(self, ctx), level = "debug")]
    pub async fn read(&self, path: &str, ctx: &OperationContext) -> Result<Vec<u8>> {
        Ok(self.read_with_metadata(path, ctx).await?.0)
    }

    pub async fn read_with_metadata(
        &self,
        path: &str,
        ctx: &OperationContext,
    ) -> Result<(Vec<u8>, FileMetadata)> {
        let path = validate_path(path)?;
        let (backend, _physical) = self.router.resolve(&path)?;

        let meta = self
            .meta
            .get(&path)
            .await?
            .ok_or_else(|| NexusError::not_found(&path))?;
        if meta.is_directory {
            return Err(NexusError::invalid(format!("{path} is a directory")));
        }
        self.perms.check(Some(&meta), &path, Permission::Read, ctx)?;

        let bytes = self.fetch_content(&backend, &path, &meta.etag).await?;
        ctx.track(ResourceType::File, &path, meta.version, AccessType::Content);
        Ok((bytes, meta))
    }

    async fn fetch_content(
        &self,
        backend: &Arc<dyn Backend>,
        path: &str,
        etag: &str,
    ) -> Result<Vec<u8>> {
        let backend = backend.clone();
        let etag_owned = etag.to_string();
        let result = tokio::task::spawn_blocking(move || {
            backend.read_content(ContentRef::Hash(&etag_owned))
        })
        .await
        .expect("content read task panicked");

        match result {
            Ok(bytes) => Ok(bytes),
            // Metadata names a blob the store no longer has: integrity,
            // not a plain miss.
            Err(nexus_cas::CasError::NotFound { hash }) => Err(NexusError::Integrity {
                path: path.to_string(),
                reason: format!("metadata references missing blob {hash}"),
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn stat(&self, path: &str, ctx: &OperationContext) -> Result<FileMetadata> {
        let path = validate_path(path)?;
        let meta = self
            .meta
            .get(&path)
            .await?
            .ok_or_else(|| NexusError::not_found(&path))?;
        self.perms.check(Some(&meta), &path, Permission::Read, ctx)?;
        ctx.track(ResourceType::File, &path, meta.version, AccessType::Metadata);
        Ok(meta)
    }

    pub async fn exists(&self, path: &str, ctx: &OperationContext) -> Result<bool> {
        let path = validate_path(path)?;
        let exists = match self.meta.get(&path).await? {
            Some(meta) => {
                // An entry the caller may not even see still exists; zone
                // isolation applies before the answer does.
                self.perms.check(Some(&meta), &path, Permission::Read, ctx)?;
                true
            }
            None => self.meta.is_implicit_directory(&path).await?,
        };
        ctx.track(ResourceType::File, &path, 0, AccessType::Exists);
        Ok(exists)
    }

    // === Write ===

    #[instrument(skip(self, content, ctx, opts), fields(bytes = content.len()), level = "debug")]
    pub async fn write(
        &self,
        path: &str,
        content: &[u8],
        ctx: &OperationContext,
        opts: WriteOptions,
    ) -> Result<WriteResult> {
        let path = validate_path(path)?;

        let guard = if opts.lock {
            let timeout = opts.lock_timeout.unwrap_or(DEFAULT_LOCK_TIMEOUT);
            match self.events.lock_guard(&path, timeout, LOCK_TTL, 1).await? {
                Some(guard) => Some(guard),
                None => {
                    return Err(NexusError::Timeout {
                        operation: format!("lock {path}"),
                    })
                }
            }
        } else {
            None
        };

        let result = self.write_unlocked(&path, content, ctx, &opts).await;

        if let Some(guard) = guard {
            let _ = guard.release().await;
        }
        result
    }

    async fn write_unlocked(
        &self,
        path: &str,
        content: &[u8],
        ctx: &OperationContext,
        opts: &WriteOptions,
    ) -> Result<WriteResult> {
        let (backend, physical) = self.router.resolve(path)?;

        let existing = self.meta.get(path).await?;
        if let Some(meta) = &existing {
            if meta.is_directory {
                return Err(NexusError::invalid(format!("{path} is a directory")));
            }
            self.perms.check(Some(meta), path, Permission::Write, ctx)?;
        }

        // Preconditions run before any content lands so a refused write
        // leaves the pointer untouched. The log re-checks them under its
        // total order; this is the fast fail.
        if !opts.force {
            if opts.if_none_match {
                if let Some(current) = &existing {
                    return Err(NexusError::Conflict {
                        path: path.to_string(),
                        current_etag: Some(current.etag.clone()),
                        provided_etag: None,
                    });
                }
            }
            if let Some(expected) = &opts.if_match {
                match &existing {
                    Some(current) if &current.etag == expected => {}
                    Some(current) => {
                        return Err(NexusError::Conflict {
                            path: path.to_string(),
                            current_etag: Some(current.etag.clone()),
                            provided_etag: Some(expected.clone()),
                        })
                    }
                    None => return Err(NexusError::not_found(path)),
                }
            }
        }

        let etag = {
            let backend = backend.clone();
            let bytes = content.to_vec();
            tokio::task::spawn_blocking(move || backend.write_content(&bytes, Some(&physical)))
                .await
                .expect("content write task panicked")?
        };

        let mut metadata = match existing.clone() {
            Some(mut prev) => {
                prev.etag = etag.clone();
                prev.physical_key = etag.clone();
                prev.size = content.len() as u64;
                prev.modified_at = nexus_meta::now_millis();
                prev
            }
            None => {
                let mut fresh = FileMetadata::new_file(
                    path,
                    backend.name(),
                    &etag,
                    content.len() as u64,
                    &ctx.zone,
                    &ctx.user,
                    ctx.groups.first().cloned().unwrap_or_default(),
                );
                fresh.mime_type = guess_mime(path);
                fresh
            }
        };
        metadata.backend_name = backend.name().to_string();

        let mut put = MetadataPut::new(metadata);
        if !opts.force {
            put.if_match = opts.if_match.clone();
            put.if_none_match = opts.if_none_match;
        }

        let (stored, revision) = match self.meta.put(put).await {
            Ok(result) => result,
            Err(e) => {
                let err = match NexusError::from(e) {
                    NexusError::Conflict {
                        path,
                        current_etag,
                        ..
                    } => NexusError::Conflict {
                        path,
                        current_etag,
                        provided_etag: opts.if_match.clone(),
                    },
                    other => other,
                };
                // A racing writer won between our precondition check and
                // the log; point the pointer back at the committed content
                // so it keeps agreeing with metadata.
                if let Some(prev) = &existing {
                    self.repoint(&backend, path, &prev.etag).await;
                }
                return Err(err);
            }
        };

        if existing.is_none() {
            self.ensure_parent_tuples(path, &ctx.zone);
            self.grants.on_file_created(path, &ctx.zone);
        }

        self.events
            .publish(ChangeEvent::new(EventKind::FileWrite, path, revision, &ctx.zone))
            .await?;

        log_kernel_debug!("write committed", path = path, version = stored.version);
        Ok(WriteResult {
            path: stored.path,
            etag: stored.etag,
            version: stored.version,
            revision,
            size: stored.size,
        })
    }

    /// Commit several writes as one log transaction: all land or none do.
    /// An empty batch succeeds and commits nothing.
    pub async fn write_batch(
        &self,
        items: Vec<(String, Vec<u8>)>,
        ctx: &OperationContext,
    ) -> Result<Vec<WriteResult>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let mut puts = Vec::with_capacity(items.len());
        let mut created = Vec::new();
        for (raw_path, content) in &items {
            let path = validate_path(raw_path)?;
            let (backend, physical) = self.router.resolve(&path)?;

            let existing = self.meta.get(&path).await?;
            if let Some(meta) = &existing {
                self.perms.check(Some(meta), &path, Permission::Write, ctx)?;
            } else {
                created.push(path.clone());
            }

            let etag = {
                let backend = backend.clone();
                let bytes = content.clone();
                tokio::task::spawn_blocking(move || {
                    backend.write_content(&bytes, Some(&physical))
                })
                .await
                .expect("content write task panicked")?
            };

            let metadata = match existing {
                Some(mut prev) => {
                    prev.etag = etag.clone();
                    prev.physical_key = etag;
                    prev.size = content.len() as u64;
                    prev.modified_at = nexus_meta::now_millis();
                    prev
                }
                None => FileMetadata::new_file(
                    &path,
                    backend.name(),
                    &etag,
                    content.len() as u64,
                    &ctx.zone,
                    &ctx.user,
                    ctx.groups.first().cloned().unwrap_or_default(),
                ),
            };
            puts.push(MetadataPut::new(metadata));
        }

        let stored = self.meta.put_batch(puts).await?;

        for path in &created {
            self.ensure_parent_tuples(path, &ctx.zone);
            self.grants.on_file_created(path, &ctx.zone);
        }
        let mut results = Vec::with_capacity(stored.len());
        for (meta, revision) in stored {
            self.events
                .publish(ChangeEvent::new(
                    EventKind::FileWrite,
                    &meta.path,
                    revision,
                    &ctx.zone,
                ))
                .await?;
            results.push(WriteResult {
                path: meta.path,
                etag: meta.etag,
                version: meta.version,
                revision,
                size: meta.size,
            });
        }
        Ok(results)
    }

    /// Best-effort pointer repair after a lost write race.
    async fn repoint(&self, backend: &Arc<dyn Backend>, path: &str, etag: &str) {
        let Ok((_, physical)) = self.router.resolve(path) else {
            return;
        };
        let backend = backend.clone();
        let etag = etag.to_string();
        let _ = tokio::task::spawn_blocking(move || {
            backend
                .read_content(ContentRef::Hash(&etag))
                .and_then(|bytes| backend.write_content(&bytes, Some(&physical)))
        })
        .await;
    }

    /// Parent edges make directory grants reachable by graph traversal.
    fn ensure_parent_tuples(&self, path: &str, zone: &str) {
        let mut child = path.to_string();
        for parent in ancestors_of(path) {
            let child_entity = Entity::file(child.clone());
            let parent_entity = Entity::file(parent.clone());
            if !self
                .rebac
                .store()
                .has_direct(&child_entity, "parent", &parent_entity, zone)
            {
                let _ = self
                    .rebac
                    .write(child_entity, "parent", parent_entity, zone, None, None, None);
            }
            child = parent;
        }
    }

    // === Delete / rename / copy ===

    pub async fn delete(&self, path: &str, ctx: &OperationContext) -> Result<()> {
        let path = validate_path(path)?;
        let (backend, physical) = self.router.resolve(&path)?;

        let meta = self
            .meta
            .get(&path)
            .await?
            .ok_or_else(|| NexusError::not_found(&path))?;
        self.perms.check(Some(&meta), &path, Permission::Write, ctx)?;

        {
            let backend = backend.clone();
            tokio::task::spawn_blocking(move || backend.delete_content(&physical))
                .await
                .expect("pointer delete task panicked")?;
        }

        let (_, revision) = self.meta.delete(&path).await?;
        self.events
            .publish(ChangeEvent::new(EventKind::FileDelete, &path, revision, &ctx.zone))
            .await?;
        Ok(())
    }

    /// Re-point a file under a new path. Content is untouched (same hash
    /// before and after); on passthrough backends the pointer file moves
    /// with one rename.
    pub async fn rename(&self, old: &str, new: &str, ctx: &OperationContext) -> Result<WriteResult> {
        let old = validate_path(old)?;
        let new = validate_path(new)?;
        let (old_backend, old_physical) = self.router.resolve(&old)?;
        let (new_backend, new_physical) = self.router.resolve(&new)?;
        if old_backend.name() != new_backend.name() {
            return Err(NexusError::invalid(
                "rename across backends is not supported; copy instead",
            ));
        }

        let src = self
            .meta
            .get(&old)
            .await?
            .ok_or_else(|| NexusError::not_found(&old))?;
        self.perms.check(Some(&src), &old, Permission::Write, ctx)?;
        if let Some(dst) = self.meta.get(&new).await? {
            self.perms.check(Some(&dst), &new, Permission::Write, ctx)?;
            return Err(NexusError::Conflict {
                path: new,
                current_etag: Some(dst.etag),
                provided_etag: None,
            });
        }

        let mut moved = src.clone();
        moved.path = new.clone();
        moved.modified_at = nexus_meta::now_millis();

        let mut put = MetadataPut::new(moved);
        put.if_none_match = true;
        put.change_reason = Some(format!("renamed from {old}"));
        let (stored, _) = self.meta.put(put).await?;
        let (_, revision) = self.meta.delete(&old).await?;

        if old_backend.is_passthrough() {
            let backend = old_backend.clone();
            tokio::task::spawn_blocking(move || {
                backend.rename_pointer(&old_physical, &new_physical)
            })
            .await
            .expect("pointer rename task panicked")?;
        }

        // Re-home the relationship graph and the grant bitmaps
        if let Some(old_parent) = parent_of(&old) {
            self.rebac.delete(
                &Entity::file(old.clone()),
                "parent",
                &Entity::file(old_parent),
                &ctx.zone,
            );
        }
        self.ensure_parent_tuples(&new, &ctx.zone);
        self.grants.on_renamed(&old, &new, &ctx.zone);

        self.events
            .publish(ChangeEvent::rename(&old, &new, revision, &ctx.zone))
            .await?;

        Ok(WriteResult {
            path: new,
            etag: stored.etag,
            version: stored.version,
            revision,
            size: stored.size,
        })
    }

    pub async fn copy(&self, src: &str, dst: &str, ctx: &OperationContext) -> Result<WriteResult> {
        let bytes = self.read(src, ctx).await?;
        self.write(dst, &bytes, ctx, WriteOptions::default()).await
    }

    // === Directories ===

    pub async fn mkdir(
        &self,
        path: &str,
        ctx: &OperationContext,
        parents: bool,
        exist_ok: bool,
    ) -> Result<()> {
        let path = validate_path(path)?;
        let (backend, physical) = self.router.resolve(&path)?;

        if let Some(existing) = self.meta.get(&path).await? {
            if existing.is_directory && exist_ok {
                return Ok(());
            }
            return Err(NexusError::Conflict {
                path,
                current_etag: Some(existing.etag),
                provided_etag: None,
            });
        }

        {
            let backend = backend.clone();
            tokio::task::spawn_blocking(move || backend.mkdir(&physical, parents, exist_ok))
                .await
                .expect("mkdir task panicked")?;
        }

        let mut metadata = FileMetadata::new_file(
            &path,
            backend.name(),
            "",
            0,
            &ctx.zone,
            &ctx.user,
            ctx.groups.first().cloned().unwrap_or_default(),
        );
        metadata.is_directory = true;
        metadata.mode = 0o755;
        let (_, revision) = self.meta.put(MetadataPut::new(metadata)).await?;

        self.events
            .publish(ChangeEvent::new(EventKind::DirCreate, &path, revision, &ctx.zone))
            .await?;
        Ok(())
    }

    pub async fn rmdir(&self, path: &str, ctx: &OperationContext, recursive: bool) -> Result<()> {
        let path = validate_path(path)?;
        let (backend, physical) = self.router.resolve(&path)?;

        let explicit = self.meta.get(&path).await?;
        let implicit = self.meta.is_implicit_directory(&path).await?;
        match &explicit {
            Some(meta) if meta.is_directory => {
                self.perms.check(Some(meta), &path, Permission::Write, ctx)?
            }
            Some(_) => return Err(NexusError::invalid(format!("{path} is not a directory"))),
            None if implicit => {}
            None => return Err(NexusError::not_found(&path)),
        }

        let children = self.meta.list(&path, true, usize::MAX, None).await?;
        if !children.entries.is_empty() {
            if !recursive {
                return Err(NexusError::Conflict {
                    path,
                    current_etag: None,
                    provided_etag: None,
                });
            }
            for child in &children.entries {
                self.perms
                    .check(Some(child), &child.path, Permission::Write, ctx)?;
                self.meta.delete(&child.path).await?;
            }
        }

        {
            let backend = backend.clone();
            tokio::task::spawn_blocking(move || match backend.rmdir(&physical, recursive) {
                // Purely implicit directories have no physical node
                Err(nexus_cas::CasError::PathNotFound { .. }) => Ok(()),
                other => other,
            })
            .await
            .expect("rmdir task panicked")?;
        }

        let revision = if explicit.is_some() {
            self.meta.delete(&path).await?.1
        } else {
            self.meta.zone_revision(&ctx.zone).await?
        };

        self.events
            .publish(ChangeEvent::new(EventKind::DirDelete, &path, revision, &ctx.zone))
            .await?;
        Ok(())
    }

    // === Listing / glob / grep ===

    /// Permission-aware listing. Entries the caller cannot read are
    /// hidden, not errored.
    pub async fn list(
        &self,
        path: &str,
        ctx: &OperationContext,
        recursive: bool,
        details: bool,
        limit: usize,
        cursor: Option<String>,
    ) -> Result<(Vec<ListEntry>, Option<String>)> {
        let path = validate_path(path)?;

        if limit == 0 {
            return Ok((Vec::new(), None));
        }

        let explicit = self.meta.get(&path).await?;
        let implicit = self.meta.is_implicit_directory(&path).await?;
        if path != "/" && explicit.as_ref().map(|m| !m.is_directory).unwrap_or(!implicit) {
            if explicit.is_none() {
                return Err(NexusError::not_found(&path));
            }
            return Err(NexusError::invalid(format!("{path} is not a directory")));
        }

        let page = self.meta.list(&path, recursive, limit, cursor).await?;

        let mut entries = Vec::new();
        for dir in &page.directories {
            let full = if path == "/" {
                format!("/{dir}")
            } else {
                format!("{path}/{dir}")
            };
            entries.push(ListEntry {
                name: format!("{dir}/"),
                path: full,
                is_directory: true,
                metadata: None,
            });
        }
        for meta in page.entries {
            if self
                .perms
                .check(Some(&meta), &meta.path, Permission::Read, ctx)
                .is_err()
            {
                continue;
            }
            let name = meta
                .path
                .rsplit('/')
                .next()
                .unwrap_or(&meta.path)
                .to_string();
            entries.push(ListEntry {
                name: if meta.is_directory {
                    format!("{name}/")
                } else {
                    name
                },
                path: meta.path.clone(),
                is_directory: meta.is_directory,
                metadata: if details { Some(meta) } else { None },
            });
        }

        let revision = self.meta.zone_revision(&ctx.zone).await.unwrap_or(0);
        ctx.track(ResourceType::Directory, &path, revision, AccessType::List);
        Ok((entries, page.next_cursor))
    }

    /// Glob over the tree: the pattern is converted to a prefix scan plus
    /// an anchored regex filter on the paginated listing.
    pub async fn glob(
        &self,
        pattern: &str,
        path: &str,
        ctx: &OperationContext,
    ) -> Result<Vec<String>> {
        let base = validate_path(path)?;
        let absolute = if pattern.starts_with('/') {
            pattern.to_string()
        } else if base == "/" {
            format!("/{pattern}")
        } else {
            format!("{base}/{pattern}")
        };
        let re = glob_to_regex(&absolute)?;

        let mut out = Vec::new();
        let mut cursor = None;
        loop {
            let page = self.meta.list(&base, true, 1000, cursor).await?;
            for meta in &page.entries {
                if !re.is_match(&meta.path) {
                    continue;
                }
                if self
                    .perms
                    .check(Some(meta), &meta.path, Permission::Read, ctx)
                    .is_ok()
                {
                    out.push(meta.path.clone());
                }
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        let revision = self.meta.zone_revision(&ctx.zone).await.unwrap_or(0);
        ctx.track(ResourceType::Directory, &base, revision, AccessType::List);
        out.sort();
        Ok(out)
    }

    /// Walk matching files and apply a regex, honoring `max_results`.
    #[allow(clippy::too_many_arguments)]
    pub async fn grep(
        &self,
        pattern: &str,
        path: &str,
        ctx: &OperationContext,
        file_pattern: Option<&str>,
        ignore_case: bool,
        max_results: usize,
        search_mode: SearchMode,
    ) -> Result<Vec<GrepMatch>> {
        let base = validate_path(path)?;
        let re = regex::RegexBuilder::new(pattern)
            .case_insensitive(ignore_case)
            .build()
            .map_err(|e| NexusError::invalid(format!("bad pattern: {e}")))?;
        let file_re = match file_pattern {
            Some(glob) => Some(glob_to_regex(&format!("**/{glob}"))?),
            None => None,
        };

        let mut matches: Vec<GrepMatch> = Vec::new();
        let mut seen_files: HashSet<String> = HashSet::new();
        let mut cursor = None;

        'outer: loop {
            let page = self.meta.list(&base, true, 500, cursor).await?;
            for meta in &page.entries {
                if meta.is_directory {
                    continue;
                }
                if let Some(file_re) = &file_re {
                    if !file_re.is_match(&meta.path) {
                        continue;
                    }
                }
                if self
                    .perms
                    .check(Some(meta), &meta.path, Permission::Read, ctx)
                    .is_err()
                {
                    continue;
                }

                let (backend, _) = self.router.resolve(&meta.path)?;
                let bytes = match self.fetch_content(&backend, &meta.path, &meta.etag).await {
                    Ok(bytes) => bytes,
                    Err(_) => continue,
                };
                if bytes.contains(&0) {
                    continue;
                }
                let Ok(text) = String::from_utf8(bytes) else {
                    continue;
                };

                for (index, line) in text.lines().enumerate() {
                    if !re.is_match(line) {
                        continue;
                    }
                    match search_mode {
                        SearchMode::Files => {
                            if seen_files.insert(meta.path.clone()) {
                                matches.push(GrepMatch {
                                    path: meta.path.clone(),
                                    line_number: index + 1,
                                    line: String::new(),
                                });
                            }
                            break;
                        }
                        SearchMode::Content => {
                            matches.push(GrepMatch {
                                path: meta.path.clone(),
                                line_number: index + 1,
                                line: line.to_string(),
                            });
                        }
                    }
                    if matches.len() >= max_results {
                        break 'outer;
                    }
                }
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        Ok(matches)
    }

    // === Permission administration ===

    async fn stat_for_owner_change(
        &self,
        path: &str,
        ctx: &OperationContext,
    ) -> Result<FileMetadata> {
        let meta = self
            .meta
            .get(path)
            .await?
            .ok_or_else(|| NexusError::not_found(path))?;
        self.perms.check_owner(&meta, ctx)?;
        Ok(meta)
    }

    pub async fn chmod(&self, path: &str, mode: u32, ctx: &OperationContext) -> Result<()> {
        let path = validate_path(path)?;
        if mode > 0o777 {
            return Err(NexusError::invalid(format!("bad mode {mode:o}")));
        }
        let mut meta = self.stat_for_owner_change(&path, ctx).await?;
        meta.mode = mode;
        self.commit_admin_change(meta, &path, &ctx.zone, "chmod").await
    }

    pub async fn chown(&self, path: &str, owner: &str, ctx: &OperationContext) -> Result<()> {
        let path = validate_path(path)?;
        let mut meta = self.stat_for_owner_change(&path, ctx).await?;
        meta.owner = owner.to_string();
        self.commit_admin_change(meta, &path, &ctx.zone, "chown").await
    }

    pub async fn chgrp(&self, path: &str, group: &str, ctx: &OperationContext) -> Result<()> {
        let path = validate_path(path)?;
        let mut meta = self.stat_for_owner_change(&path, ctx).await?;
        meta.group = group.to_string();
        self.commit_admin_change(meta, &path, &ctx.zone, "chgrp").await
    }

    async fn commit_admin_change(
        &self,
        mut meta: FileMetadata,
        path: &str,
        zone: &str,
        reason: &str,
    ) -> Result<()> {
        meta.modified_at = nexus_meta::now_millis();
        let mut put = MetadataPut::new(meta);
        put.change_reason = Some(reason.to_string());
        let (_, revision) = self.meta.put(put).await?;
        self.events
            .publish(ChangeEvent::new(EventKind::FileWrite, path, revision, zone))
            .await?;
        Ok(())
    }

    pub async fn grant_user(
        &self,
        path: &str,
        user: &str,
        permissions: &str,
        ctx: &OperationContext,
    ) -> Result<()> {
        self.upsert_acl(path, "user", user, permissions, false, ctx).await
    }

    pub async fn grant_group(
        &self,
        path: &str,
        group: &str,
        permissions: &str,
        ctx: &OperationContext,
    ) -> Result<()> {
        self.upsert_acl(path, "group", group, permissions, false, ctx).await
    }

    /// Deny entries take precedence over every other grant.
    pub async fn deny_user(&self, path: &str, user: &str, ctx: &OperationContext) -> Result<()> {
        self.upsert_acl(path, "user", user, "---", true, ctx).await
    }

    async fn upsert_acl(
        &self,
        path: &str,
        entry_type: &str,
        identifier: &str,
        permissions: &str,
        deny: bool,
        ctx: &OperationContext,
    ) -> Result<()> {
        let path = validate_path(path)?;
        validate_rwx(permissions)?;
        let mut meta = self.stat_for_owner_change(&path, ctx).await?;

        meta.acl
            .retain(|e| !(e.entry_type == entry_type && e.identifier == identifier));
        meta.acl.push(nexus_meta::AclEntry {
            entry_type: entry_type.to_string(),
            identifier: identifier.to_string(),
            permissions: permissions.to_string(),
            deny,
        });
        self.commit_admin_change(meta, &path, &ctx.zone, "acl").await
    }

    pub async fn revoke_acl(
        &self,
        path: &str,
        entry_type: &str,
        identifier: &str,
        ctx: &OperationContext,
    ) -> Result<()> {
        if entry_type != "user" && entry_type != "group" {
            return Err(NexusError::invalid(format!(
                "entry_type must be 'user' or 'group', got '{entry_type}'"
            )));
        }
        let path = validate_path(path)?;
        let mut meta = self.stat_for_owner_change(&path, ctx).await?;
        meta.acl
            .retain(|e| !(e.entry_type == entry_type && e.identifier == identifier));
        self.commit_admin_change(meta, &path, &ctx.zone, "acl").await
    }

    pub async fn get_acl(
        &self,
        path: &str,
        ctx: &OperationContext,
    ) -> Result<Vec<nexus_meta::AclEntry>> {
        let path = validate_path(path)?;
        let meta = self
            .meta
            .get(&path)
            .await?
            .ok_or_else(|| NexusError::not_found(&path))?;
        self.perms.check(Some(&meta), &path, Permission::Read, ctx)?;
        Ok(meta.acl)
    }

    // === Versions ===

    pub async fn list_versions(
        &self,
        path: &str,
        ctx: &OperationContext,
    ) -> Result<Vec<VersionRecord>> {
        let path = validate_path(path)?;
        if let Some(meta) = self.meta.get(&path).await? {
            self.perms.check(Some(&meta), &path, Permission::Read, ctx)?;
        }
        Ok(self.meta.list_versions(&path).await?)
    }

    /// Content of a specific version.
    pub async fn get_version(
        &self,
        path: &str,
        version: u64,
        ctx: &OperationContext,
    ) -> Result<(VersionRecord, Vec<u8>)> {
        let path = validate_path(path)?;
        if let Some(meta) = self.meta.get(&path).await? {
            self.perms.check(Some(&meta), &path, Permission::Read, ctx)?;
        }
        let record = self.meta.get_version(&path, version).await?;
        let (backend, _) = self.router.resolve(&path)?;
        let bytes = self.fetch_content(&backend, &path, &record.etag).await?;
        Ok((record, bytes))
    }

    /// Restore an earlier version as a new version; history is kept.
    pub async fn rollback(
        &self,
        path: &str,
        version: u64,
        ctx: &OperationContext,
    ) -> Result<WriteResult> {
        let path = validate_path(path)?;
        let (backend, physical) = self.router.resolve(&path)?;

        let meta = self
            .meta
            .get(&path)
            .await?
            .ok_or_else(|| NexusError::not_found(&path))?;
        self.perms.check(Some(&meta), &path, Permission::Write, ctx)?;

        let (stored, revision) = self.meta.rollback(&path, version).await?;

        // Re-point the pointer at the restored content
        let bytes = self.fetch_content(&backend, &path, &stored.etag).await?;
        {
            let backend = backend.clone();
            tokio::task::spawn_blocking(move || backend.write_content(&bytes, Some(&physical)))
                .await
                .expect("pointer update task panicked")?;
        }

        self.events
            .publish(ChangeEvent::new(EventKind::FileWrite, &path, revision, &ctx.zone))
            .await?;

        Ok(WriteResult {
            path: stored.path,
            etag: stored.etag,
            version: stored.version,
            revision,
            size: stored.size,
        })
    }

    pub async fn diff_versions(
        &self,
        path: &str,
        from: u64,
        to: u64,
        ctx: &OperationContext,
    ) -> Result<VersionDiff> {
        let path = validate_path(path)?;
        if let Some(meta) = self.meta.get(&path).await? {
            self.perms.check(Some(&meta), &path, Permission::Read, ctx)?;
        }
        Ok(self.meta.diff_versions(&path, from, to).await?)
    }

    // === ReBAC admin surface ===

    pub async fn rebac_write(
        &self,
        subject: Entity,
        relation: &str,
        object: Entity,
        ctx: &OperationContext,
        expires_at_ms: Option<u64>,
    ) -> Result<u64> {
        Ok(self
            .rebac
            .write(subject, relation, object, &ctx.zone, expires_at_ms, None, None)?)
    }

    pub async fn rebac_check(
        &self,
        subject: &Entity,
        permission: &str,
        object: &Entity,
        ctx: &OperationContext,
    ) -> Result<bool> {
        Ok(self.rebac.check(subject, permission, object, &ctx.zone))
    }

    pub async fn rebac_expand(
        &self,
        permission: &str,
        object: &Entity,
        ctx: &OperationContext,
    ) -> Result<Vec<Entity>> {
        let mut out: Vec<Entity> = self
            .rebac
            .expand(permission, object, &ctx.zone)
            .into_iter()
            .collect();
        out.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(out)
    }

    pub async fn rebac_delete(
        &self,
        subject: &Entity,
        relation: &str,
        object: &Entity,
        ctx: &OperationContext,
    ) -> Result<usize> {
        Ok(self.rebac.delete(subject, relation, object, &ctx.zone))
    }

    /// Grant on a directory: recorded, tuple written, bitmap expansion
    /// kicked off in the background.
    pub async fn grant_directory(
        &self,
        subject: Entity,
        relation: &str,
        dir_path: &str,
        ctx: &OperationContext,
    ) -> Result<u64> {
        let dir = validate_path(dir_path)?;
        Ok(self.grants.grant(subject, relation, &dir, &ctx.zone).await?)
    }

    // === Read-set integration ===

    /// Queries whose read sets overlap a write at `path`.
    pub fn affected_queries(
        &self,
        path: &str,
        revision: u64,
        zone: Option<&str>,
    ) -> HashSet<String> {
        self.read_sets.get_affected_queries(path, revision, zone)
    }
}

fn validate_rwx(permissions: &str) -> Result<()> {
    let bytes = permissions.as_bytes();
    if bytes.len() != 3
        || !matches!(bytes[0], b'r' | b'-')
        || !matches!(bytes[1], b'w' | b'-')
        || !matches!(bytes[2], b'x' | b'-')
    {
        return Err(NexusError::invalid(format!(
            "permissions must be rwx form, got '{permissions}'"
        )));
    }
    Ok(())
}

fn guess_mime(path: &str) -> Option<String> {
    let ext = path.rsplit('.').next()?;
    let mime = match ext {
        "txt" => "text/plain",
        "md" => "text/markdown",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "csv" => "text/csv",
        "json" => "application/json",
        "yaml" | "yml" => "application/yaml",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        _ => return None,
    };
    Some(mime.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rwx_validation() {
        assert!(validate_rwx("rw-").is_ok());
        assert!(validate_rwx("---").is_ok());
        assert!(validate_rwx("rwx").is_ok());
        assert!(validate_rwx("rw").is_err());
        assert!(validate_rwx("abc").is_err());
    }

    #[test]
    fn mime_guessing() {
        assert_eq!(guess_mime("/a/b.json").as_deref(), Some("application/json"));
        assert_eq!(guess_mime("/a/b.unknownext"), None);
    }
}
