//! Explicit RPC method registry: `name → handler(params, context)`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use nexus_cas::PassthroughBackend;
use nexus_core::{NexusError, NexusFs, OperationContext, Result, SearchMode, WriteOptions};
use nexus_rebac::Entity;

pub struct AppState {
    pub fs: Arc<NexusFs>,
    pub backend: Arc<PassthroughBackend>,
    pub started_at: Instant,
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;
type Handler = fn(Arc<AppState>, Value, OperationContext) -> HandlerFuture;

pub struct MethodRegistry {
    methods: HashMap<&'static str, Handler>,
}

fn params<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| NexusError::invalid(format!("bad params: {e}")))
}

/// Content rides as UTF-8 in `content` or hex in `content_hex`.
fn decode_content(content: Option<String>, content_hex: Option<String>) -> Result<Vec<u8>> {
    match (content, content_hex) {
        (Some(text), None) => Ok(text.into_bytes()),
        (None, Some(hexed)) => {
            hex::decode(hexed).map_err(|e| NexusError::invalid(format!("bad content_hex: {e}")))
        }
        (None, None) => Ok(Vec::new()),
        (Some(_), Some(_)) => Err(NexusError::invalid(
            "provide content or content_hex, not both",
        )),
    }
}

fn encode_content(bytes: &[u8]) -> Value {
    match std::str::from_utf8(bytes) {
        Ok(text) => json!({ "content": text }),
        Err(_) => json!({ "content_hex": hex::encode(bytes) }),
    }
}

fn entity(value: &str) -> Result<Entity> {
    match value.split_once(':') {
        Some((entity_type, id)) if !entity_type.is_empty() && !id.is_empty() => {
            Ok(Entity::new(entity_type, id))
        }
        _ => Err(NexusError::invalid(format!(
            "entity must be '<type>:<id>', got '{value}'"
        ))),
    }
}

macro_rules! to_value {
    ($expr:expr) => {
        serde_json::to_value($expr).map_err(|e| NexusError::Internal(e.to_string()))
    };
}

// === File operations ===

fn h_read(state: Arc<AppState>, raw: Value, ctx: OperationContext) -> HandlerFuture {
    Box::pin(async move {
        #[derive(Deserialize)]
        struct P {
            path: String,
            #[serde(default)]
            return_metadata: bool,
        }
        let p: P = params(raw)?;
        let (bytes, meta) = state.fs.read_with_metadata(&p.path, &ctx).await?;
        let mut out = encode_content(&bytes);
        if p.return_metadata {
            out["metadata"] = to_value!(meta)?;
        }
        Ok(out)
    })
}

fn h_write(state: Arc<AppState>, raw: Value, ctx: OperationContext) -> HandlerFuture {
    Box::pin(async move {
        #[derive(Deserialize)]
        struct P {
            path: String,
            #[serde(default)]
            content: Option<String>,
            #[serde(default)]
            content_hex: Option<String>,
            #[serde(default)]
            if_match: Option<String>,
            #[serde(default)]
            if_none_match: bool,
            #[serde(default)]
            force: bool,
            #[serde(default)]
            lock: bool,
            #[serde(default)]
            lock_timeout_ms: Option<u64>,
        }
        let p: P = params(raw)?;
        let bytes = decode_content(p.content, p.content_hex)?;
        let opts = WriteOptions {
            if_match: p.if_match,
            if_none_match: p.if_none_match,
            force: p.force,
            lock: p.lock,
            lock_timeout: p.lock_timeout_ms.map(Duration::from_millis),
        };
        let result = state.fs.write(&p.path, &bytes, &ctx, opts).await?;
        to_value!(result)
    })
}

fn h_write_batch(state: Arc<AppState>, raw: Value, ctx: OperationContext) -> HandlerFuture {
    Box::pin(async move {
        #[derive(Deserialize)]
        struct Item {
            path: String,
            #[serde(default)]
            content: Option<String>,
            #[serde(default)]
            content_hex: Option<String>,
        }
        #[derive(Deserialize)]
        struct P {
            items: Vec<Item>,
        }
        let p: P = params(raw)?;
        let mut items = Vec::with_capacity(p.items.len());
        for item in p.items {
            items.push((item.path, decode_content(item.content, item.content_hex)?));
        }
        let results = state.fs.write_batch(items, &ctx).await?;
        to_value!(results)
    })
}

fn h_delete(state: Arc<AppState>, raw: Value, ctx: OperationContext) -> HandlerFuture {
    Box::pin(async move {
        #[derive(Deserialize)]
        struct P {
            path: String,
        }
        let p: P = params(raw)?;
        state.fs.delete(&p.path, &ctx).await?;
        Ok(json!({ "deleted": true }))
    })
}

fn h_rename(state: Arc<AppState>, raw: Value, ctx: OperationContext) -> HandlerFuture {
    Box::pin(async move {
        #[derive(Deserialize)]
        struct P {
            old_path: String,
            new_path: String,
        }
        let p: P = params(raw)?;
        let result = state.fs.rename(&p.old_path, &p.new_path, &ctx).await?;
        to_value!(result)
    })
}

fn h_copy(state: Arc<AppState>, raw: Value, ctx: OperationContext) -> HandlerFuture {
    Box::pin(async move {
        #[derive(Deserialize)]
        struct P {
            src: String,
            dst: String,
        }
        let p: P = params(raw)?;
        let result = state.fs.copy(&p.src, &p.dst, &ctx).await?;
        to_value!(result)
    })
}

fn h_list(state: Arc<AppState>, raw: Value, ctx: OperationContext) -> HandlerFuture {
    Box::pin(async move {
        #[derive(Deserialize)]
        struct P {
            path: String,
            #[serde(default)]
            recursive: bool,
            #[serde(default)]
            details: bool,
            #[serde(default = "default_limit")]
            limit: usize,
            #[serde(default)]
            cursor: Option<String>,
        }
        fn default_limit() -> usize {
            1000
        }
        let p: P = params(raw)?;
        let (entries, cursor) = state
            .fs
            .list(&p.path, &ctx, p.recursive, p.details, p.limit, p.cursor)
            .await?;
        Ok(json!({ "entries": to_value!(entries)?, "cursor": cursor }))
    })
}

fn h_glob(state: Arc<AppState>, raw: Value, ctx: OperationContext) -> HandlerFuture {
    Box::pin(async move {
        #[derive(Deserialize)]
        struct P {
            pattern: String,
            #[serde(default = "default_root")]
            path: String,
        }
        fn default_root() -> String {
            "/".to_string()
        }
        let p: P = params(raw)?;
        let paths = state.fs.glob(&p.pattern, &p.path, &ctx).await?;
        Ok(json!({ "paths": paths }))
    })
}

fn h_grep(state: Arc<AppState>, raw: Value, ctx: OperationContext) -> HandlerFuture {
    Box::pin(async move {
        #[derive(Deserialize)]
        struct P {
            pattern: String,
            #[serde(default = "default_root")]
            path: String,
            #[serde(default)]
            file_pattern: Option<String>,
            #[serde(default)]
            ignore_case: bool,
            #[serde(default = "default_max")]
            max_results: usize,
            #[serde(default)]
            search_mode: Option<SearchMode>,
        }
        fn default_root() -> String {
            "/".to_string()
        }
        fn default_max() -> usize {
            100
        }
        let p: P = params(raw)?;
        let matches = state
            .fs
            .grep(
                &p.pattern,
                &p.path,
                &ctx,
                p.file_pattern.as_deref(),
                p.ignore_case,
                p.max_results,
                p.search_mode.unwrap_or(SearchMode::Content),
            )
            .await?;
        to_value!(matches)
    })
}

fn h_mkdir(state: Arc<AppState>, raw: Value, ctx: OperationContext) -> HandlerFuture {
    Box::pin(async move {
        #[derive(Deserialize)]
        struct P {
            path: String,
            #[serde(default)]
            parents: bool,
            #[serde(default)]
            exist_ok: bool,
        }
        let p: P = params(raw)?;
        state.fs.mkdir(&p.path, &ctx, p.parents, p.exist_ok).await?;
        Ok(json!({ "created": true }))
    })
}

fn h_rmdir(state: Arc<AppState>, raw: Value, ctx: OperationContext) -> HandlerFuture {
    Box::pin(async move {
        #[derive(Deserialize)]
        struct P {
            path: String,
            #[serde(default)]
            recursive: bool,
        }
        let p: P = params(raw)?;
        state.fs.rmdir(&p.path, &ctx, p.recursive).await?;
        Ok(json!({ "removed": true }))
    })
}

fn h_exists(state: Arc<AppState>, raw: Value, ctx: OperationContext) -> HandlerFuture {
    Box::pin(async move {
        #[derive(Deserialize)]
        struct P {
            path: String,
        }
        let p: P = params(raw)?;
        Ok(json!({ "exists": state.fs.exists(&p.path, &ctx).await? }))
    })
}

fn h_stat(state: Arc<AppState>, raw: Value, ctx: OperationContext) -> HandlerFuture {
    Box::pin(async move {
        #[derive(Deserialize)]
        struct P {
            path: String,
        }
        let p: P = params(raw)?;
        to_value!(state.fs.stat(&p.path, &ctx).await?)
    })
}

// === Permission administration ===

fn h_chmod(state: Arc<AppState>, raw: Value, ctx: OperationContext) -> HandlerFuture {
    Box::pin(async move {
        #[derive(Deserialize)]
        struct P {
            path: String,
            mode: Value,
        }
        let p: P = params(raw)?;
        let mode = parse_mode(&p.mode)?;
        state.fs.chmod(&p.path, mode, &ctx).await?;
        Ok(json!({ "mode": format!("{mode:o}") }))
    })
}

/// Modes arrive as an integer (`420`), an octal string (`"644"`), or the
/// symbolic form (`"rw-r--r--"`).
fn parse_mode(value: &Value) -> Result<u32> {
    if let Some(n) = value.as_u64() {
        return Ok(n as u32);
    }
    let Some(text) = value.as_str() else {
        return Err(NexusError::invalid("mode must be int or string"));
    };
    if text.len() == 9 && text.bytes().all(|b| matches!(b, b'r' | b'w' | b'x' | b'-')) {
        let mut mode = 0u32;
        for (i, b) in text.bytes().enumerate() {
            if b != b'-' {
                mode |= 1 << (8 - i);
            }
        }
        return Ok(mode);
    }
    u32::from_str_radix(text, 8).map_err(|_| NexusError::invalid(format!("bad mode '{text}'")))
}

fn h_chown(state: Arc<AppState>, raw: Value, ctx: OperationContext) -> HandlerFuture {
    Box::pin(async move {
        #[derive(Deserialize)]
        struct P {
            path: String,
            owner: String,
        }
        let p: P = params(raw)?;
        state.fs.chown(&p.path, &p.owner, &ctx).await?;
        Ok(json!({ "owner": p.owner }))
    })
}

fn h_chgrp(state: Arc<AppState>, raw: Value, ctx: OperationContext) -> HandlerFuture {
    Box::pin(async move {
        #[derive(Deserialize)]
        struct P {
            path: String,
            group: String,
        }
        let p: P = params(raw)?;
        state.fs.chgrp(&p.path, &p.group, &ctx).await?;
        Ok(json!({ "group": p.group }))
    })
}

fn h_grant_user(state: Arc<AppState>, raw: Value, ctx: OperationContext) -> HandlerFuture {
    Box::pin(async move {
        #[derive(Deserialize)]
        struct P {
            path: String,
            user: String,
            permissions: String,
        }
        let p: P = params(raw)?;
        state.fs.grant_user(&p.path, &p.user, &p.permissions, &ctx).await?;
        Ok(json!({ "granted": true }))
    })
}

fn h_grant_group(state: Arc<AppState>, raw: Value, ctx: OperationContext) -> HandlerFuture {
    Box::pin(async move {
        #[derive(Deserialize)]
        struct P {
            path: String,
            group: String,
            permissions: String,
        }
        let p: P = params(raw)?;
        state
            .fs
            .grant_group(&p.path, &p.group, &p.permissions, &ctx)
            .await?;
        Ok(json!({ "granted": true }))
    })
}

fn h_deny_user(state: Arc<AppState>, raw: Value, ctx: OperationContext) -> HandlerFuture {
    Box::pin(async move {
        #[derive(Deserialize)]
        struct P {
            path: String,
            user: String,
        }
        let p: P = params(raw)?;
        state.fs.deny_user(&p.path, &p.user, &ctx).await?;
        Ok(json!({ "denied": true }))
    })
}

fn h_revoke_acl(state: Arc<AppState>, raw: Value, ctx: OperationContext) -> HandlerFuture {
    Box::pin(async move {
        #[derive(Deserialize)]
        struct P {
            path: String,
            entry_type: String,
            identifier: String,
        }
        let p: P = params(raw)?;
        state
            .fs
            .revoke_acl(&p.path, &p.entry_type, &p.identifier, &ctx)
            .await?;
        Ok(json!({ "revoked": true }))
    })
}

fn h_get_acl(state: Arc<AppState>, raw: Value, ctx: OperationContext) -> HandlerFuture {
    Box::pin(async move {
        #[derive(Deserialize)]
        struct P {
            path: String,
        }
        let p: P = params(raw)?;
        to_value!(state.fs.get_acl(&p.path, &ctx).await?)
    })
}

// === Versions ===

fn h_list_versions(state: Arc<AppState>, raw: Value, ctx: OperationContext) -> HandlerFuture {
    Box::pin(async move {
        #[derive(Deserialize)]
        struct P {
            path: String,
        }
        let p: P = params(raw)?;
        to_value!(state.fs.list_versions(&p.path, &ctx).await?)
    })
}

fn h_get_version(state: Arc<AppState>, raw: Value, ctx: OperationContext) -> HandlerFuture {
    Box::pin(async move {
        #[derive(Deserialize)]
        struct P {
            path: String,
            version: u64,
        }
        let p: P = params(raw)?;
        let (record, bytes) = state.fs.get_version(&p.path, p.version, &ctx).await?;
        let mut out = encode_content(&bytes);
        out["record"] = to_value!(record)?;
        Ok(out)
    })
}

fn h_rollback(state: Arc<AppState>, raw: Value, ctx: OperationContext) -> HandlerFuture {
    Box::pin(async move {
        #[derive(Deserialize)]
        struct P {
            path: String,
            version: u64,
        }
        let p: P = params(raw)?;
        to_value!(state.fs.rollback(&p.path, p.version, &ctx).await?)
    })
}

fn h_diff_versions(state: Arc<AppState>, raw: Value, ctx: OperationContext) -> HandlerFuture {
    Box::pin(async move {
        #[derive(Deserialize)]
        struct P {
            path: String,
            from: u64,
            to: u64,
        }
        let p: P = params(raw)?;
        to_value!(state.fs.diff_versions(&p.path, p.from, p.to, &ctx).await?)
    })
}

// === ReBAC administration ===

fn h_rebac_write(state: Arc<AppState>, raw: Value, ctx: OperationContext) -> HandlerFuture {
    Box::pin(async move {
        #[derive(Deserialize)]
        struct P {
            subject: String,
            relation: String,
            object: String,
            #[serde(default)]
            expires_at_ms: Option<u64>,
        }
        let p: P = params(raw)?;
        let id = state
            .fs
            .rebac_write(entity(&p.subject)?, &p.relation, entity(&p.object)?, &ctx, p.expires_at_ms)
            .await?;
        Ok(json!({ "tuple_id": id }))
    })
}

fn h_rebac_check(state: Arc<AppState>, raw: Value, ctx: OperationContext) -> HandlerFuture {
    Box::pin(async move {
        #[derive(Deserialize)]
        struct P {
            subject: String,
            permission: String,
            object: String,
        }
        let p: P = params(raw)?;
        let allowed = state
            .fs
            .rebac_check(&entity(&p.subject)?, &p.permission, &entity(&p.object)?, &ctx)
            .await?;
        Ok(json!({ "allowed": allowed }))
    })
}

fn h_rebac_expand(state: Arc<AppState>, raw: Value, ctx: OperationContext) -> HandlerFuture {
    Box::pin(async move {
        #[derive(Deserialize)]
        struct P {
            permission: String,
            object: String,
        }
        let p: P = params(raw)?;
        let subjects = state
            .fs
            .rebac_expand(&p.permission, &entity(&p.object)?, &ctx)
            .await?;
        Ok(json!({
            "subjects": subjects.iter().map(|e| e.key()).collect::<Vec<_>>()
        }))
    })
}

fn h_rebac_delete(state: Arc<AppState>, raw: Value, ctx: OperationContext) -> HandlerFuture {
    Box::pin(async move {
        #[derive(Deserialize)]
        struct P {
            subject: String,
            relation: String,
            object: String,
        }
        let p: P = params(raw)?;
        let removed = state
            .fs
            .rebac_delete(&entity(&p.subject)?, &p.relation, &entity(&p.object)?, &ctx)
            .await?;
        Ok(json!({ "removed": removed }))
    })
}

fn h_grant_directory(state: Arc<AppState>, raw: Value, ctx: OperationContext) -> HandlerFuture {
    Box::pin(async move {
        #[derive(Deserialize)]
        struct P {
            subject: String,
            relation: String,
            path: String,
        }
        let p: P = params(raw)?;
        let grant_id = state
            .fs
            .grant_directory(entity(&p.subject)?, &p.relation, &p.path, &ctx)
            .await?;
        Ok(json!({ "grant_id": grant_id }))
    })
}

// === Events and locks ===

fn h_wait_for_changes(state: Arc<AppState>, raw: Value, ctx: OperationContext) -> HandlerFuture {
    Box::pin(async move {
        #[derive(Deserialize)]
        struct P {
            path: String,
            #[serde(default = "default_timeout_ms")]
            timeout_ms: u64,
            #[serde(default)]
            since_revision: u64,
        }
        fn default_timeout_ms() -> u64 {
            30_000
        }
        let p: P = params(raw)?;
        let event = state
            .fs
            .events()
            .wait_for_changes(
                &p.path,
                Duration::from_millis(p.timeout_ms),
                p.since_revision,
                &ctx.zone,
            )
            .await
            .map_err(NexusError::from)?;
        Ok(json!({ "event": to_value!(event)? }))
    })
}

fn h_lock(state: Arc<AppState>, raw: Value, _ctx: OperationContext) -> HandlerFuture {
    Box::pin(async move {
        #[derive(Deserialize)]
        struct P {
            path: String,
            #[serde(default = "default_timeout_ms")]
            timeout_ms: u64,
            #[serde(default = "default_ttl_ms")]
            ttl_ms: u64,
            #[serde(default = "default_holders")]
            max_holders: u32,
        }
        fn default_timeout_ms() -> u64 {
            30_000
        }
        fn default_ttl_ms() -> u64 {
            30_000
        }
        fn default_holders() -> u32 {
            1
        }
        let p: P = params(raw)?;
        let lock_id = state
            .fs
            .events()
            .lock(
                &p.path,
                Duration::from_millis(p.timeout_ms),
                Duration::from_millis(p.ttl_ms),
                p.max_holders,
            )
            .await
            .map_err(NexusError::from)?;
        Ok(json!({ "lock_id": lock_id }))
    })
}

fn h_extend_lock(state: Arc<AppState>, raw: Value, _ctx: OperationContext) -> HandlerFuture {
    Box::pin(async move {
        #[derive(Deserialize)]
        struct P {
            lock_id: String,
            path: String,
            #[serde(default = "default_ttl_ms")]
            ttl_ms: u64,
        }
        fn default_ttl_ms() -> u64 {
            30_000
        }
        let p: P = params(raw)?;
        let extended = state
            .fs
            .events()
            .extend_lock(&p.lock_id, &p.path, Duration::from_millis(p.ttl_ms))
            .await
            .map_err(NexusError::from)?;
        Ok(json!({ "extended": extended }))
    })
}

fn h_unlock(state: Arc<AppState>, raw: Value, _ctx: OperationContext) -> HandlerFuture {
    Box::pin(async move {
        #[derive(Deserialize)]
        struct P {
            lock_id: String,
            path: String,
        }
        let p: P = params(raw)?;
        let released = state
            .fs
            .events()
            .unlock(&p.lock_id, &p.path)
            .await
            .map_err(NexusError::from)?;
        Ok(json!({ "released": released }))
    })
}

// === Workspaces ===

fn h_register_workspace(state: Arc<AppState>, raw: Value, ctx: OperationContext) -> HandlerFuture {
    Box::pin(async move {
        #[derive(Deserialize)]
        struct P {
            name: String,
            root: String,
        }
        let p: P = params(raw)?;
        state.fs.register_workspace(&p.name, &p.root, &ctx).await?;
        Ok(json!({ "registered": true }))
    })
}

fn h_snapshot_workspace(state: Arc<AppState>, raw: Value, ctx: OperationContext) -> HandlerFuture {
    Box::pin(async move {
        #[derive(Deserialize)]
        struct P {
            name: String,
        }
        let p: P = params(raw)?;
        to_value!(state.fs.snapshot_workspace(&p.name, &ctx).await?)
    })
}

fn h_restore_workspace(state: Arc<AppState>, raw: Value, ctx: OperationContext) -> HandlerFuture {
    Box::pin(async move {
        #[derive(Deserialize)]
        struct P {
            name: String,
            snapshot_id: String,
        }
        let p: P = params(raw)?;
        let restored = state
            .fs
            .restore_workspace(&p.name, &p.snapshot_id, &ctx)
            .await?;
        Ok(json!({ "restored": restored }))
    })
}

fn h_list_snapshots(state: Arc<AppState>, raw: Value, ctx: OperationContext) -> HandlerFuture {
    Box::pin(async move {
        #[derive(Deserialize)]
        struct P {
            name: String,
        }
        let p: P = params(raw)?;
        to_value!(state.fs.list_snapshots(&p.name, &ctx).await?)
    })
}

// === Introspection ===

fn h_status(state: Arc<AppState>, _raw: Value, _ctx: OperationContext) -> HandlerFuture {
    Box::pin(async move {
        let cas = state.backend.stats().map_err(NexusError::from)?;
        let grants = state.fs.grants().metrics();
        let read_sets = state.fs.read_sets().stats();
        Ok(json!({
            "uptime_seconds": state.started_at.elapsed().as_secs(),
            "mounts": state.fs.router().mounts(),
            "cas": { "blob_count": cas.blob_count, "total_bytes": cas.total_bytes },
            "grants": to_value!(grants)?,
            "read_sets": to_value!(read_sets)?,
        }))
    })
}

impl MethodRegistry {
    pub fn new() -> Self {
        let mut methods: HashMap<&'static str, Handler> = HashMap::new();

        methods.insert("read", h_read);
        methods.insert("write", h_write);
        methods.insert("write_batch", h_write_batch);
        methods.insert("delete", h_delete);
        methods.insert("rename", h_rename);
        methods.insert("copy", h_copy);
        methods.insert("list", h_list);
        methods.insert("glob", h_glob);
        methods.insert("grep", h_grep);
        methods.insert("mkdir", h_mkdir);
        methods.insert("rmdir", h_rmdir);
        methods.insert("exists", h_exists);
        methods.insert("stat", h_stat);

        methods.insert("chmod", h_chmod);
        methods.insert("chown", h_chown);
        methods.insert("chgrp", h_chgrp);
        methods.insert("grant_user", h_grant_user);
        methods.insert("grant_group", h_grant_group);
        methods.insert("deny_user", h_deny_user);
        methods.insert("revoke_acl", h_revoke_acl);
        methods.insert("get_acl", h_get_acl);

        methods.insert("list_versions", h_list_versions);
        methods.insert("get_version", h_get_version);
        methods.insert("rollback", h_rollback);
        methods.insert("diff_versions", h_diff_versions);

        methods.insert("rebac_write", h_rebac_write);
        methods.insert("rebac_check", h_rebac_check);
        methods.insert("rebac_expand", h_rebac_expand);
        methods.insert("rebac_delete", h_rebac_delete);
        methods.insert("grant_directory", h_grant_directory);

        methods.insert("wait_for_changes", h_wait_for_changes);
        methods.insert("lock", h_lock);
        methods.insert("extend_lock", h_extend_lock);
        methods.insert("unlock", h_unlock);

        methods.insert("register_workspace", h_register_workspace);
        methods.insert("snapshot_workspace", h_snapshot_workspace);
        methods.insert("restore_workspace", h_restore_workspace);
        methods.insert("list_snapshots", h_list_snapshots);

        methods.insert("status", h_status);

        Self { methods }
    }

    pub fn method_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.methods.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub async fn dispatch(
        &self,
        state: Arc<AppState>,
        method: &str,
        params: Value,
        ctx: OperationContext,
    ) -> Result<Value> {
        match self.methods.get(method) {
            Some(handler) => handler(state, params, ctx).await,
            None => Err(NexusError::invalid(format!("unknown method '{method}'"))),
        }
    }
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn state() -> (TempDir, Arc<AppState>) {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(PassthroughBackend::new(temp.path().join("data")).unwrap());
        let store = Arc::new(
            nexus_meta::MetadataStore::open(temp.path().join("metadata")).unwrap(),
        );
        let fs = NexusFs::builder()
            .backend(backend.clone())
            .transport(Arc::new(nexus_meta::LocalLog::new(store)))
            .build()
            .unwrap();
        (
            temp,
            Arc::new(AppState {
                fs,
                backend,
                started_at: Instant::now(),
            }),
        )
    }

    fn ctx() -> OperationContext {
        OperationContext::user("alice", "default")
    }

    #[tokio::test]
    async fn write_then_read_via_registry() {
        let (_t, state) = state();
        let registry = MethodRegistry::new();

        let result = registry
            .dispatch(
                state.clone(),
                "write",
                json!({ "path": "/r.txt", "content": "over rpc" }),
                ctx(),
            )
            .await
            .unwrap();
        assert_eq!(result["version"], 1);

        let result = registry
            .dispatch(
                state,
                "read",
                json!({ "path": "/r.txt", "return_metadata": true }),
                ctx(),
            )
            .await
            .unwrap();
        assert_eq!(result["content"], "over rpc");
        assert_eq!(result["metadata"]["owner"], "alice");
    }

    #[tokio::test]
    async fn binary_content_rides_as_hex() {
        let (_t, state) = state();
        let registry = MethodRegistry::new();

        registry
            .dispatch(
                state.clone(),
                "write",
                json!({ "path": "/bin", "content_hex": "00ff10" }),
                ctx(),
            )
            .await
            .unwrap();

        let result = registry
            .dispatch(state, "read", json!({ "path": "/bin" }), ctx())
            .await
            .unwrap();
        assert_eq!(result["content_hex"], "00ff10");
    }

    #[tokio::test]
    async fn unknown_method_is_invalid_argument() {
        let (_t, state) = state();
        let registry = MethodRegistry::new();
        let err = registry
            .dispatch(state, "bogus", json!({}), ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, NexusError::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn rebac_round_trip_via_registry() {
        let (_t, state) = state();
        let registry = MethodRegistry::new();

        registry
            .dispatch(
                state.clone(),
                "rebac_write",
                json!({ "subject": "user:bob", "relation": "direct_viewer", "object": "file:/x" }),
                ctx(),
            )
            .await
            .unwrap();

        let result = registry
            .dispatch(
                state,
                "rebac_check",
                json!({ "subject": "user:bob", "permission": "read", "object": "file:/x" }),
                ctx(),
            )
            .await
            .unwrap();
        assert_eq!(result["allowed"], true);
    }

    #[test]
    fn mode_parsing_forms() {
        assert_eq!(parse_mode(&json!(0o644)).unwrap(), 0o644);
        assert_eq!(parse_mode(&json!("755")).unwrap(), 0o755);
        assert_eq!(parse_mode(&json!("rwxr-xr-x")).unwrap(), 0o755);
        assert_eq!(parse_mode(&json!("rw-r--r--")).unwrap(), 0o644);
        assert!(parse_mode(&json!("zzz")).is_err());
    }

    #[test]
    fn registry_lists_full_surface() {
        let registry = MethodRegistry::new();
        let names = registry.method_names();
        for required in [
            "read",
            "write",
            "rebac_check",
            "wait_for_changes",
            "lock",
            "unlock",
            "chmod",
            "status",
        ] {
            assert!(names.contains(&required), "missing {required}");
        }
    }
}
