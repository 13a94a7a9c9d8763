//! nexusd: RPC daemon exposing the Nexus kernel over a Unix socket.

mod auth;
mod ratelimit;
mod registry;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};

use nexus_cas::{Backend, PassthroughBackend};
use nexus_config::logging::{init_logging, LogLevel};
use nexus_config::Config;
use nexus_config::{log_daemon_debug, log_daemon_error, log_daemon_info, log_daemon_warn};
use nexus_core::{NexusError, NexusFs};
use nexus_ipc::{frame_async, FrameHeader, RpcRequest, RpcResponse};
use nexus_meta::{LocalLog, MetadataStore, VersionGc};

use auth::{AuthHeaders, Authenticator};
use ratelimit::RateLimiter;
use registry::{AppState, MethodRegistry};

/// Unreferenced blobs survive at least this long before a sweep removes
/// them.
const CAS_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);
const CAS_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Parser)]
#[command(name = "nexusd")]
#[command(version, about = "Nexus kernel daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Override the configured socket path
    #[arg(long)]
    socket: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (default)
    Start,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging(LogLevel::Info);
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Start) {
        Commands::Start => start_daemon(cli.socket).await,
    }
}

async fn start_daemon(socket_override: Option<std::path::PathBuf>) -> Result<()> {
    let config = Config::load().unwrap_or_else(|e| {
        log_daemon_warn!("config load failed, using defaults", error = e.to_string().as_str());
        Config::default()
    });
    let zone = config.daemon.default_zone.clone();

    if let Some(dsn) = &config.sentry.dsn {
        // The observer itself is wired by the deployment; expected error
        // kinds are filtered before anything would reach it.
        log_daemon_info!(
            "error observer configured",
            dsn = dsn.as_str(),
            environment = config.sentry.environment.as_str(),
            sample_rate = config.sentry.traces_sample_rate,
        );
    }

    let backend = Arc::new(
        PassthroughBackend::new(&config.storage.data_dir)
            .context("opening storage backend")?,
    );
    let store = Arc::new(
        MetadataStore::open(&config.storage.metadata_dir).context("opening metadata store")?,
    );
    let log = Arc::new(LocalLog::new(store.clone()));

    let fs: Arc<NexusFs> = NexusFs::builder()
        .backend(backend.clone())
        .transport(log)
        .default_zone(&zone)
        .build()
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    // Background maintenance: version-history GC and the CAS sweep that
    // reclaims blobs whose reference count reached zero.
    if config.version_gc.enabled {
        let _ = Arc::new(VersionGc::new(store.clone(), config.version_gc.clone())).spawn();
    }
    spawn_cas_sweep(backend.clone(), store.clone());

    fs.events().startup_sync(&zone).await;
    let _ = fs.events().start_invalidation_task(&zone);

    let state = Arc::new(AppState {
        fs,
        backend,
        started_at: Instant::now(),
    });
    let registry = Arc::new(MethodRegistry::new());
    // No auth provider configured here: open-access fallback per the
    // auth contract. Deployments plug a provider in.
    let authenticator = Arc::new(Authenticator::new(None, zone));
    let limiter = Arc::new(RateLimiter::new(&config.rate_limit));

    let socket_path = socket_override.unwrap_or(config.daemon.socket);
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)
            .with_context(|| format!("removing stale socket {socket_path:?}"))?;
    }
    let listener =
        UnixListener::bind(&socket_path).with_context(|| format!("binding {socket_path:?}"))?;
    let socket_display = socket_path.display().to_string();
    log_daemon_info!(
        "nexusd listening",
        socket = socket_display.as_str(),
        methods = registry.method_names().len(),
    );

    loop {
        let (stream, _) = listener.accept().await?;
        let state = state.clone();
        let registry = registry.clone();
        let authenticator = authenticator.clone();
        let limiter = limiter.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, state, registry, authenticator, limiter).await
            {
                log_daemon_debug!("connection closed", error = e.to_string().as_str());
            }
        });
    }
}

fn spawn_cas_sweep(backend: Arc<PassthroughBackend>, store: Arc<MetadataStore>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CAS_SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let backend = backend.clone();
            let store = store.clone();
            let result = tokio::task::spawn_blocking(move || {
                backend.gc_sweep(&|etag| store.is_referenced(etag), CAS_RETENTION)
            })
            .await;
            match result {
                Ok(Ok(removed)) if removed > 0 => {
                    log_daemon_info!("cas sweep reclaimed blobs", removed = removed)
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => log_daemon_warn!("cas sweep failed", error = e.to_string().as_str()),
                Err(e) => {
                    log_daemon_warn!("cas sweep task panicked", error = e.to_string().as_str())
                }
            }
        }
    });
}

async fn handle_connection(
    stream: UnixStream,
    state: Arc<AppState>,
    registry: Arc<MethodRegistry>,
    authenticator: Arc<Authenticator>,
    limiter: Arc<RateLimiter>,
) -> std::io::Result<()> {
    let (mut reader, mut writer) = stream.into_split();

    loop {
        let header = frame_async::read_header(&mut reader).await?;
        if frame_async::is_heartbeat(&header) {
            continue;
        }

        let mut payload = vec![0u8; header.length as usize];
        reader.read_exact(&mut payload).await?;

        let request: RpcRequest = match serde_json::from_slice(&payload) {
            Ok(request) => request,
            Err(e) => {
                let response = RpcResponse::err(
                    NexusError::invalid(format!("malformed request: {e}")).to_rpc_error(),
                );
                frame_async::send_response(&mut writer, &response, header.seq_id).await?;
                continue;
            }
        };

        let response = process(&state, &registry, &authenticator, &limiter, &request, &header).await;
        frame_async::send_response(&mut writer, &response, header.seq_id).await?;
    }
}

async fn process(
    state: &Arc<AppState>,
    registry: &MethodRegistry,
    authenticator: &Authenticator,
    limiter: &RateLimiter,
    request: &RpcRequest,
    header: &FrameHeader,
) -> RpcResponse {
    let headers: AuthHeaders = request
        .params
        .get("auth")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .unwrap_or_default()
        .unwrap_or_default();

    let ctx = match authenticator.authenticate(&headers) {
        Ok(ctx) => ctx,
        Err(e) => return respond(request, Err(e), header),
    };

    let authenticated = ctx.user != "anonymous";
    if !limiter.allow(&ctx.user, authenticated) {
        return respond(
            request,
            Err(NexusError::denied("rate limit exceeded")),
            header,
        );
    }

    let params = request.params.clone();
    let result = registry
        .dispatch(state.clone(), &request.method, params, ctx)
        .await;
    respond(request, result, header)
}

fn respond(
    request: &RpcRequest,
    result: nexus_core::Result<Value>,
    header: &FrameHeader,
) -> RpcResponse {
    let mut response = match result {
        Ok(value) => RpcResponse::ok(value),
        Err(e) => {
            if e.is_expected() {
                log_daemon_debug!(
                    "expected failure",
                    method = request.method.as_str(),
                    error = e.to_string().as_str(),
                );
            } else {
                // Unexpected kinds go to the error observer with a
                // correlation id; expected kinds were filtered above.
                log_daemon_error!(
                    "operation failed",
                    method = request.method.as_str(),
                    seq_id = header.seq_id,
                    request_id = request.request_id.as_deref().unwrap_or("-"),
                    error = e.to_string().as_str(),
                );
            }
            RpcResponse::err(e.to_rpc_error())
        }
    };
    response.request_id = request.request_id.clone();
    response
}
