//! Structured logging setup shared by all Nexus components.
//!
//! Filtering is driven by the `NEXUS_LOG` environment variable with the
//! usual `tracing_subscriber::EnvFilter` syntax, falling back to the level
//! passed by the caller.
//!
//! Events are tagged with a `component` field so operators can filter one
//! subsystem at a time:
//!
//! ```ignore
//! use nexus_config::{log_daemon_info, log_events_debug};
//!
//! log_daemon_info!("connection accepted", peer = "worker-7");
//! log_events_debug!("subscription opened", zone = "acme");
//! ```

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const DAEMON: &'static str = "DAEMON";
    pub const KERNEL: &'static str = "KERNEL";
    pub const EVENTS: &'static str = "EVENTS";
    pub const META: &'static str = "META";
    pub const CAS: &'static str = "CAS";
    pub const REBAC: &'static str = "REBAC";
}

// === DAEMON logging macros ===

#[macro_export]
macro_rules! log_daemon_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "DAEMON", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_daemon_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "DAEMON", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_daemon_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "DAEMON", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_daemon_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "DAEMON", $($key = $value,)* $msg)
    };
}

// === KERNEL logging macros ===

#[macro_export]
macro_rules! log_kernel_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "KERNEL", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_kernel_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "KERNEL", $($key = $value,)* $msg)
    };
}

// === EVENTS logging macros ===

#[macro_export]
macro_rules! log_events_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "EVENTS", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_events_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "EVENTS", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_events_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "EVENTS", $($key = $value,)* $msg)
    };
}

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Initialize logging with the given default level.
/// Call this once at application startup.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_env("NEXUS_LOG")
        .unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

/// Same as [`init_logging`] but safe to call repeatedly (tests).
pub fn try_init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_env("NEXUS_LOG")
        .unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init();
}
