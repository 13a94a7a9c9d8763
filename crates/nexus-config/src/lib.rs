//! # nexus-config
//!
//! Configuration management for the Nexus kernel.
//!
//! Loads configuration from:
//! 1. `~/.nexus/config.toml` (global)
//! 2. `.nexus/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)

pub mod logging;

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| {
    RwLock::new(Config::load().unwrap_or_else(|e| {
        eprintln!("[nexus-config] WARNING: failed to load config: {e}. Using defaults.");
        Config::default()
    }))
});

/// Get global config (read-only)
pub fn config() -> std::sync::RwLockReadGuard<'static, Config> {
    CONFIG.read().unwrap()
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    *CONFIG.write().unwrap() = new_config;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Current config schema version
pub const CONFIG_VERSION: u32 = 1;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub config_version: u32,
    pub storage: StorageConfig,
    pub daemon: DaemonConfig,
    pub version_gc: VersionGcConfig,
    pub rate_limit: RateLimitConfig,
    pub sentry: SentryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: CONFIG_VERSION,
            storage: StorageConfig::default(),
            daemon: DaemonConfig::default(),
            version_gc: VersionGcConfig::default(),
            rate_limit: RateLimitConfig::default(),
            sentry: SentryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Base directory holding `pointers/` and `cas/`.
    pub data_dir: PathBuf,
    /// Directory for the LMDB metadata environment.
    pub metadata_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".nexus");
        Self {
            data_dir: base.join("data"),
            metadata_dir: base.join("metadata"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Unix socket the RPC server listens on.
    pub socket: PathBuf,
    /// Default zone for requests that carry none.
    pub default_zone: String,
    pub debug: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket: PathBuf::from("/tmp/nexusd.sock"),
            default_zone: "default".to_string(),
            debug: false,
        }
    }
}

/// Version-history garbage collection knobs (`NEXUS_VERSION_GC_*`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VersionGcConfig {
    pub enabled: bool,
    pub retention_days: u32,
    pub max_versions: u32,
    pub interval_hours: u32,
    pub batch_size: usize,
}

impl Default for VersionGcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: 30,
            max_versions: 100,
            interval_hours: 24,
            batch_size: 1000,
        }
    }
}

/// Server-side rate limits (`NEXUS_RATE_LIMIT_*`), requests per minute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub anonymous_per_minute: u32,
    pub authenticated_per_minute: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            anonymous_per_minute: 60,
            authenticated_per_minute: 600,
        }
    }
}

/// Error-observer wiring (`NEXUS_SENTRY_*`). The observer itself is an
/// external collaborator; the kernel only parses and clamps these values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SentryConfig {
    pub dsn: Option<String>,
    pub environment: String,
    /// Clamped to [0.0, 1.0] on load.
    pub traces_sample_rate: f64,
    pub send_pii: bool,
}

impl Default for SentryConfig {
    fn default() -> Self {
        Self {
            dsn: None,
            environment: "development".to_string(),
            traces_sample_rate: 0.1,
            send_pii: false,
        }
    }
}

impl Config {
    /// Load config from standard locations (CWD-relative project config)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_for_project(Path::new("."))
    }

    /// Load config for a specific project root directory.
    /// Resolution order: global → project → env vars.
    pub fn load_for_project(project_root: &Path) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        // 1. Global config (~/.nexus/config.toml)
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("loading global config from {:?}", global_path);
                let contents = std::fs::read_to_string(&global_path)?;
                config = toml::from_str(&contents)?;
            }
        }

        // 2. Project config (<project_root>/.nexus/config.toml)
        let project_config_path = project_root.join(".nexus/config.toml");
        if project_config_path.exists() {
            debug!("loading project config from {:?}", project_config_path);
            let contents = std::fs::read_to_string(&project_config_path)?;
            let project_config: Config = toml::from_str(&contents)?;
            config.merge(project_config);
        }

        // 3. Environment variable overrides
        config.apply_env_overrides();

        // 4. Clamp values that must stay in range
        config.sentry.traces_sample_rate = config.sentry.traces_sample_rate.clamp(0.0, 1.0);

        // 5. Socket fallback: if the parent dir can't be created, use
        //    /tmp so daemon and clients resolve to the same socket.
        if let Some(parent) = config.daemon.socket.parent() {
            if !parent.as_os_str().is_empty()
                && !parent.exists()
                && std::fs::create_dir_all(parent).is_err()
            {
                debug!("socket directory {:?} unavailable, falling back to /tmp/nexusd.sock", parent);
                config.daemon.socket = PathBuf::from("/tmp/nexusd.sock");
            }
        }

        Ok(config)
    }

    /// Global config path: ~/.nexus/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".nexus/config.toml"))
    }

    /// Merge another config (project overrides global).
    /// Non-default values from `other` replace values in `self`.
    fn merge(&mut self, other: Config) {
        let default_storage = StorageConfig::default();
        if other.storage.data_dir != default_storage.data_dir {
            self.storage.data_dir = other.storage.data_dir;
        }
        if other.storage.metadata_dir != default_storage.metadata_dir {
            self.storage.metadata_dir = other.storage.metadata_dir;
        }

        let default_daemon = DaemonConfig::default();
        if other.daemon.socket != default_daemon.socket {
            self.daemon.socket = other.daemon.socket;
        }
        if other.daemon.default_zone != default_daemon.default_zone {
            self.daemon.default_zone = other.daemon.default_zone;
        }
        if other.daemon.debug != default_daemon.debug {
            self.daemon.debug = other.daemon.debug;
        }

        if other.version_gc != VersionGcConfig::default() {
            self.version_gc = other.version_gc;
        }
        if other.rate_limit != RateLimitConfig::default() {
            self.rate_limit = other.rate_limit;
        }
        if other.sentry != SentryConfig::default() {
            self.sentry = other.sentry;
        }
    }

    /// Apply environment variable overrides (highest priority)
    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("NEXUS_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("NEXUS_METADATA_DIR") {
            self.storage.metadata_dir = PathBuf::from(dir);
        }
        if let Ok(socket) = std::env::var("NEXUS_SOCKET") {
            self.daemon.socket = PathBuf::from(socket);
        }
        if let Ok(zone) = std::env::var("NEXUS_DEFAULT_ZONE") {
            self.daemon.default_zone = zone;
        }

        if let Some(enabled) = env_bool("NEXUS_VERSION_GC_ENABLED") {
            self.version_gc.enabled = enabled;
        }
        if let Some(days) = env_parse("NEXUS_VERSION_GC_RETENTION_DAYS") {
            self.version_gc.retention_days = days;
        }
        if let Some(max) = env_parse("NEXUS_VERSION_GC_MAX_VERSIONS") {
            self.version_gc.max_versions = max;
        }
        if let Some(hours) = env_parse("NEXUS_VERSION_GC_INTERVAL_HOURS") {
            self.version_gc.interval_hours = hours;
        }
        if let Some(batch) = env_parse("NEXUS_VERSION_GC_BATCH_SIZE") {
            self.version_gc.batch_size = batch;
        }

        if let Some(limit) = env_parse("NEXUS_RATE_LIMIT_ANON") {
            self.rate_limit.anonymous_per_minute = limit;
        }
        if let Some(limit) = env_parse("NEXUS_RATE_LIMIT_AUTH") {
            self.rate_limit.authenticated_per_minute = limit;
        }

        if let Ok(dsn) = std::env::var("NEXUS_SENTRY_DSN") {
            self.sentry.dsn = if dsn.is_empty() { None } else { Some(dsn) };
        }
        if let Ok(env) = std::env::var("NEXUS_SENTRY_ENVIRONMENT") {
            self.sentry.environment = env;
        }
        if let Some(rate) = env_parse::<f64>("NEXUS_SENTRY_TRACES_SAMPLE_RATE") {
            self.sentry.traces_sample_rate = rate;
        }
        if let Some(pii) = env_bool("NEXUS_SENTRY_SEND_PII") {
            self.sentry.send_pii = pii;
        }
    }
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert!(config.version_gc.enabled);
        assert_eq!(config.version_gc.retention_days, 30);
        assert_eq!(config.version_gc.max_versions, 100);
        assert_eq!(config.version_gc.interval_hours, 24);
        assert_eq!(config.version_gc.batch_size, 1000);
        assert!(config.sentry.dsn.is_none());
        assert!((0.0..=1.0).contains(&config.sentry.traces_sample_rate));
    }

    #[test]
    fn project_config_overrides_defaults() {
        let temp = tempfile::TempDir::new().unwrap();
        let nexus_dir = temp.path().join(".nexus");
        std::fs::create_dir_all(&nexus_dir).unwrap();
        std::fs::write(
            nexus_dir.join("config.toml"),
            r#"
[daemon]
default_zone = "acme"

[version_gc]
enabled = false
retention_days = 7
max_versions = 10
interval_hours = 1
batch_size = 50
"#,
        )
        .unwrap();

        let config = Config::load_for_project(temp.path()).unwrap();
        assert_eq!(config.daemon.default_zone, "acme");
        assert!(!config.version_gc.enabled);
        assert_eq!(config.version_gc.retention_days, 7);
    }

    #[test]
    fn sample_rate_is_clamped() {
        let temp = tempfile::TempDir::new().unwrap();
        let nexus_dir = temp.path().join(".nexus");
        std::fs::create_dir_all(&nexus_dir).unwrap();
        std::fs::write(
            nexus_dir.join("config.toml"),
            "[sentry]\ntraces_sample_rate = 3.5\n",
        )
        .unwrap();

        let config = Config::load_for_project(temp.path()).unwrap();
        assert_eq!(config.sentry.traces_sample_rate, 1.0);
    }
}
