//! Broker configuration.
//!
//! Layered lowest to highest: built-in defaults, an optional TOML file, then
//! `SSEHUB__SECTION__KEY` environment variables. CLI flags are applied on top
//! by the binary.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::store::{MemoryStore, SqliteStore, Store, StoreError};

pub const APP_NAME: &str = "ssehub";
pub const ENV_PREFIX: &str = "SSEHUB";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub hub: HubConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
}

// ============================================================================
// Server
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind: String,
    /// Port to listen on.
    pub port: u16,
    /// Header consulted for the client identifier when `uid` is absent from
    /// the query string.
    pub identifier_header: String,
    /// Extra headers added to every stream response.
    pub extra_headers: HashMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8686,
            identifier_header: "X-User-ID".to_string(),
            extra_headers: HashMap::new(),
        }
    }
}

// ============================================================================
// Hub
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Capacity of each client's outbound queue.
    pub buffer_size: usize,
    /// Capacity of the hub's delivery queue.
    pub delivery_queue_size: usize,
    /// Retry pool workers.
    pub workers: usize,
    /// Retry pool queue capacity.
    pub pool_queue_size: usize,
    /// Attempts made by the slow path before giving up.
    pub retry_attempts: u32,
    /// Deadline of a single slow-path attempt.
    pub retry_timeout_ms: u64,
    /// Idle time after which a heartbeat comment is written.
    pub heartbeat_interval_secs: u64,
    /// Replay missed events from the store when a client reconnects.
    pub resend: bool,
    /// Broadcast a `close` record on shutdown.
    pub notify_on_close: bool,
    /// How long shutdown waits for clients to acknowledge `close`.
    pub close_wait_ms: u64,
    /// Poll interval while waiting for acknowledgements.
    pub close_poll_ms: u64,
    /// Page size used when draining the store during replay.
    pub replay_page_size: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            buffer_size: 256,
            delivery_queue_size: 1024,
            workers: crate::pool::DEFAULT_WORKERS,
            pool_queue_size: crate::pool::DEFAULT_QUEUE_SIZE,
            retry_attempts: 3,
            retry_timeout_ms: 5_000,
            heartbeat_interval_secs: 30,
            resend: false,
            notify_on_close: true,
            close_wait_ms: 5_000,
            close_poll_ms: 100,
            replay_page_size: 100,
        }
    }
}

impl HubConfig {
    pub fn retry_timeout(&self) -> Duration {
        Duration::from_millis(self.retry_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn close_wait(&self) -> Duration {
        Duration::from_millis(self.close_wait_ms)
    }

    pub fn close_poll(&self) -> Duration {
        Duration::from_millis(self.close_poll_ms.max(1))
    }
}

// ============================================================================
// Store
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    None,
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Database file for the sqlite backend.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl StoreConfig {
    /// Open the configured store, if any.
    pub async fn open(&self) -> Result<Option<Arc<dyn Store>>, StoreError> {
        match self.backend {
            StoreBackend::None => Ok(None),
            StoreBackend::Memory => Ok(Some(Arc::new(MemoryStore::new()))),
            StoreBackend::Sqlite => {
                let path = self.path.clone().unwrap_or_else(default_database_path);
                Ok(Some(Arc::new(SqliteStore::open(&path).await?)))
            }
        }
    }
}

fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
        .join("events.db")
}

// ============================================================================
// Logging
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

/// Default config file location.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
        .join("config.toml")
}

/// Load configuration from `path` (optional file) and the environment.
pub fn load(path: &Path) -> Result<AppConfig> {
    let built = Config::builder()
        .add_source(
            File::from(path)
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("loading config from {}", path.display()))?;

    built
        .try_deserialize()
        .context("deserializing configuration")
}

/// Render a config as a commented TOML document.
pub fn to_toml(config: &AppConfig) -> Result<String> {
    let body = toml::to_string_pretty(config).context("serializing config to TOML")?;
    Ok(format!("# Configuration for {APP_NAME}\n\n{body}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_broker_constants() {
        let hub = HubConfig::default();
        assert_eq!(hub.workers, 10);
        assert_eq!(hub.pool_queue_size, 10_000);
        assert_eq!(hub.retry_attempts, 3);
        assert_eq!(hub.retry_timeout(), Duration::from_secs(5));
        assert_eq!(hub.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(hub.close_wait(), Duration::from_secs(5));
        assert_eq!(hub.close_poll(), Duration::from_millis(100));
        assert_eq!(hub.replay_page_size, 100);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.server.port, 8686);
        assert_eq!(config.store.backend, StoreBackend::None);
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[hub]\nresend = true\nbuffer_size = 8\n\n[store]\nbackend = \"memory\"\n\n[server.extra_headers]\nX-Frame = \"deny\""
        )
        .unwrap();

        let config = load(&path).unwrap();
        assert!(config.hub.resend);
        assert_eq!(config.hub.buffer_size, 8);
        assert_eq!(config.hub.delivery_queue_size, 1024);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(
            config.server.extra_headers.get("x-frame").or(config.server.extra_headers.get("X-Frame")),
            Some(&"deny".to_string())
        );
    }

    #[test]
    fn test_to_toml_round_trips_through_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = AppConfig::default();
        config.hub.heartbeat_interval_secs = 7;
        std::fs::write(&path, to_toml(&config).unwrap()).unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.hub.heartbeat_interval_secs, 7);
    }
}
