//! # strata-config
//!
//! Configuration management for the strata subscriber.
//!
//! Loads configuration from:
//! 1. `~/.strata/config.toml` (global)
//! 2. `.strata/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)
//!
//! There is no process-wide config instance. Callers load a [`Config`] once
//! and hand it (or the relevant section) to each component constructor.

pub mod logging;
pub mod path;
pub mod testing;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub freshness: FreshnessConfig,
    pub fetch: FetchConfig,
    pub roots: RootsConfig,
    pub origins: Vec<OriginConfig>,
    pub daemon: DaemonConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let global = Self::global_config_path();
        let project = PathBuf::from(".strata/config.toml");
        let mut config = Self::load_layers(global.as_deref(), Some(&project))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load and merge two optional config files without consulting the environment.
    ///
    /// Tables are merged key by key; any non-table value in the project file
    /// (including the `origins` array) replaces the global one.
    pub fn load_layers(global: Option<&Path>, project: Option<&Path>) -> Result<Self, ConfigError> {
        let mut merged = toml::Table::new();

        for path in [global, project].into_iter().flatten() {
            if !path.exists() {
                continue;
            }
            debug!("Loading config from {:?}", path);
            let contents = std::fs::read_to_string(path)?;
            let layer: toml::Table = toml::from_str(&contents)?;
            merge_tables(&mut merged, layer);
        }

        let config = toml::Value::Table(merged).try_into()?;
        Ok(config)
    }

    /// Global config path: ~/.strata/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".strata/config.toml"))
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("STRATA_CACHE_ROOT") {
            self.storage.cache_root = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("STRATA_META_DIR") {
            self.storage.meta_dir = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("STRATA_SOCKET") {
            self.daemon.socket = PathBuf::from(path);
        }
    }

    /// Look up the publisher address for a root.
    pub fn origin_url(&self, root: &str) -> Option<&str> {
        origin_url(&self.origins, root)
    }

    /// Generate default config TOML string
    pub fn default_toml() -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(&Config::default())?)
    }
}

/// Publisher address of `root` among configured origins.
pub fn origin_url<'a>(origins: &'a [OriginConfig], root: &str) -> Option<&'a str> {
    origins
        .iter()
        .find(|o| o.name == root)
        .map(|o| o.url.as_str())
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Chunk blob root directory
    pub cache_root: PathBuf,
    /// LMDB environment holding dataset and root records
    pub meta_dir: PathBuf,
}

impl StorageConfig {
    pub fn cache_root(&self) -> PathBuf {
        path::expand_tilde(&self.cache_root)
    }

    pub fn meta_dir(&self) -> PathBuf {
        path::expand_tilde(&self.meta_dir)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_root: PathBuf::from("~/.strata/chunks"),
            meta_dir: PathBuf::from("~/.strata/meta.lmdb"),
        }
    }
}

/// Metadata freshness configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FreshnessConfig {
    /// Skip probing the origin if metadata was probed this recently
    pub ttl_ms: u64,
    /// Tolerated clock skew when comparing modification times
    pub mtime_epsilon_ms: u64,
}

impl FreshnessConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn mtime_epsilon(&self) -> Duration {
        Duration::from_millis(self.mtime_epsilon_ms)
    }
}

impl Default for FreshnessConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 5_000,
            mtime_epsilon_ms: 1,
        }
    }
}

/// Origin fetch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Per-call origin timeout
    pub timeout_ms: u64,
    /// Maximum origin calls in flight across all datasets
    pub max_concurrent: usize,
    /// Extra attempts for unreachable/timed-out chunk fetches
    pub retries: u32,
    /// Base delay between retries (doubled each attempt)
    pub retry_backoff_ms: u64,
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_concurrent: 16,
            retries: 2,
            retry_backoff_ms: 50,
        }
    }
}

/// Root listing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RootsConfig {
    /// Age after which a cached dataset listing is re-fetched on `list`
    pub refresh_interval_secs: u64,
    /// Period of the daemon's background resync
    pub poll_interval_secs: u64,
}

impl RootsConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl Default for RootsConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 60,
            poll_interval_secs: 30,
        }
    }
}

/// A known root and the publisher that serves it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginConfig {
    pub name: String,
    pub url: String,
}

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Unix socket path
    pub socket: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket: PathBuf::from("/tmp/strata.sock"),
        }
    }
}
