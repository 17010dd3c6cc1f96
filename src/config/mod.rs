//! Configuration management for archivist
//!
//! Handles loading, saving, and validating configuration from TOML files.

mod defaults;

pub use defaults::*;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Indexing backend configuration
    #[serde(default)]
    pub indexer: IndexerConfig,

    /// Sync pipeline configuration
    #[serde(default)]
    pub sync: SyncConfig,

    /// Paths configuration (internal, not user-editable)
    #[serde(skip)]
    pub paths: PathsConfig,
}

/// Indexing backend connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerConfig {
    /// Base URL of the indexing backend
    #[serde(default = "default_indexer_url")]
    pub url: String,

    /// Environment variable name for the indexer API key
    #[serde(default = "default_indexer_api_key_env")]
    pub api_key_env: String,

    /// Request timeout in seconds
    #[serde(default = "default_indexer_timeout")]
    pub timeout_secs: u64,
}

/// Sync pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Number of concurrent sync workers
    #[serde(default = "default_sync_workers")]
    pub workers: usize,

    /// Attempt ceiling: a job failing this many times is exhausted
    #[serde(default = "default_sync_max_attempts")]
    pub max_attempts: u32,

    /// Base delay for exponential retry backoff (milliseconds)
    #[serde(default = "default_sync_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Upper bound on retry backoff (milliseconds)
    #[serde(default = "default_sync_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// How long an idle worker sleeps before polling again (milliseconds)
    #[serde(default = "default_sync_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Global cap on adapter calls per second across all workers.
    /// None disables throttling.
    #[serde(default)]
    pub max_requests_per_sec: Option<u32>,
}

/// Internal paths configuration
#[derive(Debug, Clone, Default)]
pub struct PathsConfig {
    /// Base directory for archivist data
    pub base_dir: PathBuf,

    /// Path to config file
    pub config_file: PathBuf,

    /// Path to SQLite database
    pub db_file: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            indexer: IndexerConfig::default(),
            sync: SyncConfig::default(),
            paths: PathsConfig::default(),
        }
    }
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            url: default_indexer_url(),
            api_key_env: default_indexer_api_key_env(),
            timeout_secs: default_indexer_timeout(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workers: default_sync_workers(),
            max_attempts: default_sync_max_attempts(),
            backoff_base_ms: default_sync_backoff_base_ms(),
            backoff_cap_ms: default_sync_backoff_cap_ms(),
            poll_interval_ms: default_sync_poll_interval_ms(),
            max_requests_per_sec: None,
        }
    }
}

impl Config {
    /// Get the default base directory for archivist (~/.archivist)
    pub fn default_base_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".archivist")
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        Self::default_base_dir().join("config.toml")
    }

    /// Initialize paths configuration
    pub fn init_paths(&mut self, base_dir: Option<PathBuf>) {
        let base = base_dir.unwrap_or_else(Self::default_base_dir);
        self.paths = PathsConfig {
            config_file: base.join("config.toml"),
            db_file: base.join("archive.db"),
            base_dir: base,
        };
    }

    /// Load configuration from a specific file path
    pub fn load(config_path: &Path) -> Result<Self> {
        debug!("Loading config from {:?}", config_path);

        if !config_path.exists() {
            return Err(Error::Config(format!(
                "Config file not found: {}",
                config_path.display()
            )));
        }

        let content = std::fs::read_to_string(config_path)?;
        let mut config: Config = toml::from_str(&content)?;

        // Set up paths based on config file location
        let base = config_path.parent().unwrap_or(Path::new(".")).to_path_buf();
        config.paths = PathsConfig {
            config_file: config_path.to_path_buf(),
            db_file: base.join("archive.db"),
            base_dir: base,
        };

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific base directory, falling back to
    /// defaults when no config file exists yet
    pub fn load_from(base_dir: Option<PathBuf>) -> Result<Self> {
        let mut config = Config::default();
        config.init_paths(base_dir);

        if config.paths.config_file.exists() {
            debug!("Loading config from {:?}", config.paths.config_file);
            let content = std::fs::read_to_string(&config.paths.config_file)?;
            let mut loaded: Config = toml::from_str(&content)?;
            loaded.paths = config.paths;
            config = loaded;
        } else {
            debug!("No config file found, using defaults");
        }

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.paths.config_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&self.paths.config_file, content)?;
        info!("Saved config to {:?}", self.paths.config_file);
        Ok(())
    }

    /// Get the indexer API key from environment
    pub fn indexer_api_key(&self) -> Option<String> {
        if self.indexer.api_key_env.is_empty() {
            return None;
        }
        std::env::var(&self.indexer.api_key_env).ok()
    }

    /// Check if archivist is initialized (config and DB exist)
    pub fn is_initialized(&self) -> bool {
        self.paths.config_file.exists() && self.paths.db_file.exists()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.sync.workers == 0 {
            return Err(Error::Config("sync.workers must be >= 1".to_string()));
        }

        if self.sync.max_attempts == 0 {
            return Err(Error::Config("sync.max_attempts must be >= 1".to_string()));
        }

        if self.sync.backoff_cap_ms < self.sync.backoff_base_ms {
            return Err(Error::Config(
                "sync.backoff_cap_ms must be >= sync.backoff_base_ms".to_string(),
            ));
        }

        if self.sync.max_requests_per_sec == Some(0) {
            return Err(Error::Config(
                "sync.max_requests_per_sec must be positive when set".to_string(),
            ));
        }

        Ok(())
    }
}
