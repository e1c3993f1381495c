//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/scanlog/config.toml`. Every field
//! has a default, and the API location can be overridden from the
//! environment (`API_BASE_URL` or `SCANLOG_API_BASE_URL`) so the same build
//! can point at different servers.
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/scanlog/` (~/.config/scanlog/)
//! - Data: `$XDG_DATA_HOME/scanlog/` (~/.local/share/scanlog/)
//! - State/Logs: `$XDG_STATE_HOME/scanlog/` (~/.local/state/scanlog/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Environment variables that override `api.base_url`, highest priority first
const BASE_URL_ENV_VARS: &[&str] = &["SCANLOG_API_BASE_URL", "API_BASE_URL"];

/// Environment variable that overrides `api.device_id`
const DEVICE_ID_ENV_VAR: &str = "SCANLOG_DEVICE_ID";

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Remote logistics API
    #[serde(default)]
    pub api: ApiConfig,

    /// Sync engine tuning
    #[serde(default)]
    pub sync: SyncConfig,

    /// Connectivity probing
    #[serde(default)]
    pub connectivity: ConnectivityConfig,

    /// Capture validation
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Conflict resolution policy
    #[serde(default)]
    pub conflict: ConflictConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Remote logistics API configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    /// Base URL of the logistics API (e.g., `https://logistics.example.com/api`)
    pub base_url: Option<String>,

    /// Identifier of this scanning device; generated and persisted when unset
    pub device_id: Option<String>,

    /// Per-request timeout in seconds
    #[serde(default = "default_api_timeout")]
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            device_id: None,
            timeout_secs: default_api_timeout(),
        }
    }
}

impl ApiConfig {
    /// Check if a server is configured
    pub fn is_ready(&self) -> bool {
        self.base_url
            .as_deref()
            .map(|url| !url.trim().is_empty())
            .unwrap_or(false)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_api_timeout() -> u64 {
    15
}

/// Sync engine configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Maximum records per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// First retry delay in milliseconds (doubles per attempt)
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Upper bound for the retry delay in milliseconds
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Seconds between periodic wake-ups when nothing else triggers a sync
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    /// Hours a confirmed record is kept before it is purged
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            tick_interval_secs: default_tick_interval(),
            retention_hours: default_retention_hours(),
        }
    }
}

impl SyncConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours.saturating_mul(3600))
    }
}

fn default_batch_size() -> usize {
    50
}

fn default_backoff_base_ms() -> u64 {
    2_000
}

fn default_backoff_max_ms() -> u64 {
    300_000
}

fn default_tick_interval() -> u64 {
    60
}

const MAX_RETENTION_HOURS: u64 = 876_000;

fn default_retention_hours() -> u64 {
    168
}

/// Connectivity monitor configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ConnectivityConfig {
    /// Seconds between liveness probes
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: default_probe_interval(),
        }
    }
}

impl ConnectivityConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }
}

fn default_probe_interval() -> u64 {
    30
}

/// Capture pipeline configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CaptureConfig {
    /// Maximum accepted content length in characters
    #[serde(default = "default_max_content_len")]
    pub max_content_len: usize,

    /// Refuse a second read of the same content from this device within this
    /// many milliseconds (0 disables the guard)
    #[serde(default)]
    pub duplicate_window_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_content_len: default_max_content_len(),
            duplicate_window_ms: 0,
        }
    }
}

fn default_max_content_len() -> usize {
    512
}

/// Conflict resolver configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ConflictConfig {
    /// How many attempts a record may reach while being resubmitted over
    /// stale server state before it escalates to manual resolution
    #[serde(default = "default_max_resubmits")]
    pub max_resubmits: u32,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            max_resubmits: default_max_resubmits(),
        }
    }
}

fn default_max_resubmits() -> u32 {
    3
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path, then apply environment overrides
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        let mut config = if config_path.exists() {
            Self::load_from(&config_path)?
        } else {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            Config::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Override values that deployments set from the environment
    pub fn apply_env_overrides(&mut self) {
        for var in BASE_URL_ENV_VARS {
            if let Ok(value) = std::env::var(var) {
                if !value.trim().is_empty() {
                    self.api.base_url = Some(value);
                    break;
                }
            }
        }

        if let Ok(value) = std::env::var(DEVICE_ID_ENV_VAR) {
            if !value.trim().is_empty() {
                self.api.device_id = Some(value);
            }
        }
    }

    /// Validate ranges, returning an error naming the offending key
    pub fn validate(&self) -> Result<()> {
        if self.sync.batch_size == 0 || self.sync.batch_size > 500 {
            return Err(Error::Config(
                "sync.batch_size must be between 1 and 500".to_string(),
            ));
        }
        if self.sync.backoff_base_ms == 0 {
            return Err(Error::Config(
                "sync.backoff_base_ms must be greater than 0".to_string(),
            ));
        }
        if self.sync.backoff_max_ms < self.sync.backoff_base_ms {
            return Err(Error::Config(
                "sync.backoff_max_ms must not be smaller than sync.backoff_base_ms".to_string(),
            ));
        }
        if self.sync.tick_interval_secs == 0 {
            return Err(Error::Config(
                "sync.tick_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.api.timeout_secs == 0 {
            return Err(Error::Config(
                "api.timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.connectivity.probe_interval_secs == 0 {
            return Err(Error::Config(
                "connectivity.probe_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.sync.retention_hours > MAX_RETENTION_HOURS {
            return Err(Error::Config(format!(
                "sync.retention_hours must be at most {} (100 years)",
                MAX_RETENTION_HOURS
            )));
        }
        if self.capture.duplicate_window_ms > 3_600_000 {
            return Err(Error::Config(
                "capture.duplicate_window_ms must be at most one hour".to_string(),
            ));
        }
        if self.capture.max_content_len == 0 {
            return Err(Error::Config(
                "capture.max_content_len must be greater than 0".to_string(),
            ));
        }
        if let Some(url) = &self.api.base_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(Error::Config(format!(
                    "api.base_url must be an http(s) URL, got {:?}",
                    url
                )));
            }
        }
        Ok(())
    }

    /// Device identifier: configured value, or one generated on first use
    /// and persisted next to the database so it survives restarts.
    pub fn device_id(&self) -> Result<String> {
        if let Some(id) = &self.api.device_id {
            return Ok(id.clone());
        }
        load_or_create_device_id(&Self::data_dir().join("device-id"))
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/scanlog/config.toml` (~/.config/scanlog/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("scanlog").join("config.toml")
    }

    /// Returns the data directory path (for SQLite database)
    ///
    /// `$XDG_DATA_HOME/scanlog/` (~/.local/share/scanlog/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("scanlog")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/scanlog/` (~/.local/state/scanlog/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("scanlog")
    }

    /// Returns the database file path
    ///
    /// `$XDG_DATA_HOME/scanlog/scans.db` (~/.local/share/scanlog/scans.db)
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("scans.db")
    }

    /// Directory holding the daily log files
    ///
    /// `$XDG_STATE_HOME/scanlog` (~/.local/state/scanlog)
    pub fn log_dir() -> PathBuf {
        Self::state_dir()
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// Binaries call this first so every component resolves the same paths.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}

fn load_or_create_device_id(path: &Path) -> Result<String> {
    if let Ok(existing) = std::fs::read_to_string(path) {
        let existing = existing.trim();
        if !existing.is_empty() {
            return Ok(existing.to_string());
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let id = uuid::Uuid::new_v4().to_string();
    std::fs::write(path, &id)?;
    tracing::info!(device_id = %id, path = %path.display(), "Generated device id");
    Ok(id)
}
