//! Configuration module for gamehost.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::script::value::MAX_NESTING_DEPTH;
use crate::{HostError, Result};

/// Storage layout configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root directory for all host-managed data.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Directory (relative to `data_dir`) holding installed game packages.
    #[serde(default = "default_games_dir")]
    pub games_dir: String,
    /// Directory (relative to `data_dir`) holding game instance state.
    #[serde(default = "default_instances_dir")]
    pub instances_dir: String,
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_games_dir() -> String {
    "games".to_string()
}

fn default_instances_dir() -> String {
    "instances".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            games_dir: default_games_dir(),
            instances_dir: default_instances_dir(),
        }
    }
}

impl StorageConfig {
    /// Absolute-or-relative path of the installed games directory.
    pub fn games_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join(&self.games_dir)
    }

    /// Absolute-or-relative path of the instances directory.
    pub fn instances_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join(&self.instances_dir)
    }
}

/// Sandboxed script runtime configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Maximum number of VM instructions per entry point (0 = unlimited).
    #[serde(default = "default_max_instructions")]
    pub max_instructions: u64,
    /// Maximum Lua heap size in megabytes (0 = unlimited).
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: usize,
    /// Module search path templates, `;`-separated, `?` replaced by the module name.
    #[serde(default = "default_search_path")]
    pub search_path: String,
    /// Deepest table nesting passed between scripts and the host.
    #[serde(default = "default_max_table_depth")]
    pub max_table_depth: usize,
}

fn default_max_instructions() -> u64 {
    10_000_000
}

fn default_max_memory_mb() -> usize {
    32
}

fn default_search_path() -> String {
    "?.lua;?/init.lua".to_string()
}

fn default_max_table_depth() -> usize {
    MAX_NESTING_DEPTH
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_instructions: default_max_instructions(),
            max_memory_mb: default_max_memory_mb(),
            search_path: default_search_path(),
            max_table_depth: default_max_table_depth(),
        }
    }
}

/// Background fetch configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    /// Number of background worker threads for blocking fetches.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Connection timeout in seconds for remote sources.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Total request timeout in seconds for remote sources.
    #[serde(default = "default_total_timeout")]
    pub total_timeout_secs: u64,
    /// Maximum number of redirects to follow.
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
    /// User agent sent with remote requests.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_worker_threads() -> usize {
    4
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_total_timeout() -> u64 {
    30
}

fn default_max_redirects() -> usize {
    5
}

fn default_user_agent() -> String {
    concat!("gamehost/", env!("CARGO_PKG_VERSION")).to_string()
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            connect_timeout_secs: default_connect_timeout(),
            total_timeout_secs: default_total_timeout(),
            max_redirects: default_max_redirects(),
            user_agent: default_user_agent(),
        }
    }
}

/// Wall-clock configuration for script-facing instants.
#[derive(Debug, Clone, Deserialize)]
pub struct ClockConfig {
    /// Timezone used to break instants into calendar fields (e.g., "Asia/Tokyo", "UTC").
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
        }
    }
}

/// A game published through a release repository.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RepositoryEntry {
    /// `owner/name` of the repository.
    pub repository: String,
    /// Id of the game it publishes.
    pub id: String,
    /// Display name.
    pub name: String,
}

/// Release repository configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryConfig {
    /// Base URL of the releases API.
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Base URL serving raw repository contents by tag.
    #[serde(default = "default_raw_url")]
    pub raw_url: String,
    /// Known repositories.
    #[serde(default)]
    pub games: Vec<RepositoryEntry>,
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_raw_url() -> String {
    "https://raw.githubusercontent.com".to_string()
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            raw_url: default_raw_url(),
            games: Vec::new(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Path to the log file.
    #[serde(default = "default_log_file")]
    pub file: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "logs/gamehost.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Storage layout.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Script runtime limits and module search path.
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Background fetch settings.
    #[serde(default)]
    pub fetch: FetchConfig,
    /// Clock settings.
    #[serde(default)]
    pub clock: ClockConfig,
    /// Game release repositories.
    #[serde(default)]
    pub repositories: RepositoryConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(HostError::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML file and apply environment variable overrides.
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| HostError::Validation(format!("config parse error: {e}")))
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported environment variables:
    /// - `GAMEHOST_DATA_DIR`: Override the data directory
    pub fn apply_env_overrides(&mut self) {
        if let Ok(data_dir) = std::env::var("GAMEHOST_DATA_DIR") {
            if !data_dir.is_empty() {
                self.storage.data_dir = data_dir;
            }
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.fetch.worker_threads == 0 {
            return Err(HostError::Config(
                "fetch.worker_threads must be at least 1".to_string(),
            ));
        }
        if self.runtime.search_path.split(';').all(|t| !t.contains('?')) {
            return Err(HostError::Config(
                "runtime.search_path must contain at least one `?` template".to_string(),
            ));
        }
        if !(1..=MAX_NESTING_DEPTH).contains(&self.runtime.max_table_depth) {
            return Err(HostError::Config(format!(
                "runtime.max_table_depth must be between 1 and {MAX_NESTING_DEPTH}"
            )));
        }
        if self.clock.timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(HostError::Config(format!(
                "unknown timezone `{}`",
                self.clock.timezone
            )));
        }
        Ok(())
    }
}
