//! Library configuration.
//!
//! Configuration is loaded from a TOML file at:
//! 1. `$MAILSUMMARY_CONFIG` (environment variable)
//! 2. `~/.config/mailsummary/config.toml` (Linux/macOS)
//!    `%APPDATA%\mailsummary\config.toml` (Windows)
//! 3. Built-in defaults

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::DEFAULT_MAX_STRING_LEN;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub summary: SummaryConfig,
    pub cache: CacheConfig,
}

/// Logging and directory settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level: "error", "warn", "info", "debug", "trace".
    pub log_level: String,
    /// Override the directory used for logs.
    pub cache_dir: Option<PathBuf>,
    /// Also write logs to `<cache_dir>/mailsummary.log`.
    pub log_to_file: bool,
}

/// Folder summary behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SummaryConfig {
    /// Let mbox sync rewrite flag markers in place when possible.
    pub quick_sync: bool,
    /// Longest string accepted in a summary record, in bytes.
    pub max_string_len: usize,
}

/// Data cache expiry and sharding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Remove entries not modified for this many seconds.
    pub expire_age_secs: Option<u64>,
    /// Remove entries not accessed for this many seconds.
    pub expire_access_secs: Option<u64>,
    /// Minimum interval between two sweeps of the same shard.
    pub expire_cycle_secs: u64,
    /// Number of hash bits used to pick a shard (6 = 64 shards).
    pub shard_bits: u32,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "warn".to_string(),
            cache_dir: None,
            log_to_file: false,
        }
    }
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            quick_sync: true,
            max_string_len: DEFAULT_MAX_STRING_LEN,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            expire_age_secs: None,
            expire_access_secs: None,
            expire_cycle_secs: 60 * 60,
            shard_bits: 6,
        }
    }
}

impl CacheConfig {
    pub fn expire_age(&self) -> Option<Duration> {
        self.expire_age_secs.map(Duration::from_secs)
    }

    pub fn expire_access(&self) -> Option<Duration> {
        self.expire_access_secs.map(Duration::from_secs)
    }

    pub fn expire_cycle(&self) -> Duration {
        Duration::from_secs(self.expire_cycle_secs)
    }
}

// ── Load / save ─────────────────────────────────────────────────

/// Load configuration, searching standard locations.
///
/// Returns the default configuration if no file is found or on parse error.
pub fn load_config() -> Config {
    if let Some(path) = config_file_path() {
        if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(contents) => match toml::from_str::<Config>(&contents) {
                    Ok(cfg) => {
                        tracing::info!(path = %path.display(), "Loaded config");
                        return cfg;
                    }
                    Err(e) => {
                        tracing::warn!(
                            path = %path.display(),
                            error = %e,
                            "Failed to parse config, using defaults"
                        );
                    }
                },
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to read config file, using defaults"
                    );
                }
            }
        }
    }
    Config::default()
}

/// Save configuration to the standard location.
pub fn save_config(config: &Config) -> anyhow::Result<()> {
    let path = config_file_path()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config file path"))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let contents = toml::to_string_pretty(config)?;
    std::fs::write(&path, contents)?;
    tracing::info!(path = %path.display(), "Saved config");
    Ok(())
}

/// Determine the config file path (env var first, then standard dirs).
pub fn config_file_path() -> Option<PathBuf> {
    if let Ok(env_path) = std::env::var("MAILSUMMARY_CONFIG") {
        return Some(PathBuf::from(env_path));
    }
    dirs::config_dir().map(|d| d.join("mailsummary").join("config.toml"))
}

/// Directory for logs and other scratch files.
pub fn cache_dir(config: &Config) -> PathBuf {
    if let Some(ref dir) = config.general.cache_dir {
        return dir.clone();
    }
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mailsummary")
}
