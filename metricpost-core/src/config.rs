//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/metricpost/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/metricpost/` (~/.config/metricpost/)
//! - State/Logs: `$XDG_STATE_HOME/metricpost/` (~/.local/state/metricpost/)

use crate::error::{Error, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

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

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Event publisher configuration
    #[serde(default)]
    pub publisher: PublisherConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
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

/// Event publisher configuration
///
/// Supplied once when a [`Publisher`](crate::publish::Publisher) is built.
/// Keys are snake_case in TOML; the camelCase names used by browser hosts
/// are accepted as aliases.
#[derive(Debug, Deserialize, Clone)]
pub struct PublisherConfig {
    /// Ingestion endpoint URL (required when enabled)
    pub endpoint: Option<String>,

    /// Administrative switch; when false every operation is a no-op
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Queue length that triggers an immediate flush
    #[serde(default = "default_batch_size", alias = "batchSize")]
    pub batch_size: usize,

    /// Period of the flush timer in milliseconds
    #[serde(default = "default_batch_timeout_ms", alias = "batchTimeoutMs")]
    pub batch_timeout_ms: u64,

    /// Retries after the first failed attempt before a batch is archived
    #[serde(default = "default_max_retries", alias = "maxRetries")]
    pub max_retries: u32,

    /// HTTP request timeout in seconds
    #[serde(default = "default_timeout_secs", alias = "timeoutSecs")]
    pub timeout_secs: u64,

    /// Static fields merged into every event record
    #[serde(default)]
    pub context: Map<String, Value>,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            enabled: default_enabled(),
            batch_size: default_batch_size(),
            batch_timeout_ms: default_batch_timeout_ms(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            context: Map::new(),
        }
    }
}

impl PublisherConfig {
    /// Build an enabled config for `endpoint` with every other field defaulted
    pub fn for_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            ..Default::default()
        }
    }

    /// Check if the publisher is enabled and has somewhere to send events
    pub fn is_ready(&self) -> bool {
        self.enabled && self.endpoint.is_some()
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let endpoint = self.endpoint.as_deref().ok_or_else(|| {
            Error::Config("publisher.endpoint is required when publisher is enabled".to_string())
        })?;
        let url = reqwest::Url::parse(endpoint)
            .map_err(|e| Error::Config(format!("invalid publisher.endpoint {endpoint:?}: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "publisher.endpoint must be http or https, got {}",
                url.scheme()
            )));
        }

        if self.batch_size == 0 {
            return Err(Error::Config(
                "publisher.batch_size must be at least 1".to_string(),
            ));
        }
        if self.batch_timeout_ms == 0 {
            return Err(Error::Config(
                "publisher.batch_timeout_ms must be at least 1".to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(Error::Config(
                "publisher.timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_enabled() -> bool {
    true
}

fn default_batch_size() -> usize {
    25
}

fn default_batch_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_timeout_secs() -> u64 {
    30
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/metricpost/config.toml` (~/.config/metricpost/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("metricpost").join("config.toml")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/metricpost/` (~/.local/state/metricpost/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("metricpost")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/metricpost/metricpost.log` (~/.local/state/metricpost/metricpost.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("metricpost.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.publisher.enabled);
        assert!(config.publisher.endpoint.is_none());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_publisher_config_defaults() {
        let config = PublisherConfig::default();
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.batch_timeout_ms, 30_000);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.timeout_secs, 30);
        assert!(config.context.is_empty());
        assert!(!config.is_ready());
    }

    #[test]
    fn test_publisher_config_validation() {
        // Disabled config is always valid
        let config = PublisherConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        // Enabled without endpoint should fail
        let config = PublisherConfig::default();
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        // Non-http scheme should fail
        let config = PublisherConfig::for_endpoint("ftp://ingest.example.com");
        assert!(config.validate().is_err());

        // Zero batch size should fail
        let config = PublisherConfig {
            batch_size: 0,
            ..PublisherConfig::for_endpoint("https://ingest.example.com/events")
        };
        assert!(config.validate().is_err());

        let config = PublisherConfig::for_endpoint("https://ingest.example.com/events");
        assert!(config.validate().is_ok());
        assert!(config.is_ready());
    }

    #[test]
    fn test_parse_publisher_config() {
        let toml = r#"
[publisher]
endpoint = "https://ingest.example.com/events"
batch_size = 10
maxRetries = 5

[publisher.context]
device = "tv-1"
build = 42

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(
            config.publisher.endpoint.as_deref(),
            Some("https://ingest.example.com/events")
        );
        assert_eq!(config.publisher.batch_size, 10);
        assert_eq!(config.publisher.max_retries, 5);
        assert_eq!(config.publisher.batch_timeout_ms, 30_000);
        assert_eq!(config.publisher.context["device"], "tv-1");
        assert_eq!(config.publisher.context["build"], 42);
        assert_eq!(config.logging.level, "debug");
        assert!(config.publisher.is_ready());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[publisher]\nendpoint = \"http://localhost:8080/ingest\"\nenabled = false\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert!(!config.publisher.enabled);
        assert!(!config.publisher.is_ready());

        std::fs::write(&path, "[publisher\n").unwrap();
        assert!(matches!(Config::load_from(&path), Err(Error::Config(_))));
    }
}
