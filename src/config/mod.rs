//! Application configuration.
//!
//! Aggregates producer, consumer and logging configuration into a single
//! Config struct that can be loaded from YAML, TOML or JSON files and
//! environment variables.

mod logging;
mod messaging;

pub use logging::{LogConfig, LogFormat};
pub use messaging::{BackoffConfig, ConsumeConfig, ProducerConfig};

use std::path::Path;

use ::config::{Config as ConfigLib, Environment, File, FileFormat};
use serde::Deserialize;

/// Default configuration file name (without extension).
pub const DEFAULT_CONFIG_FILE: &str = "mqbridge";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "MQBRIDGE_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "MQBRIDGE";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "MQBRIDGE_LOG";

/// Keys whose environment values are comma-separated lists.
const LIST_KEYS: [&str; 5] = [
    "producer.address",
    "pull.address",
    "pull.tags",
    "push.address",
    "push.tags",
];

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Unsupported config file format: {0} (expected .yaml, .yml, .toml or .json)")]
    UnsupportedFormat(String),

    #[error("Config load failed: {0}")]
    Load(#[from] ::config::ConfigError),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Producer gateway configuration.
    pub producer: Option<ProducerConfig>,
    /// Pull consumer loop configuration.
    pub pull: Option<ConsumeConfig>,
    /// Push consumer configuration.
    pub push: Option<ConsumeConfig>,
    /// Logging configuration.
    pub logging: LogConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `mqbridge.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, file_format(config_path)?));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, file_format(&config_path)?));
        }

        let mut environment = Environment::with_prefix(CONFIG_ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .list_separator(",")
            .try_parsing(true);
        for key in LIST_KEYS {
            environment = environment.with_list_parse_key(key);
        }

        let config = builder.add_source(environment).build()?;
        Ok(config.try_deserialize()?)
    }
}

/// Pick the file format from the path's extension.
fn file_format(path: &str) -> Result<FileFormat, ConfigError> {
    match Path::new(path).extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => Ok(FileFormat::Yaml),
        Some("toml") => Ok(FileFormat::Toml),
        Some("json") => Ok(FileFormat::Json),
        _ => Err(ConfigError::UnsupportedFormat(path.to_string())),
    }
}
