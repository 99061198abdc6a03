//! Application configuration.
//!
//! Aggregates configuration into a single Config struct that can be loaded
//! from YAML files or environment variables.

mod broker;

pub use broker::{BrokerConfig, RedisConfig, SourceConfig, SourceType, TailConfig};

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "keyspace-broker.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "KEYSPACE_BROKER_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "KEYSPACE_BROKER";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "KEYSPACE_BROKER_LOG";
/// Bare environment flag enabling the interval timer.
pub const PUBSUB_INTERVAL_ENV_VAR: &str = "PUBSUB_INTERVAL";

/// Errors loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: String, value: String },
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker lifecycle configuration.
    pub broker: BrokerConfig,
    /// Underlying event source.
    pub source: SourceConfig,
    /// Tail binary configuration.
    pub tail: TailConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `keyspace-broker.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    /// 5. `PUBSUB_INTERVAL`
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("tail.patterns")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: Config = config.try_deserialize()?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Create config for testing: memory source, no timer.
    pub fn for_test() -> Self {
        Self {
            source: SourceConfig {
                source_type: SourceType::Memory,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(value) = std::env::var(PUBSUB_INTERVAL_ENV_VAR) {
            self.broker.pubsub_interval = parse_flag(&value).ok_or(ConfigError::InvalidValue {
                name: PUBSUB_INTERVAL_ENV_VAR.to_string(),
                value,
            })?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                name: "broker.interval_ms".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
