//! Application configuration.
//!
//! Aggregates broker and gateway configuration into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod broker;
mod gateway;

pub use broker::{BrokerConfig, BrokerTransport};
pub use gateway::{GatewayConfig, RouteConfig, DEFAULT_IDENTITY_HEADER};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "viewfinder.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "VIEWFINDER_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "VIEWFINDER";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "VIEWFINDER_LOG";

use serde::Deserialize;

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Missing required setting: {0}")]
    Missing(String),

    #[error("Invalid setting {field}: {reason}")]
    Invalid { field: String, reason: String },
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker connection (services that publish or consume).
    pub broker: BrokerConfig,
    /// Gateway listener, breaker options and routes.
    pub gateway: GatewayConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `viewfinder.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix, `__` separated
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
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        Ok(config)
    }

    /// Check everything a broker-connected gateway process needs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker.validate()?;
        self.gateway.validate()
    }
}
