//! Factory configuration.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Main factory configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FactoryConfig {
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Channel pool configuration.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Named clients.
    #[serde(default)]
    pub client: HashMap<String, ClientConfig>,
}

impl FactoryConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: FactoryConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.cleanup_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "pool.cleanup_interval_secs must be greater than zero".into(),
            ));
        }
        for (name, client) in &self.client {
            if let Some(address) = &client.address
                && !(address.starts_with("http://") || address.starts_with("https://"))
            {
                return Err(ConfigError::Invalid(format!(
                    "client.{name}.address must start with http:// or https://"
                )));
            }
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Log format: "pretty", "json", or "compact".
    #[serde(default = "LoggingConfig::default_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            format: Self::default_format(),
        }
    }
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }

    fn default_format() -> String {
        "pretty".to_string()
    }
}

/// Channel pool configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// How long a channel serves new clients before it is replaced.
    /// Zero keeps channels forever.
    #[serde(default = "PoolConfig::default_handler_lifetime_secs")]
    pub handler_lifetime_secs: u64,

    /// How often expired channels are checked for disposal.
    #[serde(default = "PoolConfig::default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            handler_lifetime_secs: Self::default_handler_lifetime_secs(),
            cleanup_interval_secs: Self::default_cleanup_interval_secs(),
        }
    }
}

impl PoolConfig {
    fn default_handler_lifetime_secs() -> u64 {
        120
    }

    fn default_cleanup_interval_secs() -> u64 {
        10
    }

    /// `None` when channels never expire.
    pub fn handler_lifetime(&self) -> Option<Duration> {
        match self.handler_lifetime_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Configuration for one named client.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientConfig {
    /// Server address, e.g. "https://orders.internal:443".
    pub address: Option<String>,

    /// Default call timeout, applied when a call sets no deadline.
    pub timeout_ms: Option<u64>,

    pub max_send_message_size: Option<usize>,

    pub max_receive_message_size: Option<usize>,

    /// Headers added to every call.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default)]
    pub unsafe_use_insecure_channel_call_credentials: bool,
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
