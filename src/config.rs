//! Configuration management for ispdoc-ipam.

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/ispdoc-ipam/config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Address management limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IpamConfig {
    /// Maximum number of addresses a single bulk request may register.
    pub bulk_limit: usize,
}

impl Default for IpamConfig {
    fn default() -> Self {
        Self { bulk_limit: 256 }
    }
}

impl IpamConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bulk_limit == 0 || self.bulk_limit > 4096 {
            return Err(ConfigError::ValidationError(
                "bulk_limit must be between 1 and 4096".to_string(),
            ));
        }
        Ok(())
    }
}

/// Reachability probe configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PingConfig {
    /// Ping executable.
    pub command: String,

    /// Echo requests sent per probe.
    pub count: u32,

    /// Seconds to wait for a reply.
    pub timeout_secs: u64,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            command: "ping".to_string(),
            count: 1,
            timeout_secs: 1,
        }
    }
}

impl PingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "ping.command must not be empty".to_string(),
            ));
        }
        if self.count == 0 || self.count > 10 {
            return Err(ConfigError::ValidationError(
                "ping.count must be between 1 and 10".to_string(),
            ));
        }
        if self.timeout_secs == 0 || self.timeout_secs > 30 {
            return Err(ConfigError::ValidationError(
                "ping.timeout_secs must be between 1 and 30".to_string(),
            ));
        }
        Ok(())
    }
}

/// API server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Listen address.
    pub listen_host: String,

    /// Listen port.
    pub listen_port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 8080,
        }
    }
}

impl ApiConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.listen_host, self.listen_port)
            .parse()
            .map_err(|_| ConfigError::ValidationError("Invalid listen address".to_string()))
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to SQLite database.
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/ispdoc-ipam/ipam.db"),
        }
    }
}

/// Main configuration container.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub database: DatabaseConfig,
    pub ipam: IpamConfig,
    pub ping: PingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.api.socket_addr()?;
        self.ipam.validate()?;
        self.ping.validate()?;
        Ok(())
    }
}

/// Load configuration from the default or specified path.
pub fn load_config(path: Option<&std::path::Path>) -> Result<Config, ConfigError> {
    let config_path = path.unwrap_or(std::path::Path::new(DEFAULT_CONFIG_PATH));
    Config::from_file(config_path)
}
