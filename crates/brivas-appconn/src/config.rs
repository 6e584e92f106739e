//! Connection pool and peer configuration

use crate::errors::ConfigError;
use crate::message::DEFAULT_TIME_TO_LIVE;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

/// Default peer port
pub const DEFAULT_PORT: u16 = 8482;

/// Property keys understood by [`ClientConfig::from_properties`]
pub mod keys {
    pub const ADDRESS: &str = "address";
    pub const PORT: &str = "port";
    pub const INDEX: &str = "index";
    pub const SIZE: &str = "size";
    pub const REGISTRABLE: &str = "registrable";
    pub const PERSISTENT: &str = "persistent";
    pub const CHECK_PERIOD_MS: &str = "check_period_ms";
    pub const CONNECT_TIMEOUT_MS: &str = "connect_timeout_ms";
    pub const ECHO_PERIOD_MS: &str = "echo_period_ms";
    pub const ECHO_MAX_FAILED: &str = "echo_max_failed";
    pub const ECHO_TIME_TO_LIVE: &str = "echo_time_to_live";
}

/// Liveness probing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EchoConfig {
    /// Probe period in milliseconds
    pub period_ms: u64,
    /// Consecutive failures before the link is torn down
    pub max_failed: u32,
    /// Probe time to live in seconds
    pub time_to_live: u8,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            period_ms: 32_000,
            max_failed: 2,
            time_to_live: DEFAULT_TIME_TO_LIVE,
        }
    }
}

impl EchoConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

/// Outbound pool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Peer host
    pub address: String,
    pub port: u16,
    /// First connection index
    pub index: i16,
    /// Number of parallel connections
    pub size: u16,
    /// Register each connection and probe it with echo calls
    pub registrable: bool,
    /// Periodically restart offline connections
    pub persistent: bool,
    pub check_period_ms: u64,
    pub connect_timeout_ms: u64,
    pub echo: EchoConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            index: 0,
            size: 8,
            registrable: true,
            persistent: true,
            check_period_ms: 8_000,
            connect_timeout_ms: 4_000,
            echo: EchoConfig::default(),
        }
    }
}

fn parse_or<T: FromStr>(
    props: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match props.get(key).map(|v| v.trim()) {
        None => Ok(default),
        Some(v) => v.parse().map_err(|_| ConfigError::invalid(key, v)),
    }
}

impl ClientConfig {
    /// Build from a flat key/value map; `address` is mandatory
    pub fn from_properties(props: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let address = props
            .get(keys::ADDRESS)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ConfigError::NullProperty(keys::ADDRESS.to_string()))?
            .to_string();

        let config = Self {
            address,
            port: parse_or(props, keys::PORT, defaults.port)?,
            index: parse_or(props, keys::INDEX, defaults.index)?,
            size: parse_or(props, keys::SIZE, defaults.size)?,
            registrable: parse_or(props, keys::REGISTRABLE, defaults.registrable)?,
            persistent: parse_or(props, keys::PERSISTENT, defaults.persistent)?,
            check_period_ms: parse_or(props, keys::CHECK_PERIOD_MS, defaults.check_period_ms)?,
            connect_timeout_ms: parse_or(
                props,
                keys::CONNECT_TIMEOUT_MS,
                defaults.connect_timeout_ms,
            )?,
            echo: EchoConfig {
                period_ms: parse_or(props, keys::ECHO_PERIOD_MS, defaults.echo.period_ms)?,
                max_failed: parse_or(props, keys::ECHO_MAX_FAILED, defaults.echo.max_failed)?,
                time_to_live: parse_or(
                    props,
                    keys::ECHO_TIME_TO_LIVE,
                    defaults.echo.time_to_live,
                )?,
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Build from `APPCONN_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let props = [
            keys::ADDRESS,
            keys::PORT,
            keys::INDEX,
            keys::SIZE,
            keys::REGISTRABLE,
            keys::PERSISTENT,
            keys::CHECK_PERIOD_MS,
            keys::CONNECT_TIMEOUT_MS,
            keys::ECHO_PERIOD_MS,
            keys::ECHO_MAX_FAILED,
            keys::ECHO_TIME_TO_LIVE,
        ]
        .into_iter()
        .filter_map(|key| {
            std::env::var(format!("APPCONN_{}", key.to_uppercase()))
                .ok()
                .map(|v| (key.to_string(), v))
        })
        .collect();
        Self::from_properties(&props)
    }

    /// Load from a JSON file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Load(e.to_string()))?;
        let config: Self =
            serde_json::from_str(&content).map_err(|e| ConfigError::Load(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.trim().is_empty() {
            return Err(ConfigError::NullProperty(keys::ADDRESS.to_string()));
        }
        if self.port == 0 {
            return Err(ConfigError::invalid(keys::PORT, "0"));
        }
        if self.size == 0 {
            return Err(ConfigError::invalid(keys::SIZE, "0"));
        }
        if self.index < 0 || i32::from(self.index) + i32::from(self.size) - 1 > i32::from(i16::MAX) {
            return Err(ConfigError::invalid(keys::INDEX, self.index.to_string()));
        }
        if self.echo.time_to_live == 0 {
            return Err(ConfigError::invalid(keys::ECHO_TIME_TO_LIVE, "0"));
        }
        if self.echo.period_ms == 0 {
            return Err(ConfigError::invalid(keys::ECHO_PERIOD_MS, "0"));
        }
        if self.check_period_ms == 0 {
            return Err(ConfigError::invalid(keys::CHECK_PERIOD_MS, "0"));
        }
        Ok(())
    }

    /// Connection indexes `[index, index + size)`
    pub fn indexes(&self) -> impl Iterator<Item = i16> {
        let start = i32::from(self.index);
        (start..start + i32::from(self.size)).filter_map(|i| i16::try_from(i).ok())
    }

    pub fn check_period(&self) -> Duration {
        Duration::from_millis(self.check_period_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Inbound peer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// Id this peer answers registrations for
    pub local_id: i32,
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            local_id: 0,
            max_connections: 1024,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            bind_address: std::env::var("APPCONN_BIND_ADDRESS").unwrap_or(defaults.bind_address),
            port: env_or("APPCONN_PORT", defaults.port)?,
            local_id: env_or("APPCONN_LOCAL_ID", defaults.local_id)?,
            max_connections: env_or("APPCONN_MAX_CONNECTIONS", defaults.max_connections)?,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(v) => v.trim().parse().map_err(|_| ConfigError::invalid(key, v.as_str())),
        Err(_) => Ok(default),
    }
}
