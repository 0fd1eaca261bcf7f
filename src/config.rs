//! Connection configuration for the MQTT session manager
//!
//! A [`ConnectionConfig`] is an immutable snapshot: the connection copies it when a
//! connect cycle starts and only [`crate::MqttConnection::reconfigure`] replaces it.

use crate::transport::Endpoint;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Default MQTT port for plain TCP connections
pub const DEFAULT_PORT: u16 = 1883;

/// Client identifiers longer than this are rejected by many 3.1.1 brokers
const MAX_CLIENT_ID_LEN: usize = 65535;

/// Connection settings consumed by [`crate::MqttConnection`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionConfig {
    /// Broker URI, e.g. `mqtt://localhost:1883` or `tcp://broker:1883`
    pub server_uri: String,
    /// MQTT client identifier; generated when empty
    #[serde(default)]
    pub client_id: String,
    /// Username sent in CONNECT
    #[serde(default)]
    pub username: Option<String>,
    /// Password sent in CONNECT
    #[serde(default)]
    pub password: Option<String>,
    /// Environment variable holding the username, used when `username` is unset
    #[serde(default)]
    pub username_env: Option<String>,
    /// Environment variable holding the password, used when `password` is unset
    #[serde(default)]
    pub password_env: Option<String>,
    /// Ask the broker to discard prior session state (default: true)
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
    /// Upper bound for a single connect attempt, CONNACK included
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Retry failed connects and reconnect after unexpected disconnects
    #[serde(default = "default_reconnect")]
    pub reconnect: bool,
    /// Delay between connect attempts
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// Keep-alive interval advertised in CONNECT (0 disables keep-alive)
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u16,
    /// How long publish/subscribe/unsubscribe wait for an ack (0 waits forever)
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,
    /// Largest frame accepted or sent by the transport
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
}

fn default_clean_session() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_reconnect() -> bool {
    true
}

fn default_reconnect_delay() -> u64 {
    10
}

fn default_keep_alive() -> u16 {
    60
}

fn default_operation_timeout() -> u64 {
    30
}

fn default_max_packet_size() -> usize {
    256 * 1024
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid server URI: {0}")]
    InvalidServerUri(String),
    #[error("Unsupported URI scheme '{0}' - only mqtt:// and tcp:// are supported")]
    UnsupportedScheme(String),
    #[error("Invalid client ID: {0}")]
    InvalidClientId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new(format!("mqtt://localhost:{DEFAULT_PORT}"), "")
    }
}

impl ConnectionConfig {
    /// Create a configuration with default settings for the given broker
    pub fn new<U: Into<String>, C: Into<String>>(server_uri: U, client_id: C) -> Self {
        Self {
            server_uri: server_uri.into(),
            client_id: client_id.into(),
            username: None,
            password: None,
            username_env: None,
            password_env: None,
            clean_session: default_clean_session(),
            connect_timeout_secs: default_connect_timeout(),
            reconnect: default_reconnect(),
            reconnect_delay_secs: default_reconnect_delay(),
            keep_alive_secs: default_keep_alive(),
            operation_timeout_secs: default_operation_timeout(),
            max_packet_size: default_max_packet_size(),
        }
    }

    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text and validate it
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ConnectionConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the server URI, client ID and numeric limits
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.endpoint()?;

        if self.client_id.len() > MAX_CLIENT_ID_LEN {
            return Err(ConfigError::InvalidClientId(format!(
                "client ID is {} bytes, maximum is {MAX_CLIENT_ID_LEN}",
                self.client_id.len()
            )));
        }
        if self.client_id.contains('\0') {
            return Err(ConfigError::InvalidClientId(
                "client ID must not contain NUL".to_string(),
            ));
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "connect_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.reconnect && self.reconnect_delay_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "reconnect_delay_secs must be greater than 0 when reconnect is enabled".to_string(),
            ));
        }
        if self.max_packet_size < 64 {
            return Err(ConfigError::InvalidConfig(
                "max_packet_size must be at least 64 bytes".to_string(),
            ));
        }

        Ok(())
    }

    /// Copy of this configuration with a generated client ID if none was set
    ///
    /// The generated ID is fixed for the lifetime of the copy so that
    /// reconnects resume the same broker session when `clean_session` is false.
    pub fn with_generated_client_id(&self) -> Self {
        let mut config = self.clone();
        if config.client_id.is_empty() {
            config.client_id = format!("mqtt-{}", uuid::Uuid::new_v4().simple());
        }
        config
    }

    /// Resolve host and port from the server URI
    pub fn endpoint(&self) -> Result<Endpoint, ConfigError> {
        let url = Url::parse(&self.server_uri)
            .map_err(|_| ConfigError::InvalidServerUri(self.server_uri.clone()))?;

        match url.scheme() {
            "mqtt" | "tcp" => {}
            other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ConfigError::InvalidServerUri(self.server_uri.clone()))?;
        let port = url.port().unwrap_or(DEFAULT_PORT);

        Ok(Endpoint {
            host: host.to_string(),
            port,
            keep_alive: self.keep_alive(),
            max_packet_size: self.max_packet_size,
        })
    }

    /// Username and password for CONNECT, falling back to environment variables
    pub fn credentials(&self) -> Option<(String, String)> {
        let username = self
            .username
            .clone()
            .or_else(|| Self::get_env_var_optional(self.username_env.as_ref()))?;
        let password = self
            .password
            .clone()
            .or_else(|| Self::get_env_var_optional(self.password_env.as_ref()))
            .unwrap_or_default();
        Some((username, password))
    }

    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(u64::from(self.keep_alive_secs))
    }

    /// Ack timeout for a single operation, `None` when disabled
    pub fn operation_timeout(&self) -> Option<Duration> {
        (self.operation_timeout_secs > 0).then(|| Duration::from_secs(self.operation_timeout_secs))
    }
}
