//! Error types for MQTT session operations
//!
//! Every operation handle resolves to `Result<(), MqttError>`. The variants map
//! one-to-one onto the ways an operation can end without success.

use crate::connection::ConnectionState;
use thiserror::Error;

/// Main error type for connection, publish, subscribe and unsubscribe operations
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MqttError {
    #[error("Connect failed: {reason}")]
    ConnectFailed { reason: String },

    #[error("Operation timed out waiting for {operation} acknowledgment")]
    Timeout { operation: &'static str },

    #[error("Connection lost: {reason}")]
    ConnectionLost { reason: String },

    #[error("Connection closed")]
    Closed,

    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },

    #[error("Subscription to {topic} rejected by broker")]
    SubscribeRejected { topic: String },

    #[error("No free packet identifiers - too many operations in flight")]
    PacketIdsExhausted,

    #[error("Invalid topic name: {0}")]
    InvalidTopic(String),

    #[error("Invalid topic filter: {0}")]
    InvalidTopicFilter(String),

    #[error("PUBLISH frame of {size} bytes exceeds max_packet_size {max}")]
    PacketTooLarge { size: usize, max: usize },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl MqttError {
    /// Create connect failure error
    pub fn connect_failed<S: Into<String>>(reason: S) -> Self {
        Self::ConnectFailed {
            reason: reason.into(),
        }
    }

    /// Create connection lost error
    pub fn connection_lost<S: Into<String>>(reason: S) -> Self {
        Self::ConnectionLost {
            reason: reason.into(),
        }
    }
}

impl From<crate::config::ConfigError> for MqttError {
    fn from(error: crate::config::ConfigError) -> Self {
        MqttError::Config(error.to_string())
    }
}

impl From<crate::transport::TransportError> for MqttError {
    fn from(error: crate::transport::TransportError) -> Self {
        MqttError::Transport(error.to_string())
    }
}

/// Convenience result alias
pub type MqttResult<T> = Result<T, MqttError>;
