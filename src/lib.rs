//! MQTT session manager
//!
//! A reconnecting, concurrency-safe MQTT 3.1.1 client session built on tokio.
//!
//! # Overview
//!
//! - [`MqttConnection`] owns one logical session with a broker and keeps it
//!   alive across network failures when `reconnect` is enabled
//! - every open, close, reconfigure, publish, subscribe and unsubscribe
//!   request returns an [`OperationHandle`] that resolves exactly once
//! - inbound messages are dispatched to the handler of the most specific
//!   matching subscription, or to a global handler
//! - a [`ConnectionObserver`] is told when sessions are established or lost,
//!   and is the place to restore subscriptions after a reconnect
//!
//! # Quick Start
//!
//! ```no_run
//! use mqtt_session::{handler_fn, ConnectionConfig, MqttConnection, MqttMessage, QoS};
//!
//! # async fn run() -> Result<(), mqtt_session::MqttError> {
//! let config = ConnectionConfig::new("mqtt://localhost:1883", "meter-7");
//! let connection = MqttConnection::new(config)?;
//! connection.open().await?;
//!
//! let handler = handler_fn(|message: &MqttMessage| {
//!     println!("{} -> {}", message.topic, message.payload_str());
//! });
//! connection.subscribe("sensors/#", QoS::AtLeastOnce, Some(handler)).await?;
//! connection
//!     .publish(MqttMessage::new("sensors/1", QoS::AtLeastOnce, "21.5"))
//!     .await?;
//!
//! connection.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, ConnectionConfig};
pub use connection::{
    handler_fn, ConnectionObserver, ConnectionState, MessageHandler, MqttConnection,
    OperationHandle, SharedMessageHandler,
};
pub use error::{MqttError, MqttResult};
pub use protocol::{MqttMessage, QoS};
pub use transport::{TcpTransport, Transport};
