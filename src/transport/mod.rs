//! Transport seam between the connection state machine and the broker
//!
//! A [`Transport`] opens one byte-level link per connect attempt and exchanges
//! decoded MQTT frames over channels. Frame encoding is done by
//! `rumqttc::mqttbytes::v4`; the connection never touches raw bytes.

use rumqttc::mqttbytes::v4::Packet;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod tcp;

pub use tcp::TcpTransport;

/// Broker address and link-level settings derived from the connection config
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    /// Idle interval after which the link sends PINGREQ (zero disables)
    pub keep_alive: Duration,
    pub max_packet_size: usize,
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Frames handed to the transport for sending
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Packet(Packet),
    /// Send DISCONNECT and close the link
    Disconnect,
}

/// Transport-level failures
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Codec error: {0}")]
    Codec(String),
    #[error("Frame of {size} bytes exceeds the {max} byte limit")]
    PacketTooLarge { size: usize, max: usize },
    #[error("Link closed: {0}")]
    Closed(String),
    #[error("Keep-alive timeout - no traffic from broker for {0:?}")]
    KeepAliveTimeout(Duration),
}

/// An open link to the broker
///
/// Dropping `outbound` closes the link. `inbound` yields decoded frames in
/// arrival order; an `Err` item or the end of the stream means the link is gone.
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<Outbound>,
    pub inbound: mpsc::UnboundedReceiver<Result<Packet, TransportError>>,
}

/// Opens links to a broker
///
/// Implementations must be cheap to call repeatedly: the connection calls
/// `open` once per connect attempt.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self, endpoint: &Endpoint) -> Result<TransportLink, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_display() {
        let endpoint = Endpoint {
            host: "broker.local".to_string(),
            port: 1883,
            keep_alive: Duration::from_secs(60),
            max_packet_size: 1024,
        };
        assert_eq!(endpoint.to_string(), "broker.local:1883");
    }

    #[test]
    fn test_transport_error_display() {
        let errors = vec![
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "refused",
            )),
            TransportError::Codec("malformed".to_string()),
            TransportError::Closed("eof".to_string()),
            TransportError::KeepAliveTimeout(Duration::from_secs(90)),
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }
}
