//! MQTT message values and topic rules
//!
//! Frame encoding itself is delegated to `rumqttc::mqttbytes`; this module only
//! holds the application-facing message type and topic filter logic.

pub mod message;
pub mod topics;

pub use message::MqttMessage;
pub use rumqttc::mqttbytes::QoS;
pub use topics::{topic_matches, validate_topic_filter, validate_topic_name, TopicError};
