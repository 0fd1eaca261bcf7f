//! Application-level MQTT message value

use bytes::Bytes;
use rumqttc::mqttbytes::v4::Publish;
use rumqttc::mqttbytes::QoS;

/// An immutable MQTT application message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttMessage {
    pub topic: String,
    pub retained: bool,
    pub qos: QoS,
    pub payload: Bytes,
}

impl MqttMessage {
    pub fn new<T: Into<String>, P: Into<Bytes>>(topic: T, qos: QoS, payload: P) -> Self {
        Self {
            topic: topic.into(),
            retained: false,
            qos,
            payload: payload.into(),
        }
    }

    /// Same message with the retain flag set
    pub fn retain(mut self, retained: bool) -> Self {
        self.retained = retained;
        self
    }

    /// Payload as UTF-8, replacing invalid sequences
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Build the PUBLISH frame for this message with the given packet identifier
    pub(crate) fn to_publish(&self, pkid: u16) -> Publish {
        let mut publish = Publish::new(self.topic.as_str(), self.qos, self.payload.to_vec());
        publish.retain = self.retained;
        publish.pkid = pkid;
        publish
    }
}

impl From<&Publish> for MqttMessage {
    fn from(publish: &Publish) -> Self {
        Self {
            topic: publish.topic.clone(),
            retained: publish.retain,
            qos: publish.qos,
            payload: publish.payload.clone(),
        }
    }
}
