//! Mock implementations for testing
//!
//! Provides an in-memory MQTT broker implementing [`Transport`], plus a
//! recording message handler and connection observer, so the connection can
//! be exercised end to end without a network.

use crate::connection::{lock, ConnectionObserver, MqttConnection, SharedMessageHandler};
use crate::error::MqttError;
use crate::protocol::topics::topic_matches;
use crate::protocol::MqttMessage;
use crate::transport::{Endpoint, Outbound, Transport, TransportError, TransportLink};
use async_trait::async_trait;
use rumqttc::mqttbytes::v4::{
    ConnAck, ConnectReturnCode, Packet, PubAck, PubComp, PubRec, PubRel, Publish, SubAck,
    SubscribeReasonCode, UnsubAck,
};
use rumqttc::mqttbytes::QoS;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// CONNECT frame as seen by the mock broker
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectRecord {
    pub endpoint: String,
    pub client_id: String,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub username: Option<String>,
    /// Other sessions still open when this CONNECT arrived
    pub concurrent_sessions: usize,
}

struct Session {
    id: u64,
    endpoint: String,
    client_id: String,
    clean_session: bool,
    connected: bool,
    subscriptions: Vec<(String, QoS)>,
    inbound: mpsc::UnboundedSender<Result<Packet, TransportError>>,
}

struct BrokerState {
    reachable: bool,
    connack_code: ConnectReturnCode,
    withhold_connack: bool,
    ack_publishes: bool,
    ack_subscribes: bool,
    release_incoming: bool,
    rejected_filters: HashSet<String>,
    next_session: u64,
    next_pkid: u16,
    sessions: Vec<Session>,
    persisted: HashMap<String, Vec<(String, QoS)>>,
    retained: HashMap<String, MqttMessage>,
    attempts: usize,
    connects: Vec<ConnectRecord>,
    published: Vec<MqttMessage>,
    frames: Vec<Packet>,
    subscribe_requests: Vec<(String, QoS)>,
    unsubscribe_requests: Vec<String>,
    disconnects: usize,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            reachable: true,
            connack_code: ConnectReturnCode::Success,
            withhold_connack: false,
            ack_publishes: true,
            ack_subscribes: true,
            release_incoming: true,
            rejected_filters: HashSet::new(),
            next_session: 0,
            next_pkid: 0,
            sessions: Vec::new(),
            persisted: HashMap::new(),
            retained: HashMap::new(),
            attempts: 0,
            connects: Vec::new(),
            published: Vec::new(),
            frames: Vec::new(),
            subscribe_requests: Vec::new(),
            unsubscribe_requests: Vec::new(),
            disconnects: 0,
        }
    }
}

fn qos_rank(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}

impl BrokerState {
    fn session_mut(&mut self, id: u64) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.id == id)
    }

    fn reply(&mut self, id: u64, packet: Packet) {
        if let Some(session) = self.session_mut(id) {
            let _ = session.inbound.send(Ok(packet));
        }
    }

    fn allocate_pkid(&mut self) -> u16 {
        self.next_pkid = if self.next_pkid == u16::MAX {
            1
        } else {
            self.next_pkid + 1
        };
        self.next_pkid
    }

    /// Forward a message to every connected session with a matching subscription
    fn route(&mut self, message: &MqttMessage) {
        let deliveries: Vec<(usize, QoS)> = self
            .sessions
            .iter()
            .enumerate()
            .filter(|(_, s)| s.connected)
            .filter_map(|(index, s)| {
                s.subscriptions
                    .iter()
                    .filter(|(filter, _)| topic_matches(filter, &message.topic))
                    .map(|(_, qos)| *qos)
                    .max_by_key(|qos| qos_rank(*qos))
                    .map(|qos| (index, qos))
            })
            .collect();

        for (index, granted) in deliveries {
            let qos = if qos_rank(granted) < qos_rank(message.qos) {
                granted
            } else {
                message.qos
            };
            let pkid = if qos == QoS::AtMostOnce {
                0
            } else {
                self.allocate_pkid()
            };
            let mut publish = Publish::new(message.topic.as_str(), qos, message.payload.to_vec());
            publish.pkid = pkid;
            let _ = self.sessions[index].inbound.send(Ok(Packet::Publish(publish)));
        }
    }

    fn end_session(&mut self, id: u64) {
        if let Some(index) = self.sessions.iter().position(|s| s.id == id) {
            let session = self.sessions.remove(index);
            if !session.clean_session && !session.client_id.is_empty() {
                self.persisted
                    .insert(session.client_id, session.subscriptions);
            }
        }
    }

    fn handle_frame(&mut self, id: u64, packet: Packet) {
        if self.session_mut(id).is_none() {
            return;
        }
        self.frames.push(packet.clone());

        match packet {
            Packet::Connect(connect) => {
                let endpoint = self
                    .session_mut(id)
                    .map(|s| s.endpoint.clone())
                    .unwrap_or_default();
                self.connects.push(ConnectRecord {
                    endpoint,
                    client_id: connect.client_id.clone(),
                    clean_session: connect.clean_session,
                    keep_alive: connect.keep_alive,
                    username: connect.login.as_ref().map(|l| l.username.clone()),
                    concurrent_sessions: self.sessions.len() - 1,
                });
                if self.withhold_connack {
                    return;
                }

                let restored = if connect.clean_session {
                    self.persisted.remove(&connect.client_id);
                    Vec::new()
                } else {
                    self.persisted
                        .get(&connect.client_id)
                        .cloned()
                        .unwrap_or_default()
                };
                let code = self.connack_code;
                let session_present = !restored.is_empty();
                if let Some(session) = self.session_mut(id) {
                    session.client_id = connect.client_id;
                    session.clean_session = connect.clean_session;
                    session.subscriptions = restored;
                    session.connected = code == ConnectReturnCode::Success;
                }
                self.reply(id, Packet::ConnAck(ConnAck::new(code, session_present)));
            }
            Packet::Publish(publish) => {
                let message = MqttMessage::from(&publish);
                self.published.push(message.clone());
                if publish.retain {
                    self.retained.insert(message.topic.clone(), message.clone());
                }
                if self.ack_publishes {
                    match publish.qos {
                        QoS::AtLeastOnce => self.reply(id, Packet::PubAck(PubAck::new(publish.pkid))),
                        QoS::ExactlyOnce => self.reply(id, Packet::PubRec(PubRec::new(publish.pkid))),
                        QoS::AtMostOnce => {}
                    }
                }
                self.route(&message);
            }
            Packet::PubRel(rel) => {
                if self.ack_publishes {
                    self.reply(id, Packet::PubComp(PubComp::new(rel.pkid)));
                }
            }
            Packet::PubRec(rec) => {
                if self.release_incoming {
                    self.reply(id, Packet::PubRel(PubRel::new(rec.pkid)));
                }
            }
            Packet::Subscribe(subscribe) => {
                let mut codes = Vec::new();
                let mut granted = Vec::new();
                for filter in subscribe.filters {
                    self.subscribe_requests.push((filter.path.clone(), filter.qos));
                    if self.rejected_filters.contains(&filter.path) {
                        codes.push(SubscribeReasonCode::Failure);
                        continue;
                    }
                    codes.push(SubscribeReasonCode::Success(filter.qos));
                    granted.push((filter.path, filter.qos));
                }

                if let Some(session) = self.session_mut(id) {
                    for (path, qos) in &granted {
                        session.subscriptions.retain(|(f, _)| f != path);
                        session.subscriptions.push((path.clone(), *qos));
                    }
                }
                if self.ack_subscribes {
                    self.reply(id, Packet::SubAck(SubAck::new(subscribe.pkid, codes)));
                }

                let retained: Vec<MqttMessage> = self
                    .retained
                    .values()
                    .filter(|m| granted.iter().any(|(f, _)| topic_matches(f, &m.topic)))
                    .cloned()
                    .collect();
                for message in retained {
                    let mut publish =
                        Publish::new(message.topic.as_str(), QoS::AtMostOnce, message.payload.to_vec());
                    publish.retain = true;
                    self.reply(id, Packet::Publish(publish));
                }
            }
            Packet::Unsubscribe(unsubscribe) => {
                if let Some(session) = self.session_mut(id) {
                    session
                        .subscriptions
                        .retain(|(f, _)| !unsubscribe.topics.contains(f));
                }
                self.unsubscribe_requests
                    .extend(unsubscribe.topics.iter().cloned());
                self.reply(id, Packet::UnsubAck(UnsubAck::new(unsubscribe.pkid)));
            }
            _ => {}
        }
    }
}

/// In-memory broker implementing [`Transport`]
///
/// Clones share the same broker. Every `open` creates a new session; the
/// broker answers CONNECT, acknowledges publishes and subscriptions, routes
/// publishes to matching subscribers (including the sender) and keeps
/// subscriptions across reconnects only for `clean_session = false`.
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        lock(&self.state)
    }

    /// Refuse new connections at the transport level while false
    pub fn set_reachable(&self, reachable: bool) {
        self.state().reachable = reachable;
    }

    /// Return code sent in CONNACK
    pub fn set_connack_code(&self, code: ConnectReturnCode) {
        self.state().connack_code = code;
    }

    /// Never answer CONNECT while true
    pub fn withhold_connack(&self, withhold: bool) {
        self.state().withhold_connack = withhold;
    }

    /// Stop acknowledging client publishes (PUBACK, PUBREC and PUBCOMP)
    pub fn set_ack_publishes(&self, ack: bool) {
        self.state().ack_publishes = ack;
    }

    /// Stop sending SUBACK
    pub fn set_ack_subscribes(&self, ack: bool) {
        self.state().ack_subscribes = ack;
    }

    /// Answer the client's PUBREC with PUBREL while true
    pub fn set_release_incoming(&self, release: bool) {
        self.state().release_incoming = release;
    }

    /// Answer SUBSCRIBE for `filter` with a failure return code
    pub fn reject_filter(&self, filter: &str) {
        self.state().rejected_filters.insert(filter.to_string());
    }

    /// Simulate a network failure on every open session
    pub fn drop_connections(&self) {
        let mut state = self.state();
        let ids: Vec<u64> = state.sessions.iter().map(|s| s.id).collect();
        for id in ids {
            if let Some(session) = state.session_mut(id) {
                let _ = session.inbound.send(Err(TransportError::Closed(
                    "connection reset by broker".to_string(),
                )));
            }
            state.end_session(id);
        }
    }

    /// Publish from the broker side to matching subscribers
    pub fn inject(&self, message: MqttMessage) {
        self.state().route(&message);
    }

    /// Send a raw frame to every connected session
    pub fn send_to_clients(&self, packet: Packet) {
        let state = self.state();
        for session in state.sessions.iter().filter(|s| s.connected) {
            let _ = session.inbound.send(Ok(packet.clone()));
        }
    }

    pub fn connection_attempts(&self) -> usize {
        self.state().attempts
    }

    pub fn connects(&self) -> Vec<ConnectRecord> {
        self.state().connects.clone()
    }

    /// Messages published by clients, in arrival order
    pub fn published(&self) -> Vec<MqttMessage> {
        self.state().published.clone()
    }

    /// Every frame received from clients, in arrival order
    pub fn client_frames(&self) -> Vec<Packet> {
        self.state().frames.clone()
    }

    pub fn subscribe_requests(&self) -> Vec<(String, QoS)> {
        self.state().subscribe_requests.clone()
    }

    pub fn unsubscribe_requests(&self) -> Vec<String> {
        self.state().unsubscribe_requests.clone()
    }

    /// Sessions with an open link
    pub fn session_count(&self) -> usize {
        self.state().sessions.len()
    }

    /// Filters currently subscribed by connected sessions
    pub fn active_subscriptions(&self) -> Vec<String> {
        self.state()
            .sessions
            .iter()
            .flat_map(|s| s.subscriptions.iter().map(|(f, _)| f.clone()))
            .collect()
    }

    /// DISCONNECT frames received
    pub fn disconnects(&self) -> usize {
        self.state().disconnects
    }
}

#[async_trait]
impl Transport for MockBroker {
    async fn open(&self, endpoint: &Endpoint) -> Result<TransportLink, TransportError> {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let session_id = {
            let mut state = self.state();
            state.attempts += 1;
            if !state.reachable {
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "mock broker unreachable",
                )));
            }
            state.next_session += 1;
            let id = state.next_session;
            state.sessions.push(Session {
                id,
                endpoint: endpoint.to_string(),
                client_id: String::new(),
                clean_session: true,
                connected: false,
                subscriptions: Vec::new(),
                inbound: inbound_tx,
            });
            id
        };

        let broker = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                match frame {
                    Outbound::Packet(packet) => broker.state().handle_frame(session_id, packet),
                    Outbound::Disconnect => {
                        broker.state().disconnects += 1;
                        break;
                    }
                }
            }
            broker.state().end_session(session_id);
        });

        Ok(TransportLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

/// Message handler that records what it receives
///
/// Each call to [`handler`](Self::handler) returns a new handler identity
/// feeding the same record.
#[derive(Clone, Default)]
pub struct MessageCollector {
    messages: Arc<Mutex<Vec<MqttMessage>>>,
}

impl MessageCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler(&self) -> SharedMessageHandler {
        let messages = self.messages.clone();
        Arc::new(move |message: &MqttMessage| {
            lock(&messages).push(message.clone());
        })
    }

    pub fn messages(&self) -> Vec<MqttMessage> {
        lock(&self.messages).clone()
    }

    pub fn payloads(&self) -> Vec<String> {
        lock(&self.messages)
            .iter()
            .map(|m| m.payload_str().into_owned())
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.messages).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until at least `count` messages arrived
    pub async fn wait_for(&self, count: usize, limit: Duration) -> bool {
        wait_until(limit, || self.len() >= count).await
    }
}

/// Lifecycle callback recorded by [`RecordingObserver`]
#[derive(Debug, Clone, PartialEq)]
pub enum ObserverEvent {
    Established { reconnected: bool },
    Lost { will_reconnect: bool, cause: MqttError },
}

/// Observer that records callbacks and optionally resubscribes on connect
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ObserverEvent>>,
    resubscribe: Mutex<Vec<(String, QoS, Option<SharedMessageHandler>)>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Subscribe to `filter` from inside every `on_connection_established`
    pub fn resubscribe_on_connect(
        &self,
        filter: &str,
        qos: QoS,
        handler: Option<SharedMessageHandler>,
    ) {
        lock(&self.resubscribe).push((filter.to_string(), qos, handler));
    }

    pub fn events(&self) -> Vec<ObserverEvent> {
        lock(&self.events).clone()
    }

    pub fn established_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, ObserverEvent::Established { .. }))
            .count()
    }

    pub fn lost_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, ObserverEvent::Lost { .. }))
            .count()
    }
}

impl ConnectionObserver for RecordingObserver {
    fn on_connection_lost(&self, _connection: &MqttConnection, will_reconnect: bool, cause: &MqttError) {
        lock(&self.events).push(ObserverEvent::Lost {
            will_reconnect,
            cause: cause.clone(),
        });
    }

    fn on_connection_established(&self, connection: &MqttConnection, reconnected: bool) {
        lock(&self.events).push(ObserverEvent::Established { reconnected });
        let subscriptions = lock(&self.resubscribe).clone();
        for (filter, qos, handler) in subscriptions {
            // Not awaited: the SUBACK arrives on the task running this callback
            drop(connection.subscribe(&filter, qos, handler));
        }
    }
}

/// Poll `condition` until it holds or `limit` elapses
pub async fn wait_until<F: FnMut() -> bool>(limit: Duration, mut condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
