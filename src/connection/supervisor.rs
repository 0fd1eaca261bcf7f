//! Background task owning one open cycle of a connection
//!
//! A supervisor is started by `open` or `reconfigure` and runs until the
//! cycle ends: it connects, reads frames in arrival order, reacts to link
//! loss and retries after the configured delay. It only holds a weak
//! reference to the connection, so dropping every `MqttConnection` clone
//! stops it.

use super::pending::AckKind;
use super::state::ConnectionEvent;
use super::{lock, ConnectionInner, MqttConnection};
use crate::config::ConnectionConfig;
use crate::error::MqttError;
use crate::protocol::MqttMessage;
use crate::transport::{Endpoint, Outbound, Transport, TransportLink};
use rumqttc::mqttbytes::v4::{
    Connect, ConnectReturnCode, Login, Packet, PubAck, PubComp, PubRec, PubRel, Publish,
    SubscribeReasonCode,
};
use rumqttc::mqttbytes::QoS;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

/// How long a closing link may take to shut down after DISCONNECT
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

enum Attempt {
    Connected {
        link: TransportLink,
        session_present: bool,
    },
    Failed(MqttError),
    Shutdown,
}

enum LinkEnd {
    Lost(MqttError),
    Shutdown,
}

pub(crate) struct Supervisor {
    inner: Weak<ConnectionInner>,
    transport: Arc<dyn Transport>,
    generation: u64,
    config: Arc<ConnectionConfig>,
    shutdown: watch::Receiver<bool>,
    /// Done signal of the cycle this one replaces
    previous: Option<watch::Receiver<()>>,
    /// Dropped when this supervisor exits
    _done: watch::Sender<()>,
    /// QoS 2 packet ids received but not yet released by PUBREL
    incoming_qos2: HashSet<u16>,
}

impl Supervisor {
    pub(crate) fn new(
        inner: &Arc<ConnectionInner>,
        generation: u64,
        config: Arc<ConnectionConfig>,
        shutdown: watch::Receiver<bool>,
        previous: Option<watch::Receiver<()>>,
        done: watch::Sender<()>,
    ) -> Self {
        Self {
            inner: Arc::downgrade(inner),
            transport: inner.transport.clone(),
            generation,
            config,
            shutdown,
            previous,
            _done: done,
            incoming_qos2: HashSet::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        if let Some(mut previous) = self.previous.take() {
            // Completes once the previous supervisor drops its sender
            let _ = previous.changed().await;
        }

        let endpoint = match self.config.endpoint() {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.on_connect_failed(MqttError::from(e), false);
                return;
            }
        };

        let mut reconnected = false;
        loop {
            let link = match self.connect(&endpoint).await {
                Attempt::Connected {
                    link,
                    session_present,
                } => {
                    if !session_present {
                        // Packet ids of a fresh broker session start over
                        self.incoming_qos2.clear();
                    }
                    link
                }
                Attempt::Shutdown => break,
                Attempt::Failed(error) => {
                    if !self.on_connect_failed(error, self.config.reconnect)
                        || !self.wait_before_retry().await
                    {
                        break;
                    }
                    continue;
                }
            };

            if !self.on_connected(&link, reconnected) {
                disconnect(link).await;
                break;
            }
            reconnected = true;

            match self.pump(link).await {
                LinkEnd::Shutdown => break,
                LinkEnd::Lost(cause) => {
                    if !self.on_connection_lost(cause) || !self.wait_before_retry().await {
                        break;
                    }
                }
            }
        }

        debug!("Supervisor for cycle {} exiting", self.generation);
    }

    fn connection(&self) -> Option<MqttConnection> {
        self.inner.upgrade().map(|inner| MqttConnection { inner })
    }

    /// One connect attempt bounded by the connect timeout
    async fn connect(&mut self, endpoint: &Endpoint) -> Attempt {
        info!(
            client_id = %self.config.client_id,
            "Connecting to MQTT broker at {}",
            endpoint
        );

        let transport = self.transport.clone();
        let connect = build_connect(&self.config);
        let target = endpoint.clone();
        let attempt = async move {
            let mut link = transport
                .open(&target)
                .await
                .map_err(|e| MqttError::connect_failed(format!("{target}: {e}")))?;

            link.outbound
                .send(Outbound::Packet(Packet::Connect(connect)))
                .map_err(|_| MqttError::connect_failed("link closed before CONNECT was sent"))?;

            match link.inbound.recv().await {
                Some(Ok(Packet::ConnAck(ack))) if ack.code == ConnectReturnCode::Success => {
                    Ok((link, ack.session_present))
                }
                Some(Ok(Packet::ConnAck(ack))) => Err(MqttError::connect_failed(format!(
                    "broker refused connection: {:?}",
                    ack.code
                ))),
                Some(Ok(other)) => Err(MqttError::connect_failed(format!(
                    "expected CONNACK, received {other:?}"
                ))),
                Some(Err(e)) => Err(MqttError::connect_failed(e.to_string())),
                None => Err(MqttError::connect_failed("link closed before CONNACK")),
            }
        };

        let limit = self.config.connect_timeout();
        tokio::select! {
            _ = shutdown_requested(&mut self.shutdown) => Attempt::Shutdown,
            result = tokio::time::timeout(limit, attempt) => match result {
                Ok(Ok((link, session_present))) => Attempt::Connected {
                    link,
                    session_present,
                },
                Ok(Err(error)) => Attempt::Failed(error),
                Err(_) => Attempt::Failed(MqttError::connect_failed(format!(
                    "no CONNACK within {limit:?}"
                ))),
            },
        }
    }

    /// Publish the new session; false if this cycle was superseded
    fn on_connected(&self, link: &TransportLink, reconnected: bool) -> bool {
        let Some(connection) = self.connection() else {
            return false;
        };
        let inner = &connection.inner;

        let waiters = {
            let mut control = lock(&inner.control);
            if control.generation != self.generation
                || inner.state.apply(ConnectionEvent::ConnectSucceeded).is_none()
            {
                return false;
            }
            control.outbound = Some(link.outbound.clone());
            std::mem::take(&mut control.open_waiters)
        };

        info!(
            client_id = %self.config.client_id,
            reconnected,
            "MQTT session established"
        );
        for waiter in waiters {
            waiter.complete(Ok(()));
        }
        inner.observer.notify_established(&connection, reconnected);
        true
    }

    /// Record a failed attempt; returns whether to retry
    fn on_connect_failed(&self, error: MqttError, retry: bool) -> bool {
        let Some(connection) = self.connection() else {
            return false;
        };
        let inner = &connection.inner;

        let waiters = {
            let mut control = lock(&inner.control);
            if control.generation != self.generation
                || inner
                    .state
                    .apply(ConnectionEvent::ConnectFailed { will_retry: retry })
                    .is_none()
            {
                return false;
            }
            if retry {
                Vec::new()
            } else {
                std::mem::take(&mut control.open_waiters)
            }
        };

        if retry {
            warn!(
                "Connect attempt failed: {}; retrying in {:?}",
                error,
                self.config.reconnect_delay()
            );
        } else {
            error!("Connect attempt failed: {}", error);
        }
        for waiter in waiters {
            waiter.complete(Err(error.clone()));
        }
        retry
    }

    /// Tear down after an unexpected link loss; returns whether to reconnect
    fn on_connection_lost(&self, cause: MqttError) -> bool {
        let Some(connection) = self.connection() else {
            return false;
        };
        let inner = &connection.inner;
        let will_reconnect = self.config.reconnect;

        {
            let mut control = lock(&inner.control);
            if control.generation != self.generation
                || inner
                    .state
                    .apply(ConnectionEvent::ConnectionLost { will_reconnect })
                    .is_none()
            {
                return false;
            }
            control.outbound = None;
        }

        warn!(will_reconnect, "MQTT connection lost: {}", cause);
        inner.pending.fail_all(cause.clone());
        inner
            .observer
            .notify_lost(&connection, will_reconnect, &cause);
        will_reconnect
    }

    /// Sleep for the reconnect delay, then move back to connecting
    async fn wait_before_retry(&mut self) -> bool {
        let delay = self.config.reconnect_delay();
        if !interruptible_sleep(&mut self.shutdown, delay).await {
            info!("Shutdown requested during reconnect delay, stopping");
            return false;
        }

        let Some(connection) = self.connection() else {
            return false;
        };
        let control = lock(&connection.inner.control);
        let resumed = control.generation == self.generation
            && connection
                .inner
                .state
                .apply(ConnectionEvent::RetryTimerFired)
                .is_some();
        resumed
    }

    /// Read frames until the link ends or shutdown is requested
    async fn pump(&mut self, mut link: TransportLink) -> LinkEnd {
        loop {
            tokio::select! {
                biased;

                _ = shutdown_requested(&mut self.shutdown) => {
                    debug!("Shutdown requested, sending DISCONNECT");
                    disconnect(link).await;
                    return LinkEnd::Shutdown;
                }

                frame = link.inbound.recv() => match frame {
                    Some(Ok(packet)) => {
                        let Some(connection) = self.connection() else {
                            disconnect(link).await;
                            return LinkEnd::Shutdown;
                        };
                        self.handle_packet(&connection, packet, &link.outbound);
                    }
                    Some(Err(e)) => return LinkEnd::Lost(MqttError::connection_lost(e.to_string())),
                    None => return LinkEnd::Lost(MqttError::connection_lost("link closed")),
                },
            }
        }
    }

    fn handle_packet(
        &mut self,
        connection: &MqttConnection,
        packet: Packet,
        outbound: &mpsc::UnboundedSender<Outbound>,
    ) {
        let inner = &connection.inner;
        match packet {
            Packet::Publish(publish) => self.handle_publish(inner, publish, outbound),
            Packet::PubAck(ack) => complete(inner, ack.pkid, AckKind::PubAck),
            Packet::PubRec(rec) => {
                if !inner.pending.awaits_pubrec(rec.pkid) {
                    debug!("PUBREC for unknown packet id {}", rec.pkid);
                }
                send(outbound, Packet::PubRel(PubRel::new(rec.pkid)));
            }
            Packet::PubRel(rel) => {
                self.incoming_qos2.remove(&rel.pkid);
                send(outbound, Packet::PubComp(PubComp::new(rel.pkid)));
            }
            Packet::PubComp(comp) => complete(inner, comp.pkid, AckKind::PubComp),
            Packet::SubAck(ack) => {
                let Some(op) = inner.pending.take(ack.pkid, AckKind::SubAck) else {
                    return;
                };
                let rejected = ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure));
                if rejected {
                    let topic = op.topic().to_string();
                    warn!("Broker rejected subscription to {}", topic);
                    inner.subscriptions.remove_filter(&topic);
                    op.complete(Err(MqttError::SubscribeRejected { topic }));
                } else {
                    op.complete(Ok(()));
                }
            }
            Packet::UnsubAck(ack) => complete(inner, ack.pkid, AckKind::UnsubAck),
            Packet::ConnAck(_) => warn!("Ignoring unexpected CONNACK on an open session"),
            other => trace!("Ignoring {:?}", other),
        }
    }

    fn handle_publish(
        &mut self,
        inner: &ConnectionInner,
        publish: Publish,
        outbound: &mpsc::UnboundedSender<Outbound>,
    ) {
        let message = MqttMessage::from(&publish);
        match publish.qos {
            QoS::AtMostOnce => {
                inner.subscriptions.dispatch(&message);
            }
            QoS::AtLeastOnce => {
                inner.subscriptions.dispatch(&message);
                send(outbound, Packet::PubAck(PubAck::new(publish.pkid)));
            }
            QoS::ExactlyOnce => {
                if self.incoming_qos2.insert(publish.pkid) {
                    inner.subscriptions.dispatch(&message);
                } else {
                    debug!(
                        "Duplicate QoS 2 delivery for packet id {} suppressed",
                        publish.pkid
                    );
                }
                send(outbound, Packet::PubRec(PubRec::new(publish.pkid)));
            }
        }
    }
}

fn complete(inner: &ConnectionInner, pkid: u16, ack: AckKind) {
    if let Some(op) = inner.pending.take(pkid, ack) {
        op.complete(Ok(()));
    }
}

fn send(outbound: &mpsc::UnboundedSender<Outbound>, packet: Packet) {
    if outbound.send(Outbound::Packet(packet)).is_err() {
        debug!("Link closed before frame could be sent");
    }
}

/// CONNECT frame for the configured session parameters
pub(crate) fn build_connect(config: &ConnectionConfig) -> Connect {
    let mut connect = Connect::new(config.client_id.as_str());
    connect.keep_alive = config.keep_alive_secs;
    connect.clean_session = config.clean_session;
    if let Some((username, password)) = config.credentials() {
        connect.login = Some(Login::new(username, password));
    }
    connect
}

/// Send DISCONNECT and wait, bounded, for the transport to close the link
async fn disconnect(mut link: TransportLink) {
    if link.outbound.send(Outbound::Disconnect).is_err() {
        return;
    }
    let drained = tokio::time::timeout(DISCONNECT_GRACE, async {
        while link.inbound.recv().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!("Link did not close within {:?} after DISCONNECT", DISCONNECT_GRACE);
    }
}

/// Resolves once shutdown is signalled or its sender is gone
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Sleep with shutdown monitoring
/// Returns true if the sleep completed, false if shutdown was requested
pub(crate) async fn interruptible_sleep(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = shutdown_requested(shutdown) => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
