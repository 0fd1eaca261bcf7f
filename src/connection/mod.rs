//! Reconnecting MQTT session manager
//!
//! [`MqttConnection`] is a cheaply cloneable handle that may be shared across
//! tasks and threads. Every request returns immediately with an
//! [`OperationHandle`]; the work itself runs on a background supervisor task
//! owned by the current open cycle.
//!
//! Locking: `control` guards the cycle bookkeeping and every state
//! transition. It is never held while a handler or observer callback runs,
//! so callbacks may call back into the connection.

pub mod handle;
pub mod observer;
pub mod pending;
pub mod state;
pub mod subscriptions;
mod supervisor;

pub use handle::OperationHandle;
pub use observer::ConnectionObserver;
pub use pending::{OperationKind, PendingOperationTable};
pub use state::{ConnectionEvent, ConnectionState};
pub use subscriptions::{handler_fn, MessageHandler, SharedMessageHandler, SubscriptionRegistry};

use crate::config::ConnectionConfig;
use crate::error::{MqttError, MqttResult};
use crate::protocol::topics::{validate_topic_filter, validate_topic_name};
use crate::protocol::MqttMessage;
use crate::transport::{Outbound, TcpTransport, Transport};
use handle::Completion;
use observer::ObserverSlot;
use rumqttc::mqttbytes::v4::{Packet, Subscribe, Unsubscribe};
use rumqttc::mqttbytes::QoS;
use state::{can_send, StateMachine};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use supervisor::Supervisor;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, Instrument};

/// Bookkeeping for the current open cycle
#[derive(Default)]
pub(crate) struct Control {
    /// Incremented every time a new supervisor is started
    generation: u64,
    shutdown: Option<watch::Sender<bool>>,
    /// Resolves when the current supervisor has exited
    done: Option<watch::Receiver<()>>,
    /// Sender of the live session, only set while `Open`
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    open_waiters: Vec<Completion>,
}

pub(crate) struct ConnectionInner {
    runtime: Handle,
    transport: Arc<dyn Transport>,
    config: RwLock<Arc<ConnectionConfig>>,
    state: StateMachine,
    control: Mutex<Control>,
    pending: Arc<PendingOperationTable>,
    subscriptions: SubscriptionRegistry,
    observer: ObserverSlot,
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        let control = self
            .control
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);

        // Signal shutdown to the supervisor if it's still running
        if let Some(shutdown) = control.shutdown.take() {
            let _ = shutdown.send(true);
        }
        for waiter in control.open_waiters.drain(..) {
            waiter.complete(Err(MqttError::Closed));
        }
        self.pending.fail_all(MqttError::Closed);
    }
}

/// A reconnecting MQTT client session
///
/// Dropping the last clone stops the background supervisor; call
/// [`close`](Self::close) for an orderly DISCONNECT.
#[derive(Clone)]
pub struct MqttConnection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for MqttConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttConnection")
            .field("client_id", &self.config().client_id)
            .field("state", &self.state())
            .finish()
    }
}

impl MqttConnection {
    /// Create a connection using the plain TCP transport
    ///
    /// Must be called from within a tokio runtime; the connection spawns its
    /// background tasks onto that runtime and may afterwards be driven from
    /// any thread.
    pub fn new(config: ConnectionConfig) -> MqttResult<Self> {
        Self::with_transport(config, Arc::new(TcpTransport::new()))
    }

    /// Create a connection over a custom transport
    pub fn with_transport(
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
    ) -> MqttResult<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| {
            MqttError::Config("MqttConnection must be created inside a tokio runtime".to_string())
        })?;

        Ok(Self {
            inner: Arc::new(ConnectionInner {
                runtime,
                transport,
                config: RwLock::new(Arc::new(config.with_generated_client_id())),
                state: StateMachine::new(),
                control: Mutex::new(Control::default()),
                pending: Arc::new(PendingOperationTable::new()),
                subscriptions: SubscriptionRegistry::new(),
                observer: ObserverSlot::default(),
            }),
        })
    }

    /// Start connecting; resolves once a session is open
    ///
    /// With `reconnect` enabled, failed attempts are retried and the handle
    /// stays pending until a session opens or the connection is closed.
    /// Calling `open` while already open resolves immediately.
    pub fn open(&self) -> OperationHandle {
        let (completion, handle) = OperationHandle::pair();
        let mut control = lock(&self.inner.control);

        match self.inner.state.current() {
            ConnectionState::Open => {
                completion.complete(Ok(()));
            }
            ConnectionState::Connecting | ConnectionState::ReconnectWaiting => {
                control.open_waiters.push(completion);
            }
            ConnectionState::Closed | ConnectionState::Closing => {
                self.start_cycle(&mut control);
                control.open_waiters.push(completion);
            }
        }
        handle
    }

    /// Disconnect and stop reconnecting
    ///
    /// Pending operations and open requests fail with [`MqttError::Closed`]
    /// and all subscriptions are removed; the global handler is kept.
    pub fn close(&self) -> OperationHandle {
        let (completion, handle) = OperationHandle::pair();
        let (done, generation) = {
            let mut control = lock(&self.inner.control);
            self.stop_cycle(&mut control);
            (control.done.clone(), control.generation)
        };

        let inner = self.inner.clone();
        self.inner.runtime.spawn(async move {
            if let Some(mut done) = done {
                let _ = done.changed().await;
            }
            {
                let control = lock(&inner.control);
                if control.generation == generation {
                    inner.state.apply(ConnectionEvent::CloseCompleted);
                }
            }
            info!("MQTT connection closed");
            completion.complete(Ok(()));
        });
        handle
    }

    /// Replace the configuration and reconnect with it
    ///
    /// Equivalent to `close` followed by `open` with the new settings: the
    /// old session is disconnected before the new one connects.
    pub fn reconfigure(&self, config: ConnectionConfig) -> OperationHandle {
        if let Err(e) = config.validate() {
            return OperationHandle::failed(e.into());
        }
        let config = Arc::new(config.with_generated_client_id());

        let (completion, handle) = OperationHandle::pair();
        let mut control = lock(&self.inner.control);
        info!(
            server_uri = %config.server_uri,
            client_id = %config.client_id,
            "Reconfiguring MQTT connection"
        );
        *write(&self.inner.config) = config;
        self.stop_cycle(&mut control);
        self.start_cycle(&mut control);
        control.open_waiters.push(completion);
        handle
    }

    /// Send an application message
    ///
    /// QoS 0 resolves once the frame is handed to the link; QoS 1 and 2
    /// resolve on PUBACK and PUBCOMP respectively.
    pub fn publish(&self, message: MqttMessage) -> OperationHandle {
        if let Err(e) = validate_topic_name(&message.topic) {
            return OperationHandle::failed(MqttError::InvalidTopic(e.to_string()));
        }

        // Sized with a placeholder id; QoS 1 and 2 frames carry two more bytes
        let mut publish = message.to_publish(u16::from(message.qos != QoS::AtMostOnce));
        let max = self.config().max_packet_size;
        if publish.size() > max {
            return OperationHandle::failed(MqttError::PacketTooLarge {
                size: publish.size(),
                max,
            });
        }

        let (completion, handle) = OperationHandle::pair();
        let control = lock(&self.inner.control);
        let outbound = match self.live_outbound(&control) {
            Ok(outbound) => outbound,
            Err(e) => {
                completion.complete(Err(e));
                return handle;
            }
        };

        if message.qos == QoS::AtMostOnce {
            let sent = outbound
                .send(Outbound::Packet(Packet::Publish(publish)))
                .map_err(|_| MqttError::connection_lost("link closed before PUBLISH was sent"));
            completion.complete(sent);
            return handle;
        }

        let pkid = match self.inner.pending.register(
            OperationKind::Publish(message.qos),
            &message.topic,
            completion.clone(),
        ) {
            Ok(pkid) => pkid,
            Err(e) => {
                completion.complete(Err(e));
                return handle;
            }
        };
        publish.pkid = pkid;
        self.send_registered(&outbound, pkid, Packet::Publish(publish), completion);
        handle
    }

    /// Subscribe to a topic filter
    ///
    /// Messages matching `topic` go to `handler`, or to the global handler
    /// when `handler` is `None`. The entry is registered before SUBSCRIBE is
    /// sent so retained messages are not missed.
    pub fn subscribe(
        &self,
        topic: &str,
        qos: QoS,
        handler: Option<SharedMessageHandler>,
    ) -> OperationHandle {
        if let Err(e) = validate_topic_filter(topic) {
            return OperationHandle::failed(MqttError::InvalidTopicFilter(e.to_string()));
        }

        let (completion, handle) = OperationHandle::pair();
        let control = lock(&self.inner.control);
        let outbound = match self.live_outbound(&control) {
            Ok(outbound) => outbound,
            Err(e) => {
                completion.complete(Err(e));
                return handle;
            }
        };

        self.inner.subscriptions.add(topic, qos, handler.clone());
        let pkid =
            match self
                .inner
                .pending
                .register(OperationKind::Subscribe, topic, completion.clone())
            {
                Ok(pkid) => pkid,
                Err(e) => {
                    self.inner.subscriptions.remove(topic, handler.as_ref());
                    completion.complete(Err(e));
                    return handle;
                }
            };

        let mut subscribe = Subscribe::new(topic, qos);
        subscribe.pkid = pkid;
        self.send_registered(&outbound, pkid, Packet::Subscribe(subscribe), completion);
        handle
    }

    /// Remove the subscription registered for (`topic`, `handler`)
    ///
    /// UNSUBSCRIBE is only sent once no other handler uses the filter;
    /// otherwise the handle resolves immediately.
    pub fn unsubscribe(
        &self,
        topic: &str,
        handler: Option<&SharedMessageHandler>,
    ) -> OperationHandle {
        if let Err(e) = validate_topic_filter(topic) {
            return OperationHandle::failed(MqttError::InvalidTopicFilter(e.to_string()));
        }

        let (completion, handle) = OperationHandle::pair();
        let control = lock(&self.inner.control);
        let outbound = match self.live_outbound(&control) {
            Ok(outbound) => outbound,
            Err(e) => {
                completion.complete(Err(e));
                return handle;
            }
        };

        let removal = self.inner.subscriptions.remove(topic, handler);
        if removal.filter_still_used {
            debug!("Filter {} still in use, not sending UNSUBSCRIBE", topic);
            completion.complete(Ok(()));
            return handle;
        }

        let pkid =
            match self
                .inner
                .pending
                .register(OperationKind::Unsubscribe, topic, completion.clone())
            {
                Ok(pkid) => pkid,
                Err(e) => {
                    completion.complete(Err(e));
                    return handle;
                }
            };

        let mut unsubscribe = Unsubscribe::new(topic);
        unsubscribe.pkid = pkid;
        self.send_registered(&outbound, pkid, Packet::Unsubscribe(unsubscribe), completion);
        handle
    }

    /// Set or clear the handler for messages no subscription handler takes
    pub fn set_message_handler(&self, handler: Option<SharedMessageHandler>) {
        self.inner.subscriptions.set_global_handler(handler);
    }

    /// Set or clear the lifecycle observer
    pub fn set_connection_observer(&self, observer: Option<Arc<dyn ConnectionObserver>>) {
        self.inner.observer.set(observer);
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.current()
    }

    pub fn is_open(&self) -> bool {
        can_send(self.state())
    }

    /// Configuration of the current open cycle
    pub fn config(&self) -> Arc<ConnectionConfig> {
        read(&self.inner.config).clone()
    }

    /// Receiver that observes every state change
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Number of operations waiting for an acknowledgment
    pub fn pending_operations(&self) -> usize {
        self.inner.pending.len()
    }

    /// Registered (filter, qos) pairs in registration order
    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        self.inner.subscriptions.filters()
    }

    fn live_outbound(&self, control: &Control) -> MqttResult<mpsc::UnboundedSender<Outbound>> {
        let state = self.inner.state.current();
        match &control.outbound {
            Some(outbound) if can_send(state) => Ok(outbound.clone()),
            _ => Err(MqttError::NotConnected { state }),
        }
    }

    fn send_registered(
        &self,
        outbound: &mpsc::UnboundedSender<Outbound>,
        pkid: u16,
        packet: Packet,
        completion: Completion,
    ) {
        if outbound.send(Outbound::Packet(packet)).is_err() {
            if let Some(op) = self.inner.pending.remove(pkid) {
                op.complete(Err(MqttError::connection_lost(
                    "link closed before the frame was sent",
                )));
            }
            return;
        }
        self.arm_timeout(pkid, completion);
    }

    fn arm_timeout(&self, pkid: u16, completion: Completion) {
        let Some(limit) = self.config().operation_timeout() else {
            return;
        };

        let table = Arc::downgrade(&self.inner.pending);
        let expiring = completion.clone();
        let timer = self.inner.runtime.spawn(async move {
            tokio::time::sleep(limit).await;
            if let Some(table) = table.upgrade() {
                table.expire(pkid, &expiring);
            }
        });
        self.inner
            .pending
            .set_timer(pkid, &completion, timer.abort_handle());
    }

    /// Start a new supervisor after whatever cycle is currently winding down
    fn start_cycle(&self, control: &mut Control) {
        self.inner.state.apply(ConnectionEvent::OpenRequested);
        control.generation += 1;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(());
        let previous = control.done.replace(done_rx);
        control.shutdown = Some(shutdown_tx);

        let config = self.config();
        let span = crate::connection_span!(
            client_id = %config.client_id,
            cycle = control.generation
        );
        let supervisor = Supervisor::new(
            &self.inner,
            control.generation,
            config,
            shutdown_rx,
            previous,
            done_tx,
        );
        self.inner.runtime.spawn(supervisor.run().instrument(span));
    }

    /// Stop the current cycle and fail everything waiting on it
    fn stop_cycle(&self, control: &mut Control) {
        self.inner.state.apply(ConnectionEvent::CloseRequested);
        if let Some(shutdown) = control.shutdown.take() {
            let _ = shutdown.send(true);
        }
        control.outbound = None;

        for waiter in control.open_waiters.drain(..) {
            waiter.complete(Err(MqttError::Closed));
        }
        self.inner.pending.fail_all(MqttError::Closed);
        self.inner.subscriptions.clear();
    }
}

/// Lock a mutex, recovering the data if a panicking thread poisoned it
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
