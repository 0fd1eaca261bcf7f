//! Connection lifecycle states and the pure transition table
//!
//! All state changes go through [`StateMachine::apply`], which validates the
//! event against the current state and publishes the result on a watch
//! channel in one step.

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Lifecycle state of an [`MqttConnection`](super::MqttConnection)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
    ReconnectWaiting,
    Closing,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Closed => "closed",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::ReconnectWaiting => "reconnect-waiting",
            ConnectionState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Events that drive the connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    OpenRequested,
    ConnectSucceeded,
    ConnectFailed { will_retry: bool },
    ConnectionLost { will_reconnect: bool },
    RetryTimerFired,
    CloseRequested,
    CloseCompleted,
}

/// Determine the next state for an event (pure function)
///
/// Returns `None` when the event does not apply in the current state.
pub fn next_state(current: ConnectionState, event: ConnectionEvent) -> Option<ConnectionState> {
    use ConnectionEvent as E;
    use ConnectionState as S;

    match (current, event) {
        (S::Closed | S::Closing, E::OpenRequested) => Some(S::Connecting),
        (S::Connecting, E::ConnectSucceeded) => Some(S::Open),
        (S::Connecting, E::ConnectFailed { will_retry: true }) => Some(S::ReconnectWaiting),
        (S::Connecting, E::ConnectFailed { will_retry: false }) => Some(S::Closed),
        (S::Open, E::ConnectionLost { will_reconnect: true }) => Some(S::ReconnectWaiting),
        (S::Open, E::ConnectionLost { will_reconnect: false }) => Some(S::Closed),
        (S::ReconnectWaiting, E::RetryTimerFired) => Some(S::Connecting),
        (S::Connecting | S::Open | S::ReconnectWaiting | S::Closing, E::CloseRequested) => {
            Some(S::Closing)
        }
        (S::Closing, E::CloseCompleted) => Some(S::Closed),
        _ => None,
    }
}

/// Whether operations that need a live session may run (pure function)
pub fn can_send(state: ConnectionState) -> bool {
    matches!(state, ConnectionState::Open)
}

/// Log a state transition at a level matching its severity
pub fn log_state_transition(from: ConnectionState, to: ConnectionState) {
    match to {
        ConnectionState::Open => info!("MQTT connection state: {} -> {}", from, to),
        ConnectionState::ReconnectWaiting => {
            warn!("MQTT connection state: {} -> {}", from, to)
        }
        _ => debug!("MQTT connection state: {} -> {}", from, to),
    }
}

/// Single mutation point for the connection state
pub struct StateMachine {
    tx: watch::Sender<ConnectionState>,
}

impl StateMachine {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionState::Closed);
        Self { tx }
    }

    pub fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Apply an event; returns the new state when the transition was valid
    pub fn apply(&self, event: ConnectionEvent) -> Option<ConnectionState> {
        let mut transition = None;
        self.tx.send_if_modified(|state| match next_state(*state, event) {
            Some(next) => {
                transition = Some((*state, next));
                let changed = *state != next;
                *state = next;
                changed
            }
            None => false,
        });

        match transition {
            Some((from, to)) => {
                if from != to {
                    log_state_transition(from, to);
                }
                Some(to)
            }
            None => {
                debug!(
                    "Ignoring {:?} in state {}",
                    event,
                    self.current()
                );
                None
            }
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
