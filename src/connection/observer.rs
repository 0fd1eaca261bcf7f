//! Connection lifecycle notifications

use super::{read, write, MqttConnection};
use crate::error::MqttError;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use tracing::error;

/// Receives connection lifecycle events
///
/// Callbacks run on the connection's supervisor task with no internal lock
/// held, so they may call back into the connection, for example to restore
/// subscriptions in `on_connection_established`. A panicking callback is
/// logged and does not affect the connection.
pub trait ConnectionObserver: Send + Sync {
    /// An open session dropped unexpectedly
    fn on_connection_lost(
        &self,
        _connection: &MqttConnection,
        _will_reconnect: bool,
        _cause: &MqttError,
    ) {
    }

    /// A session was established; `reconnected` is false for the first
    /// session after `open` or `reconfigure`
    fn on_connection_established(&self, _connection: &MqttConnection, _reconnected: bool) {}
}

/// Holder for the optional observer
#[derive(Default)]
pub(crate) struct ObserverSlot {
    observer: RwLock<Option<Arc<dyn ConnectionObserver>>>,
}

impl ObserverSlot {
    pub fn set(&self, observer: Option<Arc<dyn ConnectionObserver>>) {
        *write(&self.observer) = observer;
    }

    fn current(&self) -> Option<Arc<dyn ConnectionObserver>> {
        read(&self.observer).clone()
    }

    pub fn notify_established(&self, connection: &MqttConnection, reconnected: bool) {
        if let Some(observer) = self.current() {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                observer.on_connection_established(connection, reconnected)
            }));
            if outcome.is_err() {
                error!("Connection observer panicked in on_connection_established");
            }
        }
    }

    pub fn notify_lost(&self, connection: &MqttConnection, will_reconnect: bool, cause: &MqttError) {
        if let Some(observer) = self.current() {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                observer.on_connection_lost(connection, will_reconnect, cause)
            }));
            if outcome.is_err() {
                error!("Connection observer panicked in on_connection_lost");
            }
        }
    }
}
