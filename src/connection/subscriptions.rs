//! Subscription registry and inbound message dispatch
//!
//! Entries are kept per (filter, handler) pair. An inbound message goes to
//! exactly one handler: the handler of the most specific matching filter,
//! else the global handler, else it is dropped.

use super::{read, write};
use crate::protocol::topics::{filter_specificity, topic_matches};
use crate::protocol::MqttMessage;
use rumqttc::mqttbytes::QoS;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use tracing::{debug, error};

/// Receives inbound messages
///
/// Implemented for any `Fn(&MqttMessage) + Send + Sync` closure. Handlers run
/// on the connection's reader task, so slow work should be handed off.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: &MqttMessage);
}

impl<F> MessageHandler for F
where
    F: Fn(&MqttMessage) + Send + Sync,
{
    fn handle(&self, message: &MqttMessage) {
        self(message)
    }
}

/// Shared handler reference; identity is the allocation it points to
pub type SharedMessageHandler = Arc<dyn MessageHandler>;

/// Wrap a closure as a [`SharedMessageHandler`]
pub fn handler_fn<F>(f: F) -> SharedMessageHandler
where
    F: Fn(&MqttMessage) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Whether two optional handlers are the same handler
pub fn same_handler(a: Option<&SharedMessageHandler>, b: Option<&SharedMessageHandler>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const (),
        _ => false,
    }
}

/// One registered subscription
#[derive(Clone)]
pub struct SubscriptionEntry {
    pub filter: String,
    pub qos: QoS,
    pub handler: Option<SharedMessageHandler>,
    seq: u64,
}

impl std::fmt::Debug for SubscriptionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionEntry")
            .field("filter", &self.filter)
            .field("qos", &self.qos)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

/// Where a dispatched message ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Topic,
    Global,
    Dropped,
}

/// Result of removing a subscription entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Removal {
    pub removed: bool,
    /// Other entries still use the filter, so the broker subscription stays
    pub filter_still_used: bool,
}

#[derive(Default)]
struct Entries {
    next_seq: u64,
    list: Vec<SubscriptionEntry>,
}

/// Registered subscriptions plus the global handler
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: RwLock<Entries>,
    global: RwLock<Option<SharedMessageHandler>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription; re-adding the same (filter, handler) updates its QoS
    pub fn add(&self, filter: &str, qos: QoS, handler: Option<SharedMessageHandler>) {
        let mut entries = write(&self.entries);
        entries.next_seq += 1;
        let seq = entries.next_seq;

        if let Some(existing) = entries
            .list
            .iter_mut()
            .find(|e| e.filter == filter && same_handler(e.handler.as_ref(), handler.as_ref()))
        {
            existing.qos = qos;
            existing.seq = seq;
            return;
        }

        entries.list.push(SubscriptionEntry {
            filter: filter.to_string(),
            qos,
            handler,
            seq,
        });
    }

    /// Remove the entry registered for exactly this (filter, handler) pair
    pub fn remove(&self, filter: &str, handler: Option<&SharedMessageHandler>) -> Removal {
        let mut entries = write(&self.entries);
        let before = entries.list.len();
        entries
            .list
            .retain(|e| !(e.filter == filter && same_handler(e.handler.as_ref(), handler)));
        let removed = entries.list.len() != before;
        let filter_still_used = entries.list.iter().any(|e| e.filter == filter);

        Removal {
            removed,
            filter_still_used,
        }
    }

    /// Remove every entry for a filter; returns how many were removed
    pub fn remove_filter(&self, filter: &str) -> usize {
        let mut entries = write(&self.entries);
        let before = entries.list.len();
        entries.list.retain(|e| e.filter != filter);
        before - entries.list.len()
    }

    /// Remove all entries; the global handler is kept
    pub fn clear(&self) {
        write(&self.entries).list.clear();
    }

    pub fn set_global_handler(&self, handler: Option<SharedMessageHandler>) {
        *write(&self.global) = handler;
    }

    /// Handler of the most specific filter matching `topic`
    ///
    /// Entries without a handler never take part. Among equally specific
    /// filters the most recent registration wins.
    pub fn topic_handler(&self, topic: &str) -> Option<SharedMessageHandler> {
        read(&self.entries)
            .list
            .iter()
            .filter(|e| e.handler.is_some() && topic_matches(&e.filter, topic))
            .max_by_key(|e| (filter_specificity(&e.filter), e.seq))
            .and_then(|e| e.handler.clone())
    }

    /// Deliver one message to the handler chosen for its topic
    ///
    /// Handlers are called without any registry lock held, and a panicking
    /// handler is logged and contained.
    pub fn dispatch(&self, message: &MqttMessage) -> Dispatch {
        let (handler, route) = match self.topic_handler(&message.topic) {
            Some(handler) => (handler, Dispatch::Topic),
            None => match read(&self.global).clone() {
                Some(handler) => (handler, Dispatch::Global),
                None => {
                    debug!("Dropping message on {} - no handler", message.topic);
                    return Dispatch::Dropped;
                }
            },
        };

        if catch_unwind(AssertUnwindSafe(|| handler.handle(message))).is_err() {
            error!("Message handler panicked while handling {}", message.topic);
        }
        route
    }

    /// Snapshot of (filter, qos) pairs in registration order
    pub fn filters(&self) -> Vec<(String, QoS)> {
        read(&self.entries)
            .list
            .iter()
            .map(|e| (e.filter.clone(), e.qos))
            .collect()
    }

    pub fn len(&self) -> usize {
        read(&self.entries).list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
