//! Packet identifier allocation and correlation of in-flight operations
//!
//! Every QoS 1/2 publish, subscribe and unsubscribe holds a packet identifier
//! until its acknowledgment arrives, its timeout fires, or the session ends.
//! Each of those paths removes the entry under the table lock, so exactly one
//! of them resolves the operation's handle.

use super::handle::Completion;
use super::lock;
use crate::error::{MqttError, MqttResult};
use rumqttc::mqttbytes::QoS;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// What an in-flight operation is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Publish(QoS),
    Subscribe,
    Unsubscribe,
}

/// Acknowledgment frames that finish an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    PubAck,
    PubComp,
    SubAck,
    UnsubAck,
}

impl OperationKind {
    /// Whether `ack` is the frame that completes this operation
    pub fn completed_by(&self, ack: AckKind) -> bool {
        matches!(
            (self, ack),
            (OperationKind::Publish(QoS::AtLeastOnce), AckKind::PubAck)
                | (OperationKind::Publish(QoS::ExactlyOnce), AckKind::PubComp)
                | (OperationKind::Subscribe, AckKind::SubAck)
                | (OperationKind::Unsubscribe, AckKind::UnsubAck)
        )
    }

    /// Name of the awaited acknowledgment, used in timeout errors
    pub fn awaited_ack(&self) -> &'static str {
        match self {
            OperationKind::Publish(QoS::AtMostOnce) => "PUBLISH",
            OperationKind::Publish(QoS::AtLeastOnce) => "PUBACK",
            OperationKind::Publish(QoS::ExactlyOnce) => "PUBCOMP",
            OperationKind::Subscribe => "SUBACK",
            OperationKind::Unsubscribe => "UNSUBACK",
        }
    }
}

/// One operation awaiting its acknowledgment
#[derive(Debug)]
pub struct PendingOperation {
    kind: OperationKind,
    topic: String,
    completion: Completion,
    timer: Option<AbortHandle>,
}

impl PendingOperation {
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Resolve the operation's handle, cancelling its timeout
    pub(crate) fn complete(mut self, result: MqttResult<()>) -> bool {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.completion.complete(result)
    }
}

struct TableState {
    next_id: u16,
    operations: HashMap<u16, PendingOperation>,
}

impl TableState {
    fn allocate(&mut self) -> Option<u16> {
        if self.operations.len() >= usize::from(u16::MAX) {
            return None;
        }
        loop {
            let id = self.next_id;
            self.next_id = if id == u16::MAX { 1 } else { id + 1 };
            if !self.operations.contains_key(&id) {
                return Some(id);
            }
        }
    }
}

/// Table of operations keyed by packet identifier
pub struct PendingOperationTable {
    state: Mutex<TableState>,
}

impl PendingOperationTable {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TableState {
                next_id: 1,
                operations: HashMap::new(),
            }),
        }
    }

    /// Allocate a free packet identifier and record the operation under it
    pub(crate) fn register(
        &self,
        kind: OperationKind,
        topic: &str,
        completion: Completion,
    ) -> MqttResult<u16> {
        let mut state = lock(&self.state);
        let id = state.allocate().ok_or(MqttError::PacketIdsExhausted)?;
        state.operations.insert(
            id,
            PendingOperation {
                kind,
                topic: topic.to_string(),
                completion,
                timer: None,
            },
        );
        debug!("Registered {:?} for {} with packet id {}", kind, topic, id);
        Ok(id)
    }

    /// Remove the operation acknowledged by `ack`
    ///
    /// Returns `None` for unknown identifiers and for acknowledgments that do
    /// not match the operation's kind; such frames leave the table untouched.
    pub fn take(&self, id: u16, ack: AckKind) -> Option<PendingOperation> {
        let mut state = lock(&self.state);
        match state.operations.get(&id) {
            Some(op) if op.kind.completed_by(ack) => state.operations.remove(&id),
            Some(op) => {
                warn!(
                    "Ignoring {:?} for packet id {} - operation is {:?}",
                    ack, id, op.kind
                );
                None
            }
            None => {
                debug!("Ignoring {:?} for unknown packet id {}", ack, id);
                None
            }
        }
    }

    /// Remove any operation under `id` regardless of kind
    pub fn remove(&self, id: u16) -> Option<PendingOperation> {
        lock(&self.state).operations.remove(&id)
    }

    /// Whether `id` is a QoS 2 publish that PUBREC may advance to PUBCOMP
    pub fn awaits_pubrec(&self, id: u16) -> bool {
        matches!(
            lock(&self.state).operations.get(&id),
            Some(op) if op.kind == OperationKind::Publish(QoS::ExactlyOnce)
        )
    }

    /// Attach a timeout task to the operation it was started for
    ///
    /// If the operation already finished, the timer is aborted immediately.
    pub(crate) fn set_timer(&self, id: u16, completion: &Completion, timer: AbortHandle) {
        let mut state = lock(&self.state);
        match state.operations.get_mut(&id) {
            Some(op) if op.completion.same_as(completion) => op.timer = Some(timer),
            _ => timer.abort(),
        }
    }

    /// Fail the operation with a timeout if it is still the one registered under `id`
    pub(crate) fn expire(&self, id: u16, completion: &Completion) -> bool {
        let op = {
            let mut state = lock(&self.state);
            match state.operations.get(&id) {
                Some(op) if op.completion.same_as(completion) => state.operations.remove(&id),
                _ => None,
            }
        };

        match op {
            Some(mut op) => {
                op.timer = None;
                let operation = op.kind.awaited_ack();
                warn!(
                    "Operation on {} timed out waiting for {} (packet id {})",
                    op.topic, operation, id
                );
                op.complete(Err(MqttError::Timeout { operation }))
            }
            None => false,
        }
    }

    /// Fail every in-flight operation; returns how many were failed
    pub fn fail_all(&self, error: MqttError) -> usize {
        let drained: Vec<PendingOperation> = {
            let mut state = lock(&self.state);
            state.operations.drain().map(|(_, op)| op).collect()
        };

        let count = drained.len();
        for op in drained {
            op.complete(Err(error.clone()));
        }
        if count > 0 {
            debug!("Failed {} pending operations: {}", count, error);
        }
        count
    }

    pub fn len(&self) -> usize {
        lock(&self.state).operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PendingOperationTable {
    fn default() -> Self {
        Self::new()
    }
}
