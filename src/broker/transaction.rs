//! Local transactions spanning sends and acknowledgements on any number of
//! destinations.
//!
//! Transacted sends reserve memory when they are issued and become visible
//! on commit. Transacted acknowledgements take effect on commit; a rollback
//! returns the messages for redelivery. Commit writes to every store first
//! and only then touches the cursors, so a store failure leaves nothing
//! half-applied.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::destination::{Destination, PreparedAck, PreparedSend};
use crate::broker::message::{DestinationName, Message, MessageId};
use crate::broker::subscription::{AckMode, ConsumerId};
use crate::utils::error::{BrokerError, Result};

/// Destinations replaced by the GC while a commit resolves them are looked up
/// again, at most this many times.
const MAX_COMMIT_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(pub String);

impl TransactionId {
    pub fn generate() -> Self {
        Self(format!("TX:{}", Uuid::new_v4()))
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TransactionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

enum Operation {
    Send {
        message: Message,
        size: u64,
        /// Destination whose usage holds the reservation made at send time.
        reserved_on: Arc<Destination>,
    },
    Ack {
        destination: Arc<Destination>,
        consumer: ConsumerId,
        message_id: MessageId,
    },
}

#[derive(Default)]
pub(crate) struct Transaction {
    operations: Vec<Operation>,
}

impl Transaction {
    pub(crate) fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Open transactions. Unknown ids start a transaction implicitly.
#[derive(Default)]
pub(crate) struct TransactionRegistry {
    open: Mutex<HashMap<TransactionId, Transaction>>,
}

impl TransactionRegistry {
    pub(crate) fn begin(&self) -> TransactionId {
        let id = TransactionId::generate();
        self.open.lock().insert(id.clone(), Transaction::default());
        id
    }

    pub(crate) fn record_send(
        &self,
        id: &TransactionId,
        reserved_on: Arc<Destination>,
        message: Message,
        size: u64,
    ) {
        self.open
            .lock()
            .entry(id.clone())
            .or_default()
            .operations
            .push(Operation::Send {
                message,
                size,
                reserved_on,
            });
    }

    pub(crate) fn record_ack(
        &self,
        id: &TransactionId,
        destination: Arc<Destination>,
        consumer: ConsumerId,
        message_id: MessageId,
    ) {
        self.open
            .lock()
            .entry(id.clone())
            .or_default()
            .operations
            .push(Operation::Ack {
                destination,
                consumer,
                message_id,
            });
    }

    pub(crate) fn take(&self, id: &TransactionId) -> Transaction {
        self.open.lock().remove(id).unwrap_or_default()
    }

    /// Pulls out every acknowledgement `consumer` recorded in `id`.
    pub(crate) fn take_consumer_acks(
        &self,
        id: &TransactionId,
        consumer: &ConsumerId,
    ) -> Transaction {
        let mut open = self.open.lock();
        let Some(transaction) = open.get_mut(id) else {
            return Transaction::default();
        };
        let (acks, rest): (Vec<Operation>, Vec<Operation>) = std::mem::take(&mut transaction.operations)
            .into_iter()
            .partition(|op| matches!(op, Operation::Ack { consumer: c, .. } if c == consumer));
        transaction.operations = rest;
        Transaction { operations: acks }
    }

    pub(crate) fn open_count(&self) -> usize {
        self.open.lock().len()
    }
}

enum Prepared {
    Send(usize, PreparedSend),
    Ack(usize, PreparedAck),
}

/// Commits `transaction`. `resolve` looks up the live destination for a name.
///
/// On failure everything is rolled back the way `rollback` would, and the
/// error is returned.
pub(crate) fn commit<F>(id: &TransactionId, mut transaction: Transaction, resolve: F) -> Result<()>
where
    F: Fn(&DestinationName) -> Result<Arc<Destination>>,
{
    if transaction.is_empty() {
        return Ok(());
    }

    for attempt in 1..=MAX_COMMIT_ATTEMPTS {
        if let Err(e) = relocate_sends(&mut transaction, &resolve) {
            rollback(id, transaction);
            return Err(e);
        }
        let destinations = touched(&transaction);
        let mut guards: Vec<_> = destinations.iter().map(|d| d.lock()).collect();
        if guards.iter().any(|g| g.is_removed()) {
            debug!(transaction = %id, attempt, "destination removed during commit, resolving again");
            continue;
        }

        let index_of = |d: &Arc<Destination>| {
            destinations
                .iter()
                .position(|x| Arc::ptr_eq(x, d))
                .unwrap_or_default()
        };

        let mut prepared = Vec::with_capacity(transaction.operations.len());
        let mut failure = None;
        for op in &transaction.operations {
            let result = match op {
                Operation::Send {
                    message,
                    reserved_on,
                    ..
                } => {
                    let i = index_of(reserved_on);
                    destinations[i]
                        .prepare_send_locked(&mut guards[i], message.clone())
                        .map(|p| Prepared::Send(i, p))
                }
                Operation::Ack {
                    destination,
                    consumer,
                    message_id,
                } => {
                    let i = index_of(destination);
                    destinations[i]
                        .prepare_ack_locked(&mut guards[i], consumer, message_id, AckMode::Individual)
                        .map(|p| Prepared::Ack(i, p))
                }
            };
            match result {
                Ok(p) => prepared.push(p),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = failure {
            warn!(transaction = %id, error = %e, "commit failed, rolling back");
            for p in prepared.iter().rev() {
                match p {
                    Prepared::Send(i, send) => destinations[*i].undo_prepared_send(send),
                    Prepared::Ack(i, ack) => destinations[*i].undo_prepared_ack(ack),
                }
            }
            for op in &transaction.operations {
                if let Operation::Ack {
                    destination,
                    consumer,
                    message_id,
                } = op
                {
                    let i = index_of(destination);
                    destinations[i].rollback_locked(&mut guards[i], consumer, message_id);
                }
            }
            let outboxes: Vec<_> = guards.iter_mut().map(|g| Destination::take_outbox(g)).collect();
            drop(guards);
            release_reservations(&transaction);
            for (destination, outbox) in destinations.iter().zip(outboxes) {
                destination.finish(outbox);
            }
            return Err(e);
        }

        for p in prepared {
            match p {
                Prepared::Send(i, send) => destinations[i].complete_send_locked(&mut guards[i], send, true),
                Prepared::Ack(i, ack) => destinations[i].complete_ack_locked(&mut guards[i], ack),
            }
        }
        let outboxes: Vec<_> = guards.iter_mut().map(|g| Destination::take_outbox(g)).collect();
        drop(guards);
        for (destination, outbox) in destinations.iter().zip(outboxes) {
            destination.finish(outbox);
        }
        debug!(transaction = %id, operations = transaction.operations.len(), "committed");
        return Ok(());
    }

    let name = touched(&transaction)
        .first()
        .map(|d| d.name().clone())
        .unwrap_or_else(|| DestinationName::queue(id.to_string()));
    rollback(id, transaction);
    Err(BrokerError::DestinationRemoved(name))
}

/// Drops the transaction's sends and returns its acknowledged messages for
/// redelivery.
pub(crate) fn rollback(id: &TransactionId, transaction: Transaction) {
    release_reservations(&transaction);
    for op in transaction.operations {
        if let Operation::Ack {
            destination,
            consumer,
            message_id,
        } = op
        {
            if let Err(e) = destination.rollback(&consumer, std::slice::from_ref(&message_id)) {
                debug!(transaction = %id, consumer = %consumer, error = %e, "rollback skipped");
            }
        }
    }
}

fn release_reservations(transaction: &Transaction) {
    for op in &transaction.operations {
        if let Operation::Send {
            size, reserved_on, ..
        } = op
        {
            reserved_on.release_admitted(*size);
        }
    }
}

/// Moves sends whose destination was removed by the GC to the live
/// destination of the same name, together with their reservation.
fn relocate_sends<F>(transaction: &mut Transaction, resolve: &F) -> Result<()>
where
    F: Fn(&DestinationName) -> Result<Arc<Destination>>,
{
    for op in &mut transaction.operations {
        if let Operation::Send {
            message,
            size,
            reserved_on,
        } = op
        {
            if reserved_on.is_removed() {
                let live = resolve(&message.destination)?;
                live.usage().increase(*size);
                reserved_on.release_admitted(*size);
                *reserved_on = live;
            }
        }
    }
    Ok(())
}

/// Every destination the transaction touches, in lock order.
fn touched(transaction: &Transaction) -> Vec<Arc<Destination>> {
    let mut destinations: Vec<Arc<Destination>> = Vec::new();
    for op in &transaction.operations {
        let destination = match op {
            Operation::Send { reserved_on, .. } => reserved_on,
            Operation::Ack { destination, .. } => destination,
        };
        if !destinations.iter().any(|d| Arc::ptr_eq(d, destination)) {
            destinations.push(Arc::clone(destination));
        }
    }
    destinations.sort_by(|a, b| {
        a.name()
            .to_string()
            .cmp(&b.name().to_string())
            .then_with(|| Arc::as_ptr(a).cmp(&Arc::as_ptr(b)))
    });
    destinations
}
