//! Subscriptions: one consumer's demand on a destination.
//!
//! A subscription owns the consumer's inflight window (dispatched but not yet
//! acknowledged), bounded by its prefetch limit. Topic subscriptions also own
//! a pending cursor that the topic fans messages into; durable topic
//! subscriptions back that cursor with their own message store so it
//! survives consumer disconnects.
//!
//! Per message, from the subscription's point of view:
//!
//! ```text
//! Pending -> Dispatched -> Acked
//!                       -> RolledBack -> Pending (redelivery_count + 1)
//!                       -> Expired | RedeliveryExhausted -> DeadLettered
//! ```

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::broker::dead_letter::DeadLetterCause;
use crate::broker::message::{DestinationName, Message, MessageId};
use crate::broker::selector::Selector;
use crate::broker::transaction::TransactionId;
use crate::cursor::Cursor;
use crate::store::MessageStore;
use crate::utils::error::BrokerError;

pub type ConsumerId = String;

/// Identity of a durable topic subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionKey {
    pub client_id: String,
    pub subscription_name: String,
}

impl SubscriptionKey {
    pub fn new(client_id: impl Into<String>, subscription_name: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            subscription_name: subscription_name.into(),
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.client_id, self.subscription_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckMode {
    /// Acknowledged as soon as the consumer receives the message.
    Auto,
    /// Acknowledging a message acknowledges every earlier one delivered to
    /// the same consumer.
    Client,
    Individual,
    /// Acknowledgements take effect when the transaction commits.
    Transacted,
}

/// What a consumer asks for when subscribing.
#[derive(Debug, Clone)]
pub struct ConsumerInfo {
    pub id: ConsumerId,
    pub destination: DestinationName,
    pub selector: Option<String>,
    /// `None` uses the destination policy default. Zero means pull mode.
    pub prefetch: Option<u32>,
    pub ack_mode: AckMode,
    pub durable: Option<SubscriptionKey>,
    pub retroactive: bool,
    pub transaction: Option<TransactionId>,
}

impl ConsumerInfo {
    pub fn new(destination: DestinationName) -> Self {
        Self {
            id: format!("consumer-{}", Uuid::new_v4()),
            destination,
            selector: None,
            prefetch: None,
            ack_mode: AckMode::Auto,
            durable: None,
            retroactive: false,
            transaction: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    pub fn with_prefetch(mut self, prefetch: u32) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    pub fn with_ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.ack_mode = ack_mode;
        self
    }

    pub fn transacted(mut self, transaction: TransactionId) -> Self {
        self.ack_mode = AckMode::Transacted;
        self.transaction = Some(transaction);
        self
    }

    pub fn durable(mut self, client_id: impl Into<String>, name: impl Into<String>) -> Self {
        self.durable = Some(SubscriptionKey::new(client_id, name));
        self
    }

    pub fn retroactive(mut self) -> Self {
        self.retroactive = true;
        self
    }
}

/// The delivery side of a consumer: whatever pushes dispatched messages to it.
pub trait DeliverySink: Send + Sync {
    fn deliver(&self, consumer: &ConsumerId, message: Arc<Message>) -> Result<(), DeliveryError>;

    /// Whether a successful `deliver` already counts as the acknowledgement
    /// of an auto-ack consumer. Sinks whose consumer acknowledges on receipt
    /// keep the default.
    fn settles_on_delivery(&self) -> bool {
        false
    }
}

/// The consumer side is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryError;

impl DeliverySink for crossbeam_channel::Sender<Arc<Message>> {
    fn deliver(&self, _consumer: &ConsumerId, message: Arc<Message>) -> Result<(), DeliveryError> {
        self.send(message).map_err(|_| DeliveryError)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    WindowFull,
    Inactive,
    SinkClosed,
}

/// Outcome of a rollback or expiry of an inflight message.
#[derive(Debug, Clone)]
pub enum Settlement {
    /// Back to pending, carrying the incremented redelivery count.
    Redeliver(Arc<Message>),
    DeadLetter {
        message: Arc<Message>,
        cause: DeadLetterCause,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    pub dispatched: u64,
    pub acknowledged: u64,
    pub redelivered: u64,
    pub dead_lettered: u64,
    /// Topic messages discarded because the pending limit was reached.
    pub missed: u64,
    pub inflight_count: usize,
    pub inflight_size: u64,
    pub pending: usize,
    /// Pending messages currently held in memory.
    pub resident: usize,
    /// Whether the pending cursor is paging from the store.
    pub store_backed: bool,
}

pub struct Subscription {
    info: ConsumerInfo,
    selector: Option<Selector>,
    prefetch: u32,
    sink: Option<Arc<dyn DeliverySink>>,
    inflight: Vec<Arc<Message>>,
    inflight_size: u64,
    pull_credit: u32,
    pending: Option<Cursor>,
    store: Option<Arc<dyn MessageStore>>,
    joined_after: u64,
    stats: SubscriptionStats,
}

impl Subscription {
    /// Parses the selector; a malformed one rejects the subscription.
    pub fn new(info: ConsumerInfo, default_prefetch: u32) -> Result<Self, BrokerError> {
        let selector = info.selector.as_deref().map(Selector::parse).transpose()?;
        let prefetch = info.prefetch.unwrap_or(default_prefetch);
        Ok(Self {
            info,
            selector,
            prefetch,
            sink: None,
            inflight: Vec::new(),
            inflight_size: 0,
            pull_credit: 0,
            pending: None,
            store: None,
            joined_after: 0,
            stats: SubscriptionStats::default(),
        })
    }

    /// Gives a topic subscription its own pending cursor. `joined_after` is
    /// the last topic sequence sent before the subscription existed.
    pub fn with_pending(
        mut self,
        pending: Cursor,
        store: Option<Arc<dyn MessageStore>>,
        joined_after: u64,
    ) -> Self {
        self.pending = Some(pending);
        self.store = store;
        self.joined_after = joined_after;
        self
    }

    pub fn attach(&mut self, sink: Arc<dyn DeliverySink>) {
        self.sink = Some(sink);
    }

    /// Reattaches a durable subscription to a new consumer. Non-persistent
    /// messages sent while it was detached are not replayed.
    pub fn reactivate(
        &mut self,
        info: ConsumerInfo,
        default_prefetch: u32,
        sink: Arc<dyn DeliverySink>,
        joined_after: u64,
    ) -> Result<(), BrokerError> {
        self.selector = info.selector.as_deref().map(Selector::parse).transpose()?;
        self.prefetch = info.prefetch.unwrap_or(default_prefetch);
        self.info = info;
        self.joined_after = joined_after;
        self.pull_credit = 0;
        self.sink = Some(sink);
        Ok(())
    }

    pub fn id(&self) -> &ConsumerId {
        &self.info.id
    }

    pub fn info(&self) -> &ConsumerInfo {
        &self.info
    }

    pub fn key(&self) -> Option<&SubscriptionKey> {
        self.info.durable.as_ref()
    }

    pub fn is_durable(&self) -> bool {
        self.info.durable.is_some()
    }

    pub fn is_active(&self) -> bool {
        self.sink.is_some()
    }

    pub fn prefetch(&self) -> u32 {
        self.prefetch
    }

    pub fn selector(&self) -> Option<&Selector> {
        self.selector.as_ref()
    }

    pub fn joined_after(&self) -> u64 {
        self.joined_after
    }

    pub fn pending(&self) -> Option<&Cursor> {
        self.pending.as_ref()
    }

    pub fn pending_mut(&mut self) -> Option<&mut Cursor> {
        self.pending.as_mut()
    }

    pub fn store(&self) -> Option<&Arc<dyn MessageStore>> {
        self.store.as_ref()
    }

    /// An auto-ack consumer behind a sink that settles on delivery: the
    /// destination acknowledges each message right after dispatching it.
    pub fn acks_on_dispatch(&self) -> bool {
        self.info.ack_mode == AckMode::Auto
            && self.sink.as_ref().is_some_and(|sink| sink.settles_on_delivery())
    }

    pub fn matches(&self, message: &Message) -> bool {
        self.selector.as_ref().is_none_or(|s| s.matches(message))
    }

    /// Room in the inflight window, or an outstanding pull.
    pub fn has_capacity(&self) -> bool {
        if self.sink.is_none() {
            return false;
        }
        if self.prefetch == 0 {
            self.pull_credit > 0
        } else {
            (self.inflight.len() as u64) < u64::from(self.prefetch)
        }
    }

    /// Adds `message` to the inflight window and hands it to the consumer.
    ///
    /// A full window is an error the caller must handle by keeping the message
    /// pending. A closed sink deactivates the subscription.
    pub fn dispatch(&mut self, message: Arc<Message>) -> Result<(), DispatchError> {
        let Some(sink) = &self.sink else {
            return Err(DispatchError::Inactive);
        };
        if !self.has_capacity() {
            return Err(DispatchError::WindowFull);
        }
        if sink.deliver(&self.info.id, Arc::clone(&message)).is_err() {
            self.sink = None;
            return Err(DispatchError::SinkClosed);
        }
        if self.prefetch == 0 {
            self.pull_credit -= 1;
        }
        self.inflight_size += message.size();
        self.inflight.push(message);
        self.stats.dispatched += 1;
        Ok(())
    }

    /// The messages an acknowledgement of `id` in `mode` settles, without
    /// removing them. Client mode is cumulative.
    pub fn messages_to_ack(
        &self,
        id: &MessageId,
        mode: AckMode,
    ) -> Result<Vec<Arc<Message>>, BrokerError> {
        let index = self
            .inflight
            .iter()
            .position(|m| &m.id == id)
            .ok_or_else(|| BrokerError::UnknownMessage(id.clone()))?;
        Ok(match mode {
            AckMode::Client => self.inflight[..=index].to_vec(),
            _ => vec![Arc::clone(&self.inflight[index])],
        })
    }

    /// Removes the acknowledged messages from the inflight window and returns
    /// them; the destination then removes them from its cursor and store.
    /// A transacted acknowledgement only validates: removal waits for commit.
    pub fn acknowledge(
        &mut self,
        id: &MessageId,
        mode: AckMode,
    ) -> Result<Vec<Arc<Message>>, BrokerError> {
        let acked = self.messages_to_ack(id, mode)?;
        if mode == AckMode::Transacted {
            return Ok(Vec::new());
        }
        for message in &acked {
            self.remove_inflight(&message.id);
        }
        self.stats.acknowledged += acked.len() as u64;
        Ok(acked)
    }

    /// Rolls back (or expires) one inflight message. Returns `None` if the
    /// message is not inflight on this subscription.
    pub fn rollback_or_expire(
        &mut self,
        id: &MessageId,
        max_redeliveries: u32,
        now_millis: i64,
    ) -> Option<Settlement> {
        let message = self.remove_inflight(id)?;
        if message.is_expired_at(now_millis) {
            self.stats.dead_lettered += 1;
            return Some(Settlement::DeadLetter {
                message,
                cause: DeadLetterCause::Expired,
            });
        }
        let redelivered = Arc::new(message.redelivered());
        if redelivered.redelivery_count > max_redeliveries {
            self.stats.dead_lettered += 1;
            Some(Settlement::DeadLetter {
                message: redelivered,
                cause: DeadLetterCause::RedeliveryExhausted,
            })
        } else {
            self.stats.redelivered += 1;
            Some(Settlement::Redeliver(redelivered))
        }
    }

    /// Detaches the consumer and hands back the whole inflight window so the
    /// caller can return it to pending.
    pub fn close(&mut self) -> Vec<Arc<Message>> {
        self.sink = None;
        self.pull_credit = 0;
        self.inflight_size = 0;
        std::mem::take(&mut self.inflight)
    }

    /// Asks for one more message. Consumers with a prefetch window never
    /// pull.
    pub fn add_pull(&mut self) -> Result<(), BrokerError> {
        if self.prefetch > 0 {
            return Err(BrokerError::NotPullConsumer(self.info.id.clone()));
        }
        self.pull_credit = self.pull_credit.saturating_add(1);
        Ok(())
    }

    pub fn cancel_pull(&mut self) {
        self.pull_credit = self.pull_credit.saturating_sub(1);
    }

    pub fn record_missed(&mut self) {
        self.stats.missed += 1;
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    pub fn inflight_size(&self) -> u64 {
        self.inflight_size
    }

    pub fn inflight_messages(&self) -> &[Arc<Message>] {
        &self.inflight
    }

    pub fn stats(&self) -> SubscriptionStats {
        SubscriptionStats {
            inflight_count: self.inflight.len(),
            inflight_size: self.inflight_size,
            pending: self.pending.as_ref().map_or(0, |p| p.pending_count()),
            resident: self.pending.as_ref().map_or(0, |p| p.resident_count()),
            store_backed: self.pending.as_ref().is_some_and(|p| p.is_store_backed()),
            ..self.stats.clone()
        }
    }

    fn remove_inflight(&mut self, id: &MessageId) -> Option<Arc<Message>> {
        let index = self.inflight.iter().position(|m| &m.id == id)?;
        let message = self.inflight.remove(index);
        self.inflight_size = self.inflight_size.saturating_sub(message.size());
        Some(message)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.info.id)
            .field("destination", &self.info.destination)
            .field("durable", &self.info.durable)
            .field("prefetch", &self.prefetch)
            .field("inflight", &self.inflight.len())
            .field("active", &self.is_active())
            .finish()
    }
}
