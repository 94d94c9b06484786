//! Queues and topics.
//!
//! A `Destination` owns a cursor of pending messages, its subscriptions and
//! its usage. All of that sits behind one mutex; anything that has to reach
//! another destination (dead-letter routing) is staged in an outbox and
//! carried out after the lock is released.
//!
//! Queues dispatch each message to exactly one subscription, picked round
//! robin among those with room in their inflight window. Topics stage sent
//! messages in their own cursor and fan them out into each matching
//! subscription's pending cursor on the next dispatch pass.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::broker::dead_letter::{DeadLetterCause, DeadLetterStrategy};
use crate::broker::message::{DestinationName, Message, MessageId};
use crate::broker::subscription::{
    AckMode, ConsumerId, ConsumerInfo, DeliverySink, DispatchError, Settlement, Subscription,
    SubscriptionKey, SubscriptionStats,
};
use crate::config::{DestinationPolicy, FlowControlPolicy};
use crate::cursor::Cursor;
use crate::store::{DurableSubscriptionRecord, MessageStore, PersistenceAdapter, StoreKey};
use crate::usage::{Reservation, UsageManager};
use crate::utils::error::{BrokerError, Result};

/// Delivers dead-letter copies to their dead-letter destination.
pub trait DeadLetterRouter: Send + Sync {
    fn route_dead_letter(&self, message: Message) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DestinationStats {
    pub enqueued: u64,
    pub dequeued: u64,
    pub dispatched: u64,
    pub expired: u64,
    pub redelivered: u64,
    pub dead_lettered: u64,
    /// Messages dropped instead of dead-lettered.
    pub discarded: u64,
    pub pending: usize,
    pub inflight_count: usize,
    pub inflight_size: u64,
    pub consumers: usize,
    pub memory_usage: u64,
}

/// Which cursor still holds a message that is on its way to the DLQ.
#[derive(Debug, Clone)]
enum Holder {
    Queue,
    Durable(SubscriptionKey),
    /// Already taken out of a memory-only cursor.
    Released,
}

struct DeadLetterEntry {
    message: Arc<Message>,
    cause: DeadLetterCause,
    subscription: Option<SubscriptionKey>,
    holder: Holder,
}

/// Dead letters staged under a destination lock.
pub(crate) struct Outbox(Vec<DeadLetterEntry>);

/// A send whose store writes are done but which is not yet visible.
pub(crate) struct PreparedSend {
    message: Message,
    stores: Vec<Arc<dyn MessageStore>>,
    durable_targets: Vec<SubscriptionKey>,
}

/// An acknowledgement whose store removals are done but which has not yet
/// left the inflight window.
pub(crate) struct PreparedAck {
    consumer: ConsumerId,
    message_id: MessageId,
    mode: AckMode,
    store: Option<Arc<dyn MessageStore>>,
    removed: Vec<Arc<Message>>,
}

#[derive(Default)]
struct Counters {
    enqueued: u64,
    dequeued: u64,
    dispatched: u64,
    expired: u64,
    redelivered: u64,
    dead_lettered: u64,
    discarded: u64,
}

pub(crate) struct DestinationState {
    cursor: Cursor,
    subscriptions: Vec<Subscription>,
    next_sequence: u64,
    round_robin: usize,
    last_active: Instant,
    removed: bool,
    /// Durable subscriptions that stored a staged persistent topic message.
    durable_targets: HashMap<u64, Vec<SubscriptionKey>>,
    /// Recently fanned out topic messages, for retroactive consumers.
    recovery: VecDeque<Arc<Message>>,
    outbox: Vec<DeadLetterEntry>,
    counters: Counters,
}

impl DestinationState {
    pub(crate) fn is_removed(&self) -> bool {
        self.removed
    }

    fn subscription_mut(&mut self, consumer: &ConsumerId) -> Result<&mut Subscription> {
        self.subscriptions
            .iter_mut()
            .find(|s| s.id() == consumer)
            .ok_or_else(|| BrokerError::UnknownConsumer(consumer.clone()))
    }
}

pub struct Destination {
    name: DestinationName,
    policy: DestinationPolicy,
    dead_letter: DeadLetterStrategy,
    usage: Arc<UsageManager>,
    store_usage: Arc<UsageManager>,
    adapter: Arc<dyn PersistenceAdapter>,
    store: Option<Arc<dyn MessageStore>>,
    router: Arc<dyn DeadLetterRouter>,
    state: Mutex<DestinationState>,
    dispatch_requested: AtomicBool,
    dispatching: AtomicBool,
}

impl Destination {
    /// Opens the destination over the adapter's stores. A queue resumes the
    /// messages left in its store; a topic restores its durable
    /// subscriptions, detached until their consumers reconnect.
    pub fn open(
        name: DestinationName,
        policy: DestinationPolicy,
        usage: Arc<UsageManager>,
        store_usage: Arc<UsageManager>,
        adapter: Arc<dyn PersistenceAdapter>,
        router: Arc<dyn DeadLetterRouter>,
    ) -> Result<Arc<Self>> {
        let dead_letter = DeadLetterStrategy::from_policy(&policy.dead_letter);
        let mut next_sequence = 1;
        let (cursor, store) = if name.is_queue() {
            let store = adapter.message_store(&StoreKey::Destination(name.clone()))?;
            next_sequence = store.last_sequence()? + 1;
            let cursor = Cursor::store_backed(
                name.to_string(),
                Arc::clone(&usage),
                Arc::clone(&store),
                policy.cursor_batch_size,
                policy.cursor_high_watermark_percent,
                policy.cursor_low_watermark_percent,
            )?;
            (cursor, Some(store))
        } else {
            (Cursor::in_memory(name.to_string(), Arc::clone(&usage)), None)
        };

        let destination = Self {
            name,
            policy,
            dead_letter,
            usage,
            store_usage,
            adapter,
            store,
            router,
            state: Mutex::new(DestinationState {
                cursor,
                subscriptions: Vec::new(),
                next_sequence,
                round_robin: 0,
                last_active: Instant::now(),
                removed: false,
                durable_targets: HashMap::new(),
                recovery: VecDeque::new(),
                outbox: Vec::new(),
                counters: Counters::default(),
            }),
            dispatch_requested: AtomicBool::new(false),
            dispatching: AtomicBool::new(false),
        };

        if destination.name.is_topic() {
            let records = destination.adapter.durable_subscriptions(&destination.name)?;
            let mut state = destination.state.lock();
            for record in records {
                let mut info = ConsumerInfo::new(destination.name.clone())
                    .with_id(format!("durable:{}", record.subscription));
                info.selector = record.selector;
                info.durable = Some(record.subscription);
                let subscription = destination.durable_subscription(info)?;
                if let Some(store) = subscription.store() {
                    state.next_sequence = state.next_sequence.max(store.last_sequence()? + 1);
                }
                debug!(destination = %destination.name, subscription = ?subscription.key(), "restored durable subscription");
                state.subscriptions.push(subscription);
            }
        }
        Ok(Arc::new(destination))
    }

    pub fn name(&self) -> &DestinationName {
        &self.name
    }

    pub fn policy(&self) -> &DestinationPolicy {
        &self.policy
    }

    pub fn usage(&self) -> &Arc<UsageManager> {
        &self.usage
    }

    pub fn is_dead_letter_queue(&self) -> bool {
        self.dead_letter.is_dead_letter_destination(&self.name)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, DestinationState> {
        self.state.lock()
    }

    pub fn is_removed(&self) -> bool {
        self.state.lock().removed
    }

    /// Accepts a message from a producer. Blocks, times out or fails fast on
    /// a full memory limit according to the flow control policy; `cancel`
    /// interrupts a blocked send.
    pub fn send(&self, message: Message, cancel: &AtomicBool) -> Result<()> {
        let size = message.size();
        self.admit(size, message.is_persistent(), cancel)?;
        let result = {
            let mut state = self.state.lock();
            self.prepare_send_locked(&mut state, message)
                .map(|prepared| self.complete_send_locked(&mut state, prepared, true))
        };
        if let Err(e) = result {
            self.usage.release(size);
            return Err(e);
        }
        self.dispatch();
        Ok(())
    }

    /// Enqueues a dead-letter copy. Dead letters are not subject to flow
    /// control.
    pub fn enqueue_dead_letter(&self, message: Message) -> Result<()> {
        {
            let mut state = self.state.lock();
            let prepared = self.prepare_send_locked(&mut state, message)?;
            self.complete_send_locked(&mut state, prepared, false);
        }
        self.dispatch();
        Ok(())
    }

    /// Reserves `size` bytes of memory for a message about to be sent.
    pub fn admit(&self, size: u64, persistent: bool, cancel: &AtomicBool) -> Result<()> {
        let refused = || BrokerError::FlowControl {
            destination: self.name.clone(),
            bytes: size,
        };
        if persistent && self.store_usage.is_full() {
            warn!(destination = %self.name, "store limit reached, refusing persistent send");
            return Err(refused());
        }
        if size > self.usage.max_reservable() {
            return Err(refused());
        }
        if self.usage.reserve(size) {
            return Ok(());
        }
        match self.policy.flow_control {
            FlowControlPolicy::Reject => Err(refused()),
            FlowControlPolicy::Block => {
                let timeout = self.policy.send_timeout_ms.map(Duration::from_millis);
                debug!(destination = %self.name, bytes = size, "producer blocked by memory limit");
                match self.usage.reserve_blocking(size, timeout, cancel) {
                    Reservation::Reserved => Ok(()),
                    Reservation::TimedOut => Err(refused()),
                    Reservation::Interrupted => Err(BrokerError::Interrupted),
                }
            }
        }
    }

    /// Gives back a reservation made by `admit` for a send that never
    /// happened.
    pub fn release_admitted(&self, size: u64) {
        self.usage.release(size);
    }

    /// Assigns the sequence and writes the message to every store that must
    /// hold it. Undone with `undo_prepared_send`.
    pub(crate) fn prepare_send_locked(
        &self,
        state: &mut DestinationState,
        mut message: Message,
    ) -> Result<PreparedSend> {
        if state.removed {
            return Err(BrokerError::DestinationRemoved(self.name.clone()));
        }
        message.sequence = state.next_sequence;
        message.destination = self.name.clone();

        let mut stores: Vec<Arc<dyn MessageStore>> = Vec::new();
        let mut durable_targets = Vec::new();
        if message.is_persistent() {
            let targets: Vec<(Arc<dyn MessageStore>, Option<SubscriptionKey>)> = match &self.store {
                Some(store) => vec![(Arc::clone(store), None)],
                None => state
                    .subscriptions
                    .iter()
                    .filter(|s| s.is_durable() && s.matches(&message))
                    .filter_map(|s| Some((Arc::clone(s.store()?), s.key().cloned())))
                    .collect(),
            };
            for (store, key) in targets {
                if let Err(e) = store.append(&message) {
                    error!(destination = %self.name, error = %e, "failed to store message");
                    undo_appends(&stores, &message.id);
                    return Err(e.into());
                }
                stores.push(store);
                durable_targets.extend(key);
            }
        }
        state.next_sequence += 1;
        Ok(PreparedSend {
            message,
            stores,
            durable_targets,
        })
    }

    pub(crate) fn undo_prepared_send(&self, prepared: &PreparedSend) {
        undo_appends(&prepared.stores, &prepared.message.id);
    }

    /// Makes a prepared send visible. `reserved` says the memory for it was
    /// reserved by `admit`.
    pub(crate) fn complete_send_locked(
        &self,
        state: &mut DestinationState,
        prepared: PreparedSend,
        reserved: bool,
    ) {
        let message = Arc::new(prepared.message);
        let size = message.size();
        for _ in &prepared.stores {
            self.store_usage.increase(size);
        }
        if !prepared.durable_targets.is_empty() {
            state
                .durable_targets
                .insert(message.sequence, prepared.durable_targets);
        }
        state.cursor.add(message, reserved);
        state.counters.enqueued += 1;
        state.last_active = Instant::now();
    }

    /// Registers a consumer. A durable topic consumer picks up its existing
    /// subscription, or creates and persists a new one.
    pub fn add_subscription(&self, info: ConsumerInfo, sink: Arc<dyn DeliverySink>) -> Result<()> {
        let default_prefetch = if self.name.is_queue() {
            self.policy.queue_prefetch
        } else {
            self.policy.topic_prefetch
        };
        {
            let mut state = self.state.lock();
            if state.removed {
                return Err(BrokerError::DestinationRemoved(self.name.clone()));
            }
            if state.subscriptions.iter().any(|s| s.id() == &info.id) {
                return Err(BrokerError::DuplicateConsumer(info.id));
            }

            if self.name.is_queue() {
                let mut subscription = Subscription::new(info, default_prefetch)?;
                subscription.attach(sink);
                state.subscriptions.push(subscription);
            } else {
                // consumers only see messages sent after they joined
                self.fan_out_locked(&mut state);
                let joined_after = state.next_sequence - 1;
                match info.durable.clone() {
                    Some(key) => {
                        let record = DurableSubscriptionRecord {
                            topic: self.name.clone(),
                            subscription: key.clone(),
                            selector: info.selector.clone(),
                        };
                        let existing = state
                            .subscriptions
                            .iter_mut()
                            .find(|s| s.key() == Some(&key));
                        match existing {
                            Some(subscription) if subscription.is_active() => {
                                return Err(BrokerError::DurableSubscriptionActive(key));
                            }
                            Some(subscription) => {
                                subscription.reactivate(info, default_prefetch, sink, joined_after)?;
                                self.adapter.save_durable_subscription(&record)?;
                                debug!(destination = %self.name, subscription = %key, "durable subscriber reconnected");
                            }
                            None => {
                                let mut subscription = self.durable_subscription(info)?;
                                self.adapter.save_durable_subscription(&record)?;
                                subscription.attach(sink);
                                state.subscriptions.push(subscription);
                                info!(destination = %self.name, subscription = %key, "created durable subscription");
                            }
                        }
                    }
                    None => {
                        let usage = self.usage.child(format!("{}#{}", self.name, info.id), None);
                        let mut pending = Cursor::in_memory(info.id.clone(), usage);
                        let retroactive = info.retroactive;
                        let mut subscription = Subscription::new(info, default_prefetch)?;
                        if retroactive {
                            for message in state.recovery.iter().filter(|m| subscription.matches(m)) {
                                pending.add(Arc::clone(message), false);
                            }
                        }
                        subscription = subscription.with_pending(pending, None, joined_after);
                        subscription.attach(sink);
                        state.subscriptions.push(subscription);
                    }
                }
            }
            state.last_active = Instant::now();
        }
        self.dispatch();
        Ok(())
    }

    fn durable_subscription(&self, info: ConsumerInfo) -> Result<Subscription> {
        let key = info
            .durable
            .clone()
            .ok_or_else(|| BrokerError::InvalidDestination(self.name.to_string()))?;
        let store = self.adapter.message_store(&StoreKey::Durable {
            topic: self.name.clone(),
            subscription: key.clone(),
        })?;
        let name = format!("{}#{}", self.name, key);
        let usage = self.usage.child(name.clone(), None);
        let pending = Cursor::store_backed(
            name,
            usage,
            Arc::clone(&store),
            self.policy.cursor_batch_size,
            self.policy.cursor_high_watermark_percent,
            self.policy.cursor_low_watermark_percent,
        )?;
        Ok(Subscription::new(info, self.policy.topic_prefetch)?.with_pending(pending, Some(store), 0))
    }

    /// Detaches a consumer. Its inflight messages go back to pending without
    /// counting as a redelivery. A durable subscription stays registered.
    pub fn remove_subscription(&self, consumer: &ConsumerId) -> Result<()> {
        {
            let mut state = self.state.lock();
            let index = state
                .subscriptions
                .iter()
                .position(|s| s.id() == consumer)
                .ok_or_else(|| BrokerError::UnknownConsumer(consumer.clone()))?;
            if self.name.is_queue() {
                let mut subscription = state.subscriptions.remove(index);
                for message in subscription.close() {
                    state.cursor.release(message.sequence);
                }
            } else if state.subscriptions[index].is_durable() {
                let subscription = &mut state.subscriptions[index];
                let released = subscription.close();
                if let Some(pending) = subscription.pending_mut() {
                    for message in released {
                        pending.release(message.sequence);
                    }
                }
            } else {
                state.subscriptions.remove(index);
            }
            state.last_active = Instant::now();
        }
        self.dispatch();
        Ok(())
    }

    /// Deletes a detached durable subscription and its stored messages.
    pub fn remove_durable_subscription(&self, key: &SubscriptionKey) -> Result<()> {
        {
            let mut state = self.state.lock();
            let index = state
                .subscriptions
                .iter()
                .position(|s| s.key() == Some(key))
                .ok_or_else(|| BrokerError::UnknownSubscription(key.clone()))?;
            if state.subscriptions[index].is_active() {
                return Err(BrokerError::DurableSubscriptionActive(key.clone()));
            }
            self.adapter.remove_durable_subscription(&self.name, key)?;
            let subscription = state.subscriptions.remove(index);
            drop(subscription);
            self.adapter.drop_store(&StoreKey::Durable {
                topic: self.name.clone(),
                subscription: key.clone(),
            })?;
            state.last_active = Instant::now();
            info!(destination = %self.name, subscription = %key, "removed durable subscription");
        }
        Ok(())
    }

    /// Acknowledges a message delivered to `consumer`.
    pub fn acknowledge(&self, consumer: &ConsumerId, message_id: &MessageId, mode: AckMode) -> Result<()> {
        {
            let mut state = self.state.lock();
            let prepared = self.prepare_ack_locked(&mut state, consumer, message_id, mode)?;
            self.complete_ack_locked(&mut state, prepared);
        }
        self.dispatch();
        Ok(())
    }

    /// Checks the acknowledgement and removes the settled messages from the
    /// store. Undone with `undo_prepared_ack`.
    pub(crate) fn prepare_ack_locked(
        &self,
        state: &mut DestinationState,
        consumer: &ConsumerId,
        message_id: &MessageId,
        mode: AckMode,
    ) -> Result<PreparedAck> {
        let subscription = state.subscription_mut(consumer)?;
        let messages = subscription.messages_to_ack(message_id, mode)?;
        let store = match &self.store {
            Some(store) => Some(Arc::clone(store)),
            None => subscription.store().cloned(),
        };
        let mut removed = Vec::new();
        if let Some(store) = &store {
            for message in messages.iter().filter(|m| m.is_persistent()) {
                if let Err(e) = store.remove(&message.id) {
                    error!(destination = %self.name, message = %message.id, error = %e, "failed to remove acknowledged message");
                    undo_removals(store, &removed);
                    return Err(e.into());
                }
                removed.push(Arc::clone(message));
            }
        }
        Ok(PreparedAck {
            consumer: consumer.clone(),
            message_id: message_id.clone(),
            mode,
            store,
            removed,
        })
    }

    pub(crate) fn undo_prepared_ack(&self, prepared: &PreparedAck) {
        if let Some(store) = &prepared.store {
            undo_removals(store, &prepared.removed);
        }
    }

    /// Takes the acknowledged messages out of the inflight window and the
    /// cursor.
    pub(crate) fn complete_ack_locked(&self, state: &mut DestinationState, prepared: PreparedAck) {
        let DestinationState {
            cursor,
            subscriptions,
            counters,
            last_active,
            ..
        } = state;
        let Some(subscription) = subscriptions.iter_mut().find(|s| s.id() == &prepared.consumer) else {
            return;
        };
        let mode = match prepared.mode {
            AckMode::Transacted => AckMode::Individual,
            mode => mode,
        };
        let acked = match subscription.acknowledge(&prepared.message_id, mode) {
            Ok(acked) => acked,
            Err(e) => {
                debug!(destination = %self.name, error = %e, "acknowledgement raced with rollback");
                return;
            }
        };
        for message in acked {
            match subscription.pending_mut() {
                Some(pending) => pending.take(&message.id),
                None => cursor.take(&message.id),
            };
            if prepared.store.is_some() && message.is_persistent() {
                self.store_usage.release(message.size());
            }
            counters.dequeued += 1;
        }
        *last_active = Instant::now();
    }

    /// Returns inflight messages to pending, incrementing their redelivery
    /// count. Messages over the redelivery limit are dead-lettered.
    pub fn rollback(&self, consumer: &ConsumerId, message_ids: &[MessageId]) -> Result<()> {
        let outbox = {
            let mut state = self.state.lock();
            state.subscription_mut(consumer)?;
            for id in message_ids {
                self.rollback_locked(&mut state, consumer, id);
            }
            std::mem::take(&mut state.outbox)
        };
        self.settle_dead_letters(outbox);
        self.dispatch();
        Ok(())
    }

    /// Every message currently inflight on `consumer`, in dispatch order.
    pub fn inflight_ids(&self, consumer: &ConsumerId) -> Vec<MessageId> {
        let state = self.state.lock();
        state
            .subscriptions
            .iter()
            .find(|s| s.id() == consumer)
            .map(|s| s.inflight_messages().iter().map(|m| m.id.clone()).collect())
            .unwrap_or_default()
    }

    pub(crate) fn rollback_locked(&self, state: &mut DestinationState, consumer: &ConsumerId, id: &MessageId) {
        let now = chrono::Utc::now().timestamp_millis();
        let DestinationState {
            cursor,
            subscriptions,
            outbox,
            counters,
            ..
        } = state;
        let Some(subscription) = subscriptions.iter_mut().find(|s| s.id() == consumer) else {
            return;
        };
        match subscription.rollback_or_expire(id, self.policy.max_redeliveries, now) {
            None => debug!(destination = %self.name, message = %id, "rollback of a message that is not inflight"),
            Some(Settlement::Redeliver(message)) => {
                counters.redelivered += 1;
                match subscription.pending_mut() {
                    Some(pending) => pending.redeliver(message),
                    None => cursor.redeliver(message),
                }
            }
            Some(Settlement::DeadLetter { message, cause }) => {
                let key = subscription.key().cloned();
                let holder = if self.name.is_queue() {
                    Holder::Queue
                } else if let Some(key) = &key {
                    Holder::Durable(key.clone())
                } else {
                    if let Some(pending) = subscription.pending_mut() {
                        pending.take(&message.id);
                    }
                    Holder::Released
                };
                outbox.push(DeadLetterEntry {
                    message,
                    cause,
                    subscription: key,
                    holder,
                });
            }
        }
    }

    /// Takes the dead letters staged under the lock, for `finish` to settle
    /// once the lock is released.
    pub(crate) fn take_outbox(state: &mut DestinationState) -> Outbox {
        Outbox(std::mem::take(&mut state.outbox))
    }

    /// Settles an outbox and runs a dispatch pass. Must be called without the
    /// lock held.
    pub(crate) fn finish(&self, outbox: Outbox) {
        self.settle_dead_letters(outbox.0);
        self.dispatch();
    }

    /// Adds one delivery credit to a pull consumer.
    pub fn pull(&self, consumer: &ConsumerId) -> Result<()> {
        self.state.lock().subscription_mut(consumer)?.add_pull()?;
        self.dispatch();
        Ok(())
    }

    /// Withdraws an unused pull credit.
    pub fn cancel_pull(&self, consumer: &ConsumerId) {
        if let Ok(subscription) = self.state.lock().subscription_mut(consumer) {
            subscription.cancel_pull();
        }
    }

    /// Runs dispatch passes until no more were requested. Concurrent callers
    /// coalesce: while one thread dispatches, the others only leave a request
    /// behind for it.
    pub fn dispatch(&self) {
        self.dispatch_requested.store(true, Ordering::Release);
        loop {
            if self
                .dispatching
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            while self.dispatch_requested.swap(false, Ordering::AcqRel) {
                let outbox = {
                    let mut state = self.state.lock();
                    let mut settled = Vec::new();
                    if self.name.is_queue() {
                        self.dispatch_queue_locked(&mut state, &mut settled);
                    } else {
                        self.dispatch_topic_locked(&mut state, &mut settled);
                    }
                    if !settled.is_empty() {
                        self.ack_dispatched_locked(&mut state, settled);
                        self.dispatch_requested.store(true, Ordering::Release);
                    }
                    std::mem::take(&mut state.outbox)
                };
                self.settle_dead_letters(outbox);
            }
            self.dispatching.store(false, Ordering::Release);
            if !self.dispatch_requested.load(Ordering::Acquire) {
                return;
            }
        }
    }

    /// Acknowledges messages handed to sinks that settle on delivery.
    fn ack_dispatched_locked(&self, state: &mut DestinationState, settled: Vec<(ConsumerId, MessageId)>) {
        for (consumer, message_id) in settled {
            match self.prepare_ack_locked(state, &consumer, &message_id, AckMode::Auto) {
                Ok(prepared) => self.complete_ack_locked(state, prepared),
                Err(e) => {
                    warn!(destination = %self.name, consumer = %consumer, message = %message_id, error = %e, "auto acknowledgement failed");
                }
            }
        }
    }

    fn dispatch_queue_locked(&self, state: &mut DestinationState, settled: &mut Vec<(ConsumerId, MessageId)>) {
        let DestinationState {
            cursor,
            subscriptions,
            round_robin,
            outbox,
            counters,
            ..
        } = state;
        if !subscriptions.iter().any(Subscription::has_capacity) {
            return;
        }
        let now = chrono::Utc::now().timestamp_millis();
        cursor.reset();
        while let Some(message) = cursor.next() {
            if message.is_expired_at(now) {
                cursor.mark_dispatched(message.sequence);
                counters.expired += 1;
                outbox.push(DeadLetterEntry {
                    message,
                    cause: DeadLetterCause::Expired,
                    subscription: None,
                    holder: Holder::Queue,
                });
                continue;
            }
            if !subscriptions.iter().any(Subscription::has_capacity) {
                break;
            }
            let count = subscriptions.len();
            for offset in 0..count {
                let index = (*round_robin + offset) % count;
                let subscription = &mut subscriptions[index];
                if !subscription.has_capacity() || !subscription.matches(&message) {
                    continue;
                }
                match subscription.dispatch(Arc::clone(&message)) {
                    Ok(()) => {
                        cursor.mark_dispatched(message.sequence);
                        counters.dispatched += 1;
                        *round_robin = index + 1;
                        if subscription.acks_on_dispatch() {
                            settled.push((subscription.id().clone(), message.id.clone()));
                        }
                        break;
                    }
                    Err(DispatchError::SinkClosed) => {
                        warn!(destination = %self.name, consumer = %subscription.id(), "consumer went away, skipping it");
                    }
                    Err(_) => {}
                }
            }
        }
    }

    /// Moves staged topic messages into each eligible subscription's
    /// pending cursor.
    fn fan_out_locked(&self, state: &mut DestinationState) {
        let DestinationState {
            cursor,
            subscriptions,
            durable_targets,
            recovery,
            counters,
            ..
        } = state;
        let pending_limit = self.policy.topic_pending_limit;
        let recovery_count = self.policy.retroactive_recovery_count;
        cursor.reset();
        while let Some(message) = cursor.next() {
            cursor.take(&message.id);
            let targets = durable_targets.remove(&message.sequence).unwrap_or_default();
            for subscription in subscriptions.iter_mut() {
                let eligible = match subscription.key() {
                    Some(key) if message.is_persistent() => targets.contains(key),
                    _ => {
                        subscription.is_active()
                            && message.sequence > subscription.joined_after()
                            && subscription.matches(&message)
                    }
                };
                if !eligible {
                    continue;
                }
                let durable = subscription.is_durable();
                let Some(pending) = subscription.pending_mut() else {
                    continue;
                };
                pending.add(Arc::clone(&message), false);
                let mut missed = 0;
                if let Some(limit) = pending_limit.filter(|_| !durable) {
                    while pending.pending_count() > limit {
                        if pending.take_oldest_pending().is_none() {
                            break;
                        }
                        missed += 1;
                    }
                }
                for _ in 0..missed {
                    subscription.record_missed();
                }
            }
            if recovery_count > 0 {
                recovery.push_back(Arc::clone(&message));
                while recovery.len() > recovery_count {
                    recovery.pop_front();
                }
            }
            counters.dequeued += 1;
        }
    }

    fn dispatch_topic_locked(&self, state: &mut DestinationState, settled: &mut Vec<(ConsumerId, MessageId)>) {
        self.fan_out_locked(state);
        let now = chrono::Utc::now().timestamp_millis();
        let DestinationState {
            subscriptions,
            outbox,
            counters,
            ..
        } = state;
        for subscription in subscriptions.iter_mut() {
            if !subscription.has_capacity() {
                continue;
            }
            if let Some(pending) = subscription.pending_mut() {
                pending.reset();
            }
            while subscription.has_capacity() {
                let Some(message) = subscription.pending_mut().and_then(Cursor::next) else {
                    break;
                };
                if message.is_expired_at(now) {
                    counters.expired += 1;
                    outbox.push(expire_from_subscription(subscription, message));
                    continue;
                }
                match subscription.dispatch(Arc::clone(&message)) {
                    Ok(()) => {
                        if let Some(pending) = subscription.pending_mut() {
                            pending.mark_dispatched(message.sequence);
                        }
                        counters.dispatched += 1;
                        if subscription.acks_on_dispatch() {
                            settled.push((subscription.id().clone(), message.id.clone()));
                        }
                    }
                    Err(DispatchError::SinkClosed) => {
                        warn!(destination = %self.name, consumer = %subscription.id(), "consumer went away, skipping it");
                        break;
                    }
                    Err(_) => break,
                }
            }
        }
    }

    /// Dead-letters (or drops) every pending message that has expired.
    /// Returns how many expired.
    pub fn expire_and_sweep(&self) -> usize {
        let now = chrono::Utc::now().timestamp_millis();
        let (expired, outbox) = {
            let mut state = self.state.lock();
            let mut expired = 0;
            if self.name.is_queue() {
                for message in state.cursor.mark_expired(now) {
                    state.outbox.push(DeadLetterEntry {
                        message,
                        cause: DeadLetterCause::Expired,
                        subscription: None,
                        holder: Holder::Queue,
                    });
                    expired += 1;
                }
            } else {
                self.fan_out_locked(&mut state);
                let DestinationState {
                    subscriptions,
                    outbox,
                    ..
                } = &mut *state;
                for subscription in subscriptions.iter_mut() {
                    let durable = subscription.is_durable();
                    let Some(pending) = subscription.pending_mut() else {
                        continue;
                    };
                    let messages = if durable {
                        pending.mark_expired(now)
                    } else {
                        pending.take_expired(now)
                    };
                    for message in messages {
                        outbox.push(expire_from_subscription(subscription, message));
                        expired += 1;
                    }
                }
            }
            state.counters.expired += expired as u64;
            (expired, std::mem::take(&mut state.outbox))
        };
        if expired > 0 {
            debug!(destination = %self.name, expired, "expired messages");
        }
        self.settle_dead_letters(outbox);
        expired
    }

    /// Routes staged dead letters, then removes each original from the cursor
    /// and store that held it. A message whose copy could not be routed stays
    /// in its store.
    fn settle_dead_letters(&self, outbox: Vec<DeadLetterEntry>) {
        for entry in outbox {
            let message = &entry.message;
            let process = self.dead_letter.should_process(message, entry.cause);
            let routed = if process {
                let target = self
                    .dead_letter
                    .destination_for(message, entry.subscription.as_ref());
                let copy = self.dead_letter.dead_letter_copy(message, entry.cause, target.clone());
                match self.router.route_dead_letter(copy) {
                    Ok(()) => {
                        info!(
                            destination = %self.name,
                            message = %message.id,
                            dead_letter_queue = %target,
                            cause = %entry.cause,
                            "message dead-lettered"
                        );
                        true
                    }
                    Err(e) => {
                        error!(destination = %self.name, message = %message.id, error = %e, "failed to dead-letter message");
                        false
                    }
                }
            } else {
                debug!(destination = %self.name, message = %message.id, cause = %entry.cause, "discarding message");
                true
            };
            if !routed {
                continue;
            }

            let mut state = self.state.lock();
            if process {
                state.counters.dead_lettered += 1;
            } else {
                state.counters.discarded += 1;
            }
            let removal = match &entry.holder {
                Holder::Queue => state.cursor.remove(&message.id).map(|_| self.store.is_some()),
                Holder::Durable(key) => {
                    match state
                        .subscriptions
                        .iter_mut()
                        .find(|s| s.key() == Some(key))
                        .and_then(Subscription::pending_mut)
                    {
                        Some(pending) => pending.remove(&message.id).map(|_| true),
                        None => Ok(false),
                    }
                }
                Holder::Released => Ok(false),
            };
            match removal {
                Ok(true) if message.is_persistent() => self.store_usage.release(message.size()),
                Ok(_) => {}
                Err(e) => {
                    error!(destination = %self.name, message = %message.id, error = %e, "failed to remove dead-lettered message")
                }
            }
        }
    }

    /// Marks the destination removed if it has no subscriptions, holds no
    /// messages and has been idle for `inactive_for`. Once marked, every
    /// further send or subscribe fails with `DestinationRemoved`.
    pub(crate) fn mark_removed_if_inactive(&self, inactive_for: Duration) -> bool {
        let mut state = self.state.lock();
        if state.removed
            || !state.subscriptions.is_empty()
            || !state.cursor.is_empty()
            || state.last_active.elapsed() < inactive_for
        {
            return false;
        }
        state.removed = true;
        true
    }

    pub fn subscription_count(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    pub fn pending_count(&self) -> usize {
        let state = self.state.lock();
        state.cursor.pending_count()
            + state
                .subscriptions
                .iter()
                .filter_map(|s| s.pending().map(Cursor::pending_count))
                .sum::<usize>()
    }

    /// Bytes currently inflight, summed over the subscriptions.
    pub fn inflight_size(&self) -> u64 {
        self.state
            .lock()
            .subscriptions
            .iter()
            .map(Subscription::inflight_size)
            .sum()
    }

    pub fn subscription_stats(&self, consumer: &ConsumerId) -> Option<SubscriptionStats> {
        let state = self.state.lock();
        state
            .subscriptions
            .iter()
            .find(|s| s.id() == consumer)
            .map(Subscription::stats)
    }

    pub fn durable_subscription_stats(&self, key: &SubscriptionKey) -> Option<SubscriptionStats> {
        let state = self.state.lock();
        state
            .subscriptions
            .iter()
            .find(|s| s.key() == Some(key))
            .map(Subscription::stats)
    }

    pub fn stats(&self) -> DestinationStats {
        let state = self.state.lock();
        let counters = &state.counters;
        let pending = state.cursor.pending_count()
            + state
                .subscriptions
                .iter()
                .filter_map(|s| s.pending().map(Cursor::pending_count))
                .sum::<usize>();
        DestinationStats {
            enqueued: counters.enqueued,
            dequeued: counters.dequeued,
            dispatched: counters.dispatched,
            expired: counters.expired,
            redelivered: counters.redelivered,
            dead_lettered: counters.dead_lettered,
            discarded: counters.discarded,
            pending,
            inflight_count: state.subscriptions.iter().map(Subscription::inflight_count).sum(),
            inflight_size: state.subscriptions.iter().map(Subscription::inflight_size).sum(),
            consumers: state.subscriptions.iter().filter(|s| s.is_active()).count(),
            memory_usage: self.usage.usage(),
        }
    }
}

impl std::fmt::Debug for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Destination").field("name", &self.name).finish()
    }
}

fn expire_from_subscription(subscription: &mut Subscription, message: Arc<Message>) -> DeadLetterEntry {
    let key = subscription.key().cloned();
    let holder = match &key {
        Some(key) => {
            if let Some(pending) = subscription.pending_mut() {
                pending.mark_dispatched(message.sequence);
            }
            Holder::Durable(key.clone())
        }
        None => {
            if let Some(pending) = subscription.pending_mut() {
                pending.take(&message.id);
            }
            Holder::Released
        }
    };
    DeadLetterEntry {
        message,
        cause: DeadLetterCause::Expired,
        subscription: key,
        holder,
    }
}

fn undo_appends(stores: &[Arc<dyn MessageStore>], id: &MessageId) {
    for store in stores {
        if let Err(e) = store.remove(id) {
            error!(message = %id, error = %e, "failed to undo store append");
        }
    }
}

fn undo_removals(store: &Arc<dyn MessageStore>, messages: &[Arc<Message>]) {
    for message in messages {
        if let Err(e) = store.append(message) {
            error!(message = %message.id, error = %e, "failed to restore message after a store failure");
        }
    }
}
