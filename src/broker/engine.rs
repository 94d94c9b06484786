use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::broker::consumer::Consumer;
use crate::broker::destination::{DeadLetterRouter, Destination, DestinationStats};
use crate::broker::message::{DestinationName, Message, MessageId};
use crate::broker::subscription::{AckMode, ConsumerId, ConsumerInfo, DeliverySink, SubscriptionKey};
use crate::broker::transaction::{self, TransactionId, TransactionRegistry};
use crate::config::{BrokerSettings, DestinationPolicy, Settings};
use crate::store::{
    MemoryPersistenceAdapter, PersistenceAdapter, SledPersistenceAdapter, StoreKey,
};
use crate::usage::UsageManager;
use crate::utils::error::{BrokerError, Result};

struct ConsumerRecord {
    destination: Arc<Destination>,
    ack_mode: AckMode,
    transaction: Option<TransactionId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub destinations: usize,
    pub consumers: usize,
    pub clients: usize,
    pub open_transactions: usize,
    pub memory_usage: u64,
    pub store_usage: u64,
}

/// Routes dead letters back through the broker that owns the destination.
struct BrokerRouter(Weak<Broker>);

impl DeadLetterRouter for BrokerRouter {
    fn route_dead_letter(&self, message: Message) -> Result<()> {
        let broker = self.0.upgrade().ok_or(BrokerError::ShuttingDown)?;
        broker.route_dead_letter(message)
    }
}

/// The broker: the registry of destinations and the entry point for every
/// producer, consumer and transaction operation.
///
/// Destinations are created on first use and, when their policy allows it,
/// garbage collected once they have been empty and idle for long enough.
/// An operation that races with the collector simply resolves the
/// destination again.
pub struct Broker {
    settings: BrokerSettings,
    default_policy: DestinationPolicy,
    policies: RwLock<HashMap<DestinationName, DestinationPolicy>>,
    memory_usage: Arc<UsageManager>,
    store_usage: Arc<UsageManager>,
    adapter: Arc<dyn PersistenceAdapter>,
    router: Arc<dyn DeadLetterRouter>,
    destinations: RwLock<HashMap<DestinationName, Arc<Destination>>>,
    consumers: Mutex<HashMap<ConsumerId, ConsumerRecord>>,
    /// Client ids of the connected clients.
    clients: Mutex<HashSet<String>>,
    transactions: TransactionRegistry,
    stopped: AtomicBool,
    never_cancelled: AtomicBool,
    shutdown: Notify,
}

impl Broker {
    /// Creates a broker over `adapter`.
    pub fn new(settings: &Settings, adapter: Arc<dyn PersistenceAdapter>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            settings: settings.broker.clone(),
            default_policy: settings.policy.clone(),
            policies: RwLock::new(HashMap::new()),
            memory_usage: UsageManager::root("memory", settings.broker.memory_limit_bytes),
            store_usage: UsageManager::root("store", settings.broker.store_limit_bytes),
            adapter,
            router: Arc::new(BrokerRouter(weak.clone())),
            destinations: RwLock::new(HashMap::new()),
            consumers: Mutex::new(HashMap::new()),
            clients: Mutex::new(HashSet::new()),
            transactions: TransactionRegistry::default(),
            stopped: AtomicBool::new(false),
            never_cancelled: AtomicBool::new(false),
            shutdown: Notify::new(),
        })
    }

    /// A broker whose stores live in memory only.
    pub fn in_memory(settings: &Settings) -> Arc<Self> {
        Self::new(settings, Arc::new(MemoryPersistenceAdapter::new()))
    }

    /// Opens the broker configured by `settings`: sled under `data_dir` when
    /// one is set, memory otherwise.
    pub fn open(settings: &Settings) -> Result<Arc<Self>> {
        match &settings.broker.data_dir {
            Some(dir) => {
                let adapter = SledPersistenceAdapter::open(dir)?;
                info!(data_dir = %dir, "opened sled message store");
                Ok(Self::new(settings, Arc::new(adapter)))
            }
            None => Ok(Self::in_memory(settings)),
        }
    }

    pub fn memory_usage(&self) -> &Arc<UsageManager> {
        &self.memory_usage
    }

    pub fn store_usage(&self) -> &Arc<UsageManager> {
        &self.store_usage
    }

    /// Overrides the policy for destinations named `name` created from now on.
    pub fn set_policy(&self, name: DestinationName, policy: DestinationPolicy) {
        self.policies.write().insert(name, policy);
    }

    pub fn policy_for(&self, name: &DestinationName) -> DestinationPolicy {
        self.policies
            .read()
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.default_policy.clone())
    }

    /// The live destination called `name`, created if needed.
    pub fn destination(&self, name: &DestinationName) -> Result<Arc<Destination>> {
        if let Some(destination) = self.destinations.read().get(name) {
            if !destination.is_removed() {
                return Ok(Arc::clone(destination));
            }
        }

        let mut destinations = self.destinations.write();
        if let Some(destination) = destinations.get(name) {
            if !destination.is_removed() {
                return Ok(Arc::clone(destination));
            }
        }
        if self.stopped.load(Ordering::Acquire) {
            return Err(BrokerError::ShuttingDown);
        }
        if name.name.trim().is_empty() {
            return Err(BrokerError::InvalidDestination(name.to_string()));
        }

        let policy = self.policy_for(name);
        let usage = self
            .memory_usage
            .child(name.to_string(), policy.memory_limit_bytes);
        let destination = Destination::open(
            name.clone(),
            policy,
            usage,
            Arc::clone(&self.store_usage),
            Arc::clone(&self.adapter),
            Arc::clone(&self.router),
        )?;
        destinations.insert(name.clone(), Arc::clone(&destination));
        debug!(destination = %name, "created destination");
        Ok(destination)
    }

    /// The registered destination called `name`, without creating one.
    pub fn lookup(&self, name: &DestinationName) -> Option<Arc<Destination>> {
        self.destinations.read().get(name).cloned()
    }

    pub fn destination_names(&self) -> Vec<DestinationName> {
        let mut names: Vec<_> = self.destinations.read().keys().cloned().collect();
        names.sort_by_key(|n| n.to_string());
        names
    }

    pub fn destination_stats(&self, name: &DestinationName) -> Option<DestinationStats> {
        self.lookup(name).map(|d| d.stats())
    }

    pub fn send(&self, message: Message) -> Result<()> {
        self.send_with(message, None, &self.never_cancelled)
    }

    pub fn send_transacted(&self, message: Message, transaction: &TransactionId) -> Result<()> {
        self.send_with(message, Some(transaction), &self.never_cancelled)
    }

    /// Sends `message` to its destination, or records it in `transaction`.
    /// A send blocked by flow control returns `Interrupted` once `cancel` is
    /// set and `interrupt_blocked_sends` is called.
    pub fn send_with(
        &self,
        message: Message,
        transaction: Option<&TransactionId>,
        cancel: &AtomicBool,
    ) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(BrokerError::ShuttingDown);
        }
        let name = message.destination.clone();
        if let Some(transaction) = transaction {
            let destination = self.destination(&name)?;
            let size = message.size();
            destination.admit(size, message.is_persistent(), cancel)?;
            self.transactions
                .record_send(transaction, destination, message, size);
            return Ok(());
        }
        loop {
            let destination = self.destination(&name)?;
            match destination.send(message.clone(), cancel) {
                Err(BrokerError::DestinationRemoved(_)) => {
                    debug!(destination = %name, "send raced with destination removal, retrying");
                }
                result => return result,
            }
        }
    }

    fn route_dead_letter(&self, message: Message) -> Result<()> {
        let name = message.destination.clone();
        loop {
            let destination = self.destination(&name)?;
            match destination.enqueue_dead_letter(message.clone()) {
                Err(BrokerError::DestinationRemoved(_)) => continue,
                result => return result,
            }
        }
    }

    /// Subscribes an in-process consumer.
    pub fn subscribe(self: &Arc<Self>, info: ConsumerInfo) -> Result<Consumer> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let prefetch = info.prefetch.unwrap_or_else(|| {
            let policy = self.policy_for(&info.destination);
            if info.destination.is_queue() {
                policy.queue_prefetch
            } else {
                policy.topic_prefetch
            }
        });
        self.add_consumer(info.clone(), Arc::new(sender))?;
        Ok(Consumer::new(Arc::clone(self), &info, prefetch, receiver))
    }

    /// Registers a consumer whose messages are pushed to `sink`.
    pub fn add_consumer(&self, info: ConsumerInfo, sink: Arc<dyn DeliverySink>) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(BrokerError::ShuttingDown);
        }
        if info.durable.is_some() && info.destination.is_queue() {
            return Err(BrokerError::InvalidDestination(format!(
                "durable subscriptions need a topic, got {}",
                info.destination
            )));
        }
        if info.ack_mode == AckMode::Transacted && info.transaction.is_none() {
            return Err(BrokerError::InvalidDestination(format!(
                "transacted consumer {} has no transaction",
                info.id
            )));
        }

        loop {
            let destination = self.destination(&info.destination)?;
            {
                let mut consumers = self.consumers.lock();
                if consumers.contains_key(&info.id) {
                    return Err(BrokerError::DuplicateConsumer(info.id));
                }
                consumers.insert(
                    info.id.clone(),
                    ConsumerRecord {
                        destination: Arc::clone(&destination),
                        ack_mode: info.ack_mode,
                        transaction: info.transaction.clone(),
                    },
                );
            }
            match destination.add_subscription(info.clone(), Arc::clone(&sink)) {
                Ok(()) => {
                    debug!(consumer = %info.id, destination = %info.destination, "consumer added");
                    return Ok(());
                }
                Err(e) => {
                    self.consumers.lock().remove(&info.id);
                    if !matches!(e, BrokerError::DestinationRemoved(_)) {
                        return Err(e);
                    }
                    debug!(destination = %info.destination, "subscribe raced with destination removal, retrying");
                }
            }
        }
    }

    /// Closes a consumer. Messages it received in a still open transaction
    /// are rolled back first, so they come back redelivered.
    pub fn remove_consumer(&self, consumer: &ConsumerId) -> Result<()> {
        let record = self
            .consumers
            .lock()
            .remove(consumer)
            .ok_or_else(|| BrokerError::UnknownConsumer(consumer.clone()))?;
        if let Some(id) = &record.transaction {
            let acks = self.transactions.take_consumer_acks(id, consumer);
            transaction::rollback(id, acks);
        }
        record.destination.remove_subscription(consumer)?;
        debug!(consumer = %consumer, "consumer removed");
        Ok(())
    }

    /// Deletes a durable subscription that has no active consumer.
    pub fn unsubscribe_durable(&self, topic: &DestinationName, key: &SubscriptionKey) -> Result<()> {
        self.destination(topic)?.remove_durable_subscription(key)
    }

    /// Acknowledges `message_id` on behalf of `consumer`, in the consumer's
    /// acknowledgement mode.
    pub fn acknowledge(&self, consumer: &ConsumerId, message_id: &MessageId) -> Result<()> {
        let (destination, ack_mode, transaction) = {
            let consumers = self.consumers.lock();
            let record = consumers
                .get(consumer)
                .ok_or_else(|| BrokerError::UnknownConsumer(consumer.clone()))?;
            (
                Arc::clone(&record.destination),
                record.ack_mode,
                record.transaction.clone(),
            )
        };
        match (ack_mode, transaction) {
            (AckMode::Transacted, Some(transaction)) => {
                if !destination.inflight_ids(consumer).contains(message_id) {
                    return Err(BrokerError::UnknownMessage(message_id.clone()));
                }
                self.transactions.record_ack(
                    &transaction,
                    destination,
                    consumer.clone(),
                    message_id.clone(),
                );
                Ok(())
            }
            (AckMode::Client, _) => destination.acknowledge(consumer, message_id, AckMode::Client),
            _ => destination.acknowledge(consumer, message_id, AckMode::Individual),
        }
    }

    /// Returns every message inflight on `consumer` for redelivery.
    pub fn recover(&self, consumer: &ConsumerId) -> Result<()> {
        let destination = self.consumer_destination(consumer)?;
        let inflight = destination.inflight_ids(consumer);
        destination.rollback(consumer, &inflight)
    }

    pub fn pull(&self, consumer: &ConsumerId) -> Result<()> {
        self.consumer_destination(consumer)?.pull(consumer)
    }

    pub fn cancel_pull(&self, consumer: &ConsumerId) {
        if let Ok(destination) = self.consumer_destination(consumer) {
            destination.cancel_pull(consumer);
        }
    }

    fn consumer_destination(&self, consumer: &ConsumerId) -> Result<Arc<Destination>> {
        self.consumers
            .lock()
            .get(consumer)
            .map(|r| Arc::clone(&r.destination))
            .ok_or_else(|| BrokerError::UnknownConsumer(consumer.clone()))
    }

    /// Claims `client_id` for a connection. Fails while another connection
    /// holds it, so a durable subscription only ever has one owner.
    pub fn register_client(&self, client_id: &str) -> Result<()> {
        if self.clients.lock().insert(client_id.to_string()) {
            debug!(client = %client_id, "client registered");
            Ok(())
        } else {
            Err(BrokerError::ClientIdInUse(client_id.to_string()))
        }
    }

    pub fn unregister_client(&self, client_id: &str) {
        self.clients.lock().remove(client_id);
    }

    pub fn begin(&self) -> TransactionId {
        self.transactions.begin()
    }

    /// Commits a transaction. Committing an unknown or empty transaction does
    /// nothing.
    pub fn commit(&self, transaction: &TransactionId) -> Result<()> {
        let pending = self.transactions.take(transaction);
        transaction::commit(transaction, pending, |name| self.destination(name))
    }

    pub fn rollback(&self, transaction: &TransactionId) -> Result<()> {
        let pending = self.transactions.take(transaction);
        transaction::rollback(transaction, pending);
        Ok(())
    }

    /// Removes `name` if it has been empty, unsubscribed and idle for at
    /// least `inactive_for`. Returns whether it was removed.
    pub fn remove_destination(&self, name: &DestinationName, inactive_for: Duration) -> bool {
        let Some(destination) = self.lookup(name) else {
            return false;
        };
        if !destination.mark_removed_if_inactive(inactive_for) {
            return false;
        }

        let mut destinations = self.destinations.write();
        let replaced = match destinations.get(name) {
            Some(current) if Arc::ptr_eq(current, &destination) => {
                destinations.remove(name);
                false
            }
            Some(_) => true,
            None => false,
        };
        if !replaced && name.is_queue() {
            // nobody can reopen the store while the registry is locked
            if let Err(e) = self.adapter.drop_store(&StoreKey::Destination(name.clone())) {
                warn!(destination = %name, error = %e, "failed to drop store of removed destination");
            }
        }
        drop(destinations);

        if destination.subscription_count() > 0 || destination.pending_count() > 0 {
            error!(destination = %name, "Failed to remove inactive destination: it is still in use");
            return false;
        }
        info!(destination = %name, "removed inactive destination");
        true
    }

    /// One pass of the inactive destination collector.
    pub fn gc_inactive_destinations(&self) -> usize {
        let candidates: Vec<(DestinationName, Duration)> = self
            .destinations
            .read()
            .values()
            .filter(|d| d.policy().gc_inactive_destinations)
            .map(|d| {
                (
                    d.name().clone(),
                    Duration::from_millis(d.policy().gc_inactive_after_ms),
                )
            })
            .collect();

        let limit = match self.settings.max_purged_destinations_per_sweep {
            0 => usize::MAX,
            n => n,
        };
        let mut removed = 0;
        for (name, inactive_for) in candidates {
            if removed >= limit {
                break;
            }
            if self.remove_destination(&name, inactive_for) {
                removed += 1;
            }
        }
        removed
    }

    /// Expires pending messages on every destination.
    pub fn expire_and_sweep(&self) -> usize {
        let destinations: Vec<_> = self.destinations.read().values().cloned().collect();
        destinations.iter().map(|d| d.expire_and_sweep()).sum()
    }

    /// Wakes every producer blocked on flow control so it re-checks its
    /// cancel flag.
    pub fn interrupt_blocked_sends(&self) {
        self.memory_usage.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stops accepting work, fails blocked sends and flushes the store.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.memory_usage.stop();
        self.shutdown.notify_one();
        if let Err(e) = self.adapter.flush() {
            error!(error = %e, "failed to flush store on shutdown");
        }
        info!("broker stopped");
    }

    /// Periodic expiry and destination GC, until `shutdown`.
    pub async fn run_maintenance(self: Arc<Self>) {
        let mut gc = tokio::time::interval(Duration::from_millis(
            self.settings.gc_sweep_period_ms.max(1),
        ));
        let mut expiry = tokio::time::interval(Duration::from_millis(
            self.settings.expire_sweep_period_ms.max(1),
        ));
        gc.set_missed_tick_behavior(MissedTickBehavior::Delay);
        expiry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.is_stopped() {
            tokio::select! {
                _ = gc.tick() => {
                    let broker = Arc::clone(&self);
                    match tokio::task::spawn_blocking(move || broker.gc_inactive_destinations()).await {
                        Ok(0) => {}
                        Ok(removed) => debug!(removed, "destination gc sweep"),
                        Err(e) => error!(error = %e, "destination gc task failed"),
                    }
                }
                _ = expiry.tick() => {
                    let broker = Arc::clone(&self);
                    if let Err(e) = tokio::task::spawn_blocking(move || broker.expire_and_sweep()).await {
                        error!(error = %e, "expiry task failed");
                    }
                }
                _ = self.shutdown.notified() => break,
            }
        }
        debug!("maintenance loop stopped");
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            destinations: self.destinations.read().len(),
            consumers: self.consumers.lock().len(),
            clients: self.clients.lock().len(),
            open_transactions: self.transactions.open_count(),
            memory_usage: self.memory_usage.usage(),
            store_usage: self.store_usage.usage(),
        }
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("destinations", &self.destinations.read().len())
            .field("memory", &self.memory_usage)
            .finish()
    }
}
