use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::broker::message::{DestinationName, Message, MessageId};
use crate::broker::subscription::SubscriptionKey;
use crate::store::{DurableSubscriptionRecord, MessageStore, PersistenceAdapter, StoreKey};
use crate::utils::error::StoreError;

#[derive(Default)]
struct Inner {
    messages: BTreeMap<u64, Message>,
    ids: HashMap<MessageId, u64>,
}

/// In-memory `MessageStore`. Survives a simulated restart as long as the
/// adapter that created it is kept alive.
#[derive(Default)]
pub struct MemoryMessageStore {
    inner: Mutex<Inner>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageStore for MemoryMessageStore {
    fn append(&self, message: &Message) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        inner.ids.insert(message.id.clone(), message.sequence);
        inner.messages.insert(message.sequence, message.clone());
        Ok(message.sequence)
    }

    fn remove(&self, id: &MessageId) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        match inner.ids.remove(id) {
            Some(sequence) => Ok(inner.messages.remove(&sequence).is_some()),
            None => Ok(false),
        }
    }

    fn recover(&self, after_sequence: u64, max_count: usize) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .messages
            .range(after_sequence.saturating_add(1)..)
            .take(max_count)
            .map(|(_, m)| m.clone())
            .collect())
    }

    fn count(&self) -> Result<usize, StoreError> {
        Ok(self.inner.lock().messages.len())
    }

    fn last_sequence(&self) -> Result<u64, StoreError> {
        Ok(self
            .inner
            .lock()
            .messages
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0))
    }
}

#[derive(Default)]
pub struct MemoryPersistenceAdapter {
    stores: Mutex<HashMap<StoreKey, Arc<MemoryMessageStore>>>,
    durable: Mutex<BTreeMap<(DestinationName, SubscriptionKey), DurableSubscriptionRecord>>,
}

impl MemoryPersistenceAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistenceAdapter for MemoryPersistenceAdapter {
    fn message_store(&self, key: &StoreKey) -> Result<Arc<dyn MessageStore>, StoreError> {
        let mut stores = self.stores.lock();
        let store = stores
            .entry(key.clone())
            .or_insert_with(|| Arc::new(MemoryMessageStore::new()));
        Ok(Arc::clone(store) as Arc<dyn MessageStore>)
    }

    fn drop_store(&self, key: &StoreKey) -> Result<(), StoreError> {
        self.stores.lock().remove(key);
        Ok(())
    }

    fn save_durable_subscription(&self, record: &DurableSubscriptionRecord) -> Result<(), StoreError> {
        self.durable.lock().insert(
            (record.topic.clone(), record.subscription.clone()),
            record.clone(),
        );
        Ok(())
    }

    fn remove_durable_subscription(
        &self,
        topic: &DestinationName,
        subscription: &SubscriptionKey,
    ) -> Result<(), StoreError> {
        self.durable
            .lock()
            .remove(&(topic.clone(), subscription.clone()));
        Ok(())
    }

    fn durable_subscriptions(
        &self,
        topic: &DestinationName,
    ) -> Result<Vec<DurableSubscriptionRecord>, StoreError> {
        Ok(self
            .durable
            .lock()
            .values()
            .filter(|r| &r.topic == topic)
            .cloned()
            .collect())
    }
}
