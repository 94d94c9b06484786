use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use sled::{Db, Tree};

use crate::broker::message::{DestinationName, Message, MessageId};
use crate::broker::subscription::SubscriptionKey;
use crate::store::{DurableSubscriptionRecord, MessageStore, PersistenceAdapter, StoreKey};
use crate::utils::error::StoreError;

const DURABLE_TREE: &str = "durable_subscriptions";

fn abort_reason(err: TransactionError<StoreError>) -> StoreError {
    match err {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => StoreError::Sled(e),
    }
}

fn decode_sequence(key: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = key.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

/// Message store over two sled trees: messages keyed by big-endian sequence
/// (so iteration order is sequence order) and an id → sequence index.
#[derive(Clone)]
pub struct SledMessageStore {
    messages: Tree,
    ids: Tree,
}

impl SledMessageStore {
    fn open(db: &Db, key: &StoreKey) -> Result<Self, StoreError> {
        Ok(Self {
            messages: db.open_tree(format!("msgs:{key}"))?,
            ids: db.open_tree(format!("ids:{key}"))?,
        })
    }
}

impl MessageStore for SledMessageStore {
    fn append(&self, message: &Message) -> Result<u64, StoreError> {
        let serialized = serde_json::to_vec(message)?;
        let key = message.sequence.to_be_bytes();
        (&self.messages, &self.ids)
            .transaction(|(messages, ids)| {
                messages.insert(key.as_slice(), serialized.as_slice())?;
                ids.insert(message.id.0.as_bytes(), key.as_slice())?;
                Ok::<(), ConflictableTransactionError<StoreError>>(())
            })
            .map_err(abort_reason)?;
        Ok(message.sequence)
    }

    fn remove(&self, id: &MessageId) -> Result<bool, StoreError> {
        (&self.messages, &self.ids)
            .transaction(|(messages, ids)| {
                let removed = match ids.remove(id.0.as_bytes())? {
                    Some(key) => messages.remove(key)?.is_some(),
                    None => false,
                };
                Ok::<bool, ConflictableTransactionError<StoreError>>(removed)
            })
            .map_err(abort_reason)
    }

    fn recover(&self, after_sequence: u64, max_count: usize) -> Result<Vec<Message>, StoreError> {
        let start = after_sequence.saturating_add(1).to_be_bytes();
        let mut recovered = Vec::new();
        for entry in self.messages.range(start..).take(max_count) {
            let (_, value) = entry?;
            recovered.push(serde_json::from_slice(&value)?);
        }
        Ok(recovered)
    }

    fn count(&self) -> Result<usize, StoreError> {
        Ok(self.messages.len())
    }

    fn last_sequence(&self) -> Result<u64, StoreError> {
        Ok(self
            .messages
            .last()?
            .and_then(|(key, _)| decode_sequence(&key))
            .unwrap_or(0))
    }
}

/// sled-backed `PersistenceAdapter`. One database per broker process.
pub struct SledPersistenceAdapter {
    db: Db,
    stores: Mutex<HashMap<StoreKey, Arc<SledMessageStore>>>,
}

impl SledPersistenceAdapter {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Ok(Self {
            db,
            stores: Mutex::new(HashMap::new()),
        })
    }

    /// `["topic://t","client","name"]`. The quoted topic ends before the
    /// first comma, so one topic's records never share a prefix with
    /// another's.
    fn durable_key(topic: &DestinationName, subscription: &SubscriptionKey) -> Result<Vec<u8>, StoreError> {
        Ok(serde_json::to_vec(&(
            topic.to_string(),
            &subscription.client_id,
            &subscription.subscription_name,
        ))?)
    }

    fn durable_prefix(topic: &DestinationName) -> Result<Vec<u8>, StoreError> {
        let mut prefix = b"[".to_vec();
        prefix.extend(serde_json::to_vec(&topic.to_string())?);
        prefix.push(b',');
        Ok(prefix)
    }
}

impl PersistenceAdapter for SledPersistenceAdapter {
    fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn message_store(&self, key: &StoreKey) -> Result<Arc<dyn MessageStore>, StoreError> {
        let mut stores = self.stores.lock();
        if let Some(store) = stores.get(key) {
            return Ok(Arc::clone(store) as Arc<dyn MessageStore>);
        }
        let store = Arc::new(SledMessageStore::open(&self.db, key)?);
        stores.insert(key.clone(), Arc::clone(&store));
        Ok(store as Arc<dyn MessageStore>)
    }

    fn drop_store(&self, key: &StoreKey) -> Result<(), StoreError> {
        self.stores.lock().remove(key);
        self.db.drop_tree(format!("msgs:{key}"))?;
        self.db.drop_tree(format!("ids:{key}"))?;
        Ok(())
    }

    fn save_durable_subscription(&self, record: &DurableSubscriptionRecord) -> Result<(), StoreError> {
        let tree = self.db.open_tree(DURABLE_TREE)?;
        let key = Self::durable_key(&record.topic, &record.subscription)?;
        tree.insert(key, serde_json::to_vec(record)?)?;
        Ok(())
    }

    fn remove_durable_subscription(
        &self,
        topic: &DestinationName,
        subscription: &SubscriptionKey,
    ) -> Result<(), StoreError> {
        let tree = self.db.open_tree(DURABLE_TREE)?;
        tree.remove(Self::durable_key(topic, subscription)?)?;
        Ok(())
    }

    fn durable_subscriptions(
        &self,
        topic: &DestinationName,
    ) -> Result<Vec<DurableSubscriptionRecord>, StoreError> {
        let tree = self.db.open_tree(DURABLE_TREE)?;
        let mut records = Vec::new();
        for entry in tree.scan_prefix(Self::durable_prefix(topic)?) {
            let (_, value) = entry?;
            records.push(serde_json::from_slice(&value)?);
        }
        Ok(records)
    }
}

impl std::fmt::Debug for SledPersistenceAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledPersistenceAdapter")
            .field("db", &"sled::Db")
            .finish()
    }
}
