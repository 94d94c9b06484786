//! The `store` module defines the persistence contract of the broker and
//! ships two implementations.
//!
//! A `MessageStore` holds the persistent messages of one destination (or of
//! one durable subscription) ordered by broker sequence number, keyed by
//! message id and queryable by "after sequence N". A `PersistenceAdapter`
//! hands out one store per key and records durable subscriptions so they can
//! be restored after a restart.
//!
//! - `memory`: `BTreeMap` backed, used when no data directory is configured
//!   and throughout the tests.
//! - `sled_store`: embedded `sled` database, one tree pair per store.

pub mod memory;
pub mod sled_store;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::broker::message::{DestinationName, Message, MessageId};
use crate::broker::subscription::SubscriptionKey;
use crate::utils::error::StoreError;

pub use memory::{MemoryMessageStore, MemoryPersistenceAdapter};
pub use sled_store::{SledMessageStore, SledPersistenceAdapter};

/// Durable, sequence-ordered message storage for a single destination.
pub trait MessageStore: Send + Sync {
    /// Stores `message` under its sequence number and returns that number.
    fn append(&self, message: &Message) -> Result<u64, StoreError>;

    /// Removes the message and reports whether it was stored. Removing an
    /// unknown id is a no-op.
    fn remove(&self, id: &MessageId) -> Result<bool, StoreError>;

    /// Up to `max_count` messages with a sequence greater than
    /// `after_sequence`, in sequence order.
    fn recover(&self, after_sequence: u64, max_count: usize) -> Result<Vec<Message>, StoreError>;

    fn count(&self) -> Result<usize, StoreError>;

    /// Highest stored sequence number, 0 when empty.
    fn last_sequence(&self) -> Result<u64, StoreError>;
}

/// Identifies a store: a destination's own store or the store of one durable
/// topic subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StoreKey {
    Destination(DestinationName),
    Durable {
        topic: DestinationName,
        subscription: SubscriptionKey,
    },
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKey::Destination(name) => write!(f, "{name}"),
            StoreKey::Durable {
                topic,
                subscription,
            } => write!(f, "{topic}#{subscription}"),
        }
    }
}

/// Registration of a durable topic subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableSubscriptionRecord {
    pub topic: DestinationName,
    pub subscription: SubscriptionKey,
    pub selector: Option<String>,
}

pub trait PersistenceAdapter: Send + Sync {
    /// Returns the store for `key`, creating it on first use. Repeated calls
    /// return the same store.
    fn message_store(&self, key: &StoreKey) -> Result<Arc<dyn MessageStore>, StoreError>;

    /// Deletes the store and everything in it.
    fn drop_store(&self, key: &StoreKey) -> Result<(), StoreError>;

    fn save_durable_subscription(&self, record: &DurableSubscriptionRecord) -> Result<(), StoreError>;

    fn remove_durable_subscription(
        &self,
        topic: &DestinationName,
        subscription: &SubscriptionKey,
    ) -> Result<(), StoreError>;

    fn durable_subscriptions(
        &self,
        topic: &DestinationName,
    ) -> Result<Vec<DurableSubscriptionRecord>, StoreError>;

    /// Makes every write so far durable.
    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
