//! The `error` module defines the error types used throughout `popmq`.
//!
//! Producers see `FlowControl`, `Interrupted` and `Store` errors on sends and
//! commits. Consumers never see internal errors: a failed dispatch attempt
//! leaves the message pending for the next pass.

use thiserror::Error;

use crate::broker::message::{DestinationName, MessageId};
use crate::broker::subscription::{ConsumerId, SubscriptionKey};

/// Errors raised by a `MessageStore` or `PersistenceAdapter`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("failed to encode or decode a stored record: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum BrokerError {
    /// The memory or store limit refused the reservation, either straight away
    /// (reject policy) or after the configured send timeout (block policy).
    #[error("flow control: {bytes} bytes refused by {destination}")]
    FlowControl {
        destination: DestinationName,
        bytes: u64,
    },

    #[error("blocked send interrupted")]
    Interrupted,

    #[error("store failure: {0}")]
    Store(#[from] StoreError),

    #[error("invalid selector `{selector}`: {reason}")]
    InvalidSelector { selector: String, reason: String },

    /// Lost a race with the destination GC. Retried internally.
    #[error("destination {0} was removed")]
    DestinationRemoved(DestinationName),

    #[error("invalid destination: {0}")]
    InvalidDestination(String),

    #[error("unknown consumer {0}")]
    UnknownConsumer(ConsumerId),

    #[error("message {0} is not inflight")]
    UnknownMessage(MessageId),

    #[error("consumer {0} already exists")]
    DuplicateConsumer(ConsumerId),

    #[error("durable subscription {0} already has an active consumer")]
    DurableSubscriptionActive(SubscriptionKey),

    #[error("no durable subscription {0}")]
    UnknownSubscription(SubscriptionKey),

    /// Pull requests are only accepted from consumers with prefetch 0.
    #[error("consumer {0} is not a pull consumer")]
    NotPullConsumer(ConsumerId),

    #[error("client id {0} is already connected")]
    ClientIdInUse(String),

    #[error("invalid client id `{0}`")]
    InvalidClientId(String),

    #[error("consumer {0} is closed")]
    ConsumerClosed(ConsumerId),

    #[error("broker is shutting down")]
    ShuttingDown,
}

pub type Result<T, E = BrokerError> = std::result::Result<T, E>;
