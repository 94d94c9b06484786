//! Dead-letter routing.
//!
//! Decides where a message goes once it expired or ran out of redelivery
//! attempts. `Shared` sends everything to one queue; `Individual` derives a
//! destination per original destination, optionally further split per
//! durable subscriber so poison messages of different durable subscribers do
//! not end up on the same queue.

use std::fmt;

use crate::broker::message::{DestinationKind, DestinationName, Message};
use crate::broker::subscription::SubscriptionKey;
use crate::config::{DeadLetterPolicy, DeadLetterVariant};

pub const ORIGINAL_DESTINATION_PROPERTY: &str = "original_destination";
pub const DEAD_LETTER_CAUSE_PROPERTY: &str = "dead_letter_cause";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterCause {
    Expired,
    RedeliveryExhausted,
}

impl fmt::Display for DeadLetterCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeadLetterCause::Expired => f.write_str("expired"),
            DeadLetterCause::RedeliveryExhausted => f.write_str("redelivery_exhausted"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum DeadLetterStrategy {
    Shared {
        queue: String,
        process_expired: bool,
        process_non_persistent: bool,
    },
    Individual {
        queue_prefix: String,
        topic_prefix: String,
        use_queue_for_queue_messages: bool,
        use_queue_for_topic_messages: bool,
        per_durable_subscriber: bool,
        process_expired: bool,
        process_non_persistent: bool,
    },
}

impl DeadLetterStrategy {
    pub fn from_policy(policy: &DeadLetterPolicy) -> Self {
        match policy.variant {
            DeadLetterVariant::Shared => DeadLetterStrategy::Shared {
                queue: policy.shared_queue.clone(),
                process_expired: policy.process_expired,
                process_non_persistent: policy.process_non_persistent,
            },
            DeadLetterVariant::Individual => DeadLetterStrategy::Individual {
                queue_prefix: policy.queue_prefix.clone(),
                topic_prefix: policy.topic_prefix.clone(),
                use_queue_for_queue_messages: policy.use_queue_for_queue_messages,
                use_queue_for_topic_messages: policy.use_queue_for_topic_messages,
                per_durable_subscriber: policy.destination_per_durable_subscriber,
                process_expired: policy.process_expired,
                process_non_persistent: policy.process_non_persistent,
            },
        }
    }

    pub fn kind(&self) -> DeadLetterVariant {
        match self {
            DeadLetterStrategy::Shared { .. } => DeadLetterVariant::Shared,
            DeadLetterStrategy::Individual { .. } => DeadLetterVariant::Individual,
        }
    }

    /// True for destinations this strategy routes into. Their messages are
    /// never dead-lettered again.
    pub fn is_dead_letter_destination(&self, destination: &DestinationName) -> bool {
        match self {
            DeadLetterStrategy::Shared { queue, .. } => {
                destination.is_queue() && &destination.name == queue
            }
            DeadLetterStrategy::Individual {
                queue_prefix,
                topic_prefix,
                ..
            } => {
                destination.name.starts_with(queue_prefix.as_str())
                    || destination.name.starts_with(topic_prefix.as_str())
            }
        }
    }

    /// Whether `message` is forwarded at all. When this is false the message
    /// is simply discarded.
    pub fn should_process(&self, message: &Message, cause: DeadLetterCause) -> bool {
        let (process_expired, process_non_persistent) = match self {
            DeadLetterStrategy::Shared {
                process_expired,
                process_non_persistent,
                ..
            }
            | DeadLetterStrategy::Individual {
                process_expired,
                process_non_persistent,
                ..
            } => (*process_expired, *process_non_persistent),
        };
        if self.is_dead_letter_destination(&message.destination) {
            return false;
        }
        if cause == DeadLetterCause::Expired && !process_expired {
            return false;
        }
        message.is_persistent() || process_non_persistent
    }

    /// The dead-letter destination for `message`, consumed through
    /// `subscription` when it came from a durable subscriber.
    pub fn destination_for(
        &self,
        message: &Message,
        subscription: Option<&SubscriptionKey>,
    ) -> DestinationName {
        match self {
            DeadLetterStrategy::Shared { queue, .. } => DestinationName::queue(queue.clone()),
            DeadLetterStrategy::Individual {
                queue_prefix,
                topic_prefix,
                use_queue_for_queue_messages,
                use_queue_for_topic_messages,
                per_durable_subscriber,
                ..
            } => {
                let original = &message.destination;
                let (prefix, as_queue) = match original.kind {
                    DestinationKind::Queue => (queue_prefix, *use_queue_for_queue_messages),
                    DestinationKind::Topic => (topic_prefix, *use_queue_for_topic_messages),
                };
                let mut name = format!("{prefix}{}", original.name);
                if *per_durable_subscriber {
                    if let Some(key) = subscription {
                        name.push('.');
                        name.push_str(&key.to_string());
                    }
                }
                if as_queue {
                    DestinationName::queue(name)
                } else {
                    DestinationName::topic(name)
                }
            }
        }
    }

    /// The copy sent to the dead-letter destination.
    pub fn dead_letter_copy(
        &self,
        message: &Message,
        cause: DeadLetterCause,
        target: DestinationName,
    ) -> Message {
        let mut copy = message.clone();
        copy.properties.insert(
            ORIGINAL_DESTINATION_PROPERTY.to_string(),
            message.destination.to_string().into(),
        );
        copy.properties
            .insert(DEAD_LETTER_CAUSE_PROPERTY.to_string(), cause.to_string().into());
        copy.destination = target;
        copy.expiration = None;
        copy.sequence = 0;
        copy
    }
}

impl Default for DeadLetterStrategy {
    fn default() -> Self {
        Self::from_policy(&DeadLetterPolicy::default())
    }
}
