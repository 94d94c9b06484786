//! The broker core: destinations, subscriptions, dispatch, dead letters and
//! transactions.

pub mod consumer;
pub mod dead_letter;
pub mod destination;
pub mod engine;
pub mod message;
pub mod selector;
pub mod subscription;
pub mod transaction;

pub use consumer::Consumer;
pub use destination::{Destination, DestinationStats};
pub use engine::{Broker, BrokerStats};
pub use message::{DeliveryMode, DestinationKind, DestinationName, Message, MessageId, PropertyValue};
pub use subscription::{AckMode, ConsumerId, ConsumerInfo, DeliverySink, SubscriptionKey};
pub use transaction::TransactionId;
