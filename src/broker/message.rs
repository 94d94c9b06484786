//! Message definitions for the broker
//!
//! `Message` is the canonical internal representation. The broker shares one
//! `Arc<Message>` between the cursor, the subscriptions' inflight windows and
//! the consumers; a redelivery produces a fresh copy with the counter bumped.
//!
//! Notes on fields:
//! - `id`: producer-assigned unique id, used for acknowledgements
//! - `sequence`: broker-assigned, strictly increasing per destination; the
//!   total order of a destination and the only tie-break the cursor uses
//! - `timestamp`/`expiration`: milliseconds since UNIX epoch
//! - `redelivery_count`: 0 on first delivery, +1 per rollback

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::utils::error::BrokerError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn generate() -> Self {
        Self(format!("ID:{}", Uuid::new_v4()))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Queues and topics live in separate namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationKind {
    Queue,
    Topic,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DestinationName {
    pub kind: DestinationKind,
    pub name: String,
}

impl DestinationName {
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            kind: DestinationKind::Queue,
            name: name.into(),
        }
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            kind: DestinationKind::Topic,
            name: name.into(),
        }
    }

    pub fn is_queue(&self) -> bool {
        self.kind == DestinationKind::Queue
    }

    pub fn is_topic(&self) -> bool {
        self.kind == DestinationKind::Topic
    }
}

impl FromStr for DestinationName {
    type Err = BrokerError;

    /// Parses `queue://name` or `topic://name`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed = match s.split_once("://") {
            Some(("queue", name)) => Self::queue(name),
            Some(("topic", name)) => Self::topic(name),
            _ => return Err(BrokerError::InvalidDestination(s.to_string())),
        };
        if parsed.name.trim().is_empty() {
            return Err(BrokerError::InvalidDestination(s.to_string()));
        }
        Ok(parsed)
    }
}

impl fmt::Display for DestinationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DestinationKind::Queue => write!(f, "queue://{}", self.name),
            DestinationKind::Topic => write!(f, "topic://{}", self.name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    Persistent,
    NonPersistent,
}

/// Typed application property, visible to selectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        PropertyValue::Int(i64::from(value))
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Double(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

/// Fixed per-message overhead added to the payload when accounting usage.
const MESSAGE_OVERHEAD_BYTES: u64 = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sequence: u64,
    pub destination: DestinationName,
    pub payload: Bytes,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyValue>,
    pub timestamp: i64,
    pub expiration: Option<i64>,
    pub delivery_mode: DeliveryMode,
    #[serde(default)]
    pub redelivery_count: u32,
}

impl Message {
    /// A persistent message with a generated id. The sequence number is
    /// assigned by the destination.
    pub fn new(destination: DestinationName, payload: impl Into<Bytes>) -> Self {
        Self {
            id: MessageId::generate(),
            sequence: 0,
            destination,
            payload: payload.into(),
            properties: BTreeMap::new(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            expiration: None,
            delivery_mode: DeliveryMode::Persistent,
            redelivery_count: 0,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = MessageId(id.into());
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn with_time_to_live(mut self, ttl: Duration) -> Self {
        let ttl = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        self.expiration = Some(self.timestamp.saturating_add(ttl));
        self
    }

    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    pub fn non_persistent(self) -> Self {
        self.with_delivery_mode(DeliveryMode::NonPersistent)
    }

    pub fn is_persistent(&self) -> bool {
        self.delivery_mode == DeliveryMode::Persistent
    }

    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    pub fn is_redelivered(&self) -> bool {
        self.redelivery_count > 0
    }

    pub fn is_expired_at(&self, now_millis: i64) -> bool {
        self.expiration.is_some_and(|exp| exp <= now_millis)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(chrono::Utc::now().timestamp_millis())
    }

    /// Bytes charged against usage limits while the message is held.
    pub fn size(&self) -> u64 {
        let properties: usize = self
            .properties
            .iter()
            .map(|(k, v)| {
                k.len()
                    + match v {
                        PropertyValue::String(s) => s.len(),
                        _ => 8,
                    }
            })
            .sum();
        (self.payload.len() + self.id.0.len() + properties) as u64 + MESSAGE_OVERHEAD_BYTES
    }

    /// Copy handed out after a rollback.
    pub fn redelivered(&self) -> Message {
        let mut copy = self.clone();
        copy.redelivery_count += 1;
        copy
    }
}
