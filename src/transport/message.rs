//! JSON frames exchanged over the WebSocket.
//!
//! Every frame is an object with a `type` field. Client frames that carry a
//! `receipt` get a `receipt` frame back once the broker has accepted them;
//! failures always produce an `error` frame.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::broker::message::{Message, PropertyValue};
use crate::broker::subscription::AckMode;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Send {
        /// `queue://name` or `topic://name`.
        destination: String,
        payload: String,
        #[serde(default)]
        properties: BTreeMap<String, PropertyValue>,
        #[serde(default = "default_true")]
        persistent: bool,
        #[serde(default)]
        ttl_ms: Option<u64>,
        #[serde(default)]
        transaction: Option<String>,
        #[serde(default)]
        receipt: Option<String>,
    },

    Subscribe {
        destination: String,
        /// Chosen by the client so later frames can refer to the consumer.
        consumer_id: String,
        #[serde(default)]
        selector: Option<String>,
        #[serde(default)]
        prefetch: Option<u32>,
        #[serde(default)]
        ack_mode: Option<AckMode>,
        /// Name of a durable subscription, scoped to the connection's client id.
        #[serde(default)]
        durable: Option<String>,
        #[serde(default)]
        retroactive: bool,
        #[serde(default)]
        transaction: Option<String>,
        #[serde(default)]
        receipt: Option<String>,
    },

    Unsubscribe {
        consumer_id: String,
        #[serde(default)]
        receipt: Option<String>,
    },

    /// Deletes a detached durable subscription.
    RemoveDurable {
        destination: String,
        name: String,
        #[serde(default)]
        receipt: Option<String>,
    },

    /// Asks for one message on a consumer subscribed with prefetch 0.
    Pull {
        consumer_id: String,
        #[serde(default)]
        receipt: Option<String>,
    },

    Ack {
        consumer_id: String,
        message_id: String,
        #[serde(default)]
        receipt: Option<String>,
    },

    Begin {
        transaction: String,
        #[serde(default)]
        receipt: Option<String>,
    },

    Commit {
        transaction: String,
        #[serde(default)]
        receipt: Option<String>,
    },

    Rollback {
        transaction: String,
        #[serde(default)]
        receipt: Option<String>,
    },
}

impl ClientMessage {
    pub fn receipt(&self) -> Option<&str> {
        match self {
            ClientMessage::Send { receipt, .. }
            | ClientMessage::Subscribe { receipt, .. }
            | ClientMessage::Unsubscribe { receipt, .. }
            | ClientMessage::RemoveDurable { receipt, .. }
            | ClientMessage::Pull { receipt, .. }
            | ClientMessage::Ack { receipt, .. }
            | ClientMessage::Begin { receipt, .. }
            | ClientMessage::Commit { receipt, .. }
            | ClientMessage::Rollback { receipt, .. } => receipt.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        client_id: String,
    },

    Deliver {
        consumer_id: String,
        message_id: String,
        destination: String,
        payload: String,
        properties: BTreeMap<String, PropertyValue>,
        timestamp: i64,
        redelivery_count: u32,
    },

    Receipt {
        receipt: String,
    },

    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        receipt: Option<String>,
    },
}

impl ServerMessage {
    pub fn deliver(consumer_id: &str, message: &Message) -> Self {
        ServerMessage::Deliver {
            consumer_id: consumer_id.to_string(),
            message_id: message.id.to_string(),
            destination: message.destination.to_string(),
            payload: String::from_utf8_lossy(&message.payload).into_owned(),
            properties: message.properties.clone(),
            timestamp: message.timestamp,
            redelivery_count: message.redelivery_count,
        }
    }
}
