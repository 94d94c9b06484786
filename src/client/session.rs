use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::message::{DestinationName, Message, MessageId};
use crate::broker::subscription::{
    AckMode, ConsumerId, ConsumerInfo, DeliveryError, DeliverySink, SubscriptionKey,
};
use crate::broker::{Broker, TransactionId};
use crate::transport::message::{ClientMessage, ServerMessage};
use crate::utils::error::{BrokerError, Result};

/// Pushes dispatched messages to a WebSocket connection as `deliver` frames.
///
/// Queuing the frame is as far as the broker can follow a message, so for
/// auto-ack consumers the delivery itself is the acknowledgement.
#[derive(Debug, Clone)]
pub struct WsDelivery {
    sender: UnboundedSender<WsMessage>,
    ack_mode: AckMode,
}

impl WsDelivery {
    pub fn new(sender: UnboundedSender<WsMessage>, ack_mode: AckMode) -> Self {
        Self { sender, ack_mode }
    }
}

impl DeliverySink for WsDelivery {
    fn deliver(&self, consumer: &ConsumerId, message: Arc<Message>) -> Result<(), DeliveryError> {
        let frame = serde_json::to_string(&ServerMessage::deliver(consumer, &message))
            .map_err(|_| DeliveryError)?;
        self.sender
            .send(WsMessage::Text(frame.into()))
            .map_err(|_| DeliveryError)
    }

    fn settles_on_delivery(&self) -> bool {
        self.ack_mode == AckMode::Auto
    }
}

/// Client ids name durable subscriptions and prefix transaction names, so
/// they are kept to a plain character set.
pub fn validate_client_id(client_id: &str) -> Result<()> {
    let valid = !client_id.is_empty()
        && client_id.len() <= 128
        && client_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));
    if valid {
        Ok(())
    } else {
        Err(BrokerError::InvalidClientId(client_id.to_string()))
    }
}

/// Broker-side state of one connected client.
#[derive(Debug)]
pub struct Session {
    /// Unique identifier of the client, also the client id of its durable
    /// subscriptions.
    pub id: String,
    broker: Arc<Broker>,
    sender: UnboundedSender<WsMessage>,
    consumers: Mutex<HashSet<ConsumerId>>,
    transactions: Mutex<HashSet<TransactionId>>,
    cancel: AtomicBool,
    /// Cleared once the client id has been given back to the broker.
    registered: AtomicBool,
}

impl Session {
    /// Opens a session under `id`. Fails when the id is malformed or already
    /// held by another connection.
    pub fn new(
        id: impl Into<String>,
        broker: Arc<Broker>,
        sender: UnboundedSender<WsMessage>,
    ) -> Result<Self> {
        let id = id.into();
        validate_client_id(&id)?;
        broker.register_client(&id)?;
        Ok(Self {
            id,
            broker,
            sender,
            consumers: Mutex::new(HashSet::new()),
            transactions: Mutex::new(HashSet::new()),
            cancel: AtomicBool::new(false),
            registered: AtomicBool::new(true),
        })
    }

    /// Queues a frame for the client. Fails silently once the connection is
    /// gone.
    pub fn reply(&self, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(frame) => {
                if self.sender.send(WsMessage::Text(frame.into())).is_err() {
                    debug!(client = %self.id, "reply to a closed connection");
                }
            }
            Err(e) => warn!(client = %self.id, error = %e, "failed to encode reply"),
        }
    }

    /// Runs one client frame. Returns the frame to answer with, if any.
    /// May block on producer flow control.
    pub fn handle(&self, message: ClientMessage) -> Option<ServerMessage> {
        let receipt = message.receipt().map(str::to_string);
        match self.execute(message) {
            Ok(()) => receipt.map(|receipt| ServerMessage::Receipt { receipt }),
            Err(e) => {
                debug!(client = %self.id, error = %e, "request failed");
                Some(ServerMessage::Error {
                    message: e.to_string(),
                    receipt,
                })
            }
        }
    }

    fn execute(&self, message: ClientMessage) -> Result<()> {
        match message {
            ClientMessage::Send {
                destination,
                payload,
                properties,
                persistent,
                ttl_ms,
                transaction,
                ..
            } => {
                let mut message = Message::new(destination.parse()?, payload.into_bytes());
                message.properties = properties;
                if !persistent {
                    message = message.non_persistent();
                }
                if let Some(ttl) = ttl_ms {
                    message = message.with_time_to_live(Duration::from_millis(ttl));
                }
                let transaction = transaction.map(|t| self.track(t));
                self.broker
                    .send_with(message, transaction.as_ref(), &self.cancel)
            }
            ClientMessage::Subscribe {
                destination,
                consumer_id,
                selector,
                prefetch,
                ack_mode,
                durable,
                retroactive,
                transaction,
                ..
            } => {
                let mut info = ConsumerInfo::new(destination.parse()?).with_id(consumer_id.clone());
                info.selector = selector;
                info.prefetch = prefetch;
                info.ack_mode = ack_mode.unwrap_or(AckMode::Client);
                info.retroactive = retroactive;
                info.durable = durable.map(|name| SubscriptionKey::new(self.id.clone(), name));
                if let Some(transaction) = transaction {
                    info = info.transacted(self.track(transaction));
                }
                let sink = Arc::new(WsDelivery::new(self.sender.clone(), info.ack_mode));
                self.broker.add_consumer(info, sink)?;
                self.consumers.lock().insert(consumer_id);
                Ok(())
            }
            ClientMessage::Unsubscribe { consumer_id, .. } => {
                self.owned(&consumer_id)?;
                self.consumers.lock().remove(&consumer_id);
                self.broker.remove_consumer(&consumer_id)
            }
            ClientMessage::RemoveDurable {
                destination, name, ..
            } => {
                let topic: DestinationName = destination.parse()?;
                self.broker
                    .unsubscribe_durable(&topic, &SubscriptionKey::new(self.id.clone(), name))
            }
            ClientMessage::Pull { consumer_id, .. } => {
                self.owned(&consumer_id)?;
                self.broker.pull(&consumer_id)
            }
            ClientMessage::Ack {
                consumer_id,
                message_id,
                ..
            } => {
                self.owned(&consumer_id)?;
                self.broker
                    .acknowledge(&consumer_id, &MessageId(message_id))
            }
            ClientMessage::Begin { transaction, .. } => {
                self.track(transaction);
                Ok(())
            }
            ClientMessage::Commit { transaction, .. } => {
                let transaction = self.scoped(&transaction);
                self.transactions.lock().remove(&transaction);
                self.broker.commit(&transaction)
            }
            ClientMessage::Rollback { transaction, .. } => {
                let transaction = self.scoped(&transaction);
                self.transactions.lock().remove(&transaction);
                self.broker.rollback(&transaction)
            }
        }
    }

    /// Transaction names are chosen by the client, so they only need to be
    /// unique within one connection.
    fn scoped(&self, name: &str) -> TransactionId {
        TransactionId(format!("{}/{name}", self.id))
    }

    fn track(&self, transaction: String) -> TransactionId {
        let transaction = self.scoped(&transaction);
        self.transactions.lock().insert(transaction.clone());
        transaction
    }

    fn owned(&self, consumer: &ConsumerId) -> Result<()> {
        if self.consumers.lock().contains(consumer) {
            Ok(())
        } else {
            Err(BrokerError::UnknownConsumer(consumer.clone()))
        }
    }

    /// Fails any send of this session that is blocked on flow control.
    pub fn interrupt(&self) {
        self.cancel.store(true, Ordering::Release);
        self.broker.interrupt_blocked_sends();
    }

    /// Closes every consumer, rolls back every open transaction of the
    /// session and frees its client id.
    pub fn close(&self) {
        let consumers: Vec<_> = self.consumers.lock().drain().collect();
        for consumer in consumers {
            if let Err(e) = self.broker.remove_consumer(&consumer) {
                debug!(client = %self.id, consumer = %consumer, error = %e, "consumer already gone");
            }
        }
        let transactions: Vec<_> = self.transactions.lock().drain().collect();
        for transaction in transactions {
            if let Err(e) = self.broker.rollback(&transaction) {
                warn!(client = %self.id, transaction = %transaction, error = %e, "rollback on disconnect failed");
            }
        }
        self.release_client_id();
    }

    fn release_client_id(&self) {
        if self.registered.swap(false, Ordering::AcqRel) {
            self.broker.unregister_client(&self.id);
        }
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.lock().len()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.release_client_id();
    }
}
