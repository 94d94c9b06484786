use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::debug;

use crate::broker::engine::Broker;
use crate::broker::message::{DestinationName, Message};
use crate::broker::subscription::{AckMode, ConsumerId, ConsumerInfo};
use crate::utils::error::{BrokerError, Result};

/// An in-process consumer. Dropping it closes the subscription.
pub struct Consumer {
    id: ConsumerId,
    destination: DestinationName,
    ack_mode: AckMode,
    pull: bool,
    broker: Arc<Broker>,
    receiver: Receiver<Arc<Message>>,
    closed: AtomicBool,
}

impl Consumer {
    pub(crate) fn new(
        broker: Arc<Broker>,
        info: &ConsumerInfo,
        prefetch: u32,
        receiver: Receiver<Arc<Message>>,
    ) -> Self {
        Self {
            id: info.id.clone(),
            destination: info.destination.clone(),
            ack_mode: info.ack_mode,
            pull: prefetch == 0,
            broker,
            receiver,
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &ConsumerId {
        &self.id
    }

    pub fn destination(&self) -> &DestinationName {
        &self.destination
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    /// Waits up to `timeout` for the next message. A pull consumer asks for
    /// exactly one message and withdraws the request if nothing arrives.
    pub fn receive(&self, timeout: Duration) -> Result<Option<Arc<Message>>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::ConsumerClosed(self.id.clone()));
        }
        if let Ok(message) = self.receiver.try_recv() {
            return self.delivered(message).map(Some);
        }
        if self.pull {
            self.broker.pull(&self.id)?;
        }
        match self.receiver.recv_timeout(timeout) {
            Ok(message) => self.delivered(message).map(Some),
            Err(RecvTimeoutError::Timeout) => {
                if !self.pull {
                    return Ok(None);
                }
                self.broker.cancel_pull(&self.id);
                // the credit may have been used after the timeout fired
                match self.receiver.try_recv() {
                    Ok(message) => self.delivered(message).map(Some),
                    Err(_) => Ok(None),
                }
            }
            Err(RecvTimeoutError::Disconnected) => Err(BrokerError::ConsumerClosed(self.id.clone())),
        }
    }

    pub fn receive_no_wait(&self) -> Result<Option<Arc<Message>>> {
        self.receive(Duration::ZERO)
    }

    /// Acknowledges `message`, and in client mode everything received before
    /// it. Auto and transacted consumers acknowledge on receipt, so this is a
    /// no-op for them.
    pub fn acknowledge(&self, message: &Message) -> Result<()> {
        match self.ack_mode {
            AckMode::Client | AckMode::Individual => self.broker.acknowledge(&self.id, &message.id),
            AckMode::Auto | AckMode::Transacted => Ok(()),
        }
    }

    /// Returns every unacknowledged message for redelivery.
    pub fn recover(&self) -> Result<()> {
        self.broker.recover(&self.id)
    }

    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.broker.remove_consumer(&self.id)
    }

    fn delivered(&self, message: Arc<Message>) -> Result<Arc<Message>> {
        if matches!(self.ack_mode, AckMode::Auto | AckMode::Transacted) {
            self.broker.acknowledge(&self.id, &message.id)?;
        }
        Ok(message)
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!(consumer = %self.id, error = %e, "consumer close on drop failed");
        }
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("id", &self.id)
            .field("destination", &self.destination)
            .field("ack_mode", &self.ack_mode)
            .finish()
    }
}
