use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use popmq::broker::{
    AckMode, Broker, ConsumerInfo, DestinationName, Message, MessageId, SubscriptionKey,
};
use popmq::config::Settings;
use popmq::store::{
    DurableSubscriptionRecord, MemoryPersistenceAdapter, MessageStore, PersistenceAdapter,
    SledPersistenceAdapter, StoreKey,
};
use popmq::utils::error::{BrokerError, StoreError};
use tempfile::tempdir;

const WAIT: Duration = Duration::from_secs(2);
const SHORT: Duration = Duration::from_millis(50);

fn body(message: &Message) -> String {
    String::from_utf8_lossy(&message.payload).into_owned()
}

#[test]
fn test_restart_recovers_persistent_messages_in_order() {
    let dir = tempdir().expect("Failed to create temp dir");
    let adapter: Arc<dyn PersistenceAdapter> =
        Arc::new(SledPersistenceAdapter::open(dir.path()).unwrap());
    let settings = Settings::default();
    let orders = DestinationName::queue("orders");

    let broker = Broker::new(&settings, Arc::clone(&adapter));
    for i in 0..10 {
        broker.send(Message::new(orders.clone(), format!("m{i}"))).unwrap();
    }
    broker
        .send(Message::new(orders.clone(), "volatile").non_persistent())
        .unwrap();
    broker.shutdown();
    drop(broker);

    let broker = Broker::new(&settings, adapter);
    let consumer = broker
        .subscribe(ConsumerInfo::new(orders.clone()).with_ack_mode(AckMode::Client))
        .unwrap();
    let mut received = Vec::new();
    while let Some(message) = consumer.receive(SHORT).unwrap() {
        received.push((message.sequence, body(&message)));
        consumer.acknowledge(&message).unwrap();
    }
    let expected: Vec<_> = (0..10).map(|i| (i as u64 + 1, format!("m{i}"))).collect();
    assert_eq!(received, expected);

    broker.send(Message::new(orders.clone(), "after")).unwrap();
    let next = consumer.receive(WAIT).unwrap().unwrap();
    assert_eq!(next.sequence, 11);
}

#[test]
fn test_durable_subscription_survives_restart() {
    let dir = tempdir().expect("Failed to create temp dir");
    let adapter: Arc<dyn PersistenceAdapter> =
        Arc::new(SledPersistenceAdapter::open(dir.path()).unwrap());
    let settings = Settings::default();
    let news = DestinationName::topic("news");
    let info = || {
        ConsumerInfo::new(news.clone())
            .durable("client-1", "archive")
            .with_ack_mode(AckMode::Client)
    };

    let broker = Broker::new(&settings, Arc::clone(&adapter));
    broker.subscribe(info()).unwrap().close().unwrap();
    for i in 0..3 {
        broker.send(Message::new(news.clone(), format!("n{i}"))).unwrap();
    }
    broker.shutdown();
    drop(broker);

    let broker = Broker::new(&settings, adapter);
    let consumer = broker.subscribe(info()).unwrap();
    let mut received = Vec::new();
    while let Some(message) = consumer.receive(SHORT).unwrap() {
        received.push(body(&message));
        consumer.acknowledge(&message).unwrap();
    }
    assert_eq!(received, ["n0", "n1", "n2"]);
}

/// Store wrapper whose appends fail once `armed` is set.
struct FailingStore {
    inner: Arc<dyn MessageStore>,
    armed: Arc<AtomicBool>,
}

impl MessageStore for FailingStore {
    fn append(&self, message: &Message) -> Result<u64, StoreError> {
        if self.armed.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("disk full".into()));
        }
        self.inner.append(message)
    }

    fn remove(&self, id: &MessageId) -> Result<bool, StoreError> {
        self.inner.remove(id)
    }

    fn recover(&self, after_sequence: u64, max_count: usize) -> Result<Vec<Message>, StoreError> {
        self.inner.recover(after_sequence, max_count)
    }

    fn count(&self) -> Result<usize, StoreError> {
        self.inner.count()
    }

    fn last_sequence(&self) -> Result<u64, StoreError> {
        self.inner.last_sequence()
    }
}

struct FailingAdapter {
    inner: MemoryPersistenceAdapter,
    failing: DestinationName,
    armed: Arc<AtomicBool>,
}

impl PersistenceAdapter for FailingAdapter {
    fn message_store(&self, key: &StoreKey) -> Result<Arc<dyn MessageStore>, StoreError> {
        let store = self.inner.message_store(key)?;
        if *key == StoreKey::Destination(self.failing.clone()) {
            return Ok(Arc::new(FailingStore {
                inner: store,
                armed: Arc::clone(&self.armed),
            }));
        }
        Ok(store)
    }

    fn drop_store(&self, key: &StoreKey) -> Result<(), StoreError> {
        self.inner.drop_store(key)
    }

    fn save_durable_subscription(&self, record: &DurableSubscriptionRecord) -> Result<(), StoreError> {
        self.inner.save_durable_subscription(record)
    }

    fn remove_durable_subscription(
        &self,
        topic: &DestinationName,
        subscription: &SubscriptionKey,
    ) -> Result<(), StoreError> {
        self.inner.remove_durable_subscription(topic, subscription)
    }

    fn durable_subscriptions(
        &self,
        topic: &DestinationName,
    ) -> Result<Vec<DurableSubscriptionRecord>, StoreError> {
        self.inner.durable_subscriptions(topic)
    }
}

#[test]
fn test_store_failure_on_commit_rolls_back_everything() {
    let input = DestinationName::queue("input");
    let output = DestinationName::queue("output");
    let other = DestinationName::queue("other");
    let armed = Arc::new(AtomicBool::new(false));
    let adapter = Arc::new(FailingAdapter {
        inner: MemoryPersistenceAdapter::new(),
        failing: output.clone(),
        armed: Arc::clone(&armed),
    });
    let broker = Broker::new(&Settings::default(), adapter);

    broker.send(Message::new(input.clone(), "request")).unwrap();
    broker.send(Message::new(other.clone(), "bystander")).unwrap();

    let tx = broker.begin();
    let consumer = broker
        .subscribe(ConsumerInfo::new(input.clone()).transacted(tx.clone()))
        .unwrap();
    let request = consumer.receive(WAIT).unwrap().unwrap();
    broker
        .send_transacted(Message::new(output.clone(), "reply"), &tx)
        .unwrap();

    armed.store(true, Ordering::SeqCst);
    let result = broker.commit(&tx);
    assert!(matches!(result, Err(BrokerError::Store(_))));
    armed.store(false, Ordering::SeqCst);

    // the acknowledged request comes back, the reply never appears
    let again = consumer.receive(WAIT).unwrap().unwrap();
    assert_eq!(again.id, request.id);
    assert_eq!(again.redelivery_count, 1);
    assert_eq!(broker.destination_stats(&output).unwrap().pending, 0);
    assert_eq!(broker.destination_stats(&output).unwrap().memory_usage, 0);
    assert_eq!(broker.destination_stats(&other).unwrap().pending, 1);

    // the broker keeps working
    broker.commit(&tx).unwrap();
    assert!(consumer.receive(SHORT).unwrap().is_none());
    assert_eq!(broker.destination_stats(&input).unwrap().pending, 0);
}
