mod common;

use std::collections::HashSet;
use std::time::Duration;

use common::EventCounter;
use popmq::broker::{AckMode, Broker, ConsumerInfo, DestinationName, Message};
use popmq::config::{DestinationPolicy, Settings};

const MESSAGES: usize = 20;

/// A durable subscriber misses 20 messages, with memory so tight that its
/// cursor pages from the store, and then catches up in pull mode.
#[test]
fn test_durable_subscriber_catches_up_from_store() {
    let counter = EventCounter::install();
    let settings = Settings {
        policy: DestinationPolicy {
            memory_limit_bytes: Some(256 * 1024),
            cursor_high_watermark_percent: 10,
            cursor_low_watermark_percent: 5,
            cursor_batch_size: 4,
            ..DestinationPolicy::default()
        },
        ..Settings::default()
    };
    let broker = Broker::in_memory(&settings);
    let topic = DestinationName::topic("feed");
    let info = || {
        ConsumerInfo::new(topic.clone())
            .durable("client-1", "reader")
            .with_prefetch(0)
            .with_ack_mode(AckMode::Client)
    };

    broker.subscribe(info()).unwrap().close().unwrap();
    for i in 0..MESSAGES {
        let mut payload = format!("{i:02}").into_bytes();
        payload.resize(8 * 1024, b'.');
        broker.send(Message::new(topic.clone(), payload)).unwrap();
    }

    let destination = broker.lookup(&topic).unwrap();
    let key = popmq::broker::SubscriptionKey::new("client-1", "reader");
    let detached = destination.durable_subscription_stats(&key).unwrap();
    assert!(detached.store_backed, "backlog should page from the store");
    assert!(detached.resident < MESSAGES);
    assert_eq!(detached.pending, MESSAGES);

    let consumer = broker.subscribe(info()).unwrap();
    let mut seen = HashSet::new();
    let mut order = Vec::new();
    while let Some(message) = consumer.receive(Duration::from_millis(500)).unwrap() {
        assert!(seen.insert(message.id.clone()), "duplicate delivery");
        order.push(String::from_utf8_lossy(&message.payload[..2]).into_owned());
        consumer.acknowledge(&message).unwrap();
    }

    let expected: Vec<String> = (0..MESSAGES).map(|i| format!("{i:02}")).collect();
    assert_eq!(order, expected);
    assert_eq!(counter.warnings(), 0);
    assert_eq!(counter.errors(), 0);

    let stats = destination.durable_subscription_stats(&key).unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.inflight_count, 0);
}
