use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use popmq::broker::{AckMode, Broker, ConsumerInfo, DestinationName, Message};
use popmq::config::{DeadLetterPolicy, DeadLetterVariant, DestinationPolicy, Settings};
use proptest::prelude::*;

const WAIT: Duration = Duration::from_secs(2);
const SHORT: Duration = Duration::from_millis(50);

fn queue(name: &str) -> DestinationName {
    DestinationName::queue(name)
}

fn body(message: &Message) -> String {
    String::from_utf8_lossy(&message.payload).into_owned()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_inflight_never_exceeds_prefetch(
        prefetch in 1u32..8,
        sends in 1usize..60,
        acks_per_round in 0usize..4,
    ) {
        let broker = Broker::in_memory(&Settings::default());
        let consumer = broker
            .subscribe(
                ConsumerInfo::new(queue("bounded"))
                    .with_prefetch(prefetch)
                    .with_ack_mode(AckMode::Individual),
            )
            .unwrap();
        let destination = broker.destination(&queue("bounded")).unwrap();

        let mut received = Vec::new();
        for i in 0..sends {
            broker.send(Message::new(queue("bounded"), format!("m{i}"))).unwrap();
            let stats = destination.subscription_stats(consumer.id()).unwrap();
            prop_assert!(stats.inflight_count <= prefetch as usize);

            while let Some(message) = consumer.receive_no_wait().unwrap() {
                received.push(message);
            }
            for message in received.drain(..acks_per_round.min(received.len())) {
                consumer.acknowledge(&message).unwrap();
            }
            let stats = destination.subscription_stats(consumer.id()).unwrap();
            prop_assert!(stats.inflight_count <= prefetch as usize);
        }
    }

    #[test]
    fn prop_each_rollback_adds_one_redelivery(rollbacks in 1u32..6) {
        let broker = Broker::in_memory(&Settings::default());
        let consumer = broker
            .subscribe(ConsumerInfo::new(queue("retry")).with_ack_mode(AckMode::Client))
            .unwrap();
        broker.send(Message::new(queue("retry"), "job")).unwrap();

        let mut previous = consumer.receive(WAIT).unwrap().unwrap();
        prop_assert_eq!(previous.redelivery_count, 0);
        for _ in 0..rollbacks {
            consumer.recover().unwrap();
            let again = consumer.receive(WAIT).unwrap().unwrap();
            prop_assert_eq!(&again.id, &previous.id);
            prop_assert_eq!(again.redelivery_count, previous.redelivery_count + 1);
            previous = again;
        }
    }
}

#[test]
fn test_inflight_size_matches_unacked_messages() {
    let broker = Broker::in_memory(&Settings::default());
    let consumers: Vec<_> = (0..3)
        .map(|i| {
            broker
                .subscribe(
                    ConsumerInfo::new(queue("sized"))
                        .with_prefetch(i + 2)
                        .with_ack_mode(AckMode::Individual),
                )
                .unwrap()
        })
        .collect();
    for i in 0..20 {
        let payload = vec![b'x'; 10 * (i + 1)];
        broker.send(Message::new(queue("sized"), payload)).unwrap();
    }

    let drain = |unacked: &mut Vec<(usize, Arc<Message>)>| {
        loop {
            let mut any = false;
            for (i, consumer) in consumers.iter().enumerate() {
                while let Some(message) = consumer.receive_no_wait().unwrap() {
                    unacked.push((i, message));
                    any = true;
                }
            }
            if !any {
                break;
            }
        }
    };

    let mut unacked = Vec::new();
    drain(&mut unacked);
    for (i, consumer) in consumers.iter().enumerate() {
        if let Some(pos) = unacked.iter().position(|(owner, _)| *owner == i) {
            let (_, message) = unacked.remove(pos);
            consumer.acknowledge(&message).unwrap();
        }
    }
    drain(&mut unacked);

    let destination = broker.lookup(&queue("sized")).unwrap();
    let expected: u64 = unacked.iter().map(|(_, m)| m.size()).sum();
    assert_eq!(destination.stats().inflight_count, unacked.len());
    assert_eq!(destination.inflight_size(), expected);
    assert_eq!(destination.stats().inflight_size, expected);
}

#[test]
fn test_dead_letter_per_durable_subscriber() {
    let settings = Settings {
        policy: DestinationPolicy {
            max_redeliveries: 1,
            dead_letter: DeadLetterPolicy {
                variant: DeadLetterVariant::Individual,
                destination_per_durable_subscriber: true,
                ..DeadLetterPolicy::default()
            },
            ..DestinationPolicy::default()
        },
        ..Settings::default()
    };
    let broker = Broker::in_memory(&settings);
    let topic = DestinationName::topic("prices");
    let consumer = broker
        .subscribe(
            ConsumerInfo::new(topic.clone())
                .durable("client-1", "audit")
                .with_ack_mode(AckMode::Client),
        )
        .unwrap();
    broker.send(Message::new(topic.clone(), "tick")).unwrap();

    for _ in 0..2 {
        assert!(consumer.receive(WAIT).unwrap().is_some());
        consumer.recover().unwrap();
    }
    assert!(consumer.receive(SHORT).unwrap().is_none());

    let dlq = broker
        .subscribe(ConsumerInfo::new(queue("DLQ.Topic.prices.client-1:audit")))
        .unwrap();
    let dead = dlq.receive(WAIT).unwrap().unwrap();
    assert_eq!(body(&dead), "tick");
    assert!(dlq.receive(SHORT).unwrap().is_none());
    assert!(broker.lookup(&queue("DLQ")).is_none());
}

#[test]
fn test_two_workers_with_prefetch_one_share_the_queue() {
    let broker = Broker::in_memory(&Settings::default());
    let workers: Vec<_> = (0..2)
        .map(|_| {
            broker
                .subscribe(
                    ConsumerInfo::new(queue("work"))
                        .with_prefetch(1)
                        .with_ack_mode(AckMode::Client),
                )
                .unwrap()
        })
        .collect();
    for i in 0..10 {
        broker.send(Message::new(queue("work"), format!("job{i}"))).unwrap();
    }

    let handles: Vec<_> = workers
        .into_iter()
        .map(|worker| {
            thread::spawn(move || {
                let mut done = Vec::new();
                while let Some(message) = worker.receive(Duration::from_millis(200)).unwrap() {
                    done.push(body(&message));
                    worker.acknowledge(&message).unwrap();
                }
                done
            })
        })
        .collect();
    let results: Vec<Vec<String>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(results.iter().all(|done| !done.is_empty()));
    let mut all: Vec<String> = results.into_iter().flatten().collect();
    all.sort();
    let mut expected: Vec<String> = (0..10).map(|i| format!("job{i}")).collect();
    expected.sort();
    assert_eq!(all, expected);
    assert_eq!(broker.destination_stats(&queue("work")).unwrap().pending, 0);
}

#[test]
fn test_close_of_transacted_consumer_counts_as_rollback() {
    let broker = Broker::in_memory(&Settings::default());
    broker.send(Message::new(queue("orders"), "order-1")).unwrap();

    let mut seen = HashSet::new();
    for expected_count in 0..3 {
        let tx = broker.begin();
        let consumer = broker
            .subscribe(ConsumerInfo::new(queue("orders")).transacted(tx.clone()))
            .unwrap();
        let message = consumer.receive(WAIT).unwrap().unwrap();
        assert_eq!(message.redelivery_count, expected_count);
        seen.insert(message.id.clone());
        consumer.close().unwrap();
        broker.rollback(&tx).unwrap();
    }
    assert_eq!(seen.len(), 1);
    assert_eq!(broker.stats().open_transactions, 0);
}

#[test]
fn test_concurrent_producers_deliver_everything_once() {
    let broker = Broker::in_memory(&Settings::default());
    let consumer = broker
        .subscribe(ConsumerInfo::new(queue("fan-in")).with_prefetch(5))
        .unwrap();

    let producers: Vec<_> = (0..4)
        .map(|p| {
            let broker = Arc::clone(&broker);
            thread::spawn(move || {
                for i in 0..50 {
                    broker
                        .send(Message::new(queue("fan-in"), format!("p{p}-{i}")))
                        .unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    let mut received = HashSet::new();
    while let Some(message) = consumer.receive(Duration::from_millis(200)).unwrap() {
        assert!(received.insert(body(&message)));
    }
    assert_eq!(received.len(), 200);
    assert_eq!(broker.memory_usage().usage(), 0);
}
