use super::Cursor;
use crate::broker::message::{DestinationName, Message};
use crate::store::{MemoryPersistenceAdapter, MessageStore, PersistenceAdapter, StoreKey};
use crate::usage::{UNLIMITED, UsageManager};
use std::sync::Arc;

fn queue() -> DestinationName {
    DestinationName::queue("cursor.test")
}

fn message(sequence: u64, payload_len: usize) -> Arc<Message> {
    let mut m = Message::new(queue(), vec![b'x'; payload_len]);
    m.sequence = sequence;
    Arc::new(m)
}

fn store() -> Arc<dyn MessageStore> {
    MemoryPersistenceAdapter::new()
        .message_store(&StoreKey::Destination(queue()))
        .unwrap()
}

/// Appends to the store and the cursor the way a destination does.
fn send(cursor: &mut Cursor, store: &Arc<dyn MessageStore>, m: Arc<Message>) {
    store.append(&m).unwrap();
    assert!(cursor.usage().reserve(m.size()));
    cursor.add(m, true);
}

fn drain(cursor: &mut Cursor) -> Vec<u64> {
    cursor.reset();
    let mut seen = Vec::new();
    while let Some(m) = cursor.next() {
        seen.push(m.sequence);
    }
    seen
}

#[test]
fn test_memory_cursor_orders_by_sequence() {
    let usage = UsageManager::root("broker", UNLIMITED);
    let mut cursor = Cursor::in_memory("mem", usage.clone());
    for seq in [1, 2, 3] {
        cursor.add(message(seq, 10), false);
    }
    assert_eq!(drain(&mut cursor), vec![1, 2, 3]);
    assert_eq!(cursor.len(), 3);
    assert!(usage.usage() > 0);
}

#[test]
fn test_next_does_not_repeat_within_a_pass() {
    let usage = UsageManager::root("broker", UNLIMITED);
    let mut cursor = Cursor::in_memory("mem", usage);
    cursor.add(message(1, 1), false);
    cursor.add(message(2, 1), false);

    cursor.reset();
    assert_eq!(cursor.next().unwrap().sequence, 1);
    assert_eq!(cursor.next().unwrap().sequence, 2);
    assert!(cursor.next().is_none());
    assert!(cursor.next().is_none());

    // a new pass starts from the head again
    assert_eq!(drain(&mut cursor), vec![1, 2]);
}

#[test]
fn test_dispatched_messages_are_skipped_until_redelivered() {
    let usage = UsageManager::root("broker", UNLIMITED);
    let mut cursor = Cursor::in_memory("mem", usage);
    for seq in 1..=3 {
        cursor.add(message(seq, 1), false);
    }
    cursor.reset();
    let first = cursor.next().unwrap();
    cursor.mark_dispatched(first.sequence);
    assert_eq!(cursor.pending_count(), 2);
    assert_eq!(drain(&mut cursor), vec![2, 3]);

    // rolled back messages come back at the head with the new count
    cursor.redeliver(Arc::new(first.redelivered()));
    cursor.reset();
    let again = cursor.next().unwrap();
    assert_eq!(again.sequence, 1);
    assert_eq!(again.redelivery_count, 1);
}

#[test]
fn test_remove_is_idempotent_and_releases_usage() {
    let usage = UsageManager::root("broker", UNLIMITED);
    let store = store();
    let mut cursor =
        Cursor::store_backed("q", usage.clone(), Arc::clone(&store), 10, 70, 50).unwrap();
    let m = message(1, 100);
    send(&mut cursor, &store, Arc::clone(&m));
    assert_eq!(usage.usage(), m.size());

    assert!(cursor.remove(&m.id).unwrap().is_some());
    assert!(cursor.remove(&m.id).unwrap().is_none());
    assert_eq!(usage.usage(), 0);
    assert_eq!(store.count().unwrap(), 0);
    assert!(cursor.is_empty());
}

#[test]
fn test_switches_to_store_mode_above_high_watermark() {
    let usage = UsageManager::root("broker", 20_000);
    let store = store();
    let mut cursor =
        Cursor::store_backed("q", usage.clone(), Arc::clone(&store), 5, 20, 10).unwrap();

    for seq in 1..=20 {
        send(&mut cursor, &store, message(seq, 500));
    }
    assert!(cursor.is_store_backed());
    assert!(cursor.resident_count() < 20, "backlog must not stay resident");
    assert_eq!(cursor.len(), 20);
    // stored messages stay charged until they are removed
    assert_eq!(usage.usage(), 20 * message(0, 500).size());

    // iteration still yields everything, once, in order
    assert_eq!(drain(&mut cursor), (1..=20).collect::<Vec<_>>());
}

#[test]
fn test_store_mode_interleaves_non_persistent_in_order() {
    let usage = UsageManager::root("broker", 4_000);
    let store = store();
    let mut cursor =
        Cursor::store_backed("q", usage.clone(), Arc::clone(&store), 2, 30, 10).unwrap();

    for seq in 1..=6 {
        send(&mut cursor, &store, message(seq, 300));
    }
    assert!(cursor.is_store_backed());

    let mut np = Message::new(queue(), "volatile").non_persistent();
    np.sequence = 7;
    cursor.add(Arc::new(np), false);

    assert_eq!(drain(&mut cursor), (1..=7).collect::<Vec<_>>());
}

#[test]
fn test_returns_to_memory_mode_after_low_watermark() {
    let usage = UsageManager::root("broker", 4_000);
    let store = store();
    let mut cursor =
        Cursor::store_backed("q", usage.clone(), Arc::clone(&store), 3, 20, 10).unwrap();

    let mut sent = Vec::new();
    for seq in 1..=6 {
        let m = message(seq, 200);
        sent.push(Arc::clone(&m));
        send(&mut cursor, &store, m);
    }
    assert!(cursor.is_store_backed());

    for m in &sent {
        cursor.remove(&m.id).unwrap();
    }
    assert!(cursor.is_empty());
    assert!(!cursor.is_store_backed());
}

#[test]
fn test_reset_evicts_paged_backlog_in_store_mode() {
    let usage = UsageManager::root("broker", 20_000);
    let store = store();
    let mut cursor =
        Cursor::store_backed("q", usage.clone(), Arc::clone(&store), 4, 20, 5).unwrap();
    for seq in 1..=30 {
        send(&mut cursor, &store, message(seq, 200));
    }
    assert_eq!(drain(&mut cursor).len(), 30);

    // only the dispatched head stays resident across passes
    cursor.reset();
    let head = cursor.next().unwrap();
    cursor.mark_dispatched(head.sequence);
    cursor.reset();
    assert_eq!(cursor.resident_count(), 1);
    assert_eq!(drain(&mut cursor), (2..=30).collect::<Vec<_>>());
}

#[test]
fn test_paged_messages_are_charged_once_until_removed() {
    let usage = UsageManager::root("broker", 10_000);
    let store = store();
    let mut cursor =
        Cursor::store_backed("q", usage.clone(), Arc::clone(&store), 2, 20, 5).unwrap();
    let sent: Vec<Arc<Message>> = (1..=10).map(|seq| message(seq, 300)).collect();
    for m in &sent {
        send(&mut cursor, &store, Arc::clone(m));
    }
    let total: u64 = sent.iter().map(|m| m.size()).sum();
    assert!(cursor.is_store_backed());
    assert_eq!(usage.usage(), total);

    // paging in and evicting again moves no bytes
    assert_eq!(drain(&mut cursor).len(), 10);
    cursor.reset();
    assert_eq!(usage.usage(), total);

    for m in &sent {
        cursor.remove(&m.id).unwrap();
    }
    assert_eq!(usage.usage(), 0);
    assert!(cursor.is_empty());
}

#[test]
fn test_dropping_store_backed_cursor_returns_parked_usage() {
    let usage = UsageManager::root("broker", 10_000);
    let store = store();
    {
        let mut cursor =
            Cursor::store_backed("q", usage.clone(), Arc::clone(&store), 2, 10, 5).unwrap();
        for seq in 1..=8 {
            send(&mut cursor, &store, message(seq, 300));
        }
        assert!(cursor.resident_count() < 8);
    }
    assert_eq!(usage.usage(), 0);
}

#[test]
fn test_restart_recovers_stored_messages_in_order() {
    let adapter = MemoryPersistenceAdapter::new();
    let key = StoreKey::Destination(queue());
    let sent: Vec<u64> = (1..=10).collect();
    {
        let store = adapter.message_store(&key).unwrap();
        let usage = UsageManager::root("broker", UNLIMITED);
        let mut cursor =
            Cursor::store_backed("q", usage, Arc::clone(&store), 4, 70, 50).unwrap();
        for seq in &sent {
            send(&mut cursor, &store, message(*seq, 16));
        }
    }

    let store = adapter.message_store(&key).unwrap();
    let usage = UsageManager::root("broker", UNLIMITED);
    let mut cursor = Cursor::store_backed("q", usage, store, 4, 70, 50).unwrap();
    assert_eq!(cursor.len(), 10);
    assert_eq!(drain(&mut cursor), sent);
}

#[test]
fn test_take_expired_skips_dispatched() {
    let usage = UsageManager::root("broker", UNLIMITED);
    let mut cursor = Cursor::in_memory("mem", usage);
    let mut a = Message::new(queue(), "a");
    a.sequence = 1;
    a.expiration = Some(10);
    let mut b = Message::new(queue(), "b");
    b.sequence = 2;
    b.expiration = Some(10);
    cursor.add(Arc::new(a), false);
    cursor.add(Arc::new(b), false);
    cursor.mark_dispatched(1);

    let expired = cursor.take_expired(100);
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].sequence, 2);
    assert_eq!(cursor.len(), 1);
}

#[test]
fn test_mark_expired_holds_messages_until_removed() {
    let usage = UsageManager::root("broker", UNLIMITED);
    let store = store();
    let mut cursor =
        Cursor::store_backed("q", usage, Arc::clone(&store), 10, 70, 50).unwrap();
    let mut a = Message::new(queue(), "a");
    a.sequence = 1;
    a.expiration = Some(10);
    send(&mut cursor, &store, Arc::new(a));
    send(&mut cursor, &store, message(2, 10));

    let expired = cursor.mark_expired(100);
    assert_eq!(expired.len(), 1);
    assert_eq!(drain(&mut cursor), vec![2]);
    assert_eq!(cursor.len(), 2);

    cursor.remove(&expired[0].id).unwrap();
    assert_eq!(cursor.len(), 1);
    assert_eq!(store.count().unwrap(), 1);
}

#[test]
fn test_dropping_cursor_returns_resident_usage() {
    let usage = UsageManager::root("broker", UNLIMITED);
    {
        let mut cursor = Cursor::in_memory("mem", usage.clone());
        cursor.add(message(1, 1_000), false);
        assert!(usage.usage() >= 1_000);
    }
    assert_eq!(usage.usage(), 0);
}
