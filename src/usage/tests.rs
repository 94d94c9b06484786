use super::{Reservation, UNLIMITED, UsageManager, WatermarkEvent};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::Duration;

#[test]
fn test_reserve_within_limit() {
    let usage = UsageManager::root("broker", 100);
    assert!(usage.reserve(60));
    assert!(usage.reserve(40));
    assert!(!usage.reserve(1));
    assert_eq!(usage.usage(), 100);
    assert!(usage.is_full());

    usage.release(50);
    assert_eq!(usage.usage(), 50);
    assert!((usage.percent_used() - 50.0).abs() < f64::EPSILON);
}

#[test]
fn test_child_reservation_is_bounded_by_parent() {
    let broker = UsageManager::root("broker", 100);
    let queue_a = broker.child("queue://a", Some(80));
    let queue_b = broker.child("queue://b", Some(80));

    assert!(queue_a.reserve(70));
    // b is under its own limit but the parent only has 30 left
    assert!(!queue_b.reserve(40));
    assert_eq!(queue_b.usage(), 0, "failed reservation leaves nothing behind");
    assert_eq!(broker.usage(), 70);

    assert!(queue_b.reserve(30));
    assert_eq!(broker.usage(), 100);
    assert!(queue_b.is_full(), "full parent makes the child full");

    queue_a.release(70);
    assert_eq!(broker.usage(), 30);
    assert!(!queue_b.is_full());
}

#[test]
fn test_child_inherits_limit() {
    let broker = UsageManager::root("broker", 512);
    let child = broker.child("topic://t", None);
    assert_eq!(child.limit(), 512);
    assert_eq!(child.max_reservable(), 512);

    let unlimited = UsageManager::root("unbounded", UNLIMITED);
    assert!(unlimited.reserve(u64::MAX / 2));
    assert_eq!(unlimited.percent_used(), 0.0);
}

#[test]
fn test_release_saturates_at_zero() {
    let usage = UsageManager::root("broker", 10);
    usage.increase(5);
    usage.release(50);
    assert_eq!(usage.usage(), 0);
}

#[test]
fn test_watermark_callbacks_have_hysteresis() {
    let usage = UsageManager::root("broker", 100);
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    usage.on_watermark(70, 50, move |event| sink.lock().push(event));

    assert!(usage.reserve(69));
    assert!(events.lock().is_empty());
    assert!(usage.reserve(1));
    assert_eq!(*events.lock(), vec![WatermarkEvent::CrossedHigh]);

    // falling below high but above low is not enough to switch back
    usage.release(10);
    assert_eq!(events.lock().len(), 1);

    usage.release(10);
    assert_eq!(
        *events.lock(),
        vec![WatermarkEvent::CrossedHigh, WatermarkEvent::CrossedLow]
    );

    usage.increase(30);
    assert_eq!(events.lock().len(), 3);
}

#[test]
fn test_removed_listener_is_not_invoked() {
    let usage = UsageManager::root("broker", 10);
    let events = Arc::new(Mutex::new(0));
    let sink = Arc::clone(&events);
    let id = usage.on_watermark(50, 10, move |_| *sink.lock() += 1);
    usage.remove_listener(id);
    usage.increase(10);
    assert_eq!(*events.lock(), 0);
}

#[test]
fn test_blocking_reserve_wakes_on_release() {
    let broker = UsageManager::root("broker", 100);
    let child = broker.child("queue://blocked", None);
    assert!(child.reserve(100));

    let waiter = {
        let child = Arc::clone(&child);
        thread::spawn(move || {
            let cancel = AtomicBool::new(false);
            child.reserve_blocking(40, Some(Duration::from_secs(5)), &cancel)
        })
    };

    thread::sleep(Duration::from_millis(50));
    child.release(50);
    assert_eq!(waiter.join().unwrap(), Reservation::Reserved);
    assert_eq!(child.usage(), 90);
}

#[test]
fn test_blocking_reserve_wakes_on_sibling_release() {
    let broker = UsageManager::root("broker", 100);
    let a = broker.child("a", None);
    let b = broker.child("b", None);
    assert!(a.reserve(100));

    let waiter = {
        let b = Arc::clone(&b);
        thread::spawn(move || {
            let cancel = AtomicBool::new(false);
            b.reserve_blocking(10, Some(Duration::from_secs(5)), &cancel)
        })
    };

    thread::sleep(Duration::from_millis(50));
    a.release(20);
    assert_eq!(waiter.join().unwrap(), Reservation::Reserved);
}

#[test]
fn test_blocking_reserve_times_out() {
    let usage = UsageManager::root("broker", 10);
    assert!(usage.reserve(10));
    let cancel = AtomicBool::new(false);
    let result = usage.reserve_blocking(5, Some(Duration::from_millis(20)), &cancel);
    assert_eq!(result, Reservation::TimedOut);
    assert_eq!(usage.usage(), 10);
}

#[test]
fn test_stop_interrupts_blocked_reservation() {
    let usage = UsageManager::root("broker", 10);
    assert!(usage.reserve(10));

    let waiter = {
        let usage = Arc::clone(&usage);
        thread::spawn(move || {
            let cancel = AtomicBool::new(false);
            usage.reserve_blocking(5, None, &cancel)
        })
    };

    thread::sleep(Duration::from_millis(50));
    usage.stop();
    assert_eq!(waiter.join().unwrap(), Reservation::Interrupted);
}

#[test]
fn test_watermark_state_follows_final_usage_under_contention() {
    let usage = UsageManager::root("broker", 100);
    let below_high = Arc::new(AtomicBool::new(true));
    {
        let below_high = Arc::clone(&below_high);
        usage.on_watermark(70, 30, move |event| {
            below_high.store(
                event == WatermarkEvent::CrossedLow,
                std::sync::atomic::Ordering::Release,
            );
        });
    }

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let usage = Arc::clone(&usage);
            thread::spawn(move || {
                for _ in 0..2_000 {
                    usage.increase(20);
                    usage.release(20);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(usage.usage(), 0);
    assert!(below_high.load(std::sync::atomic::Ordering::Acquire));
    usage.increase(80);
    assert!(!below_high.load(std::sync::atomic::Ordering::Acquire));
}
