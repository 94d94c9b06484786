//! Hierarchical byte accounting used for flow control.
//!
//! A `UsageManager` is a byte counter with an optional parent. Reserving on a
//! child reserves on every ancestor as well, and fails as a whole when any
//! level would go over its limit, so a child never exceeds its own limit nor
//! pushes its parent over the parent's limit.
//!
//! Listeners registered with [`UsageManager::on_watermark`] are invoked
//! synchronously by the operation that moves the usage across a watermark.
//! Each listener reads the usage under its own lock, so concurrent updates
//! are always judged against the latest value and never in a stale order.
//! Cursors use this to switch between memory and store-backed mode.
//!
//! All managers of one tree share a single wait gate so a producer blocked on
//! a child is woken when space frees up anywhere in the tree.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

/// Limit value meaning "no limit at this level".
pub const UNLIMITED: u64 = u64::MAX;

/// Direction in which a watermark was crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkEvent {
    CrossedHigh,
    CrossedLow,
}

/// Result of a blocking reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Reserved,
    TimedOut,
    Interrupted,
}

pub type ListenerId = u64;

type WatermarkCallback = Box<dyn Fn(WatermarkEvent) + Send + Sync>;

struct WatermarkListener {
    id: ListenerId,
    high_percent: f64,
    low_percent: f64,
    above: Mutex<bool>,
    callback: WatermarkCallback,
}

impl WatermarkListener {
    fn evaluate(&self, usage: &UsageManager) {
        let mut above = self.above.lock();
        let percent = usage.percent_used();
        if !*above && percent >= self.high_percent {
            *above = true;
            (self.callback)(WatermarkEvent::CrossedHigh);
        } else if *above && percent <= self.low_percent {
            *above = false;
            (self.callback)(WatermarkEvent::CrossedLow);
        }
    }
}

#[derive(Default)]
struct WaitGate {
    lock: Mutex<()>,
    cond: Condvar,
    stopped: AtomicBool,
}

pub struct UsageManager {
    name: String,
    limit: u64,
    usage: AtomicU64,
    parent: Option<Arc<UsageManager>>,
    listeners: Mutex<Vec<Arc<WatermarkListener>>>,
    next_listener: AtomicU64,
    gate: Arc<WaitGate>,
}

impl UsageManager {
    /// Creates the root of a usage tree.
    pub fn root(name: impl Into<String>, limit: u64) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            limit,
            usage: AtomicU64::new(0),
            parent: None,
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            gate: Arc::new(WaitGate::default()),
        })
    }

    /// Creates a child. With `limit == None` the child inherits its parent's
    /// limit.
    pub fn child(self: &Arc<Self>, name: impl Into<String>, limit: Option<u64>) -> Arc<Self> {
        let limit = limit.unwrap_or_else(|| self.limit());
        Arc::new(Self {
            name: name.into(),
            limit,
            usage: AtomicU64::new(0),
            parent: Some(Arc::clone(self)),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            gate: Arc::clone(&self.gate),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn usage(&self) -> u64 {
        self.usage.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn parent(&self) -> Option<&Arc<UsageManager>> {
        self.parent.as_ref()
    }

    /// Percentage of this level's limit currently in use.
    pub fn percent_used(&self) -> f64 {
        let limit = self.limit();
        if limit == UNLIMITED || limit == 0 {
            return 0.0;
        }
        self.usage() as f64 * 100.0 / limit as f64
    }

    /// True when this level or any ancestor is at or above its limit.
    pub fn is_full(&self) -> bool {
        let mut level = Some(self);
        while let Some(usage) = level {
            let limit = usage.limit();
            if limit != UNLIMITED && usage.usage() >= limit {
                return true;
            }
            level = usage.parent.as_deref();
        }
        false
    }

    /// Largest single reservation this level and its ancestors could ever
    /// grant.
    pub fn max_reservable(&self) -> u64 {
        let mut max = self.limit();
        let mut level = self.parent.as_deref();
        while let Some(usage) = level {
            max = max.min(usage.limit());
            level = usage.parent.as_deref();
        }
        max
    }

    /// Reserves `bytes` on this level and all ancestors.
    ///
    /// Returns false, with nothing reserved anywhere, when any level would
    /// exceed its limit. Never errors; callers decide whether to block,
    /// reject or throttle.
    pub fn reserve(&self, bytes: u64) -> bool {
        let mut reserved: Vec<&UsageManager> = Vec::new();
        let mut level = Some(self);
        while let Some(usage) = level {
            if !usage.try_add(bytes) {
                for done in reserved {
                    done.usage.fetch_sub(bytes, Ordering::AcqRel);
                }
                trace!(usage = %self.name, bytes, "reservation refused");
                return false;
            }
            reserved.push(usage);
            level = usage.parent.as_deref();
        }
        for usage in reserved {
            usage.fire();
        }
        true
    }

    /// Adds `bytes` without checking limits. Used when a message already
    /// admitted by flow control becomes memory resident again.
    pub fn increase(&self, bytes: u64) {
        let mut level = Some(self);
        while let Some(usage) = level {
            usage.usage.fetch_add(bytes, Ordering::AcqRel);
            usage.fire();
            level = usage.parent.as_deref();
        }
    }

    /// Releases `bytes` on this level and all ancestors and wakes blocked
    /// producers.
    pub fn release(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let mut level = Some(self);
        while let Some(usage) = level {
            let _ = usage
                .usage
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                    Some(current.saturating_sub(bytes))
                });
            usage.fire();
            level = usage.parent.as_deref();
        }
        self.notify_waiters();
    }

    /// Blocks until `bytes` can be reserved, the timeout elapses, or the wait
    /// is interrupted through `cancel` or [`UsageManager::stop`].
    pub fn reserve_blocking(
        &self,
        bytes: u64,
        timeout: Option<Duration>,
        cancel: &AtomicBool,
    ) -> Reservation {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.gate.lock.lock();
        loop {
            if self.gate.stopped.load(Ordering::Acquire) || cancel.load(Ordering::Acquire) {
                return Reservation::Interrupted;
            }
            if self.reserve(bytes) {
                return Reservation::Reserved;
            }
            match deadline {
                Some(deadline) => {
                    if self.gate.cond.wait_until(&mut guard, deadline).timed_out() {
                        drop(guard);
                        return if self.reserve(bytes) {
                            Reservation::Reserved
                        } else {
                            Reservation::TimedOut
                        };
                    }
                }
                None => self.gate.cond.wait(&mut guard),
            }
        }
    }

    /// Wakes every producer blocked anywhere in this tree so it can re-check
    /// its cancellation flag.
    pub fn notify_waiters(&self) {
        let _guard = self.gate.lock.lock();
        self.gate.cond.notify_all();
    }

    /// Interrupts all current and future blocking reservations in the tree.
    pub fn stop(&self) {
        self.gate.stopped.store(true, Ordering::Release);
        self.notify_waiters();
    }

    /// Registers a callback invoked when usage rises to `high_percent` and,
    /// after that, when it falls back to `low_percent`.
    pub fn on_watermark<F>(&self, high_percent: u8, low_percent: u8, callback: F) -> ListenerId
    where
        F: Fn(WatermarkEvent) + Send + Sync + 'static,
    {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        let listener = Arc::new(WatermarkListener {
            id,
            high_percent: f64::from(high_percent),
            low_percent: f64::from(low_percent.min(high_percent)),
            above: Mutex::new(false),
            callback: Box::new(callback),
        });
        self.listeners.lock().push(Arc::clone(&listener));
        listener.evaluate(self);
        id
    }

    pub fn remove_listener(&self, id: ListenerId) {
        self.listeners.lock().retain(|l| l.id != id);
    }

    fn try_add(&self, bytes: u64) -> bool {
        let limit = self.limit();
        self.usage
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let next = current.checked_add(bytes)?;
                if limit != UNLIMITED && next > limit {
                    None
                } else {
                    Some(next)
                }
            })
            .is_ok()
    }

    fn fire(&self) {
        let listeners: Vec<Arc<WatermarkListener>> = self.listeners.lock().clone();
        for listener in listeners {
            listener.evaluate(self);
        }
    }
}

impl std::fmt::Debug for UsageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageManager")
            .field("name", &self.name)
            .field("usage", &self.usage())
            .field("limit", &self.limit())
            .finish()
    }
}

#[cfg(test)]
mod tests;
