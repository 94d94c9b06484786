//! Pending-message cursors.
//!
//! A `Cursor` is the ordered, resumable view over the messages a destination
//! (or a durable subscription) still has to settle. Messages stay in the
//! cursor from `add` until `remove`; dispatching only marks them, so a
//! rollback just clears the mark and the message is found again at its
//! sequence position on the next pass.
//!
//! Two backing modes, switched by a watermark listener on the cursor's
//! `UsageManager`:
//!
//! - memory: every added message is kept resident.
//! - store-backed: persistent messages are left in the `MessageStore` and
//!   paged in `batch_size` at a time as iteration reaches them. Entered when
//!   usage reaches the high watermark, left only once it falls back to the low
//!   watermark.
//!
//! A message stays charged to the cursor's `UsageManager` from `add` until
//! it is removed, whether it is resident or waiting in the store. The memory
//! limit therefore bounds the whole backlog a producer can build, and
//! store-backed mode bounds how much of it is held in memory.
//!
//! Iteration is by broker sequence number only. Before handing out a resident
//! message the cursor pages in any stored message that could precede it, so
//! the mix of resident and paged messages never reorders.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, error, warn};

use crate::broker::message::{Message, MessageId};
use crate::store::MessageStore;
use crate::usage::{ListenerId, UsageManager, WatermarkEvent};
use crate::utils::error::StoreError;

struct Entry {
    message: Arc<Message>,
    dispatched: bool,
}

pub struct Cursor {
    name: String,
    store: Option<Arc<dyn MessageStore>>,
    usage: Arc<UsageManager>,
    listener: Option<ListenerId>,
    use_cache: Arc<AtomicBool>,
    batch_size: usize,

    entries: BTreeMap<u64, Entry>,
    ids: HashMap<MessageId, u64>,
    resident_bytes: u64,
    /// Charged messages that are not resident, with their size.
    parked: HashMap<MessageId, u64>,
    /// Last sequence handed out in the current pass.
    position: Option<u64>,
    /// Every stored message with a sequence at or below this is resident (or
    /// already removed).
    loaded_up_to: u64,
    store_has_more: bool,
    /// Messages held by the cursor, resident or not.
    count: usize,
    dispatched: usize,
}

impl Cursor {
    /// A memory-only cursor. Used for non-durable topic subscriptions and for
    /// staging on topics.
    pub fn in_memory(name: impl Into<String>, usage: Arc<UsageManager>) -> Self {
        Self::build(name.into(), usage, None, usize::MAX)
    }

    /// A cursor over `store`. Messages already in the store are picked up
    /// lazily, in stored order, which is how a restarted destination resumes.
    pub fn store_backed(
        name: impl Into<String>,
        usage: Arc<UsageManager>,
        store: Arc<dyn MessageStore>,
        batch_size: usize,
        high_watermark_percent: u8,
        low_watermark_percent: u8,
    ) -> Result<Self, StoreError> {
        let stored = store.count()?;
        let mut cursor = Self::build(name.into(), usage, Some(store), batch_size.max(1));
        cursor.count = stored;
        cursor.store_has_more = stored > 0;

        let flag = Arc::clone(&cursor.use_cache);
        let cursor_name = cursor.name.clone();
        let id = cursor.usage.on_watermark(
            high_watermark_percent,
            low_watermark_percent,
            move |event| {
                let cache = event == WatermarkEvent::CrossedLow;
                flag.store(cache, Ordering::Release);
                debug!(cursor = %cursor_name, store_backed = !cache, "cursor mode switch");
            },
        );
        cursor.listener = Some(id);
        Ok(cursor)
    }

    fn build(
        name: String,
        usage: Arc<UsageManager>,
        store: Option<Arc<dyn MessageStore>>,
        batch_size: usize,
    ) -> Self {
        Self {
            name,
            store,
            usage,
            listener: None,
            use_cache: Arc::new(AtomicBool::new(true)),
            batch_size,
            entries: BTreeMap::new(),
            ids: HashMap::new(),
            resident_bytes: 0,
            parked: HashMap::new(),
            position: None,
            loaded_up_to: 0,
            store_has_more: false,
            count: 0,
            dispatched: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn usage(&self) -> &Arc<UsageManager> {
        &self.usage
    }

    /// Appends `message` at the tail.
    ///
    /// `reserved` tells the cursor the caller already reserved
    /// `message.size()` on this cursor's usage; the cursor takes that
    /// reservation over and keeps it until the message is removed, even when
    /// the message is left in the store. Persistent messages must already be
    /// in the store.
    pub fn add(&mut self, message: Arc<Message>, reserved: bool) {
        let size = message.size();
        self.count += 1;
        if !reserved {
            self.usage.increase(size);
        }

        let keep_resident = self.store.is_none()
            || !message.is_persistent()
            || self.use_cache.load(Ordering::Acquire);

        if keep_resident {
            if message.is_persistent() && !self.store_has_more {
                self.loaded_up_to = message.sequence;
            }
            self.insert_resident(message);
        } else {
            self.parked.insert(message.id.clone(), size);
            self.store_has_more = true;
        }
    }

    /// Next message of the current pass that is neither dispatched nor
    /// already returned in this pass. `None` means the pass is exhausted.
    pub fn next(&mut self) -> Option<Arc<Message>> {
        loop {
            let candidate = self.next_resident();
            let needs_page = self.store_has_more
                && candidate
                    .as_ref()
                    .is_none_or(|m| m.sequence > self.loaded_up_to);
            if needs_page && self.page_in() {
                continue;
            }
            if let Some(message) = &candidate {
                self.position = Some(message.sequence);
            }
            return candidate;
        }
    }

    /// Starts a new pass from the head.
    ///
    /// In store-backed mode this also drops paged-in messages that are not
    /// inflight, so a deep backlog never stays resident. Redelivered messages
    /// are kept because the store does not carry their redelivery count.
    pub fn reset(&mut self) {
        self.position = None;
        if self.store.is_none() || self.use_cache.load(Ordering::Acquire) {
            return;
        }

        let evictable: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| {
                !e.dispatched && e.message.is_persistent() && e.message.redelivery_count == 0
            })
            .map(|(seq, _)| *seq)
            .collect();
        if let Some(first) = evictable.first() {
            self.loaded_up_to = self.loaded_up_to.min(first - 1);
            self.store_has_more = true;
        }
        for seq in evictable {
            if let Some(entry) = self.drop_resident(seq) {
                self.parked
                    .insert(entry.message.id.clone(), entry.message.size());
            }
        }
    }

    /// Marks a message returned by `next` as dispatched. It is skipped by
    /// later passes until `redeliver`, `release` or `remove`.
    pub fn mark_dispatched(&mut self, sequence: u64) {
        if let Some(entry) = self.entries.get_mut(&sequence) {
            if !entry.dispatched {
                entry.dispatched = true;
                self.dispatched += 1;
            }
        }
    }

    /// Puts a rolled back message back in the pending set, replacing the
    /// resident copy so the new redelivery count is seen by the next pass.
    pub fn redeliver(&mut self, message: Arc<Message>) {
        let sequence = message.sequence;
        match self.entries.get_mut(&sequence) {
            Some(entry) => {
                if entry.dispatched {
                    entry.dispatched = false;
                    self.dispatched -= 1;
                }
                entry.message = message;
            }
            None => {
                if self.parked.remove(&message.id).is_none() {
                    self.usage.increase(message.size());
                    self.count += 1;
                }
                self.insert_resident(message);
            }
        }
    }

    /// Clears the dispatched mark without touching the message.
    pub fn release(&mut self, sequence: u64) {
        if let Some(entry) = self.entries.get_mut(&sequence) {
            if entry.dispatched {
                entry.dispatched = false;
                self.dispatched -= 1;
            }
        }
    }

    /// Takes the message out of the cursor's working set, leaving the store
    /// untouched. Returns `None` when the id is not resident.
    pub fn take(&mut self, id: &MessageId) -> Option<Arc<Message>> {
        let sequence = self.ids.get(id).copied()?;
        let entry = self.drop_resident(sequence)?;
        self.usage.release(entry.message.size());
        self.count = self.count.saturating_sub(1);
        if entry.dispatched {
            self.dispatched -= 1;
        }
        Some(entry.message)
    }

    /// Removes the message from the working set and from the store.
    /// Idempotent.
    pub fn remove(&mut self, id: &MessageId) -> Result<Option<Arc<Message>>, StoreError> {
        let taken = self.take(id);
        if let Some(store) = &self.store {
            match &taken {
                Some(m) if m.is_persistent() => {
                    store.remove(id)?;
                }
                Some(_) => {}
                None => {
                    // not resident: the message may still be waiting in the store
                    if store.remove(id)? {
                        self.count = self.count.saturating_sub(1);
                    }
                    if let Some(size) = self.parked.remove(id) {
                        self.usage.release(size);
                    }
                }
            }
        }
        Ok(taken)
    }

    /// Takes out every resident, undispatched message that has expired.
    pub fn take_expired(&mut self, now_millis: i64) -> Vec<Arc<Message>> {
        let expired: Vec<MessageId> = self
            .entries
            .values()
            .filter(|e| !e.dispatched && e.message.is_expired_at(now_millis))
            .map(|e| e.message.id.clone())
            .collect();
        expired.iter().filter_map(|id| self.take(id)).collect()
    }

    /// Marks every resident, undispatched message that has expired as
    /// dispatched and returns them. The caller removes them once they are
    /// dead-lettered, so a later pass can neither page nor dispatch them again.
    pub fn mark_expired(&mut self, now_millis: i64) -> Vec<Arc<Message>> {
        let mut expired = Vec::new();
        for entry in self.entries.values_mut() {
            if !entry.dispatched && entry.message.is_expired_at(now_millis) {
                entry.dispatched = true;
                self.dispatched += 1;
                expired.push(Arc::clone(&entry.message));
            }
        }
        expired
    }

    /// Takes the oldest resident message that is not dispatched.
    pub fn take_oldest_pending(&mut self) -> Option<Arc<Message>> {
        let id = self
            .entries
            .values()
            .find(|e| !e.dispatched)
            .map(|e| e.message.id.clone())?;
        self.take(&id)
    }

    /// Dispatched messages, in sequence order.
    pub fn dispatched_messages(&self) -> Vec<Arc<Message>> {
        self.entries
            .values()
            .filter(|e| e.dispatched)
            .map(|e| Arc::clone(&e.message))
            .collect()
    }

    /// Messages held, resident or not, dispatched or not.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Messages waiting to be dispatched.
    pub fn pending_count(&self) -> usize {
        self.count.saturating_sub(self.dispatched)
    }

    pub fn dispatched_count(&self) -> usize {
        self.dispatched
    }

    pub fn resident_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_store_backed(&self) -> bool {
        self.store.is_some() && !self.use_cache.load(Ordering::Acquire)
    }

    fn next_resident(&self) -> Option<Arc<Message>> {
        let start = self.position.map_or(0, |p| p.saturating_add(1));
        self.entries
            .range(start..)
            .find(|(_, e)| !e.dispatched)
            .map(|(_, e)| Arc::clone(&e.message))
    }

    /// Loads the next page from the store. Returns true when anything new
    /// became resident.
    fn page_in(&mut self) -> bool {
        let Some(store) = self.store.clone() else {
            self.store_has_more = false;
            return false;
        };
        let page = match store.recover(self.loaded_up_to, self.batch_size) {
            Ok(page) => page,
            Err(e) => {
                error!(cursor = %self.name, error = %e, "failed to page messages from store");
                return false;
            }
        };

        if page.len() < self.batch_size {
            self.store_has_more = false;
        }
        if page.is_empty() && self.count > self.entries.len() {
            warn!(
                cursor = %self.name,
                held = self.count,
                resident = self.entries.len(),
                "cursor exhausted: store returned no messages while more are pending"
            );
            self.count = self.entries.len();
            let lost: u64 = self.parked.drain().map(|(_, size)| size).sum();
            self.usage.release(lost);
        }

        let mut added = false;
        for message in page {
            self.loaded_up_to = self.loaded_up_to.max(message.sequence);
            if self.entries.contains_key(&message.sequence) {
                continue;
            }
            if self.parked.remove(&message.id).is_none() {
                self.usage.increase(message.size());
            }
            self.insert_resident(Arc::new(message));
            added = true;
        }
        added || self.store_has_more
    }

    fn insert_resident(&mut self, message: Arc<Message>) {
        self.resident_bytes += message.size();
        self.ids.insert(message.id.clone(), message.sequence);
        self.entries.insert(
            message.sequence,
            Entry {
                message,
                dispatched: false,
            },
        );
    }

    fn drop_resident(&mut self, sequence: u64) -> Option<Entry> {
        let entry = self.entries.remove(&sequence)?;
        self.ids.remove(&entry.message.id);
        self.resident_bytes = self.resident_bytes.saturating_sub(entry.message.size());
        Some(entry)
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if let Some(id) = self.listener.take() {
            self.usage.remove_listener(id);
        }
        let parked: u64 = self.parked.values().sum();
        self.usage.release(self.resident_bytes + parked);
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("name", &self.name)
            .field("count", &self.count)
            .field("resident", &self.entries.len())
            .field("dispatched", &self.dispatched)
            .field("store_backed", &self.is_store_backed())
            .finish()
    }
}

#[cfg(test)]
mod tests;
