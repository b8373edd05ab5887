//! Recency tracking for victim selection.
//!
//! Every `touch` draws a fresh stamp from a monotonic clock, so recency
//! order is total and the least-recently-used key is the lowest stamp.
//! Victim scanning copies bounded batches out of the ordered map and
//! releases the lock before the caller inspects any slot, keeping lookups
//! on other threads unblocked while a scan walks past pinned slots.

use crate::SlotKey;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Default)]
struct LruState {
    clock: u64,
    stamps: HashMap<SlotKey, u64>,
    order: BTreeMap<u64, SlotKey>,
}

impl LruState {
    fn restamp(&mut self, key: SlotKey) {
        self.clock += 1;
        if let Some(old) = self.stamps.insert(key, self.clock) {
            self.order.remove(&old);
        }
        self.order.insert(self.clock, key);
    }
}

/// Least-recently-used ordering of resident slots.
#[derive(Debug, Default)]
pub struct LruPolicy {
    state: Mutex<LruState>,
}

impl LruPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly loaded slot as most recently used.
    pub fn insert(&self, key: SlotKey) {
        self.state.lock().restamp(key);
    }

    /// Move a resident slot to most recently used. Unknown keys are ignored.
    pub fn touch(&self, key: SlotKey) {
        let mut state = self.state.lock();
        if state.stamps.contains_key(&key) {
            state.restamp(key);
        }
    }

    /// Forget a slot that left the store.
    pub fn remove(&self, key: SlotKey) {
        let mut state = self.state.lock();
        if let Some(stamp) = state.stamps.remove(&key) {
            state.order.remove(&stamp);
        }
    }

    /// Forget `key` only if its stamp is still `stamp`.
    ///
    /// A key reloaded after its slot was claimed carries a newer stamp and
    /// keeps its entry.
    pub fn remove_stamped(&self, key: SlotKey, stamp: u64) -> bool {
        let mut state = self.state.lock();
        if state.stamps.get(&key) != Some(&stamp) {
            return false;
        }
        state.stamps.remove(&key);
        state.order.remove(&stamp);
        true
    }

    #[must_use]
    pub fn stamp(&self, key: SlotKey) -> Option<u64> {
        self.state.lock().stamps.get(&key).copied()
    }

    /// Up to `limit` keys in least-recently-used order, starting strictly
    /// after the stamp `after` (from the start when `None`).
    ///
    /// Each entry carries its stamp so the caller can resume the scan.
    #[must_use]
    pub fn victim_candidates(&self, after: Option<u64>, limit: usize) -> Vec<(u64, SlotKey)> {
        let state = self.state.lock();
        let start = after.map_or(0, |stamp| stamp.saturating_add(1));
        state
            .order
            .range(start..)
            .take(limit)
            .map(|(stamp, key)| (*stamp, *key))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().stamps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
