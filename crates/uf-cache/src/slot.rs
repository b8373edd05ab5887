//! Block cache store: slots and the sharded identity index.
//!
//! Lock order is always shard lock, then slot data lock. Pins are only
//! taken while the shard lock is held, so a slot that leaves its shard with
//! zero pins can never be pinned again.

use crate::BlockBuf;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use uf_types::{BlockNumber, VolumeId};

/// Identity of a cached block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotKey {
    pub volume: VolumeId,
    pub block: BlockNumber,
}

impl SlotKey {
    #[must_use]
    pub fn new(volume: VolumeId, block: BlockNumber) -> Self {
        Self { volume, block }
    }
}

/// One cached block: its bytes plus dirty flag and pin count.
pub(crate) struct CacheSlot {
    key: SlotKey,
    data: RwLock<Vec<u8>>,
    dirty: AtomicBool,
    pins: AtomicU32,
}

impl CacheSlot {
    pub(crate) fn new(key: SlotKey, bytes: Vec<u8>, dirty: bool) -> Self {
        Self {
            key,
            data: RwLock::new(bytes),
            dirty: AtomicBool::new(dirty),
            pins: AtomicU32::new(0),
        }
    }

    pub(crate) fn key(&self) -> SlotKey {
        self.key
    }

    fn pin(&self) {
        self.pins.fetch_add(1, Ordering::Acquire);
    }

    pub(crate) fn unpin(&self) {
        let prev = self.pins.fetch_sub(1, Ordering::Release);
        debug_assert!(prev > 0, "unpin on slot with pin count 0");
    }

    pub(crate) fn is_pinned(&self) -> bool {
        self.pins.load(Ordering::Acquire) > 0
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Copy the slot contents out under the slot read lock.
    pub(crate) fn copy_out(&self) -> BlockBuf {
        BlockBuf::new(self.data.read().clone())
    }

    /// Overwrite `data.len()` bytes at `offset` and mark the slot dirty.
    pub(crate) fn write_at(&self, offset: usize, data: &[u8]) {
        let mut bytes = self.data.write();
        bytes[offset..offset + data.len()].copy_from_slice(data);
        self.dirty.store(true, Ordering::Release);
    }

    /// Run `store` on the contents if dirty, clearing the flag on success.
    ///
    /// Holds the slot write lock for the duration so no writer can slip a
    /// change in between the store and the flag reset.
    pub(crate) fn write_back<E>(
        &self,
        store: impl FnOnce(&[u8]) -> Result<(), E>,
    ) -> Result<bool, E> {
        let bytes = self.data.write();
        if !self.dirty.load(Ordering::Acquire) {
            return Ok(false);
        }
        store(&bytes)?;
        self.dirty.store(false, Ordering::Release);
        drop(bytes);
        Ok(true)
    }
}

impl std::fmt::Debug for CacheSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheSlot")
            .field("key", &self.key)
            .field("dirty", &self.is_dirty())
            .field("pins", &self.pins.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// A pinned block. The slot cannot be evicted until this guard drops.
pub struct PinnedBlock {
    slot: Arc<CacheSlot>,
}

impl PinnedBlock {
    fn new(slot: Arc<CacheSlot>) -> Self {
        Self { slot }
    }

    #[must_use]
    pub fn key(&self) -> SlotKey {
        self.slot.key()
    }

    /// Copy of the block contents.
    #[must_use]
    pub fn read(&self) -> BlockBuf {
        self.slot.copy_out()
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.slot.is_dirty()
    }

    pub(crate) fn slot(&self) -> &Arc<CacheSlot> {
        &self.slot
    }
}

impl Drop for PinnedBlock {
    fn drop(&mut self) {
        self.slot.unpin();
    }
}

impl std::fmt::Debug for PinnedBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedBlock")
            .field("slot", &self.slot)
            .finish()
    }
}

/// Outcome of an identity lookup. A miss is not an error; it sends the
/// caller down the load path.
pub(crate) enum Lookup {
    Hit(PinnedBlock),
    Miss,
}

/// Result of trying to take a slot out of the index for eviction.
pub(crate) enum Claim {
    /// Key no longer indexed (stale recency entry).
    Missing,
    /// Someone holds a pin.
    Pinned,
    /// Clean and unpinned: removed from the index.
    Removed(Arc<CacheSlot>),
    /// Dirty and unpinned: pinned for the caller, which must write it back
    /// and call [`SlotIndex::remove_if_idle`].
    NeedsWriteBack(PinnedBlock),
}

type Shard = HashMap<SlotKey, Arc<CacheSlot>>;

/// Sharded identity index plus slot-capacity accounting.
///
/// `reserved` counts live slots and in-flight loads. A load reserves a slot
/// before touching the device, so the store never exceeds `capacity`.
#[derive(Debug)]
pub(crate) struct SlotIndex {
    shards: Vec<Mutex<Shard>>,
    capacity: usize,
    reserved: AtomicUsize,
}

impl SlotIndex {
    pub(crate) fn new(capacity: usize, shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        Self {
            shards: (0..shard_count).map(|_| Mutex::new(HashMap::new())).collect(),
            capacity,
            reserved: AtomicUsize::new(0),
        }
    }

    fn shard(&self, key: &SlotKey) -> &Mutex<Shard> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = usize::try_from(hasher.finish() % self.shards.len() as u64).unwrap_or(0);
        &self.shards[idx]
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn lookup(&self, key: SlotKey) -> Lookup {
        let shard = self.shard(&key).lock();
        match shard.get(&key) {
            Some(slot) => {
                slot.pin();
                Lookup::Hit(PinnedBlock::new(Arc::clone(slot)))
            }
            None => Lookup::Miss,
        }
    }

    pub(crate) fn contains(&self, key: SlotKey) -> bool {
        self.shard(&key).lock().contains_key(&key)
    }

    /// Take one unit of capacity if any is free.
    pub(crate) fn try_reserve(&self) -> bool {
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.capacity).then_some(current + 1)
            })
            .is_ok()
    }

    pub(crate) fn release_reservation(&self) {
        let prev = self.reserved.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "release without reservation");
    }

    /// Insert `slot` pinned, or pin and return the slot another thread
    /// indexed first. The flag is `true` when `slot` itself was inserted.
    pub(crate) fn insert_or_get(&self, slot: CacheSlot) -> (PinnedBlock, bool) {
        let key = slot.key();
        let mut shard = self.shard(&key).lock();
        if let Some(existing) = shard.get(&key) {
            existing.pin();
            return (PinnedBlock::new(Arc::clone(existing)), false);
        }
        let slot = Arc::new(slot);
        slot.pin();
        shard.insert(key, Arc::clone(&slot));
        drop(shard);
        (PinnedBlock::new(slot), true)
    }

    pub(crate) fn claim_for_eviction(&self, key: SlotKey) -> Claim {
        let mut shard = self.shard(&key).lock();
        let Some(slot) = shard.get(&key) else {
            return Claim::Missing;
        };
        if slot.is_pinned() {
            return Claim::Pinned;
        }
        if slot.is_dirty() {
            slot.pin();
            return Claim::NeedsWriteBack(PinnedBlock::new(Arc::clone(slot)));
        }
        match shard.remove(&key) {
            Some(slot) => Claim::Removed(slot),
            None => Claim::Missing,
        }
    }

    /// Remove `slot` if it is still the indexed slot for its key, unpinned,
    /// and clean. Capacity accounting is left to the caller.
    pub(crate) fn remove_if_idle(&self, slot: &Arc<CacheSlot>) -> bool {
        let key = slot.key();
        let mut shard = self.shard(&key).lock();
        let idle = shard
            .get(&key)
            .is_some_and(|s| Arc::ptr_eq(s, slot) && !s.is_pinned() && !s.is_dirty());
        if idle {
            shard.remove(&key);
        }
        idle
    }

    /// Snapshot of every slot belonging to `volume`.
    pub(crate) fn slots_of(&self, volume: VolumeId) -> Vec<Arc<CacheSlot>> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let shard = shard.lock();
            out.extend(
                shard
                    .iter()
                    .filter(|(key, _)| key.volume == volume)
                    .map(|(_, slot)| Arc::clone(slot)),
            );
        }
        out
    }

    pub(crate) fn volumes(&self) -> Vec<VolumeId> {
        let mut vols: Vec<_> = self
            .shards
            .iter()
            .flat_map(|shard| shard.lock().keys().map(|k| k.volume).collect::<Vec<_>>())
            .collect();
        vols.sort_unstable();
        vols.dedup();
        vols
    }

    pub(crate) fn resident_count(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    pub(crate) fn dirty_count(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().values().filter(|s| s.is_dirty()).count())
            .sum()
    }
}
