//! Cache manager: the entry point every file read and write goes through.
//!
//! A miss reserves one unit of capacity before touching the device. When the
//! store is full the reservation is taken over from an evicted victim, so
//! the number of live slots plus in-flight loads never exceeds
//! `capacity_blocks`. A victim is never pinned; dirty victims are written
//! back before they leave the index.

use crate::eviction::LruPolicy;
use crate::readahead::{Prefetcher, StreamTable, Submit};
use crate::slot::{CacheSlot, Claim, Lookup, SlotIndex};
use crate::stats::{StatsRegistry, VolumeCounters};
use crate::{
    AccessPattern, BlockBuf, BlockStore, CacheConfig, CacheStatsSnapshot, PinnedBlock, SlotKey,
};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};
use uf_error::{Result, UfError};
use uf_types::{BlockNumber, HandleId, VolumeId};

/// Whether an access counts towards the hit/miss statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    /// A caller read or write.
    Demand,
    /// Explicit pins and prefetch loads.
    Quiet,
}

/// State shared between callers and the prefetch workers.
struct CacheCore<S: ?Sized> {
    store: Arc<S>,
    config: CacheConfig,
    slots: SlotIndex,
    policy: LruPolicy,
    streams: StreamTable,
    stats: StatsRegistry,
}

impl<S: BlockStore + ?Sized> CacheCore<S> {
    fn block_len(&self) -> usize {
        self.store.block_size().as_usize()
    }

    fn check_block(&self, volume: VolumeId, block: BlockNumber) -> Result<()> {
        let count = self.store.block_count(volume)?;
        if block.0 >= count {
            return Err(UfError::Device {
                volume: volume.0,
                block: block.0,
                detail: format!("block out of range: block_count={count}"),
            });
        }
        Ok(())
    }

    fn get_or_load(&self, key: SlotKey, access: Access) -> Result<PinnedBlock> {
        let counters = self.stats.volume(key.volume);
        if let Lookup::Hit(pinned) = self.slots.lookup(key) {
            self.policy.touch(key);
            if access == Access::Demand {
                VolumeCounters::bump(&counters.hits);
                trace!(target: "uf::cache", event = "hit", volume = key.volume.0, block = key.block.0);
            }
            return Ok(pinned);
        }
        if access == Access::Demand {
            VolumeCounters::bump(&counters.misses);
            trace!(target: "uf::cache", event = "miss", volume = key.volume.0, block = key.block.0);
        }

        self.reserve_slot()?;
        let loaded = match self.store.load_block(key.volume, key.block) {
            Ok(buf) => buf,
            Err(err) => {
                self.slots.release_reservation();
                return Err(err);
            }
        };
        if loaded.len() != self.block_len() {
            self.slots.release_reservation();
            return Err(UfError::Device {
                volume: key.volume.0,
                block: key.block.0,
                detail: format!(
                    "short block: got={} expected={}",
                    loaded.len(),
                    self.block_len()
                ),
            });
        }
        Ok(self.install(CacheSlot::new(key, loaded.into_inner(), false)))
    }

    /// Index a slot whose capacity is already reserved.
    ///
    /// If another thread indexed the key first, its slot wins and the
    /// reservation is handed back.
    fn install(&self, slot: CacheSlot) -> PinnedBlock {
        let key = slot.key();
        let (pinned, inserted) = self.slots.insert_or_get(slot);
        if inserted {
            self.policy.insert(key);
        } else {
            self.slots.release_reservation();
            self.policy.touch(key);
        }
        pinned
    }

    /// Reserve one unit of capacity, evicting a victim if the store is full.
    fn reserve_slot(&self) -> Result<()> {
        if self.slots.try_reserve() {
            return Ok(());
        }
        let batch = self.config.eviction_scan_batch;
        let budget = self.slots.capacity().saturating_mul(2).max(batch);
        let mut examined = 0_usize;
        let mut after = None;
        'scan: loop {
            let candidates = self.policy.victim_candidates(after, batch);
            if candidates.is_empty() {
                break;
            }
            for (stamp, key) in candidates {
                after = Some(stamp);
                examined += 1;
                if self.try_evict(stamp, key)? {
                    return Ok(());
                }
                if examined >= budget {
                    break 'scan;
                }
            }
            if self.slots.try_reserve() {
                return Ok(());
            }
        }
        if self.slots.try_reserve() {
            return Ok(());
        }
        debug!(
            target: "uf::cache",
            event = "evict_exhausted",
            examined,
            capacity = self.slots.capacity()
        );
        Err(UfError::ResourceExhausted(format!(
            "no evictable slot among {} resident blocks",
            self.slots.resident_count()
        )))
    }

    /// Try to evict `key`. On success its capacity unit now belongs to the
    /// caller.
    fn try_evict(&self, stamp: u64, key: SlotKey) -> Result<bool> {
        match self.slots.claim_for_eviction(key) {
            Claim::Missing => {
                self.policy.remove_stamped(key, stamp);
                Ok(false)
            }
            Claim::Pinned => Ok(false),
            Claim::Removed(slot) => {
                self.record_eviction(&slot, stamp);
                Ok(true)
            }
            Claim::NeedsWriteBack(pinned) => {
                let slot = Arc::clone(pinned.slot());
                self.write_back(&slot)?;
                drop(pinned);
                if self.slots.remove_if_idle(&slot) {
                    self.record_eviction(&slot, stamp);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    fn record_eviction(&self, slot: &CacheSlot, stamp: u64) {
        let key = slot.key();
        self.policy.remove_stamped(key, stamp);
        VolumeCounters::bump(&self.stats.volume(key.volume).evictions);
        debug!(
            target: "uf::cache",
            event = "evict",
            volume = key.volume.0,
            block = key.block.0
        );
    }

    /// Write a dirty slot to the store. Returns whether anything was written.
    fn write_back(&self, slot: &CacheSlot) -> Result<bool> {
        let key = slot.key();
        let wrote =
            slot.write_back(|bytes| self.store.store_block(key.volume, key.block, bytes))?;
        if wrote {
            VolumeCounters::bump(&self.stats.volume(key.volume).write_backs);
            debug!(
                target: "uf::cache",
                event = "write_back",
                volume = key.volume.0,
                block = key.block.0
            );
        }
        Ok(wrote)
    }

    /// Drop a slot that left the index outside eviction.
    fn forget_slot(&self, key: SlotKey) {
        self.slots.release_reservation();
        self.policy.remove(key);
    }

    /// Background load run by a prefetch worker. Failures are counted and
    /// discarded.
    fn prefetch(&self, key: SlotKey) {
        if self.slots.contains(key) {
            return;
        }
        let counters = self.stats.volume(key.volume);
        match self.get_or_load(key, Access::Quiet) {
            Ok(pinned) => {
                drop(pinned);
                VolumeCounters::bump(&counters.prefetch_completed);
                trace!(target: "uf::cache", event = "prefetch_done", volume = key.volume.0, block = key.block.0);
            }
            Err(err) => {
                VolumeCounters::bump(&counters.prefetch_failed);
                debug!(
                    target: "uf::cache",
                    event = "prefetch_failed",
                    volume = key.volume.0,
                    block = key.block.0,
                    error = %err
                );
            }
        }
    }
}

/// Block cache façade.
///
/// Generic over the block storage collaborator; `Arc<dyn BlockStore>` works
/// as well as a concrete store.
pub struct CacheManager<S: BlockStore + ?Sized + 'static> {
    core: Arc<CacheCore<S>>,
    prefetcher: RwLock<Option<Prefetcher>>,
}

impl<S: BlockStore + ?Sized + 'static> CacheManager<S> {
    /// Build a cache over `store`, starting prefetch workers if readahead
    /// is enabled.
    pub fn new(store: Arc<S>, config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let core = Arc::new(CacheCore {
            store,
            slots: SlotIndex::new(config.capacity_blocks, config.shard_count),
            policy: LruPolicy::new(),
            streams: StreamTable::default(),
            stats: StatsRegistry::default(),
            config,
        });
        let prefetcher = if core.config.readahead_enabled() {
            let worker_core = Arc::clone(&core);
            Some(Prefetcher::spawn(
                core.config.prefetch_workers,
                core.config.prefetch_queue_depth,
                move |key| worker_core.prefetch(key),
            )?)
        } else {
            None
        };
        info!(
            target: "uf::cache",
            event = "cache_start",
            capacity_blocks = core.config.capacity_blocks,
            shard_count = core.config.shard_count,
            block_size = core.store.block_size().get(),
            readahead_window = core.config.readahead_window,
            prefetch_workers = core.config.prefetch_workers
        );
        Ok(Self {
            core,
            prefetcher: RwLock::new(prefetcher),
        })
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.core.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.core.store
    }

    /// Read one block on behalf of `handle`.
    ///
    /// Feeds the handle's access stream; a sequential stream triggers
    /// readahead of the following blocks.
    pub fn read(&self, volume: VolumeId, block: BlockNumber, handle: HandleId) -> Result<BlockBuf> {
        let key = SlotKey::new(volume, block);
        let pattern =
            self.core
                .streams
                .observe(handle, volume, block, self.core.config.sequential_threshold);
        let pinned = self.core.get_or_load(key, Access::Demand)?;
        let buf = pinned.read();
        drop(pinned);
        if pattern == AccessPattern::Sequential {
            self.readahead(key);
        }
        Ok(buf)
    }

    /// Replace a whole block. The previous contents are never loaded.
    ///
    /// Counts as a hit when the block is resident and a miss when it has
    /// to be inserted.
    pub fn write(&self, volume: VolumeId, block: BlockNumber, data: &[u8]) -> Result<()> {
        let block_len = self.core.block_len();
        if data.len() != block_len {
            return Err(UfError::InvalidArgument(format!(
                "full-block write size mismatch: got={} expected={block_len}",
                data.len()
            )));
        }
        self.core.check_block(volume, block)?;
        let key = SlotKey::new(volume, block);
        let counters = self.core.stats.volume(volume);
        if let Lookup::Hit(pinned) = self.core.slots.lookup(key) {
            pinned.slot().write_at(0, data);
            self.core.policy.touch(key);
            VolumeCounters::bump(&counters.hits);
            trace!(target: "uf::cache", event = "write", volume = volume.0, block = block.0);
            return Ok(());
        }
        VolumeCounters::bump(&counters.misses);
        self.core.reserve_slot()?;
        let (pinned, inserted) = self
            .core
            .slots
            .insert_or_get(CacheSlot::new(key, data.to_vec(), true));
        if inserted {
            self.core.policy.insert(key);
        } else {
            self.core.slots.release_reservation();
            pinned.slot().write_at(0, data);
            self.core.policy.touch(key);
        }
        trace!(target: "uf::cache", event = "write", volume = volume.0, block = block.0);
        Ok(())
    }

    /// Overwrite `data.len()` bytes at `offset` within a block.
    ///
    /// A partial write loads the block first; a full-block write does not.
    /// Either way the write counts toward the volume's hits or misses.
    pub fn write_at(
        &self,
        volume: VolumeId,
        block: BlockNumber,
        offset: usize,
        data: &[u8],
    ) -> Result<()> {
        let block_len = self.core.block_len();
        let end = offset.checked_add(data.len()).filter(|end| *end <= block_len);
        if end.is_none() {
            return Err(UfError::InvalidArgument(format!(
                "write past block end: offset={offset} len={} block_size={block_len}",
                data.len()
            )));
        }
        if offset == 0 && data.len() == block_len {
            return self.write(volume, block, data);
        }
        let pinned = self.core.get_or_load(SlotKey::new(volume, block), Access::Demand)?;
        pinned.slot().write_at(offset, data);
        trace!(
            target: "uf::cache",
            event = "write_partial",
            volume = volume.0,
            block = block.0,
            offset,
            len = data.len()
        );
        Ok(())
    }

    /// Load (if needed) and pin a block. It stays resident until the guard
    /// drops.
    pub fn pin(&self, volume: VolumeId, block: BlockNumber) -> Result<PinnedBlock> {
        self.core.get_or_load(SlotKey::new(volume, block), Access::Quiet)
    }

    /// Write back every dirty slot of `volume`, then sync the volume.
    ///
    /// Every dirty slot is attempted; the first failure is returned.
    pub fn flush(&self, volume: VolumeId) -> Result<()> {
        let mut first_err = None;
        let mut written = 0_usize;
        for slot in self.core.slots.slots_of(volume) {
            if !slot.is_dirty() {
                continue;
            }
            match self.core.write_back(&slot) {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(err) => {
                    first_err.get_or_insert(err);
                }
            }
        }
        if let Some(err) = first_err {
            return Err(err);
        }
        self.core.store.sync(volume)?;
        debug!(target: "uf::cache", event = "flush", volume = volume.0, written);
        Ok(())
    }

    /// Flush every volume with resident blocks.
    pub fn flush_all(&self) -> Result<()> {
        let mut first_err = None;
        for volume in self.core.slots.volumes() {
            if let Err(err) = self.flush(volume) {
                warn!(target: "uf::cache", event = "flush_failed", volume = volume.0, error = %err);
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Drop one block from the cache, writing it back first if dirty.
    ///
    /// Returns `false` if the block was not resident and `Busy` if it is
    /// pinned.
    pub fn invalidate(&self, volume: VolumeId, block: BlockNumber) -> Result<bool> {
        let key = SlotKey::new(volume, block);
        match self.core.slots.claim_for_eviction(key) {
            Claim::Missing => Ok(false),
            Claim::Pinned => Err(UfError::Busy(format!(
                "block {} of volume {} is pinned",
                block.0, volume.0
            ))),
            Claim::Removed(_) => {
                self.core.forget_slot(key);
                Ok(true)
            }
            Claim::NeedsWriteBack(pinned) => {
                let slot = Arc::clone(pinned.slot());
                self.core.write_back(&slot)?;
                drop(pinned);
                if self.core.slots.remove_if_idle(&slot) {
                    self.core.forget_slot(key);
                    Ok(true)
                } else {
                    Err(UfError::Busy(format!(
                        "block {} of volume {} changed during invalidate",
                        block.0, volume.0
                    )))
                }
            }
        }
    }

    /// Flush `volume` and destroy all of its slots.
    ///
    /// Fails with `Busy`, leaving the cache untouched, if any slot is pinned.
    pub fn unmount(&self, volume: VolumeId) -> Result<()> {
        let slots = self.core.slots.slots_of(volume);
        let pinned = slots.iter().filter(|slot| slot.is_pinned()).count();
        if pinned > 0 {
            return Err(UfError::Busy(format!(
                "volume {} has {pinned} pinned blocks",
                volume.0
            )));
        }
        self.flush(volume)?;
        let mut removed = 0_usize;
        let mut remaining = 0_usize;
        for slot in &slots {
            if self.core.slots.remove_if_idle(slot) {
                self.core.forget_slot(slot.key());
                removed += 1;
            } else {
                remaining += 1;
            }
        }
        self.core.streams.forget_volume(volume);
        if remaining > 0 {
            return Err(UfError::Busy(format!(
                "volume {} still has {remaining} blocks in use",
                volume.0
            )));
        }
        info!(target: "uf::cache", event = "unmount", volume = volume.0, removed);
        Ok(())
    }

    /// Forget the access stream of a closed handle.
    pub fn close_handle(&self, handle: HandleId) {
        self.core.streams.forget(handle);
    }

    #[must_use]
    pub fn access_pattern(&self, handle: HandleId) -> Option<AccessPattern> {
        self.core.streams.pattern(handle)
    }

    #[must_use]
    pub fn stats(&self, volume: VolumeId) -> CacheStatsSnapshot {
        self.core.stats.snapshot(volume)
    }

    #[must_use]
    pub fn resident_count(&self) -> usize {
        self.core.slots.resident_count()
    }

    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.core.slots.dirty_count()
    }

    #[must_use]
    pub fn is_resident(&self, volume: VolumeId, block: BlockNumber) -> bool {
        self.core.slots.contains(SlotKey::new(volume, block))
    }

    /// Wait for queued and running prefetches. `false` on timeout.
    pub fn wait_prefetch_idle(&self, timeout: Duration) -> bool {
        self.prefetcher
            .read()
            .as_ref()
            .is_none_or(|pool| pool.wait_idle(timeout))
    }

    /// Stop prefetch workers and flush every volume.
    pub fn shutdown(&self) -> Result<()> {
        self.stop_prefetch();
        let result = self.flush_all();
        info!(
            target: "uf::cache",
            event = "cache_shutdown",
            resident = self.resident_count(),
            dirty = self.dirty_count()
        );
        result
    }

    fn stop_prefetch(&self) {
        let pool = self.prefetcher.write().take();
        drop(pool);
    }

    fn readahead(&self, key: SlotKey) {
        let window = self.core.config.readahead_window;
        let Ok(count) = self.core.store.block_count(key.volume) else {
            return;
        };
        let guard = self.prefetcher.read();
        let Some(pool) = guard.as_ref() else {
            return;
        };
        let start = key.block.0.saturating_add(1);
        let end = key.block.0.saturating_add(window).saturating_add(1).min(count);
        let counters = self.core.stats.volume(key.volume);
        for block in start..end {
            let next = SlotKey::new(key.volume, BlockNumber(block));
            if self.core.slots.contains(next) {
                continue;
            }
            match pool.submit(next) {
                Submit::Queued => VolumeCounters::bump(&counters.prefetch_issued),
                Submit::AlreadyQueued => {}
                Submit::Dropped => VolumeCounters::bump(&counters.prefetch_dropped),
            }
        }
    }
}

impl<S: BlockStore + ?Sized + 'static> Drop for CacheManager<S> {
    fn drop(&mut self) {
        self.stop_prefetch();
    }
}

impl<S: BlockStore + ?Sized + 'static> std::fmt::Debug for CacheManager<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("config", &self.core.config)
            .field("resident", &self.core.slots.resident_count())
            .field("prefetcher", &*self.prefetcher.read())
            .finish_non_exhaustive()
    }
}
