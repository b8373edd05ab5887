//! Per-volume diagnostics counters.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use uf_types::VolumeId;

/// Live counters for one volume.
#[derive(Debug, Default)]
pub(crate) struct VolumeCounters {
    pub(crate) hits: AtomicU64,
    pub(crate) misses: AtomicU64,
    pub(crate) evictions: AtomicU64,
    pub(crate) write_backs: AtomicU64,
    pub(crate) prefetch_issued: AtomicU64,
    pub(crate) prefetch_completed: AtomicU64,
    pub(crate) prefetch_dropped: AtomicU64,
    pub(crate) prefetch_failed: AtomicU64,
}

impl VolumeCounters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            write_backs: self.write_backs.load(Ordering::Relaxed),
            prefetch_issued: self.prefetch_issued.load(Ordering::Relaxed),
            prefetch_completed: self.prefetch_completed.load(Ordering::Relaxed),
            prefetch_dropped: self.prefetch_dropped.load(Ordering::Relaxed),
            prefetch_failed: self.prefetch_failed.load(Ordering::Relaxed),
        }
    }
}

/// Immutable snapshot of cache counters for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub write_backs: u64,
    pub prefetch_issued: u64,
    pub prefetch_completed: u64,
    pub prefetch_dropped: u64,
    pub prefetch_failed: u64,
}

impl CacheStatsSnapshot {
    /// Hit rate as a fraction in [0.0, 1.0]. Zero when nothing was accessed.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }

    /// Counter-wise difference `self - earlier`, for measuring one phase.
    #[must_use]
    pub fn since(&self, earlier: &Self) -> Self {
        Self {
            hits: self.hits.saturating_sub(earlier.hits),
            misses: self.misses.saturating_sub(earlier.misses),
            evictions: self.evictions.saturating_sub(earlier.evictions),
            write_backs: self.write_backs.saturating_sub(earlier.write_backs),
            prefetch_issued: self.prefetch_issued.saturating_sub(earlier.prefetch_issued),
            prefetch_completed: self
                .prefetch_completed
                .saturating_sub(earlier.prefetch_completed),
            prefetch_dropped: self.prefetch_dropped.saturating_sub(earlier.prefetch_dropped),
            prefetch_failed: self.prefetch_failed.saturating_sub(earlier.prefetch_failed),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct StatsRegistry {
    volumes: RwLock<HashMap<VolumeId, Arc<VolumeCounters>>>,
}

impl StatsRegistry {
    pub(crate) fn volume(&self, volume: VolumeId) -> Arc<VolumeCounters> {
        if let Some(counters) = self.volumes.read().get(&volume) {
            return Arc::clone(counters);
        }
        Arc::clone(self.volumes.write().entry(volume).or_default())
    }

    pub(crate) fn snapshot(&self, volume: VolumeId) -> CacheStatsSnapshot {
        self.volumes
            .read()
            .get(&volume)
            .map(|c| c.snapshot())
            .unwrap_or_default()
    }
}
