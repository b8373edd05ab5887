use serde::{Deserialize, Serialize};
use uf_error::{Result, UfError};

/// Cache manager configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Number of block slots in the store. Default: 256.
    pub capacity_blocks: usize,
    /// Shards of the identity index. Default: 16.
    pub shard_count: usize,
    /// Blocks prefetched ahead of a sequential stream. Default: 8.
    pub readahead_window: u64,
    /// In-order requests needed before a stream counts as sequential. Default: 2.
    pub sequential_threshold: u32,
    /// Background prefetch threads. Zero disables readahead. Default: 2.
    pub prefetch_workers: usize,
    /// Pending prefetch requests before new ones are dropped. Default: 64.
    pub prefetch_queue_depth: usize,
    /// Victim candidates copied out of the recency list per scan step. Default: 32.
    pub eviction_scan_batch: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity_blocks: 256,
            shard_count: 16,
            readahead_window: 8,
            sequential_threshold: 2,
            prefetch_workers: 2,
            prefetch_queue_depth: 64,
            eviction_scan_batch: 32,
        }
    }
}

impl CacheConfig {
    /// Reject configurations the manager cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.capacity_blocks == 0 {
            return Err(UfError::InvalidArgument(
                "cache capacity_blocks must be > 0".to_owned(),
            ));
        }
        if self.shard_count == 0 {
            return Err(UfError::InvalidArgument(
                "cache shard_count must be > 0".to_owned(),
            ));
        }
        if self.sequential_threshold == 0 {
            return Err(UfError::InvalidArgument(
                "cache sequential_threshold must be > 0".to_owned(),
            ));
        }
        if self.eviction_scan_batch == 0 {
            return Err(UfError::InvalidArgument(
                "cache eviction_scan_batch must be > 0".to_owned(),
            ));
        }
        if self.prefetch_workers > 0 && self.prefetch_queue_depth == 0 {
            return Err(UfError::InvalidArgument(
                "cache prefetch_queue_depth must be > 0 when prefetch is enabled".to_owned(),
            ));
        }
        Ok(())
    }

    /// Whether readahead can issue prefetches at all.
    #[must_use]
    pub fn readahead_enabled(&self) -> bool {
        self.prefetch_workers > 0 && self.readahead_window > 0
    }
}
