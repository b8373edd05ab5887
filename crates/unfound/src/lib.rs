#![forbid(unsafe_code)]
//! Unfound public API facade.
//!
//! [`Unfound::start`] builds the block cache, the notification manager, and
//! an in-memory [`Namespace`] over one volume, wired so that every file
//! read and write goes through the cache and every mutation reaches the
//! watches. [`Unfound::shutdown`] closes all watch queues and flushes the
//! cache. Nothing here is process-global: two systems can run side by side.

mod config;
mod namespace;

pub use config::{NamespaceConfig, UnfoundConfig};
pub use namespace::{Metadata, Namespace, NodeKind, SharedCache};

pub use uf_cache::{
    BlockBuf, BlockStore, ByteDevice, CacheConfig, CacheManager, CacheStatsSnapshot,
    FileByteDevice, MemByteDevice, VolumeStore,
};
pub use uf_error::{Result, UfError};
pub use uf_notify::{
    DrainMode, Event, EventKind, MutationHook, NotificationManager, NotifyConfig, PathResolver,
};
pub use uf_types::{
    BlockNumber, BlockSize, EventMask, HandleId, NodeId, OwnerId, VolumeId, WatchDescriptor,
};

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// The volume the namespace lives on.
pub const NAMESPACE_VOLUME: VolumeId = VolumeId(0);

pub struct Unfound {
    config: UnfoundConfig,
    cache: Arc<SharedCache>,
    notify: Arc<NotificationManager>,
    namespace: Namespace,
}

impl std::fmt::Debug for Unfound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unfound")
            .field("cache", &self.cache)
            .field("watches", &self.notify.watch_count())
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl Unfound {
    /// Validate `config` and bring the system up.
    pub fn start(config: UnfoundConfig) -> Result<Self> {
        config.validate()?;
        let block_size = config.namespace.block_size()?;
        let volume_bytes = config.namespace.volume_bytes()?;

        let store: Arc<dyn BlockStore> = match &config.namespace.backing_file {
            Some(path) => {
                let store = VolumeStore::new(block_size);
                store.attach(NAMESPACE_VOLUME, open_backing_file(path, volume_bytes)?)?;
                Arc::new(store)
            }
            None => {
                let len = usize::try_from(volume_bytes).map_err(|_| {
                    UfError::InvalidArgument(format!(
                        "in-memory volume of {volume_bytes} bytes does not fit in memory"
                    ))
                })?;
                let store = VolumeStore::new(block_size);
                store.attach(NAMESPACE_VOLUME, MemByteDevice::new(len))?;
                Arc::new(store)
            }
        };

        let cache = Arc::new(CacheManager::new(store, config.cache.clone())?);
        let notify = Arc::new(NotificationManager::new(config.notify.clone())?);
        let hook: Arc<dyn MutationHook> = notify.clone();
        let namespace = Namespace::new(NAMESPACE_VOLUME, Arc::clone(&cache), hook)?;

        let backing = config
            .namespace
            .backing_file
            .as_ref()
            .map_or_else(|| "memory".to_owned(), |p| p.display().to_string());
        info!(
            event = "start",
            block_size = block_size.get(),
            volume_blocks = config.namespace.volume_blocks,
            capacity_blocks = config.cache.capacity_blocks,
            queue_capacity = config.notify.queue_capacity,
            backing = %backing,
            "unfound started"
        );
        Ok(Self {
            config,
            cache,
            notify,
            namespace,
        })
    }

    #[must_use]
    pub fn config(&self) -> &UnfoundConfig {
        &self.config
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<SharedCache> {
        &self.cache
    }

    #[must_use]
    pub fn notify(&self) -> &Arc<NotificationManager> {
        &self.notify
    }

    #[must_use]
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Watch a namespace path.
    pub fn add_watch(
        &self,
        path: &Path,
        mask: EventMask,
        owner: OwnerId,
    ) -> Result<WatchDescriptor> {
        self.notify.add_watch(&self.namespace, path, mask, owner)
    }

    /// Cache counters of the namespace volume.
    #[must_use]
    pub fn stats(&self) -> CacheStatsSnapshot {
        self.cache.stats(NAMESPACE_VOLUME)
    }

    /// Close every watch queue, stop prefetching, and write back every
    /// dirty block.
    pub fn shutdown(&self) -> Result<()> {
        self.notify.shutdown();
        let result = self.cache.shutdown();
        match &result {
            Ok(()) => info!(event = "shutdown", "unfound stopped"),
            Err(err) => warn!(event = "shutdown", error = %err, "final flush failed"),
        }
        result
    }
}

/// Open the volume's backing file, creating it or growing it to
/// `volume_bytes`. A longer file is used as is.
fn open_backing_file(path: &Path, volume_bytes: u64) -> Result<FileByteDevice> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    if file.metadata()?.len() < volume_bytes {
        file.set_len(volume_bytes)?;
    }
    drop(file);
    FileByteDevice::open(path)
}
