//! Watch registry: descriptor table plus an index from canonical target
//! path to the descriptors watching it.

use crate::queue::EventQueue;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use uf_error::{Result, UfError};
use uf_types::{EventMask, NodeId, OwnerId, WatchDescriptor};

/// A path resolved to its canonical form and node identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub path: PathBuf,
    pub node: NodeId,
    pub is_dir: bool,
}

/// Path resolution collaborator used by `add_watch`.
pub trait PathResolver: Send + Sync {
    /// Resolve `path`, failing with [`UfError::InvalidPath`] if it does not
    /// name an existing node.
    fn resolve(&self, path: &Path) -> Result<ResolvedTarget>;
}

/// Resolves paths on the host filesystem. Symlinks are followed.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostPathResolver;

impl PathResolver for HostPathResolver {
    fn resolve(&self, path: &Path) -> Result<ResolvedTarget> {
        let invalid = |err: std::io::Error| {
            UfError::InvalidPath(format!("{}: {err}", path.display()))
        };
        let canonical = std::fs::canonicalize(path).map_err(invalid)?;
        let meta = std::fs::metadata(&canonical).map_err(invalid)?;
        Ok(ResolvedTarget {
            path: canonical,
            node: NodeId(meta.ino()),
            is_dir: meta.is_dir(),
        })
    }
}

/// Lifecycle of a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Active,
    /// Unregistered; its queue is closed and awaits a terminal drain.
    Removed,
}

#[derive(Debug)]
pub struct WatchEntry {
    pub wd: WatchDescriptor,
    pub target: ResolvedTarget,
    pub mask: EventMask,
    pub owner: OwnerId,
    pub state: WatchState,
    pub queue: Arc<EventQueue>,
}

/// A queue that should receive an event for a mutation.
#[derive(Debug, Clone)]
pub(crate) struct Delivery {
    pub(crate) wd: WatchDescriptor,
    pub(crate) mask: EventMask,
    pub(crate) queue: Arc<EventQueue>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    by_path: HashMap<PathBuf, Vec<WatchDescriptor>>,
    entries: HashMap<WatchDescriptor, WatchEntry>,
}

impl RegistryInner {
    fn unindex(&mut self, wd: WatchDescriptor, path: &Path) {
        if let Some(wds) = self.by_path.get_mut(path) {
            wds.retain(|w| *w != wd);
            if wds.is_empty() {
                self.by_path.remove(path);
            }
        }
    }

    /// Active -> Removed. Returns the queue to close.
    fn deactivate(&mut self, wd: WatchDescriptor) -> Option<Arc<EventQueue>> {
        let entry = self.entries.get_mut(&wd)?;
        if entry.state != WatchState::Active {
            return None;
        }
        entry.state = WatchState::Removed;
        let path = entry.target.path.clone();
        let queue = Arc::clone(&entry.queue);
        self.unindex(wd, &path);
        Some(queue)
    }
}

#[derive(Debug)]
pub struct WatchRegistry {
    inner: RwLock<RegistryInner>,
    next_wd: AtomicU64,
}

impl Default for WatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            next_wd: AtomicU64::new(1),
        }
    }

    /// Register a watch on an already resolved target.
    pub fn add(
        &self,
        target: ResolvedTarget,
        mask: EventMask,
        owner: OwnerId,
        queue_capacity: usize,
    ) -> WatchDescriptor {
        let wd = WatchDescriptor(self.next_wd.fetch_add(1, Ordering::Relaxed));
        let mut inner = self.inner.write();
        inner
            .by_path
            .entry(target.path.clone())
            .or_default()
            .push(wd);
        inner.entries.insert(
            wd,
            WatchEntry {
                wd,
                target,
                mask,
                owner,
                state: WatchState::Active,
                queue: Arc::new(EventQueue::new(queue_capacity)),
            },
        );
        wd
    }

    /// Unregister an active watch and close its queue.
    pub fn remove(&self, wd: WatchDescriptor) -> Result<()> {
        let queue = self
            .inner
            .write()
            .deactivate(wd)
            .ok_or(UfError::UnknownDescriptor(wd.0))?;
        queue.close();
        Ok(())
    }

    /// Remove every active watch owned by `owner`. Returns how many.
    pub fn remove_owned_by(&self, owner: OwnerId) -> usize {
        let queues: Vec<Arc<EventQueue>> = {
            let mut inner = self.inner.write();
            let owned: Vec<WatchDescriptor> = inner
                .entries
                .values()
                .filter(|e| e.owner == owner && e.state == WatchState::Active)
                .map(|e| e.wd)
                .collect();
            owned
                .into_iter()
                .filter_map(|wd| inner.deactivate(wd))
                .collect()
        };
        for queue in &queues {
            queue.close();
        }
        queues.len()
    }

    /// Remove every active watch.
    pub fn remove_all(&self) -> usize {
        let queues: Vec<Arc<EventQueue>> = {
            let mut inner = self.inner.write();
            let active: Vec<WatchDescriptor> = inner
                .entries
                .values()
                .filter(|e| e.state == WatchState::Active)
                .map(|e| e.wd)
                .collect();
            active
                .into_iter()
                .filter_map(|wd| inner.deactivate(wd))
                .collect()
        };
        for queue in &queues {
            queue.close();
        }
        queues.len()
    }

    /// Queue and state of a known descriptor.
    pub fn lookup(&self, wd: WatchDescriptor) -> Result<(Arc<EventQueue>, WatchState)> {
        self.inner
            .read()
            .entries
            .get(&wd)
            .map(|e| (Arc::clone(&e.queue), e.state))
            .ok_or(UfError::UnknownDescriptor(wd.0))
    }

    /// Drop a removed entry whose queue has been drained empty.
    pub fn reclaim(&self, wd: WatchDescriptor) -> bool {
        let mut inner = self.inner.write();
        let done = inner
            .entries
            .get(&wd)
            .is_some_and(|e| e.state == WatchState::Removed && e.queue.is_empty());
        if done {
            inner.entries.remove(&wd);
        }
        done
    }

    /// Active watches on `path` itself.
    pub(crate) fn deliveries(&self, path: &Path) -> Vec<Delivery> {
        let inner = self.inner.read();
        inner
            .by_path
            .get(path)
            .into_iter()
            .flatten()
            .filter_map(|wd| inner.entries.get(wd))
            .map(|e| Delivery {
                wd: e.wd,
                mask: e.mask,
                queue: Arc::clone(&e.queue),
            })
            .collect()
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner
            .read()
            .entries
            .values()
            .filter(|e| e.state == WatchState::Active)
            .count()
    }
}
