#![forbid(unsafe_code)]
//! UNotify: filesystem change notification.
//!
//! Watches are registered on resolved paths and own a bounded event queue.
//! The filesystem layer reports each mutation through [`MutationHook`]; the
//! [`NotificationManager`] fans it out to the watches on the path and on its
//! directory. Consumers drain their queue without blocking, blocking, or
//! with a timeout.
//!
//! A removed watch stops matching immediately. Its queue is closed, which
//! wakes blocked drainers; the next drain returns what is left and, once
//! the queue is empty, the descriptor is forgotten.

mod event;
mod hook;
mod queue;
mod registry;

pub use event::{Event, EventKind};
pub use hook::MutationHook;
pub use queue::{DrainMode, Drained, EventQueue, PushOutcome};
pub use registry::{
    HostPathResolver, PathResolver, ResolvedTarget, WatchEntry, WatchRegistry, WatchState,
};

use parking_lot::Mutex;
use registry::Delivery;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, trace};
use uf_error::{Result, UfError};
use uf_types::{EventMask, OwnerId, WatchDescriptor};

/// Notification configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Events held per watch before overflow. Default: 1024.
    pub queue_capacity: usize,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
        }
    }
}

impl NotifyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(UfError::InvalidArgument(
                "notify queue_capacity must be > 0".to_owned(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Counters {
    next_seq: u64,
    next_cookie: u32,
}

impl Counters {
    fn seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn cookie(&mut self) -> u32 {
        self.next_cookie = self.next_cookie.wrapping_add(1);
        if self.next_cookie == 0 {
            self.next_cookie = 1;
        }
        self.next_cookie
    }
}

/// Notification façade: watch lifecycle, event fan-out, and draining.
#[derive(Debug)]
pub struct NotificationManager {
    config: NotifyConfig,
    registry: WatchRegistry,
    /// Held while a sequence number is allocated and its event appended,
    /// so every queue sees events in sequence order. Target lookup and
    /// logging happen outside it.
    counters: Mutex<Counters>,
}

impl NotificationManager {
    pub fn new(config: NotifyConfig) -> Result<Self> {
        config.validate()?;
        info!(
            target: "uf::notify",
            event = "notify_start",
            queue_capacity = config.queue_capacity
        );
        Ok(Self {
            config,
            registry: WatchRegistry::new(),
            counters: Mutex::new(Counters::default()),
        })
    }

    #[must_use]
    pub fn config(&self) -> &NotifyConfig {
        &self.config
    }

    /// Watch `path` for the kinds in `mask` on behalf of `owner`.
    pub fn add_watch(
        &self,
        resolver: &dyn PathResolver,
        path: &Path,
        mask: EventMask,
        owner: OwnerId,
    ) -> Result<WatchDescriptor> {
        if mask.is_empty() {
            return Err(UfError::InvalidArgument("empty event mask".to_owned()));
        }
        let target = resolver.resolve(path)?;
        let canonical = target.path.clone();
        let wd = self
            .registry
            .add(target, mask, owner, self.config.queue_capacity);
        debug!(
            target: "uf::notify",
            event = "watch_add",
            wd = wd.0,
            path = %canonical.display(),
            mask = mask.bits(),
            owner = owner.0
        );
        Ok(wd)
    }

    pub fn remove_watch(&self, wd: WatchDescriptor) -> Result<()> {
        self.registry.remove(wd)?;
        debug!(target: "uf::notify", event = "watch_remove", wd = wd.0);
        Ok(())
    }

    /// Remove up to `max` events from the watch's queue.
    ///
    /// On a removed watch this is the terminal drain: it returns what is
    /// left (possibly nothing) and the descriptor is forgotten once its
    /// queue is empty.
    pub fn drain_events(
        &self,
        wd: WatchDescriptor,
        max: usize,
        mode: DrainMode,
    ) -> Result<Vec<Event>> {
        let (queue, _) = self.registry.lookup(wd)?;
        if max == 0 {
            return Ok(Vec::new());
        }
        let drained = queue.drain(max, mode);
        if drained.closed && self.registry.reclaim(wd) {
            debug!(target: "uf::notify", event = "watch_reclaim", wd = wd.0);
        }
        Ok(drained.events)
    }

    /// Remove every watch registered by `owner`. Returns how many.
    pub fn close_owner(&self, owner: OwnerId) -> usize {
        let removed = self.registry.remove_owned_by(owner);
        if removed > 0 {
            debug!(target: "uf::notify", event = "owner_close", owner = owner.0, removed);
        }
        removed
    }

    pub fn pending_count(&self, wd: WatchDescriptor) -> Result<usize> {
        Ok(self.registry.lookup(wd)?.0.len())
    }

    /// Events dropped from the watch's queue by overflow.
    pub fn dropped_count(&self, wd: WatchDescriptor) -> Result<u64> {
        Ok(self.registry.lookup(wd)?.0.dropped())
    }

    /// Active watches.
    #[must_use]
    pub fn watch_count(&self) -> usize {
        self.registry.active_count()
    }

    /// Remove every watch, waking all blocked drainers.
    pub fn shutdown(&self) {
        let removed = self.registry.remove_all();
        info!(target: "uf::notify", event = "notify_shutdown", removed);
    }

    /// Queues a mutation of `path` reaches, with the name each reports.
    fn targets(&self, kind: EventKind, path: &Path) -> Vec<(Delivery, String)> {
        let mut targets = Vec::new();
        for (key, name) in hook::watch_keys(path) {
            for delivery in self.registry.deliveries(&key) {
                if kind.matches(delivery.mask) {
                    targets.push((delivery, name.clone()));
                }
            }
        }
        targets
    }

    fn append(
        targets: &[(Delivery, String)],
        kind: EventKind,
        cookie: u32,
        seq: u64,
    ) -> Vec<PushOutcome> {
        targets
            .iter()
            .map(|(delivery, name)| {
                delivery
                    .queue
                    .push(Event::new(kind, name.clone(), cookie, seq))
            })
            .collect()
    }

    fn log_outcomes(
        targets: &[(Delivery, String)],
        outcomes: &[PushOutcome],
        kind: EventKind,
        seq: u64,
    ) {
        for ((delivery, _), outcome) in targets.iter().zip(outcomes) {
            match outcome {
                PushOutcome::Overflowed => debug!(
                    target: "uf::notify",
                    event = "queue_overflow",
                    wd = delivery.wd.0,
                    capacity = delivery.queue.capacity()
                ),
                PushOutcome::Queued => trace!(
                    target: "uf::notify",
                    event = "append",
                    wd = delivery.wd.0,
                    kind = %kind,
                    seq
                ),
                PushOutcome::Coalesced | PushOutcome::Closed => {}
            }
        }
    }

    fn emit(&self, kind: EventKind, path: &Path) {
        let targets = self.targets(kind, path);
        let (seq, outcomes) = {
            let mut counters = self.counters.lock();
            let seq = counters.seq();
            (seq, Self::append(&targets, kind, 0, seq))
        };
        Self::log_outcomes(&targets, &outcomes, kind, seq);
    }
}

impl MutationHook for NotificationManager {
    fn created(&self, path: &Path) {
        self.emit(EventKind::Create, path);
    }

    fn modified(&self, path: &Path) {
        self.emit(EventKind::Modify, path);
    }

    fn deleted(&self, path: &Path) {
        self.emit(EventKind::Delete, path);
    }

    fn accessed(&self, path: &Path) {
        self.emit(EventKind::Access, path);
    }

    fn renamed(&self, from: &Path, to: &Path) {
        let kind = EventKind::Rename;
        let old = self.targets(kind, from);
        let new = self.targets(kind, to);
        let (old_seq, old_outcomes, new_seq, new_outcomes) = {
            let mut counters = self.counters.lock();
            let cookie = counters.cookie();
            let old_seq = counters.seq();
            let old_outcomes = Self::append(&old, kind, cookie, old_seq);
            let new_seq = counters.seq();
            let new_outcomes = Self::append(&new, kind, cookie, new_seq);
            (old_seq, old_outcomes, new_seq, new_outcomes)
        };
        Self::log_outcomes(&old, &old_outcomes, kind, old_seq);
        Self::log_outcomes(&new, &new_outcomes, kind, new_seq);
    }
}
