//! Access pattern classification and background prefetch.
//!
//! Each open handle carries an [`AccessStream`]. In-order requests build up
//! a sequential count; once it reaches the threshold the stream is
//! [`AccessPattern::Sequential`] and the cache prefetches the next window of
//! blocks. A single out-of-order request while sequential only costs one
//! count; two in a row demote the stream to random. Prefetch never runs for
//! random or unknown streams.

use crate::SlotKey;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, trace};
use uf_types::{BlockNumber, HandleId, VolumeId};

/// Classified access pattern of one handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessPattern {
    Unknown,
    Sequential,
    Random,
}

/// Per-handle classifier state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessStream {
    volume: VolumeId,
    last: Option<BlockNumber>,
    sequential_count: u32,
    out_of_order_run: u32,
    pattern: AccessPattern,
}

impl AccessStream {
    #[must_use]
    pub fn new(volume: VolumeId) -> Self {
        Self {
            volume,
            last: None,
            sequential_count: 0,
            out_of_order_run: 0,
            pattern: AccessPattern::Unknown,
        }
    }

    #[must_use]
    pub fn pattern(&self) -> AccessPattern {
        self.pattern
    }

    #[must_use]
    pub fn sequential_count(&self) -> u32 {
        self.sequential_count
    }

    /// Feed one request and return the resulting pattern.
    pub fn observe(&mut self, block: BlockNumber, threshold: u32) -> AccessPattern {
        let Some(last) = self.last else {
            self.last = Some(block);
            return self.pattern;
        };

        if block == last {
            // Re-reading the same block says nothing about direction.
            return self.pattern;
        }

        if block.follows(last) {
            self.sequential_count = self.sequential_count.saturating_add(1);
            self.out_of_order_run = 0;
            if self.sequential_count >= threshold {
                self.pattern = AccessPattern::Sequential;
            }
        } else {
            match self.pattern {
                AccessPattern::Sequential => {
                    self.out_of_order_run += 1;
                    if self.out_of_order_run >= 2 {
                        self.pattern = AccessPattern::Random;
                        self.sequential_count = 0;
                        self.out_of_order_run = 0;
                    } else {
                        self.sequential_count = self.sequential_count.saturating_sub(1);
                    }
                }
                AccessPattern::Unknown | AccessPattern::Random => {
                    self.pattern = AccessPattern::Random;
                    self.sequential_count = 0;
                }
            }
        }
        self.last = Some(block);
        self.pattern
    }
}

/// Classifier state for every open handle.
#[derive(Debug, Default)]
pub(crate) struct StreamTable {
    streams: Mutex<HashMap<HandleId, AccessStream>>,
}

impl StreamTable {
    pub(crate) fn observe(
        &self,
        handle: HandleId,
        volume: VolumeId,
        block: BlockNumber,
        threshold: u32,
    ) -> AccessPattern {
        let mut streams = self.streams.lock();
        let stream = streams
            .entry(handle)
            .or_insert_with(|| AccessStream::new(volume));
        if stream.volume != volume {
            *stream = AccessStream::new(volume);
        }
        let pattern = stream.observe(block, threshold);
        drop(streams);
        trace!(handle = handle.0, block = block.0, ?pattern, "access_observed");
        pattern
    }

    pub(crate) fn pattern(&self, handle: HandleId) -> Option<AccessPattern> {
        self.streams.lock().get(&handle).map(AccessStream::pattern)
    }

    pub(crate) fn forget(&self, handle: HandleId) {
        self.streams.lock().remove(&handle);
    }

    pub(crate) fn forget_volume(&self, volume: VolumeId) {
        self.streams.lock().retain(|_, s| s.volume != volume);
    }
}

/// Outcome of submitting a prefetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Submit {
    Queued,
    AlreadyQueued,
    Dropped,
}

#[derive(Debug, Default)]
struct InFlight {
    keys: HashSet<SlotKey>,
}

/// Shared between the submitting side and the workers.
#[derive(Debug, Default)]
struct PrefetchShared {
    in_flight: Mutex<InFlight>,
    idle: Condvar,
}

/// Bounded pool of background prefetch threads.
///
/// Requests go through a bounded channel; a full channel drops the request.
/// Dropping the pool closes the channel and joins the workers.
pub(crate) struct Prefetcher {
    tx: Option<SyncSender<SlotKey>>,
    workers: Vec<JoinHandle<()>>,
    shared: Arc<PrefetchShared>,
}

impl Prefetcher {
    /// Spawn `workers` threads that run `handler` for every request.
    pub(crate) fn spawn<F>(workers: usize, depth: usize, handler: F) -> std::io::Result<Self>
    where
        F: Fn(SlotKey) + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::sync_channel::<SlotKey>(depth);
        let rx = Arc::new(Mutex::new(rx));
        let handler = Arc::new(handler);
        let shared = Arc::new(PrefetchShared::default());
        let mut handles = Vec::with_capacity(workers);
        for idx in 0..workers {
            let rx = Arc::clone(&rx);
            let handler = Arc::clone(&handler);
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("uf-prefetch-{idx}"))
                .spawn(move || worker_loop(&rx, handler.as_ref(), &shared))?;
            handles.push(handle);
        }
        debug!(workers, depth, "prefetch pool started");
        Ok(Self {
            tx: Some(tx),
            workers: handles,
            shared,
        })
    }

    pub(crate) fn submit(&self, key: SlotKey) -> Submit {
        let Some(tx) = &self.tx else {
            return Submit::Dropped;
        };
        let mut in_flight = self.shared.in_flight.lock();
        if !in_flight.keys.insert(key) {
            return Submit::AlreadyQueued;
        }
        match tx.try_send(key) {
            Ok(()) => Submit::Queued,
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                in_flight.keys.remove(&key);
                Submit::Dropped
            }
        }
    }

    /// Wait until no prefetch is queued or running. Returns `false` on timeout.
    pub(crate) fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut in_flight = self.shared.in_flight.lock();
        while !in_flight.keys.is_empty() {
            if self
                .shared
                .idle
                .wait_until(&mut in_flight, deadline)
                .timed_out()
            {
                return in_flight.keys.is_empty();
            }
        }
        true
    }

    pub(crate) fn shutdown(&mut self) {
        self.tx = None;
        let workers = std::mem::take(&mut self.workers);
        let count = workers.len();
        for handle in workers {
            let _ = handle.join();
        }
        if count > 0 {
            debug!(workers = count, "prefetch pool stopped");
        }
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Prefetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prefetcher")
            .field("workers", &self.workers.len())
            .field("in_flight", &self.shared.in_flight.lock().keys.len())
            .finish()
    }
}

fn worker_loop(rx: &Mutex<Receiver<SlotKey>>, handler: &dyn Fn(SlotKey), shared: &PrefetchShared) {
    loop {
        let next = rx.lock().recv();
        let Ok(key) = next else {
            return;
        };
        handler(key);
        let mut in_flight = shared.in_flight.lock();
        in_flight.keys.remove(&key);
        if in_flight.keys.is_empty() {
            shared.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn feed(stream: &mut AccessStream, blocks: &[u64]) -> AccessPattern {
        let mut pattern = stream.pattern();
        for b in blocks {
            pattern = stream.observe(BlockNumber(*b), 2);
        }
        pattern
    }

    #[test]
    fn in_order_requests_become_sequential_at_threshold() {
        let mut stream = AccessStream::new(VolumeId(0));
        assert_eq!(feed(&mut stream, &[10]), AccessPattern::Unknown);
        assert_eq!(feed(&mut stream, &[11]), AccessPattern::Unknown);
        assert_eq!(feed(&mut stream, &[12]), AccessPattern::Sequential);
    }

    #[test]
    fn single_out_of_order_request_does_not_demote() {
        let mut stream = AccessStream::new(VolumeId(0));
        feed(&mut stream, &[0, 1, 2, 3]);
        assert_eq!(stream.sequential_count(), 3);
        assert_eq!(feed(&mut stream, &[50]), AccessPattern::Sequential);
        assert_eq!(stream.sequential_count(), 2);
        assert_eq!(feed(&mut stream, &[51]), AccessPattern::Sequential);
    }

    #[test]
    fn two_out_of_order_requests_demote_to_random() {
        let mut stream = AccessStream::new(VolumeId(0));
        feed(&mut stream, &[0, 1, 2]);
        assert_eq!(feed(&mut stream, &[40, 7]), AccessPattern::Random);
        assert_eq!(stream.sequential_count(), 0);
    }

    #[test]
    fn random_stream_resets_and_can_recover() {
        let mut stream = AccessStream::new(VolumeId(0));
        assert_eq!(feed(&mut stream, &[5, 90, 17]), AccessPattern::Random);
        assert_eq!(feed(&mut stream, &[18]), AccessPattern::Random);
        assert_eq!(feed(&mut stream, &[3]), AccessPattern::Random);
        assert_eq!(stream.sequential_count(), 0);
        assert_eq!(feed(&mut stream, &[4, 5]), AccessPattern::Sequential);
    }

    #[test]
    fn repeated_block_is_neutral() {
        let mut stream = AccessStream::new(VolumeId(0));
        feed(&mut stream, &[0, 1, 1, 1]);
        assert_eq!(stream.sequential_count(), 1);
        assert_eq!(feed(&mut stream, &[2]), AccessPattern::Sequential);
    }

    #[test]
    fn stream_table_resets_on_volume_change() {
        let table = StreamTable::default();
        for b in 0..3 {
            table.observe(HandleId(1), VolumeId(0), BlockNumber(b), 2);
        }
        assert_eq!(table.pattern(HandleId(1)), Some(AccessPattern::Sequential));
        table.observe(HandleId(1), VolumeId(1), BlockNumber(3), 2);
        assert_eq!(table.pattern(HandleId(1)), Some(AccessPattern::Unknown));
        table.forget(HandleId(1));
        assert_eq!(table.pattern(HandleId(1)), None);
    }

    #[test]
    fn prefetcher_runs_handler_and_reports_idle() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let mut pool = Prefetcher::spawn(2, 16, move |_key| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .expect("spawn");
        for b in 0..8 {
            let submitted = pool.submit(SlotKey::new(VolumeId(0), BlockNumber(b)));
            assert_ne!(submitted, Submit::Dropped);
        }
        assert!(pool.wait_idle(Duration::from_secs(5)));
        pool.shutdown();
        assert_eq!(seen.load(Ordering::SeqCst), 8);
        assert_eq!(
            pool.submit(SlotKey::new(VolumeId(0), BlockNumber(0))),
            Submit::Dropped
        );
    }
}
