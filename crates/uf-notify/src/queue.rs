//! Bounded per-watch event queue.
//!
//! Appends never block. When the queue is full the first dropped event is
//! replaced by a single overflow marker, stored past the capacity; later
//! drops are only counted. The overflowed state clears once a drain leaves
//! fewer than `capacity` entries behind.

use crate::event::Event;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// How a drain waits when the queue is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainMode {
    /// Return immediately.
    NonBlocking,
    /// Wait until an event arrives or the watch is removed.
    Blocking,
    /// Wait at most the given duration.
    Timeout(Duration),
}

/// Result of appending one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The queue just filled up; an overflow marker was appended instead.
    Overflowed,
    /// Already overflowed; the event was counted and dropped.
    Coalesced,
    /// The watch is gone.
    Closed,
}

/// Events removed by one drain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Drained {
    pub events: Vec<Event>,
    /// Set when the queue is closed; no further events will arrive.
    pub closed: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    events: VecDeque<Event>,
    overflowed: bool,
    dropped: u64,
    closed: bool,
}

impl QueueState {
    fn take(&mut self, max: usize, capacity: usize) -> Vec<Event> {
        let count = max.min(self.events.len());
        let taken: Vec<Event> = self.events.drain(..count).collect();
        if self.overflowed && self.events.len() < capacity {
            self.overflowed = false;
        }
        taken
    }
}

#[derive(Debug)]
pub struct EventQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl EventQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(QueueState::default()),
            ready: Condvar::new(),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&self, event: Event) -> PushOutcome {
        let mut state = self.state.lock();
        let outcome = if state.closed {
            PushOutcome::Closed
        } else if !state.overflowed && state.events.len() < self.capacity {
            state.events.push_back(event);
            PushOutcome::Queued
        } else if !state.overflowed {
            state.overflowed = true;
            state.dropped += 1;
            state.events.push_back(Event::overflow(event.seq));
            PushOutcome::Overflowed
        } else {
            state.dropped += 1;
            PushOutcome::Coalesced
        };
        drop(state);
        if matches!(outcome, PushOutcome::Queued | PushOutcome::Overflowed) {
            self.ready.notify_all();
        }
        outcome
    }

    /// Remove up to `max` events in FIFO order, waiting per `mode`.
    ///
    /// `max == 0` returns at once without looking at the queue.
    pub fn drain(&self, max: usize, mode: DrainMode) -> Drained {
        if max == 0 {
            return Drained {
                events: Vec::new(),
                closed: self.is_closed(),
            };
        }
        let deadline = match mode {
            DrainMode::Timeout(timeout) => Some(Instant::now() + timeout),
            DrainMode::NonBlocking | DrainMode::Blocking => None,
        };
        let mut state = self.state.lock();
        loop {
            if !state.events.is_empty() || state.closed {
                let events = state.take(max, self.capacity);
                return Drained {
                    events,
                    closed: state.closed,
                };
            }
            match (mode, deadline) {
                (DrainMode::NonBlocking, _) => break,
                (DrainMode::Blocking, _) => self.ready.wait(&mut state),
                (DrainMode::Timeout(_), Some(deadline)) => {
                    if self.ready.wait_until(&mut state, deadline).timed_out() {
                        let events = state.take(max, self.capacity);
                        return Drained {
                            events,
                            closed: state.closed,
                        };
                    }
                }
                (DrainMode::Timeout(_), None) => break,
            }
        }
        Drained {
            events: Vec::new(),
            closed: false,
        }
    }

    /// Mark the queue closed and wake every blocked drainer.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_all();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events dropped because the queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use std::sync::Arc;
    use std::thread;

    fn ev(seq: u64) -> Event {
        Event::new(EventKind::Modify, "f", 0, seq)
    }

    #[test]
    fn overflow_appends_exactly_one_marker() {
        let queue = EventQueue::new(4);
        for seq in 0..4 {
            assert_eq!(queue.push(ev(seq)), PushOutcome::Queued);
        }
        assert_eq!(queue.push(ev(4)), PushOutcome::Overflowed);
        for seq in 5..20 {
            assert_eq!(queue.push(ev(seq)), PushOutcome::Coalesced);
        }
        assert_eq!(queue.len(), 5);
        assert_eq!(queue.dropped(), 16);

        let drained = queue.drain(100, DrainMode::NonBlocking).events;
        let seqs: Vec<u64> = drained.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
        assert!(drained[4].is_overflow());
        assert_eq!(drained.iter().filter(|e| e.is_overflow()).count(), 1);
    }

    #[test]
    fn overflow_state_clears_once_drain_makes_room() {
        let queue = EventQueue::new(2);
        queue.push(ev(0));
        queue.push(ev(1));
        queue.push(ev(2));
        // Two entries left (one event plus the marker): still overflowed.
        assert_eq!(queue.drain(1, DrainMode::NonBlocking).events.len(), 1);
        assert_eq!(queue.push(ev(3)), PushOutcome::Coalesced);
        queue.drain(1, DrainMode::NonBlocking);
        assert_eq!(queue.push(ev(4)), PushOutcome::Queued);
        let rest = queue.drain(10, DrainMode::NonBlocking).events;
        assert!(rest[0].is_overflow());
        assert_eq!(rest[1].seq, 4);
    }

    #[test]
    fn zero_max_returns_immediately() {
        let queue = EventQueue::new(2);
        queue.push(ev(0));
        let drained = queue.drain(0, DrainMode::Blocking);
        assert!(drained.events.is_empty());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn timeout_drain_gives_up() {
        let queue = EventQueue::new(2);
        let drained = queue.drain(1, DrainMode::Timeout(Duration::from_millis(20)));
        assert!(drained.events.is_empty());
        assert!(!drained.closed);
    }

    #[test]
    fn close_wakes_blocked_drainer() {
        let queue = Arc::new(EventQueue::new(2));
        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.drain(8, DrainMode::Blocking))
        };
        thread::sleep(Duration::from_millis(20));
        queue.close();
        let drained = waiter.join().expect("join");
        assert!(drained.events.is_empty());
        assert!(drained.closed);
        assert_eq!(queue.push(ev(1)), PushOutcome::Closed);
    }

    #[test]
    fn push_wakes_blocked_drainer() {
        let queue = Arc::new(EventQueue::new(2));
        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.drain(8, DrainMode::Timeout(Duration::from_secs(10))))
        };
        thread::sleep(Duration::from_millis(20));
        queue.push(ev(7));
        let drained = waiter.join().expect("join");
        assert_eq!(drained.events, vec![ev(7)]);
    }
}
