//! Lamport Clock
//!
//! Per-process logical counter used to order messages across servers.
//! Every inter-server datagram and every client-visible message carries
//! a value drawn from this clock.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lamport timestamp
pub type LamportTs = u64;

/// Monotonic logical clock shared by every task in the process
#[derive(Debug, Default)]
pub struct LamportClock {
    counter: AtomicU64,
}

impl LamportClock {
    /// Create a clock starting at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the clock for a local event and return the new value
    pub fn tick(&self) -> LamportTs {
        self.counter.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Merge a timestamp seen on an incoming message.
    ///
    /// Sets the counter to `max(local, external) + 1` and returns it.
    pub fn observe(&self, external: LamportTs) -> LamportTs {
        let previous = self
            .counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |local| {
                Some(local.max(external).saturating_add(1))
            })
            .unwrap_or_else(|current| current);
        previous.max(external).saturating_add(1)
    }

    /// Current value without advancing
    pub fn now(&self) -> LamportTs {
        self.counter.load(Ordering::Acquire)
    }
}
