//! Per-image counters published through the stats pseudo-files.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::pollable::{PollWaker, Pollable};

/// A monotonic counter with a change cookie for pollers.
#[derive(Debug, Default)]
pub struct Stat {
    value: AtomicU64,
    pollable: Pollable,
    closed: AtomicBool,
}

impl Stat {
    /// Add `val` and notify pollers.
    pub fn add(&self, val: u64) {
        self.value.fetch_add(val, Ordering::SeqCst);
        self.pollable.change();
    }

    /// Current value and change cookie.
    pub fn get(&self) -> (u64, u64) {
        (
            self.value.load(Ordering::SeqCst),
            self.pollable.change_cookie(),
        )
    }

    /// Arm `waker` against the cookie sampled by [`get`](Self::get). Returns
    /// whether it fired immediately.
    pub fn add_waker_conditional(&self, waker: Box<dyn PollWaker>, seen_cookie: u64) -> bool {
        self.pollable.add_waker_conditional(waker, seen_cookie)
    }

    /// Mark the stat closed; pseudo-file opens are refused afterwards.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// The counters every image publishes.
#[derive(Debug, Default)]
pub struct ImageStats {
    /// Bytes returned to readers.
    pub bytes_read: Stat,
    /// Bytes accepted from writers.
    pub bytes_written: Stat,
    /// Transport fetches triggered by demand misses or the streamer.
    pub chunk_fetches: Stat,
    /// Fetches avoided because the chunk turned out to be present.
    pub chunk_fetch_skips: Stat,
    /// Chunks copied into the modified overlay.
    pub chunk_dirties: Stat,
    /// Failed fetches and failed cache writes.
    pub io_errors: Stat,
}

impl ImageStats {
    pub(crate) fn new() -> Self {
        ImageStats::default()
    }

    pub(crate) fn close(&self) {
        self.bytes_read.close();
        self.bytes_written.close();
        self.chunk_fetches.close();
        self.chunk_fetch_skips.close();
        self.chunk_dirties.close();
        self.io_errors.close();
    }
}
