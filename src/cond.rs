//! Interrupt flags and interrupt-aware condition waits.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, MutexGuard};

/// How long a condition wait may sleep between interrupt checks. Bounds the
/// latency with which a waiter observes cancellation that arrives without a
/// matching wakeup.
const INTERRUPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Cancellation signal for one in-flight request or worker.
///
/// The flag transitions once from unset to set. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    flag: Arc<AtomicBool>,
}

impl Interrupt {
    /// A fresh, unset interrupt.
    pub fn new() -> Self {
        Interrupt::default()
    }

    /// Signal cancellation. Idempotent.
    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was signalled.
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// A condition variable whose waits observe an [`Interrupt`] promptly.
#[derive(Debug, Default)]
pub(crate) struct Cond {
    cv: Condvar,
}

impl Cond {
    pub(crate) fn new() -> Self {
        Cond::default()
    }

    /// Block until a wakeup, a timeout tick, or interruption. Returns whether
    /// the interrupt fired; a `false` return says nothing about why we woke,
    /// so callers re-check their predicate in a loop.
    pub(crate) fn wait<T>(&self, guard: &mut MutexGuard<'_, T>, intr: &Interrupt) -> bool {
        if intr.is_set() {
            return true;
        }
        self.cv.wait_for(guard, INTERRUPT_POLL_INTERVAL);
        intr.is_set()
    }

    pub(crate) fn notify_one(&self) {
        self.cv.notify_one();
    }
}
