//! The per-chunk lock table and the authoritative image size.
//!
//! One mutex protects the lock table, the image size, and the closed flag.
//! Chunk locks serialize all work on a chunk without serializing across
//! chunks; lock entries exist only while held or waited on. While a lock for
//! chunk `k` is held, the image size is never reduced to impinge on `k` (the
//! size controller in [`crate::image`] consults this table before shrinking).

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::cond::{Cond, Interrupt};
use crate::error::{IoError, IoResult};
use crate::pollable::Pollable;

struct ChunkLock {
    busy: bool,
    waiters: u32,
    available: Arc<Cond>,
}

/// State guarded by the chunk-state mutex.
pub(crate) struct ChunkStateInner {
    locks: HashMap<u64, ChunkLock>,
    pub(crate) image_size: u64,
    pub(crate) closed: bool,
}

impl ChunkStateInner {
    /// Whether any actor holds or waits on the lock for `chunk`.
    pub(crate) fn is_locked(&self, chunk: u64) -> bool {
        self.locks.contains_key(&chunk)
    }

    #[cfg(test)]
    pub(crate) fn lock_count(&self) -> usize {
        self.locks.len()
    }
}

/// Lock table plus image-size state shared by the engine, the streamer, and
/// the size controller.
pub(crate) struct ChunkState {
    pub(crate) inner: Mutex<ChunkStateInner>,
    /// Bumped on every size change and on close.
    pub(crate) size_pollable: Pollable,
}

impl ChunkState {
    pub(crate) fn new(initial_size: u64) -> Self {
        ChunkState {
            inner: Mutex::new(ChunkStateInner {
                locks: HashMap::new(),
                image_size: initial_size,
                closed: false,
            }),
            size_pollable: Pollable::new(),
        }
    }

    /// Acquire the lock for `chunk`, waiting for the current holder if there
    /// is one. Fails only when the wait was interrupted; a waiter that both
    /// wins the lock and is interrupted prefers winning, so this path never
    /// has to free the entry.
    pub(crate) fn try_lock_locked(
        &self,
        guard: &mut MutexGuard<'_, ChunkStateInner>,
        chunk: u64,
        intr: &Interrupt,
    ) -> IoResult<()> {
        if !guard.locks.contains_key(&chunk) {
            guard.locks.insert(
                chunk,
                ChunkLock {
                    busy: true,
                    waiters: 0,
                    available: Arc::new(Cond::new()),
                },
            );
            return Ok(());
        }

        let available = {
            let entry = guard.locks.get_mut(&chunk).expect("entry checked above");
            entry.waiters += 1;
            entry.available.clone()
        };
        // The entry cannot disappear while our waiter count pins it.
        let mut interrupted = false;
        loop {
            if !guard.locks.get(&chunk).expect("entry pinned by waiter").busy {
                break;
            }
            if available.wait(guard, intr) {
                interrupted = true;
                break;
            }
        }
        let entry = guard.locks.get_mut(&chunk).expect("entry pinned by waiter");
        entry.waiters -= 1;
        if entry.busy {
            debug_assert!(interrupted);
            return Err(IoError::Interrupted);
        }
        entry.busy = true;
        Ok(())
    }

    /// Release the lock for `chunk`: hand it to one waiter, or drop the entry.
    pub(crate) fn unlock_locked(guard: &mut MutexGuard<'_, ChunkStateInner>, chunk: u64) {
        let entry = guard
            .locks
            .get_mut(&chunk)
            .expect("unlock of chunk that is not locked");
        if entry.waiters > 0 {
            entry.busy = false;
            entry.available.notify_one();
        } else {
            guard.locks.remove(&chunk);
        }
    }

    /// Lock `chunk` and return the image size, which will not be reduced to
    /// impinge on `chunk` while the lock is held.
    pub(crate) fn try_lock(&self, chunk: u64, intr: &Interrupt) -> IoResult<u64> {
        let mut guard = self.inner.lock();
        self.try_lock_locked(&mut guard, chunk, intr)?;
        Ok(guard.image_size)
    }

    /// Like [`try_lock`](Self::try_lock), but first guarantees the image size
    /// covers `needed_size`, expanding through `expand` atomically with the
    /// acquisition.
    pub(crate) fn try_lock_ensure_size<F>(
        &self,
        chunk: u64,
        needed_size: u64,
        expand: F,
        intr: &Interrupt,
    ) -> IoResult<u64>
    where
        F: FnOnce(&mut ChunkStateInner, u64) -> IoResult<()>,
    {
        let mut guard = self.inner.lock();
        if guard.image_size < needed_size {
            expand(&mut guard, needed_size)?;
        }
        self.try_lock_locked(&mut guard, chunk, intr)?;
        Ok(guard.image_size)
    }

    pub(crate) fn unlock(&self, chunk: u64) {
        let mut guard = self.inner.lock();
        Self::unlock_locked(&mut guard, chunk);
    }

    /// Lock every chunk in `range` under a single mutex hold. On interruption
    /// the chunks already acquired are released in reverse order.
    pub(crate) fn lock_range(&self, range: Range<u64>, intr: &Interrupt) -> IoResult<()> {
        let mut guard = self.inner.lock();
        for chunk in range.clone() {
            if let Err(err) = self.try_lock_locked(&mut guard, chunk, intr) {
                for acquired in (range.start..chunk).rev() {
                    Self::unlock_locked(&mut guard, acquired);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Release every chunk in `range` under a single mutex hold.
    pub(crate) fn unlock_range(&self, range: Range<u64>) {
        let mut guard = self.inner.lock();
        for chunk in range {
            Self::unlock_locked(&mut guard, chunk);
        }
    }

    /// Atomic snapshot of the image size and its change cookie.
    pub(crate) fn size(&self) -> (u64, u64) {
        let guard = self.inner.lock();
        let cookie = self.size_pollable.change_cookie();
        (guard.image_size, cookie)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;

    fn state() -> Arc<ChunkState> {
        Arc::new(ChunkState::new(16384))
    }

    #[test]
    fn lock_unlock_drops_entry() {
        let cs = state();
        let intr = Interrupt::new();
        assert_eq!(cs.try_lock(7, &intr).unwrap(), 16384);
        assert!(cs.inner.lock().is_locked(7));
        cs.unlock(7);
        assert_eq!(cs.inner.lock().lock_count(), 0);
    }

    #[test]
    fn contended_lock_is_handed_over() {
        let cs = state();
        let intr = Interrupt::new();
        cs.try_lock(3, &intr).unwrap();

        let contender = {
            let cs = cs.clone();
            thread::spawn(move || {
                let intr = Interrupt::new();
                cs.try_lock(3, &intr).unwrap();
                cs.unlock(3);
            })
        };
        thread::sleep(Duration::from_millis(50));
        cs.unlock(3);
        contender.join().unwrap();
        assert_eq!(cs.inner.lock().lock_count(), 0);
    }

    #[test]
    fn interrupted_wait_fails_and_leaves_holder() {
        let cs = state();
        let intr = Interrupt::new();
        cs.try_lock(5, &intr).unwrap();

        let waiter_intr = Interrupt::new();
        let waiter = {
            let cs = cs.clone();
            let waiter_intr = waiter_intr.clone();
            thread::spawn(move || cs.try_lock(5, &waiter_intr))
        };
        thread::sleep(Duration::from_millis(50));
        waiter_intr.set();
        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(IoError::Interrupted)));
        // The holder still owns the lock and can release it normally.
        assert!(cs.inner.lock().is_locked(5));
        cs.unlock(5);
        assert_eq!(cs.inner.lock().lock_count(), 0);
    }

    #[test]
    fn ensure_size_expands_before_acquiring() {
        let cs = state();
        let intr = Interrupt::new();
        let size = cs
            .try_lock_ensure_size(
                5,
                20001,
                |inner, new_size| {
                    inner.image_size = new_size;
                    Ok(())
                },
                &intr,
            )
            .unwrap();
        assert_eq!(size, 20001);
        cs.unlock(5);
        assert_eq!(cs.size().0, 20001);
    }

    #[test]
    fn lock_range_unwinds_on_interrupt() {
        let cs = state();
        let intr = Interrupt::new();
        cs.try_lock(2, &intr).unwrap();

        let pre_set = Interrupt::new();
        pre_set.set();
        // Chunk 2 is busy and the interrupt is already pending, so the range
        // acquisition fails and must release chunks 0 and 1.
        assert!(matches!(
            cs.lock_range(0..4, &pre_set),
            Err(IoError::Interrupted)
        ));
        assert_eq!(cs.inner.lock().lock_count(), 1);
        cs.unlock(2);
        assert_eq!(cs.inner.lock().lock_count(), 0);
    }
}
