//! Change-cookie notification for poll-for-change consumers.
//!
//! A reader samples a value together with a change cookie, then arms a waker
//! conditional on that cookie. If the value changed in between, the waker
//! fires immediately; otherwise it fires on the next change.

use parking_lot::Mutex;
use smallvec::SmallVec;

/// Wakes one pending poll request. Consumed on first use.
pub trait PollWaker: Send {
    /// Fire the pending poll.
    fn wake(self: Box<Self>);
}

impl<F: FnOnce() + Send> PollWaker for F {
    fn wake(self: Box<Self>) {
        self()
    }
}

#[derive(Default)]
struct PollableInner {
    cookie: u64,
    wakers: SmallVec<[Box<dyn PollWaker>; 2]>,
}

/// A change cookie plus the subscribers armed against it.
#[derive(Default)]
pub struct Pollable {
    inner: Mutex<PollableInner>,
}

impl Pollable {
    pub(crate) fn new() -> Self {
        Pollable::default()
    }

    /// Current change cookie.
    pub fn change_cookie(&self) -> u64 {
        self.inner.lock().cookie
    }

    /// Record a change: advance the cookie and fire every armed waker.
    pub fn change(&self) {
        let wakers = {
            let mut inner = self.inner.lock();
            inner.cookie += 1;
            std::mem::take(&mut inner.wakers)
        };
        for waker in wakers {
            waker.wake();
        }
    }

    /// Arm `waker`, or fire it immediately when `changed` is already known.
    pub fn add_waker(&self, waker: Box<dyn PollWaker>, changed: bool) {
        if changed {
            waker.wake();
        } else {
            self.inner.lock().wakers.push(waker);
        }
    }

    /// Arm `waker` unless the cookie already advanced past `seen_cookie`, in
    /// which case it fires now. Returns whether it fired.
    pub fn add_waker_conditional(&self, waker: Box<dyn PollWaker>, seen_cookie: u64) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.cookie == seen_cookie {
                inner.wakers.push(waker);
                return false;
            }
        }
        waker.wake();
        true
    }
}

impl std::fmt::Debug for Pollable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Pollable")
            .field("cookie", &inner.cookie)
            .field("wakers", &inner.wakers.len())
            .finish()
    }
}
