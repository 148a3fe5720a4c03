//! Thread parking primitive.
//!
//! A one-permit parker: `unpark` stores a permit, `park` consumes one or
//! blocks until one arrives. Used for idle cores, for the dispatch handoff
//! between a core worker and the thread it runs, and for suspended threads
//! waiting to be resumed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
pub(crate) struct Parker {
    notified: AtomicBool,
    lock: Mutex<()>,
    cv: Condvar,
}

impl Parker {
    pub(crate) const fn new() -> Self {
        Self {
            notified: AtomicBool::new(false),
            lock: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    /// Blocks until a permit is available, then consumes it.
    pub(crate) fn park(&self) {
        if self.notified.swap(false, Ordering::Acquire) {
            return;
        }
        let mut guard = self.lock.lock();
        loop {
            if self.notified.swap(false, Ordering::Acquire) {
                return;
            }
            self.cv.wait(&mut guard);
        }
    }

    /// Like [`park`](Self::park) but gives up after `timeout`.
    ///
    /// Returns true if a permit was consumed, false on timeout.
    pub(crate) fn park_timeout(&self, timeout: Duration) -> bool {
        if self.notified.swap(false, Ordering::Acquire) {
            return true;
        }
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock();
        loop {
            if self.notified.swap(false, Ordering::Acquire) {
                return true;
            }
            if self.cv.wait_until(&mut guard, deadline).timed_out() {
                return self.notified.swap(false, Ordering::Acquire);
            }
        }
    }

    /// Makes one permit available and wakes a parked thread if any.
    pub(crate) fn unpark(&self) {
        self.notified.store(true, Ordering::Release);
        // Taking the lock orders the store against a concurrent parker that
        // checked the flag but has not yet begun waiting.
        drop(self.lock.lock());
        self.cv.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn unpark_before_park_returns_immediately() {
        let parker = Parker::new();
        parker.unpark();
        parker.park();
    }

    #[test]
    fn park_timeout_expires_without_permit() {
        let parker = Parker::new();
        assert!(!parker.park_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn cross_thread_unpark_wakes_parker() {
        let parker = Arc::new(Parker::new());
        let remote = parker.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.unpark();
        });
        parker.park();
        handle.join().unwrap();
    }

    #[test]
    fn permit_is_consumed_once() {
        let parker = Parker::new();
        parker.unpark();
        assert!(parker.park_timeout(Duration::from_millis(1)));
        assert!(!parker.park_timeout(Duration::from_millis(1)));
    }
}
