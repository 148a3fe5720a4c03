//! Per-core run queue.
//!
//! FIFO dispatch order for default enqueues, plus a single handoff slot
//! that runs ahead of the FIFO (used by park-and-switch and real-time
//! wakes). Local pop and remote steal both go through the queue mutex, so
//! a thread id is owned by exactly one queue at a time. The queue also
//! stamps when it became non-empty, feeding the standing-age congestion
//! signal.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::thread::ThreadId;
use crate::util::mono_us;

#[derive(Debug)]
pub(crate) struct RunQueue {
    inner: Mutex<QueueInner>,
    /// Monotonic timestamp of the last empty-to-nonempty transition, or 0
    /// while the queue is empty.
    nonempty_since_us: AtomicU64,
}

#[derive(Debug)]
struct QueueInner {
    next: Option<ThreadId>,
    fifo: VecDeque<ThreadId>,
    accepting: bool,
}

impl QueueInner {
    fn is_empty(&self) -> bool {
        self.next.is_none() && self.fifo.is_empty()
    }
}

impl RunQueue {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                next: None,
                fifo: VecDeque::new(),
                accepting: false,
            }),
            nonempty_since_us: AtomicU64::new(0),
        }
    }

    /// Enqueues at the FIFO tail. Returns false if the queue is not
    /// accepting (core inactive or draining); the caller must place the
    /// thread elsewhere.
    pub(crate) fn push(&self, id: ThreadId) -> bool {
        let mut inner = self.inner.lock();
        if !inner.accepting {
            return false;
        }
        if inner.is_empty() {
            self.nonempty_since_us.store(mono_us(), Ordering::Release);
        }
        inner.fifo.push_back(id);
        true
    }

    /// Places `id` in the handoff slot, ahead of the FIFO. A thread already
    /// occupying the slot is demoted to the FIFO head.
    pub(crate) fn push_next(&self, id: ThreadId) -> bool {
        let mut inner = self.inner.lock();
        if !inner.accepting {
            return false;
        }
        if inner.is_empty() {
            self.nonempty_since_us.store(mono_us(), Ordering::Release);
        }
        if let Some(prev) = inner.next.replace(id) {
            inner.fifo.push_front(prev);
        }
        true
    }

    /// Takes the next thread to dispatch: the handoff slot first, then the
    /// FIFO head.
    pub(crate) fn pop(&self) -> Option<ThreadId> {
        let mut inner = self.inner.lock();
        let id = inner.next.take().or_else(|| inner.fifo.pop_front());
        if inner.is_empty() {
            self.nonempty_since_us.store(0, Ordering::Release);
        }
        id
    }

    /// Steals one thread from the FIFO head. The handoff slot is never
    /// stolen: it is a core-local promise.
    pub(crate) fn steal(&self) -> Option<ThreadId> {
        let mut inner = self.inner.lock();
        let id = inner.fifo.pop_front();
        if id.is_some() && inner.is_empty() {
            self.nonempty_since_us.store(0, Ordering::Release);
        }
        id
    }

    /// Stops accepting and removes every queued thread, in dispatch order.
    pub(crate) fn drain(&self) -> SmallVec<[ThreadId; 8]> {
        let mut inner = self.inner.lock();
        inner.accepting = false;
        let mut out = SmallVec::new();
        out.extend(inner.next.take());
        out.extend(inner.fifo.drain(..));
        self.nonempty_since_us.store(0, Ordering::Release);
        out
    }

    pub(crate) fn set_accepting(&self, accepting: bool) {
        self.inner.lock().accepting = accepting;
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Timestamp of the last empty-to-nonempty transition, 0 if empty.
    pub(crate) fn nonempty_since_us(&self) -> u64 {
        self.nonempty_since_us.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::ArenaIndex;

    fn id(n: u32) -> ThreadId {
        ThreadId(ArenaIndex::new(n, 0))
    }

    fn accepting_queue() -> RunQueue {
        let q = RunQueue::new();
        q.set_accepting(true);
        q
    }

    #[test]
    fn fifo_order_for_default_enqueues() {
        let q = accepting_queue();
        q.push(id(1));
        q.push(id(2));
        q.push(id(3));
        assert_eq!(q.pop(), Some(id(1)));
        assert_eq!(q.pop(), Some(id(2)));
        assert_eq!(q.pop(), Some(id(3)));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn handoff_slot_runs_ahead_of_fifo() {
        let q = accepting_queue();
        q.push(id(1));
        q.push_next(id(2));
        assert_eq!(q.pop(), Some(id(2)));
        assert_eq!(q.pop(), Some(id(1)));
    }

    #[test]
    fn displaced_handoff_goes_to_fifo_head() {
        let q = accepting_queue();
        q.push(id(1));
        q.push_next(id(2));
        q.push_next(id(3));
        assert_eq!(q.pop(), Some(id(3)));
        assert_eq!(q.pop(), Some(id(2)));
        assert_eq!(q.pop(), Some(id(1)));
    }

    #[test]
    fn steal_never_takes_the_handoff_slot() {
        let q = accepting_queue();
        q.push_next(id(1));
        assert_eq!(q.steal(), None);
        q.push(id(2));
        assert_eq!(q.steal(), Some(id(2)));
        assert_eq!(q.pop(), Some(id(1)));
    }

    #[test]
    fn nonaccepting_queue_rejects_pushes() {
        let q = RunQueue::new();
        assert!(!q.push(id(1)));
        assert!(!q.push_next(id(1)));
        q.set_accepting(true);
        assert!(q.push(id(1)));
    }

    #[test]
    fn nonempty_stamp_tracks_transitions() {
        let q = accepting_queue();
        assert_eq!(q.nonempty_since_us(), 0);
        q.push(id(1));
        let stamp = q.nonempty_since_us();
        assert_ne!(stamp, 0);
        // Staying non-empty must not refresh the stamp.
        q.push(id(2));
        assert_eq!(q.nonempty_since_us(), stamp);
        q.pop();
        assert_eq!(q.nonempty_since_us(), stamp);
        q.pop();
        assert_eq!(q.nonempty_since_us(), 0, "stamp must clear when drained");
    }

    #[test]
    fn drain_empties_and_stops_accepting() {
        let q = accepting_queue();
        q.push(id(1));
        q.push_next(id(2));
        q.push(id(3));
        let drained = q.drain();
        assert_eq!(drained.as_slice(), &[id(2), id(1), id(3)]);
        assert!(q.is_empty());
        assert!(!q.push(id(4)), "drained queue must reject new work");
        assert_eq!(q.nonempty_since_us(), 0);
    }

    #[test]
    fn concurrent_steal_never_duplicates_a_thread() {
        use std::collections::HashSet;
        use std::sync::{Arc, Barrier, Mutex};

        let q = Arc::new(accepting_queue());
        for n in 0..1000 {
            q.push(id(n));
        }
        let seen = Arc::new(Mutex::new(HashSet::new()));
        let barrier = Arc::new(Barrier::new(4));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let q = q.clone();
            let seen = seen.clone();
            let barrier = barrier.clone();
            handles.push(std::thread::spawn(move || {
                barrier.wait();
                while let Some(got) = q.steal() {
                    assert!(
                        seen.lock().unwrap().insert(got),
                        "thread {got:?} stolen twice"
                    );
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(seen.lock().unwrap().len(), 1000);
    }
}
