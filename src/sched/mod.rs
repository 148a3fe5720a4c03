//! Scheduling: per-core run queues, the dispatch loop, and placement.

pub(crate) mod core;
pub(crate) mod park;
pub(crate) mod queue;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::warn;

use crate::runtime::RuntimeShared;
use crate::thread::ThreadId;

/// Where a runnable thread should go.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Placement {
    /// Tail of a specific core's FIFO.
    Core(usize),
    /// A specific core's handoff slot, ahead of its FIFO.
    Next(usize),
    /// No affinity: round-robin over accepting cores.
    External,
}

/// Enqueues a runnable thread, falling back to round-robin placement when
/// the preferred core no longer accepts work (inactive or draining).
pub(crate) fn enqueue(rt: &Arc<RuntimeShared>, id: ThreadId, placement: Placement) {
    match placement {
        Placement::Core(idx) => {
            if let Some(core) = rt.cores.get(idx) {
                if core.queue.push(id) {
                    core.idle.unpark();
                    return;
                }
            }
        }
        Placement::Next(idx) => {
            if let Some(core) = rt.cores.get(idx) {
                if core.queue.push_next(id) {
                    core.idle.unpark();
                    return;
                }
            }
        }
        Placement::External => {}
    }
    let n = rt.cores.len();
    let start = rt.rr_next.fetch_add(1, Ordering::Relaxed);
    for off in 0..n {
        let core = &rt.cores[start.wrapping_add(off) % n];
        if core.queue.push(id) {
            core.idle.unpark();
            return;
        }
    }
    // Only reachable during shutdown, once every queue has closed.
    warn!(thread = ?id, "no core accepting work; dropping runnable thread");
}
