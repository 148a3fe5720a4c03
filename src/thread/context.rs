//! Execution context handoff.
//!
//! Each backing OS thread owns a [`SwitchPad`]: the rendezvous object
//! through which a core worker hands the core to a thread and gets it
//! back at the next suspension point. A suspended thread is a backing
//! thread parked on its pad's run gate; resuming it is storing the
//! dispatcher's return gate in the pad and unparking the run gate.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use nix::sys::pthread::{pthread_self, Pthread};
use parking_lot::Mutex;
use tracing::error;

use crate::sched::park::Parker;
use crate::thread::current::{self, Context};
use crate::thread::pool::StartRequest;
use crate::thread::ThreadExit;
use crate::thread::ThreadId;
use crate::{preempt, runtime::RuntimeShared};

#[derive(Debug)]
pub(crate) struct SwitchPad {
    /// Parked on by the owning backing thread while suspended.
    run_gate: Parker,
    /// The dispatcher to release when this thread next suspends. Taken out
    /// of the pad before the thread becomes stealable, so a second
    /// dispatcher can never clobber an unreleased gate.
    return_gate: Mutex<Option<Arc<Parker>>>,
    /// Core index this thread currently belongs to. Valid only while
    /// RUNNING; refreshed on every dispatch.
    core: AtomicUsize,
    pthread: Pthread,
}

impl SwitchPad {
    /// Creates the pad for the calling backing thread.
    pub(crate) fn new_for_current_thread() -> Self {
        Self {
            run_gate: Parker::new(),
            return_gate: Mutex::new(None),
            core: AtomicUsize::new(0),
            pthread: pthread_self(),
        }
    }

    pub(crate) fn pthread(&self) -> Pthread {
        self.pthread
    }

    pub(crate) fn core(&self) -> usize {
        self.core.load(Ordering::Acquire)
    }

    pub(crate) fn set_core(&self, core: usize) {
        self.core.store(core, Ordering::Release);
    }

    pub(crate) fn set_return_gate(&self, gate: Arc<Parker>) {
        *self.return_gate.lock() = Some(gate);
    }

    pub(crate) fn take_return_gate(&self) -> Option<Arc<Parker>> {
        self.return_gate.lock().take()
    }

    /// Blocks the calling backing thread until a dispatcher resumes it.
    pub(crate) fn wait_for_dispatch(&self) {
        self.run_gate.park();
    }

    /// Resumes the backing thread parked on this pad.
    pub(crate) fn resume(&self) {
        self.run_gate.unpark();
    }
}

/// Entry point for a freshly dispatched thread, run on a pooled backing
/// thread. Returns when the thread exits; the backing thread is then free
/// to be recycled.
pub(crate) fn run_dispatched(req: StartRequest, pad: &Arc<SwitchPad>) {
    let StartRequest {
        rt,
        core,
        id,
        flags,
        job,
    } = req;

    pad.set_core(core.idx);
    pad.set_return_gate(core.resume.clone());
    {
        // Register the backing pthread so the preemption timer can signal
        // it. The dispatcher published the running info before waking us.
        let mut running = core.running.lock();
        if let Some(info) = running.as_mut() {
            if info.id == id {
                info.pthread = Some(pad.pthread());
            }
        }
    }
    current::enter(Context {
        rt: rt.clone(),
        id,
        flags,
        pad: pad.clone(),
    });
    preempt::reset_depth();

    let outcome = panic::catch_unwind(AssertUnwindSafe(job));
    preempt::reset_depth();
    if let Err(payload) = outcome {
        if !payload.is::<ThreadExit>() {
            error!(thread = ?id, "thread terminated by unhandled panic");
        }
    }

    current::clear();
    finish(&rt, id, pad);
}

/// Retires an exited thread: removes its record, signals its join record,
/// wakes the joiner, and releases the core.
fn finish(rt: &Arc<RuntimeShared>, id: ThreadId, pad: &Arc<SwitchPad>) {
    let join = {
        let mut table = rt.threads.lock();
        let Some(rec) = table.remove(id.0) else {
            // Corrupted lifecycle; continuing could dispatch a stale id.
            panic!("thread record missing at exit: {id:?}");
        };
        rec.join
    };
    if let Some(waiter) = join.and_then(|j| j.finish()) {
        crate::thread::wake_with(rt, waiter);
    }
    if let Some(gate) = pad.take_return_gate() {
        gate.unpark();
    }
}
