//! Pool of reusable backing OS threads.
//!
//! Spawning a lightweight thread must never pay OS thread creation cost in
//! the common case: backing threads are recycled through this pool once the
//! thread they carried exits. The pool grows on demand and keeps at most
//! `thread_pool_cap` idle backing threads around.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::error;

use crate::runtime::RuntimeShared;
use crate::sched::core::CoreScheduler;
use crate::thread::context::{run_dispatched, SwitchPad};
use crate::thread::{Job, ThreadFlags, ThreadId};

/// Everything a backing thread needs to run a freshly dispatched thread.
pub(crate) struct StartRequest {
    pub rt: Arc<RuntimeShared>,
    pub core: Arc<CoreScheduler>,
    pub id: ThreadId,
    pub flags: Arc<ThreadFlags>,
    pub job: Job,
}

enum PoolMsg {
    Start(StartRequest),
}

struct PoolShared {
    rx: Mutex<Receiver<PoolMsg>>,
    idle: AtomicUsize,
    cap: usize,
}

pub(crate) struct ContextPool {
    tx: Mutex<Option<Sender<PoolMsg>>>,
    shared: Arc<PoolShared>,
    stack_size: usize,
}

impl ContextPool {
    pub(crate) fn new(cap: usize, stack_size: usize) -> Self {
        let (tx, rx) = channel();
        Self {
            tx: Mutex::new(Some(tx)),
            shared: Arc::new(PoolShared {
                rx: Mutex::new(rx),
                idle: AtomicUsize::new(0),
                cap,
            }),
            stack_size,
        }
    }

    /// Hands a freshly dispatched thread to a backing thread.
    ///
    /// An idle backing thread is reserved atomically before the send;
    /// when no reservation can be taken a fresh backing thread is spawned
    /// for this request. Two dispatchers racing over one idle thread can
    /// therefore never both lean on it and strand a request in the
    /// channel.
    ///
    /// A backing thread the OS refuses to create is a non-recoverable
    /// resource failure: the runtime can no longer guarantee progress, so
    /// this aborts the process rather than limping on.
    pub(crate) fn run(&self, req: StartRequest) {
        let reserved = self
            .shared
            .idle
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if !reserved {
            self.spawn_backing();
        }
        let guard = self.tx.lock();
        if let Some(tx) = guard.as_ref() {
            // A send can only fail after shutdown closed the channel; the
            // dispatched thread is abandoned along with the rest.
            let _ = tx.send(PoolMsg::Start(req));
        }
    }

    fn spawn_backing(&self) {
        let shared = self.shared.clone();
        let builder = std::thread::Builder::new()
            .name("shoal-backing".to_string())
            .stack_size(self.stack_size);
        if let Err(e) = builder.spawn(move || backing_main(&shared)) {
            error!(error = %e, "cannot create a backing thread");
            std::process::abort();
        }
    }

    /// Closes the channel. Idle backing threads exit as they observe it;
    /// backing threads parked inside a suspended thread stay parked.
    pub(crate) fn shutdown(&self) {
        self.tx.lock().take();
    }
}

// `idle` counts backing threads waiting in `recv` that no dispatcher has
// reserved yet. A fresh thread serves its first request without ever
// registering: the dispatcher that spawned it already committed it.
fn backing_main(shared: &PoolShared) {
    let pad = Arc::new(SwitchPad::new_for_current_thread());
    loop {
        let msg = shared.rx.lock().recv();
        match msg {
            Ok(PoolMsg::Start(req)) => run_dispatched(req, &pad),
            Err(_) => return,
        }
        // Retire rather than re-enter the idle set when the pool is
        // already at capacity.
        if shared.idle.load(Ordering::Acquire) >= shared.cap {
            return;
        }
        shared.idle.fetch_add(1, Ordering::AcqRel);
    }
}
