//! Preemption: disable/enable nesting, safepoints, and the timer.
//!
//! The timer thread marks the running thread of each active core
//! preempt-pending once it has held the core for a full tick, and sends
//! SIGURG to its backing thread so a blocking syscall returns early. The
//! pending flag is honored at the next safepoint, at every suspension
//! call, and by the outermost [`enable`]; while the disable depth is
//! non-zero the preemption is deferred, never dropped.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::pthread::pthread_kill;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::trace;

use crate::error::{Error, ErrorKind, Result};
use crate::runtime::RuntimeShared;
use crate::sched::core::CoreState;
use crate::thread::{current, yield_now};

thread_local! {
    static DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Defers preemption for the calling thread until the matching [`enable`].
/// Nests.
pub fn disable() {
    DEPTH.with(|d| d.set(d.get() + 1));
}

/// Re-enables preemption. The outermost enable honors a deferred
/// preemption immediately.
///
/// # Panics
///
/// Panics when unmatched with a [`disable`].
pub fn enable() {
    let outermost = DEPTH.with(|d| {
        let v = d.get();
        assert!(v > 0, "preempt::enable without a matching disable");
        d.set(v - 1);
        v == 1
    });
    if outermost {
        check_pending();
    }
}

/// Explicit safepoint for compute-bound code: yields if a preemption is
/// pending and preemption is enabled, otherwise returns immediately.
#[inline]
pub fn safepoint() {
    if DEPTH.with(Cell::get) == 0 {
        check_pending();
    }
}

fn check_pending() {
    if let Some(cx) = current::context() {
        if cx.flags.preempt_pending.swap(false, Ordering::AcqRel) {
            if let Some(core) = cx.rt.cores.get(cx.pad.core()) {
                core.stats.bump_preemptions();
            }
            yield_now();
        }
    }
}

/// RAII form of [`disable`]/[`enable`].
#[must_use = "preemption is re-enabled when the guard drops"]
pub struct DisabledGuard {
    // Depth is thread-local; the guard must not cross threads.
    _not_send: PhantomData<*const ()>,
}

/// Disables preemption for the guard's lifetime.
pub fn disabled() -> DisabledGuard {
    disable();
    DisabledGuard {
        _not_send: PhantomData,
    }
}

impl Drop for DisabledGuard {
    fn drop(&mut self) {
        enable();
    }
}

pub(crate) fn depth() -> u32 {
    DEPTH.with(Cell::get)
}

/// Clears stale depth when a backing thread starts a fresh thread.
pub(crate) fn reset_depth() {
    DEPTH.with(|d| d.set(0));
}

/// Invariant check at every blocking point: a thread that suspends with
/// preemption disabled leaves its core permanently non-preemptible.
pub(crate) fn assert_preemptible() {
    debug_assert_eq!(
        depth(),
        0,
        "suspension point reached with preemption disabled"
    );
}

extern "C" fn interrupt_handler(_sig: nix::libc::c_int) {
    // Empty on purpose: the pending flag is set by the timer thread; the
    // signal only has to interrupt a blocking syscall.
}

/// Installs the SIGURG handler, without SA_RESTART so interrupted
/// syscalls return instead of resuming.
pub(crate) fn install_signal_handler() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(interrupt_handler),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // Safety: the handler body is trivially async-signal-safe.
    unsafe { sigaction(Signal::SIGURG, &action) }
        .map(|_| ())
        .map_err(|e| Error::with_message(ErrorKind::Internal, format!("sigaction: {e}")))
}

/// Body of the timer thread: one pass per tick over the active cores.
pub(crate) fn timer_loop(rt: Arc<RuntimeShared>) {
    let tick = Duration::from_micros(rt.config.preempt_tick_us.max(1));
    while !rt.shutdown.load(Ordering::Acquire) {
        std::thread::sleep(tick);
        let now = crate::util::mono_us();
        for core in &rt.cores {
            if core.state() != CoreState::Active {
                continue;
            }
            let running = core.running.lock();
            let Some(info) = running.as_ref() else {
                continue;
            };
            if info.realtime {
                continue;
            }
            if now.saturating_sub(info.since_us) < rt.config.preempt_tick_us {
                continue;
            }
            if !info.flags.preempt_pending.swap(true, Ordering::AcqRel) {
                trace!(core = core.idx, thread = ?info.id, "preempt pending");
                if let Some(pthread) = info.pthread {
                    let _ = pthread_kill(pthread, Signal::SIGURG);
                }
            }
        }
    }
}
