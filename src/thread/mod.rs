//! Thread lifecycle: spawn, yield, park, wake, join, exit.
//!
//! A lightweight thread is a record in the runtime's arena plus, once it
//! has run, a backing OS thread parked inside its [`SwitchPad`]. The record
//! is addressed by a generation-checked [`ThreadId`]; queues and join
//! records hold the id, never the record, so a thread can be owned by at
//! most one run queue at a time and a stale id is always detected.
//!
//! The free functions in this module operate on the calling thread's
//! runtime context and panic when called from a thread the runtime does
//! not manage; the [`Runtime`](crate::runtime::Runtime) methods are the
//! entry points for external threads.

pub(crate) mod context;
pub mod current;
pub(crate) mod pool;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};

use parking_lot::{Condvar, Mutex};

use crate::runtime::RuntimeShared;
use crate::sched::{self, Placement};
use crate::thread::context::SwitchPad;
use crate::thread::current::Context;
use crate::preempt;
use crate::util::{Arena, ArenaIndex};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Stable identity of a lightweight thread.
///
/// Ids are generation-checked: once the thread exits, outstanding copies
/// no longer resolve and operations on them become no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub(crate) ArenaIndex);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ThreadState {
    Runnable,
    Running,
    Parked,
}

/// Scheduling priority hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Priority {
    Normal,
    /// Never preempted by the timer; wakes go through the handoff slot.
    RealTime,
}

/// Per-thread atomic flags, shared with the preemption timer and wakers.
#[derive(Debug, Default)]
pub(crate) struct ThreadFlags {
    /// Set by the timer; honored at the next safepoint or suspension call.
    pub preempt_pending: AtomicBool,
    /// A wake permit: a wake that raced ahead of the park it targets.
    pub wake_pending: AtomicBool,
}

/// How a dispatcher starts or resumes the thread.
pub(crate) enum Entry {
    NotStarted(Job),
    Suspended(Arc<SwitchPad>),
}

pub(crate) struct ThreadRecord {
    pub state: ThreadState,
    pub priority: Priority,
    /// Core this thread last belonged to; wake placement hint.
    pub last_core: usize,
    /// Present while the thread is dispatchable; taken by the dispatcher.
    pub entry: Option<Entry>,
    pub flags: Arc<ThreadFlags>,
    pub join: Option<Arc<dyn JoinSignal>>,
}

pub(crate) fn insert_record(
    table: &mut Arena<ThreadRecord>,
    job: Job,
    priority: Priority,
    join: Option<Arc<dyn JoinSignal>>,
) -> ThreadId {
    let idx = table.insert(ThreadRecord {
        state: ThreadState::Runnable,
        priority,
        last_core: 0,
        entry: Some(Entry::NotStarted(job)),
        flags: Arc::new(ThreadFlags::default()),
        join,
    });
    ThreadId(idx)
}

// ========== Join records ==========

/// Type-erased view of a join record, held by the thread itself so the
/// trampoline can signal completion without knowing the result type.
pub(crate) trait JoinSignal: Send + Sync {
    /// Marks the thread finished. Returns the parked joiner to wake, if
    /// one was registered.
    fn finish(&self) -> Option<ThreadId>;
}

pub(crate) struct JoinRecord<T> {
    inner: Mutex<JoinInner<T>>,
    cv: Condvar,
}

struct JoinInner<T> {
    value: Option<T>,
    done: bool,
    waiter: Option<ThreadId>,
    consumed: bool,
}

impl<T> JoinRecord<T> {
    fn new() -> Self {
        Self {
            inner: Mutex::new(JoinInner {
                value: None,
                done: false,
                waiter: None,
                consumed: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Stores the thread's result. Called by the thread itself, before the
    /// trampoline signals completion.
    pub(crate) fn complete(&self, value: T) {
        self.inner.lock().value = Some(value);
    }

    fn join(&self) -> Option<T> {
        if let Some(cx) = current::context() {
            // Register as waiter and park; the wake permit closes the race
            // with a completion between unlock and park.
            loop {
                {
                    let mut inner = self.inner.lock();
                    debug_assert!(!inner.consumed, "join record consumed twice");
                    if inner.done {
                        inner.consumed = true;
                        return inner.value.take();
                    }
                    inner.waiter = Some(cx.id);
                }
                park_current();
            }
        } else {
            let mut inner = self.inner.lock();
            while !inner.done {
                self.cv.wait(&mut inner);
            }
            debug_assert!(!inner.consumed, "join record consumed twice");
            inner.consumed = true;
            inner.value.take()
        }
    }
}

impl<T: Send + 'static> JoinSignal for JoinRecord<T> {
    fn finish(&self) -> Option<ThreadId> {
        let mut inner = self.inner.lock();
        inner.done = true;
        self.cv.notify_all();
        inner.waiter.take()
    }
}

/// Owned handle to a spawned thread's completion.
///
/// `join` consumes the handle, so a second join on the same thread is
/// unrepresentable. Dropping the handle detaches the thread.
pub struct JoinHandle<T> {
    record: Arc<JoinRecord<T>>,
    id: ThreadId,
}

impl<T: Send + 'static> JoinHandle<T> {
    /// Blocks (parking, on a runtime thread) until the target exits.
    ///
    /// Returns `None` if the target terminated through [`exit`] before
    /// producing its result.
    pub fn join(self) -> Option<T> {
        self.record.join()
    }

    /// Releases interest in the thread's result.
    pub fn detach(self) {}

    /// Identity of the spawned thread.
    #[must_use]
    pub fn id(&self) -> ThreadId {
        self.id
    }
}

impl<T> std::fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JoinHandle({:?})", self.id)
    }
}

// ========== Spawning ==========

pub(crate) fn spawn_with<F, T>(
    rt: &Arc<RuntimeShared>,
    f: F,
    priority: Priority,
    placement: Placement,
) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let record = Arc::new(JoinRecord::new());
    let completer = record.clone();
    let job: Job = Box::new(move || {
        let value = f();
        completer.complete(value);
    });
    let id = {
        let mut table = rt.threads.lock();
        insert_record(
            &mut table,
            job,
            priority,
            Some(record.clone() as Arc<dyn JoinSignal>),
        )
    };
    sched::enqueue(rt, id, placement);
    JoinHandle { record, id }
}

fn require_context(what: &str) -> Context {
    current::context().unwrap_or_else(|| {
        panic!("{what} requires a runtime thread; use the Runtime methods from outside")
    })
}

/// Spawns a thread running a clone of `f` on the calling thread's core.
/// The caller keeps the original closure.
pub fn spawn<F, T>(f: &F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Clone + Send + 'static,
    T: Send + 'static,
{
    spawn_move(f.clone())
}

/// Spawns a thread, consuming the closure.
pub fn spawn_move<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let cx = require_context("spawn");
    let placement = Placement::Core(cx.pad.core());
    spawn_with(&cx.rt, f, Priority::Normal, placement)
}

/// Spawns a thread onto a designated core's queue.
///
/// # Panics
///
/// Panics if `core` is out of range for the runtime's maximum grant.
pub fn spawn_on<F, T>(core: usize, f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let cx = require_context("spawn_on");
    assert!(
        core < cx.rt.cores.len(),
        "core index {core} out of range (maximum grant is {})",
        cx.rt.cores.len()
    );
    spawn_with(&cx.rt, f, Priority::Normal, Placement::Core(core))
}

/// Spawns a real-time thread: never timer-preempted, woken through the
/// handoff slot.
pub fn spawn_realtime<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let cx = require_context("spawn_realtime");
    let placement = Placement::Core(cx.pad.core());
    spawn_with(&cx.rt, f, Priority::RealTime, placement)
}

// ========== Suspension points ==========

/// Cooperatively relinquishes the core: re-enqueues the calling thread at
/// the tail of its core's queue and dispatches the next runnable thread.
///
/// On a thread the runtime does not manage this degrades to an OS yield.
pub fn yield_now() {
    let Some(cx) = current::context() else {
        std::thread::yield_now();
        return;
    };
    preempt::assert_preemptible();
    let Some(gate) = cx.pad.take_return_gate() else {
        panic!("suspension without a dispatcher gate");
    };
    // Suspending satisfies any pending preemption.
    cx.flags.preempt_pending.store(false, Ordering::Release);
    let core_idx = cx.pad.core();
    {
        let mut table = cx.rt.threads.lock();
        let Some(rec) = table.get_mut(cx.id.0) else {
            panic!("thread record missing in yield: {:?}", cx.id);
        };
        rec.state = ThreadState::Runnable;
        rec.last_core = core_idx;
        rec.entry = Some(Entry::Suspended(cx.pad.clone()));
    }
    sched::enqueue(&cx.rt, cx.id, Placement::Core(core_idx));
    gate.unpark();
    cx.pad.wait_for_dispatch();
}

/// Parks the calling thread until [`wake`] is called on its id.
///
/// A wake that arrives before the park is banked as a permit and consumed
/// here without suspending. This is the scheduler-facing hook for building
/// blocking primitives.
pub fn park_current() {
    let Some(cx) = current::context() else {
        panic!("park_current requires a runtime thread");
    };
    preempt::assert_preemptible();
    let Some(gate) = cx.pad.take_return_gate() else {
        panic!("suspension without a dispatcher gate");
    };
    let core_idx = cx.pad.core();
    {
        let mut table = cx.rt.threads.lock();
        if cx.flags.wake_pending.swap(false, Ordering::AcqRel) {
            cx.pad.set_return_gate(gate);
            return;
        }
        let Some(rec) = table.get_mut(cx.id.0) else {
            panic!("thread record missing in park: {:?}", cx.id);
        };
        rec.state = ThreadState::Parked;
        rec.last_core = core_idx;
        rec.entry = Some(Entry::Suspended(cx.pad.clone()));
    }
    if let Some(core) = cx.rt.cores.get(core_idx) {
        core.stats.bump_parks();
    }
    gate.unpark();
    cx.pad.wait_for_dispatch();
}

/// Makes a parked thread runnable again, enqueueing it on the core it last
/// ran on (falling back to any accepting core).
///
/// Waking a thread that is not parked banks a permit for its next park.
/// Returns false if the id no longer resolves (the thread has exited).
pub fn wake(id: ThreadId) -> bool {
    let cx = require_context("wake");
    wake_with(&cx.rt, id)
}

pub(crate) fn wake_with(rt: &Arc<RuntimeShared>, id: ThreadId) -> bool {
    let target = {
        let mut table = rt.threads.lock();
        let Some(rec) = table.get_mut(id.0) else {
            return false;
        };
        match rec.state {
            ThreadState::Parked => {
                rec.state = ThreadState::Runnable;
                Some((rec.last_core, rec.priority))
            }
            ThreadState::Runnable | ThreadState::Running => {
                rec.flags.wake_pending.store(true, Ordering::Release);
                None
            }
        }
    };
    if let Some((core_idx, priority)) = target {
        let placement = match priority {
            Priority::RealTime => Placement::Next(core_idx),
            Priority::Normal => Placement::Core(core_idx),
        };
        sched::enqueue(rt, id, placement);
        if let Some(core) = rt.cores.get(core_idx) {
            core.stats.bump_wakes();
        }
    }
    true
}

/// Atomically parks the calling thread and hands its core straight to a
/// replacement thread running `f`, bypassing the FIFO.
///
/// If a wake permit is already banked the caller keeps running and the
/// replacement is enqueued normally instead.
pub fn park_and_switch<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    let Some(cx) = current::context() else {
        panic!("park_and_switch requires a runtime thread");
    };
    preempt::assert_preemptible();
    let Some(gate) = cx.pad.take_return_gate() else {
        panic!("suspension without a dispatcher gate");
    };
    let core_idx = cx.pad.core();
    let job: Job = Box::new(f);
    let (new_id, parked) = {
        let mut table = cx.rt.threads.lock();
        let new_id = insert_record(&mut table, job, Priority::Normal, None);
        if cx.flags.wake_pending.swap(false, Ordering::AcqRel) {
            (new_id, false)
        } else {
            let Some(rec) = table.get_mut(cx.id.0) else {
                panic!("thread record missing in park_and_switch: {:?}", cx.id);
            };
            rec.state = ThreadState::Parked;
            rec.last_core = core_idx;
            rec.entry = Some(Entry::Suspended(cx.pad.clone()));
            (new_id, true)
        }
    };
    if !parked {
        cx.pad.set_return_gate(gate);
        sched::enqueue(&cx.rt, new_id, Placement::Core(core_idx));
        return;
    }
    if !queue_push_next(&cx.rt, core_idx, new_id) {
        sched::enqueue(&cx.rt, new_id, Placement::External);
    }
    if let Some(core) = cx.rt.cores.get(core_idx) {
        core.stats.bump_parks();
    }
    gate.unpark();
    cx.pad.wait_for_dispatch();
}

fn queue_push_next(rt: &Arc<RuntimeShared>, core_idx: usize, id: ThreadId) -> bool {
    match rt.cores.get(core_idx) {
        Some(core) => core.queue.push_next(id),
        None => false,
    }
}

/// Terminates the calling thread without returning.
///
/// Destructors of live locals run; the joiner, if any, observes `None`.
pub fn exit() -> ! {
    if current::context().is_none() {
        panic!("exit requires a runtime thread");
    }
    std::panic::panic_any(ThreadExit);
}

/// Panic payload used by [`exit`] to unwind to the trampoline.
pub(crate) struct ThreadExit;

static EXIT_HOOK: Once = Once::new();

/// Keeps the process-wide panic hook from reporting [`exit`] unwinds.
pub(crate) fn install_exit_hook() {
    EXIT_HOOK.call_once(|| {
        let prev = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if info.payload().is::<ThreadExit>() {
                return;
            }
            prev(info);
        }));
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    // These exercise the join record in isolation; full lifecycle coverage
    // lives in the integration suites.

    #[test]
    fn external_join_sees_completed_value() {
        let record = Arc::new(JoinRecord::new());
        let remote = record.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            remote.complete(41);
            remote.finish();
        });
        assert_eq!(record.join(), Some(41));
        handle.join().unwrap();
    }

    #[test]
    fn join_after_early_exit_yields_none() {
        let record: Arc<JoinRecord<u32>> = Arc::new(JoinRecord::new());
        record.finish();
        assert_eq!(record.join(), None);
    }

    #[test]
    fn finish_reports_registered_waiter() {
        let record: Arc<JoinRecord<()>> = Arc::new(JoinRecord::new());
        let waiter = ThreadId(ArenaIndex::new(3, 0));
        record.inner.lock().waiter = Some(waiter);
        assert_eq!(record.finish(), Some(waiter));
        assert_eq!(record.finish(), None, "waiter must be taken exactly once");
    }
}
