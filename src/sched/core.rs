//! Per-core scheduler state and the core worker loop.
//!
//! One OS worker thread is pinned to each core slot for the lifetime of
//! the runtime; the elasticity protocol toggles slots between Inactive,
//! Active and Draining. An Active worker runs the dispatch loop: handoff
//! slot, FIFO head, steal from a peer, then idle with a short spin/yield
//! backoff before parking.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::pthread::Pthread;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::Result;
use crate::runtime::RuntimeShared;
use crate::sched::park::Parker;
use crate::sched::queue::RunQueue;
use crate::stat::{CoreStats, Ewma};
use crate::thread::pool::StartRequest;
use crate::thread::{Entry, Priority, ThreadFlags, ThreadId, ThreadState};
use crate::util::{mono_us, DetRng};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CoreState {
    Inactive = 0,
    Active = 1,
    Draining = 2,
}

impl CoreState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Active,
            2 => Self::Draining,
            _ => Self::Inactive,
        }
    }
}

/// What the core is executing right now. Read by the preemption timer.
pub(crate) struct RunningInfo {
    pub id: ThreadId,
    pub since_us: u64,
    pub realtime: bool,
    pub flags: Arc<ThreadFlags>,
    /// Backing pthread to signal; filled in once the thread first runs.
    pub pthread: Option<Pthread>,
}

pub(crate) struct CoreScheduler {
    pub idx: usize,
    pub queue: RunQueue,
    state: AtomicU8,
    /// Parked on while inactive or out of work.
    pub idle: Parker,
    /// Released by the running thread at its next suspension point.
    pub resume: Arc<Parker>,
    pub running: Mutex<Option<RunningInfo>>,
    pub stats: CoreStats,
    pub load: Ewma,
}

impl CoreScheduler {
    pub(crate) fn new(idx: usize) -> Self {
        Self {
            idx,
            queue: RunQueue::new(),
            state: AtomicU8::new(CoreState::Inactive as u8),
            idle: Parker::new(),
            resume: Arc::new(Parker::new()),
            running: Mutex::new(None),
            stats: CoreStats::new(),
            load: Ewma::new(),
        }
    }

    pub(crate) fn state(&self) -> CoreState {
        CoreState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: CoreState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Grant transition: Inactive -> Active.
    pub(crate) fn activate(&self) {
        self.queue.set_accepting(true);
        self.set_state(CoreState::Active);
        self.idle.unpark();
        debug!(core = self.idx, "core activated");
    }

    /// Revoke transition: Active -> Draining. The worker migrates the
    /// queue and completes the transition to Inactive.
    pub(crate) fn begin_drain(&self) {
        self.queue.set_accepting(false);
        self.set_state(CoreState::Draining);
        self.idle.unpark();
    }
}

const SPIN_LIMIT: u32 = 64;
const YIELD_LIMIT: u32 = 16;
const LOAD_WINDOW_US: u64 = 1_000;

/// Body of a core worker OS thread. Runs the per-core initializer, reports
/// readiness, then serves dispatch rounds until shutdown.
pub(crate) fn worker_main(
    rt: Arc<RuntimeShared>,
    core: Arc<CoreScheduler>,
    core_init: Option<Arc<dyn Fn(usize) -> Result<()> + Send + Sync>>,
    ready: Sender<Result<()>>,
) {
    let init_result = match core_init {
        Some(init) => init(core.idx),
        None => Ok(()),
    };
    let failed = init_result.is_err();
    let _ = ready.send(init_result);
    drop(ready);
    if failed {
        return;
    }

    let mut rng = DetRng::new(0x9e37_79b9_7f4a_7c15 ^ (core.idx as u64 + 1));
    let mut spins = 0u32;
    let mut window_start = mono_us();
    let mut busy_us = 0u64;

    loop {
        if rt.shutdown.load(Ordering::Acquire) {
            break;
        }
        match core.state() {
            CoreState::Inactive => {
                core.idle.park();
                continue;
            }
            CoreState::Draining => {
                drain(&rt, &core);
                continue;
            }
            CoreState::Active => {}
        }

        let picked = core.queue.pop().or_else(|| {
            steal_from_peers(&rt, &core, &mut rng).map(|id| {
                core.stats.bump_steals();
                id
            })
        });
        if let Some(id) = picked {
            spins = 0;
            let t0 = mono_us();
            dispatch(&rt, &core, id);
            busy_us += mono_us().saturating_sub(t0);
        } else if spins < SPIN_LIMIT {
            spins += 1;
            std::hint::spin_loop();
        } else if spins < SPIN_LIMIT + YIELD_LIMIT {
            spins += 1;
            std::thread::yield_now();
        } else {
            core.idle.park_timeout(Duration::from_millis(1));
        }

        let now = mono_us();
        let span = now.saturating_sub(window_start);
        if span >= LOAD_WINDOW_US {
            #[allow(clippy::cast_precision_loss)]
            core.load.record((busy_us as f32 / span as f32).min(1.0));
            window_start = now;
            busy_us = 0;
        }
    }
    trace!(core = core.idx, "core worker exiting");
}

/// Runs one thread until its next suspension point.
fn dispatch(rt: &Arc<RuntimeShared>, core: &Arc<CoreScheduler>, id: ThreadId) {
    let taken = {
        let mut table = rt.threads.lock();
        let Some(rec) = table.get_mut(id.0) else {
            // Stale id: the thread exited after being enqueued.
            return;
        };
        debug_assert_eq!(
            rec.state,
            ThreadState::Runnable,
            "dispatching a thread that is not runnable: {id:?}"
        );
        rec.state = ThreadState::Running;
        rec.last_core = core.idx;
        let realtime = rec.priority == Priority::RealTime;
        let flags = rec.flags.clone();
        let Some(entry) = rec.entry.take() else {
            panic!("runnable thread without an entry: {id:?}");
        };
        (entry, flags, realtime)
    };
    let (entry, flags, realtime) = taken;
    core.stats.bump_dispatches();
    trace!(core = core.idx, thread = ?id, "dispatch");

    match entry {
        Entry::NotStarted(job) => {
            *core.running.lock() = Some(RunningInfo {
                id,
                since_us: mono_us(),
                realtime,
                flags: flags.clone(),
                pthread: None,
            });
            rt.pool.run(StartRequest {
                rt: rt.clone(),
                core: core.clone(),
                id,
                flags,
                job,
            });
        }
        Entry::Suspended(pad) => {
            *core.running.lock() = Some(RunningInfo {
                id,
                since_us: mono_us(),
                realtime,
                flags,
                pthread: Some(pad.pthread()),
            });
            pad.set_core(core.idx);
            pad.set_return_gate(core.resume.clone());
            pad.resume();
        }
    }
    // Blocks until the thread suspends or exits.
    core.resume.park();
    *core.running.lock() = None;
}

/// Steals one thread from a peer queue: randomized starting victim, then a
/// round-robin scan, so no core is permanently denied steal opportunities.
fn steal_from_peers(
    rt: &Arc<RuntimeShared>,
    core: &Arc<CoreScheduler>,
    rng: &mut DetRng,
) -> Option<ThreadId> {
    let n = rt.cores.len();
    if n <= 1 {
        return None;
    }
    let start = rng.next_usize(n);
    for off in 0..n {
        let victim = &rt.cores[(start + off) % n];
        if victim.idx == core.idx || victim.state() != CoreState::Active {
            continue;
        }
        if let Some(id) = victim.queue.steal() {
            return Some(id);
        }
    }
    None
}

/// Completes a revoke: migrates every queued thread to the remaining
/// accepting cores, then parks the slot as Inactive.
fn drain(rt: &Arc<RuntimeShared>, core: &Arc<CoreScheduler>) {
    let orphans = core.queue.drain();
    let migrated = orphans.len();
    for id in orphans {
        core.stats.bump_migrations();
        crate::sched::enqueue(rt, id, crate::sched::Placement::External);
    }
    core.load.reset();
    core.set_state(CoreState::Inactive);
    debug!(core = core.idx, migrated, "core drained");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    use crate::config::RuntimeConfig;
    use crate::elastic::authority::{CoreGrant, GrantLimits, LocalAuthority};
    use crate::stat::CongestionSnapshot;
    use crate::thread::pool::ContextPool;
    use crate::thread::insert_record;
    use crate::util::Arena;

    fn bare_runtime(cores: usize) -> Arc<RuntimeShared> {
        Arc::new(RuntimeShared {
            config: RuntimeConfig::default(),
            threads: Mutex::new(Arena::new()),
            cores: (0..cores).map(|i| Arc::new(CoreScheduler::new(i))).collect(),
            grant: CoreGrant::new(GrantLimits {
                maximum: cores,
                guaranteed: 1,
            }),
            authority: Box::new(LocalAuthority),
            pool: ContextPool::new(0, 64 * 1024),
            snapshot: CongestionSnapshot::new(),
            shutdown: AtomicBool::new(false),
            rr_next: AtomicUsize::new(0),
        })
    }

    #[test]
    fn core_state_round_trips_through_u8() {
        for state in [CoreState::Inactive, CoreState::Active, CoreState::Draining] {
            assert_eq!(CoreState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn activation_opens_the_queue() {
        let core = CoreScheduler::new(0);
        assert_eq!(core.state(), CoreState::Inactive);
        core.activate();
        assert_eq!(core.state(), CoreState::Active);
        core.begin_drain();
        assert_eq!(core.state(), CoreState::Draining);
        assert!(core.queue.is_empty());
    }

    #[test]
    fn drain_migrates_every_queued_thread_exactly_once() {
        let rt = bare_runtime(2);
        rt.cores[0].activate();
        rt.cores[1].activate();
        let ids: Vec<_> = {
            let mut table = rt.threads.lock();
            (0..5)
                .map(|_| insert_record(&mut table, Box::new(|| {}), Priority::Normal, None))
                .collect()
        };
        for id in &ids {
            assert!(rt.cores[1].queue.push(*id));
        }

        rt.cores[1].begin_drain();
        drain(&rt, &rt.cores[1]);

        assert_eq!(rt.cores[1].state(), CoreState::Inactive);
        assert!(rt.cores[1].queue.is_empty());
        assert_eq!(rt.cores[1].stats.migrations(), 5);
        let mut migrated = Vec::new();
        while let Some(id) = rt.cores[0].queue.pop() {
            migrated.push(id);
        }
        migrated.sort();
        let mut expected = ids;
        expected.sort();
        assert_eq!(
            migrated, expected,
            "every queued thread must land on the remaining core exactly once"
        );
    }
}
