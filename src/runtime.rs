//! Runtime assembly: construction, the three initialization phases, and
//! shutdown.
//!
//! Startup order: validate the configuration, run the global initializer,
//! handshake with the core authority, spawn one worker per granted core
//! slot (each runs the per-core initializer and reports readiness),
//! activate the guaranteed cores, run the late initializer, then start
//! the preemption timer and the elasticity monitor. Any failure before
//! that point tears the partial runtime down and propagates as an error.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::RuntimeConfig;
use crate::elastic;
use crate::elastic::authority::{CoreAuthority, CoreGrant, GrantLimits, GrantStatus, LocalAuthority};
use crate::error::{Error, ErrorKind, Result};
use crate::preempt;
use crate::sched::core::{worker_main, CoreScheduler};
use crate::sched::Placement;
use crate::stat::{CongestionSnapshot, CoreStats};
use crate::thread::pool::ContextPool;
use crate::thread::{self, JoinHandle, Priority, ThreadId, ThreadRecord};
use crate::util::Arena;

/// Everything shared between the runtime handle, core workers, backing
/// threads, the timer, and the monitor.
pub(crate) struct RuntimeShared {
    pub config: RuntimeConfig,
    pub threads: Mutex<Arena<ThreadRecord>>,
    /// One scheduler per core slot, indexed by core id; fixed at startup.
    pub cores: Vec<Arc<CoreScheduler>>,
    pub grant: CoreGrant,
    pub authority: Box<dyn CoreAuthority>,
    pub pool: ContextPool,
    pub snapshot: CongestionSnapshot,
    pub shutdown: AtomicBool,
    /// Cursor for round-robin placement of unaffiliated spawns.
    pub rr_next: AtomicUsize,
}

type InitFn = Box<dyn FnOnce() -> Result<()> + Send>;
type CoreInitFn = Arc<dyn Fn(usize) -> Result<()> + Send + Sync>;

/// Configures and starts a [`Runtime`].
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    global_init: Option<InitFn>,
    core_init: Option<CoreInitFn>,
    late_init: Option<InitFn>,
    authority: Option<Box<dyn CoreAuthority>>,
}

impl std::fmt::Debug for RuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RuntimeBuilder {
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            global_init: None,
            core_init: None,
            late_init: None,
            authority: None,
        }
    }

    /// Loads the configuration from a file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(RuntimeConfig::from_file(path)?))
    }

    /// Runs once, before the authority handshake and before any worker
    /// exists.
    #[must_use]
    pub fn on_global_init(mut self, f: impl FnOnce() -> Result<()> + Send + 'static) -> Self {
        self.global_init = Some(Box::new(f));
        self
    }

    /// Runs on each core's worker thread before the runtime starts; a
    /// failure on any core aborts startup.
    #[must_use]
    pub fn on_core_init(mut self, f: impl Fn(usize) -> Result<()> + Send + Sync + 'static) -> Self {
        self.core_init = Some(Arc::new(f));
        self
    }

    /// Runs once, after the guaranteed cores are active and accepting
    /// work, right before the runtime is handed back.
    #[must_use]
    pub fn on_late_init(mut self, f: impl FnOnce() -> Result<()> + Send + 'static) -> Self {
        self.late_init = Some(Box::new(f));
        self
    }

    /// Replaces the in-process [`LocalAuthority`] with a real one.
    #[must_use]
    pub fn authority(mut self, authority: impl CoreAuthority + 'static) -> Self {
        self.authority = Some(Box::new(authority));
        self
    }

    pub fn start(self) -> Result<Runtime> {
        Runtime::start(self)
    }
}

/// Handle to a running thread runtime.
///
/// Dropping the handle shuts the runtime down; threads still runnable or
/// parked at that point are abandoned.
pub struct Runtime {
    shared: Arc<RuntimeShared>,
    workers: Vec<std::thread::JoinHandle<()>>,
    aux: Vec<std::thread::JoinHandle<()>>,
    stopped: bool,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("workers", &self.workers.len())
            .field("aux", &self.aux.len())
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    fn start(builder: RuntimeBuilder) -> Result<Self> {
        let RuntimeBuilder {
            config,
            global_init,
            core_init,
            late_init,
            authority,
        } = builder;
        config.validate()?;
        if let Some(init) = global_init {
            init()?;
        }
        thread::install_exit_hook();
        preempt::install_signal_handler()?;

        let authority = authority.unwrap_or_else(|| Box::new(LocalAuthority));
        let requested = GrantLimits {
            maximum: config.cores_max,
            guaranteed: config.cores_guaranteed,
        };
        let granted = authority.attach(requested)?;
        if granted.guaranteed == 0 || granted.guaranteed > granted.maximum {
            return Err(Error::with_message(
                ErrorKind::HandshakeRejected,
                format!("authority granted unusable limits: {granted:?}"),
            ));
        }
        info!(
            maximum = granted.maximum,
            guaranteed = granted.guaranteed,
            "attached to core authority"
        );

        let shared = Arc::new(RuntimeShared {
            pool: ContextPool::new(config.thread_pool_cap, config.stack_size_kb * 1024),
            threads: Mutex::new(Arena::new()),
            cores: (0..granted.maximum)
                .map(|i| Arc::new(CoreScheduler::new(i)))
                .collect(),
            grant: CoreGrant::new(granted),
            authority,
            snapshot: CongestionSnapshot::new(),
            shutdown: AtomicBool::new(false),
            rr_next: AtomicUsize::new(0),
            config,
        });

        let (ready_tx, ready_rx) = mpsc::channel();
        let mut workers = Vec::with_capacity(shared.cores.len());
        for core in &shared.cores {
            let rt = shared.clone();
            let core = core.clone();
            let init = core_init.clone();
            let tx = ready_tx.clone();
            match std::thread::Builder::new()
                .name(format!("shoal-core-{}", core.idx))
                .spawn(move || worker_main(rt, core, init, tx))
            {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    teardown(&shared, workers);
                    return Err(Error::with_message(
                        ErrorKind::Internal,
                        format!("cannot spawn core worker: {e}"),
                    ));
                }
            }
        }
        drop(ready_tx);
        for _ in 0..workers.len() {
            let outcome = match ready_rx.recv() {
                Ok(res) => res,
                Err(_) => Err(Error::with_message(
                    ErrorKind::Internal,
                    "core worker exited before reporting readiness",
                )),
            };
            if let Err(e) = outcome {
                teardown(&shared, workers);
                return Err(Error::with_message(ErrorKind::InitFailed, e.to_string()));
            }
        }

        // Negotiated startup: exactly the guaranteed cores come up.
        for core in shared.cores.iter().take(granted.guaranteed) {
            core.activate();
        }
        shared.grant.set_active(granted.guaranteed);

        if let Some(init) = late_init {
            if let Err(e) = init() {
                teardown(&shared, workers);
                return Err(Error::with_message(ErrorKind::InitFailed, e.to_string()));
            }
        }

        let mut aux = Vec::with_capacity(2);
        for (name, body) in [
            ("shoal-timer", preempt::timer_loop as fn(Arc<RuntimeShared>)),
            ("shoal-elastic", elastic::monitor_loop as fn(Arc<RuntimeShared>)),
        ] {
            let rt = shared.clone();
            match std::thread::Builder::new()
                .name(name.to_string())
                .spawn(move || body(rt))
            {
                Ok(handle) => aux.push(handle),
                Err(e) => {
                    teardown(&shared, workers);
                    for h in aux {
                        let _ = h.join();
                    }
                    return Err(Error::with_message(
                        ErrorKind::Internal,
                        format!("cannot spawn {name}: {e}"),
                    ));
                }
            }
        }

        Ok(Self {
            shared,
            workers,
            aux,
            stopped: false,
        })
    }

    /// Runs `f` as the runtime's main thread and shuts the runtime down
    /// when it finishes. Returns `None` if the main thread terminated
    /// through [`exit`](crate::thread::exit).
    pub fn run<F, T>(mut self, f: F) -> Option<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let handle = thread::spawn_with(&self.shared, f, Priority::Normal, Placement::External);
        let result = handle.join();
        self.stop();
        result
    }

    /// Spawns a thread from outside the runtime, placed round-robin over
    /// the active cores.
    pub fn spawn<F, T>(&self, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        thread::spawn_with(&self.shared, f, Priority::Normal, Placement::External)
    }

    /// Spawns a thread onto a designated core.
    ///
    /// # Panics
    ///
    /// Panics if `core` is out of range for the maximum grant.
    pub fn spawn_on<F, T>(&self, core: usize, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        assert!(
            core < self.shared.cores.len(),
            "core index {core} out of range (maximum grant is {})",
            self.shared.cores.len()
        );
        thread::spawn_with(&self.shared, f, Priority::Normal, Placement::Core(core))
    }

    /// Spawns a real-time thread from outside the runtime: never
    /// timer-preempted, woken through the handoff slot.
    pub fn spawn_realtime<F, T>(&self, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        thread::spawn_with(&self.shared, f, Priority::RealTime, Placement::External)
    }

    /// Wakes a parked thread. See [`wake`](crate::thread::wake).
    pub fn wake(&self, id: ThreadId) -> bool {
        thread::wake_with(&self.shared, id)
    }

    /// The shared congestion snapshot, readable without locking.
    #[must_use]
    pub fn congestion(&self) -> &CongestionSnapshot {
        &self.shared.snapshot
    }

    /// Current negotiated core grant.
    #[must_use]
    pub fn grant(&self) -> GrantStatus {
        self.shared.grant.status()
    }

    /// Event counters for one core slot.
    #[must_use]
    pub fn core_stats(&self, core: usize) -> Option<&CoreStats> {
        self.shared.cores.get(core).map(|c| &c.stats)
    }

    /// Stops the runtime, waiting for workers to finish their current
    /// dispatch.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.shared.shutdown.store(true, Ordering::Release);
        for core in &self.shared.cores {
            core.idle.unpark();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        for handle in self.aux.drain(..) {
            let _ = handle.join();
        }
        self.shared.pool.shutdown();
        debug!("runtime stopped");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.stop();
    }
}

fn teardown(shared: &Arc<RuntimeShared>, workers: Vec<std::thread::JoinHandle<()>>) {
    shared.shutdown.store(true, Ordering::Release);
    for core in &shared.cores {
        core.idle.unpark();
    }
    shared.pool.shutdown();
    for worker in workers {
        let _ = worker.join();
    }
}
