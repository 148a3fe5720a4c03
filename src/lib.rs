//! shoal: an elastic user-level thread runtime.
//!
//! Many lightweight threads are multiplexed onto a small, dynamically
//! sized set of worker cores. Each active core runs a dispatch loop over
//! its own run queue, stealing from peers when empty; a timer preempts
//! threads that overstay their tick; and an elasticity monitor negotiates
//! the core count with an external allocation authority based on standing
//! queue age and load.
//!
//! ```no_run
//! use shoal::{RuntimeBuilder, RuntimeConfig};
//!
//! let runtime = RuntimeBuilder::new(RuntimeConfig::default()).start()?;
//! let total = runtime.run(|| {
//!     let handles: Vec<_> = (0..8)
//!         .map(|i| shoal::spawn_move(move || i * i))
//!         .collect();
//!     handles.into_iter().filter_map(|h| h.join()).sum::<i32>()
//! });
//! assert_eq!(total, Some(140));
//! # Ok::<(), shoal::Error>(())
//! ```

pub mod config;
pub mod elastic;
pub mod error;
pub mod preempt;
pub mod runtime;
mod sched;
pub mod stat;
pub mod thread;
pub mod util;

pub use config::RuntimeConfig;
pub use elastic::authority::{CoreAuthority, GrantLimits, GrantStatus, LocalAuthority};
pub use error::{Error, ErrorKind, Result};
pub use runtime::{Runtime, RuntimeBuilder};
pub use stat::{CongestionSnapshot, CoreStats};
pub use thread::current::current_id;
pub use thread::{
    exit, park_and_switch, park_current, spawn, spawn_move, spawn_on, spawn_realtime, wake,
    yield_now, JoinHandle, ThreadId,
};
