//! Core elasticity: congestion aggregation and the grant state machine.
//!
//! The monitor thread wakes every `elastic_interval_us`, folds the
//! per-core signals into the shared congestion snapshot, and makes at
//! most one grant move per tick: grow by one core under congestion,
//! shrink by one when idle. An unreachable authority freezes the current
//! grant; growth is denied by default and the attempt is simply retried
//! next tick.

pub mod authority;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::Error;
use crate::runtime::RuntimeShared;
use crate::sched::core::CoreState;
use crate::util::mono_us;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ElasticState {
    Steady,
    Frozen,
}

/// Body of the elasticity monitor thread.
pub(crate) fn monitor_loop(rt: Arc<RuntimeShared>) {
    let interval = Duration::from_micros(rt.config.elastic_interval_us.max(1));
    let mut state = ElasticState::Steady;
    while !rt.shutdown.load(Ordering::Acquire) {
        std::thread::sleep(interval);
        if rt.shutdown.load(Ordering::Acquire) {
            break;
        }
        let (age, load) = aggregate(&rt);
        rt.snapshot.publish(age, load);

        let active = rt.grant.active();
        let congested = age >= rt.config.standing_age_high_us || load >= rt.config.load_high;
        let idle = age == 0 && load <= rt.config.load_low;

        if congested && active < rt.grant.maximum() {
            // A still-draining slot is not reusable yet; try again next tick.
            let Some(target) = rt.cores.iter().find(|c| c.state() == CoreState::Inactive) else {
                continue;
            };
            match rt.authority.acquire_core(active) {
                Ok(true) => {
                    target.activate();
                    rt.grant.set_active(active + 1);
                    debug!(core = target.idx, active = active + 1, age, load, "grew by one core");
                    thaw(&mut state);
                }
                Ok(false) => thaw(&mut state),
                Err(e) => freeze(&mut state, &e),
            }
        } else if idle && active > rt.grant.guaranteed() {
            let Some(target) = rt.cores.iter().rev().find(|c| c.state() == CoreState::Active)
            else {
                continue;
            };
            match rt.authority.release_core(active) {
                Ok(()) => {
                    target.begin_drain();
                    rt.grant.set_active(active - 1);
                    debug!(core = target.idx, active = active - 1, "released one core");
                    thaw(&mut state);
                }
                Err(e) => freeze(&mut state, &e),
            }
        }
    }
}

/// Denied is an answer; only unreachability freezes the grant.
fn freeze(state: &mut ElasticState, err: &Error) {
    if *state != ElasticState::Frozen {
        warn!(error = %err, "core authority unreachable; freezing current grant");
        *state = ElasticState::Frozen;
    }
}

fn thaw(state: &mut ElasticState) {
    if *state == ElasticState::Frozen {
        debug!("core authority reachable again");
        *state = ElasticState::Steady;
    }
}

/// Standing age is the maximum over active cores of time since the queue
/// last became non-empty; load is the mean of the per-core EWMAs.
fn aggregate(rt: &Arc<RuntimeShared>) -> (u64, f32) {
    let now = mono_us();
    let mut max_age = 0u64;
    let mut load_sum = 0.0f32;
    let mut active = 0u32;
    for core in &rt.cores {
        if core.state() != CoreState::Active {
            continue;
        }
        active += 1;
        load_sum += core.load.value();
        let since = core.queue.nonempty_since_us();
        if since != 0 {
            max_age = max_age.max(now.saturating_sub(since));
        }
    }
    #[allow(clippy::cast_precision_loss)]
    let load = if active == 0 { 0.0 } else { load_sum / active as f32 };
    (max_age, load)
}
