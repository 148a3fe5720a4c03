//! Load accounting and the shared congestion snapshot.
//!
//! Each core tracks an exponentially weighted busy fraction and each run
//! queue stamps when it became non-empty. The elasticity monitor folds
//! those into one process-wide [`CongestionSnapshot`] per tick; readers
//! (the embedding application, the monitor itself) take the snapshot
//! without touching any scheduler lock.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Process-wide congestion snapshot, refreshed once per elasticity tick.
///
/// Values may be up to one tick stale; writes are release-ordered so a
/// reader that observes a value also observes everything that led to it.
#[derive(Debug)]
pub struct CongestionSnapshot {
    standing_queue_age_us: AtomicU64,
    load_bits: AtomicU32,
}

impl CongestionSnapshot {
    pub(crate) const fn new() -> Self {
        Self {
            standing_queue_age_us: AtomicU64::new(0),
            load_bits: AtomicU32::new(0),
        }
    }

    /// Publishes a new snapshot. Single writer (the elasticity monitor).
    pub(crate) fn publish(&self, standing_age_us: u64, load: f32) {
        self.load_bits.store(load.to_bits(), Ordering::Release);
        self.standing_queue_age_us
            .store(standing_age_us, Ordering::Release);
    }

    /// Age of the oldest continuously non-empty run queue, in microseconds.
    /// Zero when every queue has drained since the last tick.
    #[must_use]
    pub fn standing_queue_age_us(&self) -> u64 {
        self.standing_queue_age_us.load(Ordering::Acquire)
    }

    /// Average busy fraction across active cores, in `[0, 1]`.
    #[must_use]
    pub fn load(&self) -> f32 {
        f32::from_bits(self.load_bits.load(Ordering::Acquire))
    }
}

/// Exponentially weighted moving average of a core's busy fraction.
///
/// Written only by the owning core worker; read by the monitor.
#[derive(Debug)]
pub(crate) struct Ewma {
    bits: AtomicU32,
}

const EWMA_ALPHA: f32 = 0.25;

impl Ewma {
    pub(crate) const fn new() -> Self {
        Self {
            bits: AtomicU32::new(0),
        }
    }

    /// Folds in one busy-fraction sample (1.0 = spent the whole interval
    /// dispatching, 0.0 = spent it idle).
    pub(crate) fn record(&self, sample: f32) {
        let old = f32::from_bits(self.bits.load(Ordering::Relaxed));
        let new = old + EWMA_ALPHA * (sample - old);
        self.bits.store(new.to_bits(), Ordering::Relaxed);
    }

    pub(crate) fn value(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Relaxed))
    }

    pub(crate) fn reset(&self) {
        self.bits.store(0, Ordering::Relaxed);
    }
}

/// Per-core monotone event counters.
#[derive(Debug, Default)]
pub struct CoreStats {
    dispatches: AtomicU64,
    steals: AtomicU64,
    preemptions: AtomicU64,
    parks: AtomicU64,
    wakes: AtomicU64,
    migrations: AtomicU64,
}

macro_rules! counter {
    ($bump:ident, $get:ident, $field:ident) => {
        #[inline]
        pub(crate) fn $bump(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }

        /// Current value of the counter.
        #[must_use]
        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl CoreStats {
    pub(crate) const fn new() -> Self {
        Self {
            dispatches: AtomicU64::new(0),
            steals: AtomicU64::new(0),
            preemptions: AtomicU64::new(0),
            parks: AtomicU64::new(0),
            wakes: AtomicU64::new(0),
            migrations: AtomicU64::new(0),
        }
    }

    counter!(bump_dispatches, dispatches, dispatches);
    counter!(bump_steals, steals, steals);
    counter!(bump_preemptions, preemptions, preemptions);
    counter!(bump_parks, parks, parks);
    counter!(bump_wakes, wakes, wakes);
    counter!(bump_migrations, migrations, migrations);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_publish_read_roundtrip() {
        let snap = CongestionSnapshot::new();
        assert_eq!(snap.standing_queue_age_us(), 0);
        assert_eq!(snap.load(), 0.0);
        snap.publish(1500, 0.72);
        assert_eq!(snap.standing_queue_age_us(), 1500);
        assert!((snap.load() - 0.72).abs() < f32::EPSILON);
    }

    #[test]
    fn ewma_converges_toward_constant_input() {
        let ewma = Ewma::new();
        for _ in 0..64 {
            ewma.record(1.0);
        }
        assert!(ewma.value() > 0.99, "ewma stuck at {}", ewma.value());
        for _ in 0..64 {
            ewma.record(0.0);
        }
        assert!(ewma.value() < 0.01, "ewma stuck at {}", ewma.value());
    }

    #[test]
    fn counters_are_monotone() {
        let stats = CoreStats::new();
        stats.bump_dispatches();
        stats.bump_dispatches();
        stats.bump_steals();
        assert_eq!(stats.dispatches(), 2);
        assert_eq!(stats.steals(), 1);
        assert_eq!(stats.preemptions(), 0);
    }
}
