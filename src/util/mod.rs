//! Small shared utilities.

pub mod arena;
pub mod det_rng;

pub use arena::{Arena, ArenaIndex};
pub use det_rng::DetRng;

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Monotonic microseconds since the first call in this process.
///
/// Never returns 0, so 0 can serve as an "unset" sentinel in timestamps.
#[must_use]
pub fn mono_us() -> u64 {
    let epoch = *EPOCH.get_or_init(Instant::now);
    let us = Instant::now().duration_since(epoch).as_micros();
    u64::try_from(us).unwrap_or(u64::MAX).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mono_us_is_monotone_and_nonzero() {
        let a = mono_us();
        let b = mono_us();
        assert!(a >= 1);
        assert!(b >= a, "monotonic clock went backwards: {a} -> {b}");
    }
}
