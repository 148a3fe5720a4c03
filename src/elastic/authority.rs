//! The core-allocation authority contract and the shared grant block.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

use crate::error::Result;

/// Core limits exchanged during the startup handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GrantLimits {
    /// Most cores the runtime may ever hold.
    pub maximum: usize,
    /// Cores the runtime keeps without negotiation.
    pub guaranteed: usize,
}

/// The external authority that owns core allocation (the IOKernel in a
/// full deployment). The runtime only ever grows after an explicit grant
/// and reports every release; the authority's placement policy is its own
/// business.
pub trait CoreAuthority: Send + Sync {
    /// Startup handshake. The authority may clamp the requested limits;
    /// an error here rejects the runtime outright.
    fn attach(&self, requested: GrantLimits) -> Result<GrantLimits>;

    /// Asks for one core beyond the current `active` count.
    /// `Ok(false)` is a denial, not an error.
    fn acquire_core(&self, active: usize) -> Result<bool>;

    /// Returns one of the current `active` cores.
    fn release_core(&self, active: usize) -> Result<()>;
}

/// In-process authority that grants everything asked of it. Used when the
/// runtime runs standalone, and by tests.
#[derive(Debug, Default)]
pub struct LocalAuthority;

impl CoreAuthority for LocalAuthority {
    fn attach(&self, requested: GrantLimits) -> Result<GrantLimits> {
        Ok(requested)
    }

    fn acquire_core(&self, _active: usize) -> Result<bool> {
        Ok(true)
    }

    fn release_core(&self, _active: usize) -> Result<()> {
        Ok(())
    }
}

/// The grant control block: the runtime's view of its negotiated limits
/// and current core count. `active` has a single writer (the elasticity
/// monitor) and any number of readers.
#[derive(Debug)]
pub struct CoreGrant {
    maximum: usize,
    guaranteed: usize,
    active: AtomicUsize,
}

impl CoreGrant {
    pub(crate) fn new(limits: GrantLimits) -> Self {
        Self {
            maximum: limits.maximum,
            guaranteed: limits.guaranteed,
            active: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn maximum(&self) -> usize {
        self.maximum
    }

    #[must_use]
    pub fn guaranteed(&self) -> usize {
        self.guaranteed
    }

    #[must_use]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn set_active(&self, n: usize) {
        debug_assert!(n <= self.maximum, "active {n} above maximum {}", self.maximum);
        self.active.store(n, Ordering::Release);
    }

    /// Consistent one-shot view of the grant.
    #[must_use]
    pub fn status(&self) -> GrantStatus {
        GrantStatus {
            maximum: self.maximum,
            guaranteed: self.guaranteed,
            active: self.active(),
        }
    }
}

/// Read-only snapshot of [`CoreGrant`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GrantStatus {
    pub maximum: usize,
    pub guaranteed: usize,
    pub active: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_authority_echoes_the_request() {
        let authority = LocalAuthority;
        let limits = GrantLimits {
            maximum: 4,
            guaranteed: 2,
        };
        assert_eq!(authority.attach(limits).unwrap(), limits);
        assert!(authority.acquire_core(2).unwrap());
        authority.release_core(3).unwrap();
    }

    #[test]
    fn grant_status_reflects_active_updates() {
        let grant = CoreGrant::new(GrantLimits {
            maximum: 4,
            guaranteed: 1,
        });
        assert_eq!(grant.active(), 0);
        grant.set_active(3);
        let status = grant.status();
        assert_eq!(status.maximum, 4);
        assert_eq!(status.guaranteed, 1);
        assert_eq!(status.active, 3);
    }
}
