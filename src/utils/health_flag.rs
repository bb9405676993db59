use crossbeam::utils::CachePadded;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cheaply clonable up/down flag.
///
/// Connections flip it down as soon as a read or write fails so that
/// `is_status_ok` readers see the failure without touching the socket.
/// The atomic sits in its own cache line because the listener thread writes
/// it while both pump threads poll it.
#[derive(Clone)]
#[repr(transparent)]
pub struct HealthFlag(Arc<CachePadded<AtomicBool>>);

impl HealthFlag {
    #[inline]
    pub fn new(initial: bool) -> Self {
        Self(Arc::new(CachePadded::new(AtomicBool::new(initial))))
    }

    #[inline(always)]
    pub fn get(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn set(&self, v: bool) {
        self.0.store(v, Ordering::Release)
    }

    #[inline(always)]
    pub fn up(&self) {
        self.set(true);
    }

    #[inline(always)]
    pub fn down(&self) {
        self.set(false);
    }

    /// Flip the value and return the new one (used for liveness toggling).
    #[inline]
    pub fn toggle(&self) -> bool {
        !self.0.fetch_xor(true, Ordering::AcqRel)
    }
}

impl Default for HealthFlag {
    fn default() -> Self {
        Self::new(false)
    }
}

impl fmt::Debug for HealthFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthFlag")
            .field("value", &self.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_same_flag() {
        let flag = HealthFlag::new(false);
        let other = flag.clone();
        other.up();
        assert!(flag.get());
        flag.down();
        assert!(!other.get());
    }

    #[test]
    fn toggle_alternates() {
        let flag = HealthFlag::new(false);
        assert!(flag.toggle());
        assert!(!flag.toggle());
        assert!(flag.toggle());
        assert!(flag.get());
    }
}
