//! Kernel Timers - Monotonic time source
//!
//! Based on Mach4 kern/timer.h/c
//! The VM core only needs "now" in nanoseconds to age discardable objects;
//! the platform supplies a [`Clock`]. [`ManualClock`] is advanced
//! explicitly and serves hosted builds and tests.

use core::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// Time Types
// ============================================================================

/// Monotonic time in nanoseconds
pub type Nanos = u64;

// ============================================================================
// Clock
// ============================================================================

/// Monotonic clock
pub trait Clock: Send + Sync {
    fn now(&self) -> Nanos;
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub const fn new(start: Nanos) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    /// Move time forward by `delta`
    pub fn advance(&self, delta: Nanos) {
        self.now.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn set(&self, now: Nanos) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Nanos {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(10);
        assert_eq!(clock.now(), 10);
        clock.advance(5);
        assert_eq!(clock.now(), 15);
        clock.set(100);
        assert_eq!(clock.now(), 100);
    }
}
