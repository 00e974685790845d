//! Monotonic clock abstraction.
//!
//! The capture engine timestamps everything in microseconds since an
//! arbitrary origin. `RealClock` measures against a process-local
//! `Instant`; `TestClock` is advanced manually so timing-dependent code
//! can be exercised deterministically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    /// Monotonic time in microseconds since the clock's origin.
    fn now_usec(&self) -> u64;
}

pub struct RealClock {
    origin: Instant,
}

impl Default for RealClock {
    fn default() -> Self {
        Self::new()
    }
}

impl RealClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for RealClock {
    fn now_usec(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

/// Virtual clock for deterministic testing.
#[derive(Default)]
pub struct TestClock {
    now: AtomicU64,
}

impl TestClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, d: Duration) {
        self.advance_usec(d.as_micros() as u64);
    }

    pub fn advance_usec(&self, usec: u64) {
        self.now.fetch_add(usec, Ordering::SeqCst);
    }

    pub fn set_usec(&self, usec: u64) {
        self.now.store(usec, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now_usec(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

pub type SharedClock = Arc<dyn Clock>;

pub fn real_clock() -> SharedClock {
    Arc::new(RealClock::new())
}

/// Whether the kernel offers high-resolution timers. Timer-based
/// scheduling is pointless when the monotonic clock ticks at jiffy
/// granularity, so callers silently fall back to IRQ scheduling when this
/// returns false.
pub fn has_hrtimer() -> bool {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: clock_getres only writes the timespec we hand it.
    let rc = unsafe { libc::clock_getres(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        return false;
    }
    ts.tv_sec == 0 && ts.tv_nsec <= 1_000_000
}
