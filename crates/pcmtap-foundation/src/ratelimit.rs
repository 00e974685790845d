//! Log rate limiting.
//!
//! Diagnostics that can fire once per wakeup (overruns, spurious driver
//! wakeups) go through a limiter so a misbehaving device cannot flood the
//! log. `check` grants at most one event per interval and reports how many
//! were swallowed since the last grant.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

pub struct LogRateLimiter {
    interval: Duration,
    inner: Mutex<State>,
}

#[derive(Default)]
struct State {
    last: Option<Instant>,
    suppressed: u64,
}

impl LogRateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            inner: Mutex::new(State::default()),
        }
    }

    /// `Some(n)` means the caller may log now; `n` is the number of events
    /// suppressed since the previous grant.
    pub fn check(&self) -> Option<u64> {
        let now = Instant::now();
        let mut state = self.inner.lock();
        match state.last {
            Some(last) if now.duration_since(last) < self.interval => {
                state.suppressed += 1;
                None
            }
            _ => {
                state.last = Some(now);
                std::mem::take(&mut state.suppressed).into()
            }
        }
    }
}
