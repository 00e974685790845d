//! Smoothed mapping between wall-clock time and soundcard frame time.
//!
//! The driver's frame counter and the system's monotonic clock drift
//! against each other and both jitter. The smoother keeps an
//! exponentially weighted linear fit over recent (wall, frame-time)
//! pairs and answers forward queries (`at`), inverse delta translations
//! (`translate`), and survives suspend through pause/resume without a
//! discontinuity in the fitted timeline.

use std::collections::VecDeque;

const HISTORY_MAX: usize = 64;

#[derive(Debug, Clone, Copy)]
struct Sample {
    wall: u64,
    frame: u64,
}

#[derive(Debug)]
pub struct Smoother {
    history_usec: u64,
    min_samples: usize,
    samples: VecDeque<Sample>,
    /// Subtracted from every incoming wall time; bumped on resume so the
    /// fitted timeline continues where pause froze it.
    time_offset: u64,
    paused: bool,
    pause_wall: u64,
    last_answer: u64,
}

impl Smoother {
    pub fn new(history_usec: u64, min_samples: usize) -> Self {
        Self {
            history_usec: history_usec.max(1),
            min_samples: min_samples.max(2),
            samples: VecDeque::with_capacity(HISTORY_MAX),
            time_offset: 0,
            paused: false,
            pause_wall: 0,
            last_answer: 0,
        }
    }

    pub fn set_time_offset(&mut self, now: u64) {
        self.time_offset = now;
    }

    fn local(&self, wall: u64) -> u64 {
        wall.saturating_sub(self.time_offset)
    }

    /// Record an observation pair. Ignored while paused.
    pub fn put(&mut self, wall: u64, frame: u64) {
        if self.paused {
            return;
        }
        let wall = self.local(wall);

        // Keep the series monotonic in wall time; out-of-order samples are
        // driver jitter and carry no information.
        if let Some(last) = self.samples.back() {
            if wall <= last.wall {
                return;
            }
        }

        self.samples.push_back(Sample { wall, frame });
        self.prune(wall);
    }

    fn prune(&mut self, now: u64) {
        while self.samples.len() > HISTORY_MAX {
            self.samples.pop_front();
        }
        while self.samples.len() > self.min_samples {
            let oldest = self.samples.front().expect("non-empty");
            if now.saturating_sub(oldest.wall) <= self.history_usec {
                break;
            }
            self.samples.pop_front();
        }
    }

    /// Slope of the fitted line, d(frame)/d(wall). Falls back to 1.0 until
    /// the fit has enough samples to be trusted.
    fn slope(&self) -> f64 {
        if self.samples.len() < self.min_samples {
            return 1.0;
        }

        let newest = self.samples.back().expect("non-empty").wall;
        let mut sw = 0.0;
        let mut sx = 0.0;
        let mut sy = 0.0;
        for s in &self.samples {
            let age = (newest - s.wall) as f64;
            let w = (-age / self.history_usec as f64).exp();
            sw += w;
            sx += w * s.wall as f64;
            sy += w * s.frame as f64;
        }
        let mx = sx / sw;
        let my = sy / sw;

        let mut sxx = 0.0;
        let mut sxy = 0.0;
        for s in &self.samples {
            let age = (newest - s.wall) as f64;
            let w = (-age / self.history_usec as f64).exp();
            let dx = s.wall as f64 - mx;
            sxx += w * dx * dx;
            sxy += w * dx * (s.frame as f64 - my);
        }

        if sxx <= f64::EPSILON {
            return 1.0;
        }
        (sxy / sxx).clamp(0.1, 10.0)
    }

    /// Forward query: estimated frame time at wall time `wall`. Clamped to
    /// be monotonically non-decreasing across calls.
    pub fn at(&mut self, wall: u64) -> u64 {
        let wall = if self.paused {
            self.pause_wall
        } else {
            self.local(wall)
        };

        let Some(anchor) = self.samples.back() else {
            return self.last_answer;
        };

        let slope = self.slope();
        let estimate = anchor.frame as f64 + slope * (wall as f64 - anchor.wall as f64);
        let estimate = if estimate < 0.0 { 0 } else { estimate as u64 };

        self.last_answer = self.last_answer.max(estimate);
        self.last_answer
    }

    /// Inverse delta query: how much wall time corresponds to
    /// `delta_frame` of soundcard time, under the current drift estimate.
    pub fn translate(&self, _now: u64, delta_frame: u64) -> u64 {
        (delta_frame as f64 / self.slope()).round() as u64
    }

    /// Freeze the fit. Forward queries keep answering with the state at
    /// pause time; observations are dropped.
    pub fn pause(&mut self, now: u64) {
        if self.paused {
            return;
        }
        self.pause_wall = self.local(now);
        self.paused = true;
    }

    /// Continue the fitted timeline at `now` as if no wall time passed
    /// while paused.
    pub fn resume(&mut self, now: u64) {
        if !self.paused {
            return;
        }
        self.time_offset = now.saturating_sub(self.pause_wall);
        self.paused = false;
    }

    /// Observations currently feeding the fit.
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn reset(&mut self, now: u64) {
        self.samples.clear();
        self.time_offset = now;
        self.paused = false;
        self.pause_wall = 0;
        self.last_answer = 0;
    }
}
