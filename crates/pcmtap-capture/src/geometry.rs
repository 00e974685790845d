//! Hardware buffer geometry and the timer-scheduling arithmetic.
//!
//! Everything is in bytes under the negotiated sample spec. After any
//! mutation the invariants hold:
//!
//! - frame_size <= min_sleep  <= (hwbuf_size - hwbuf_unused) / 2
//! - frame_size <= min_wakeup <= (hwbuf_size - hwbuf_unused) / 2
//! - min_wakeup <= tsched_watermark <= (hwbuf_size - hwbuf_unused) - min_sleep

use pcmtap_foundation::sample::SampleSpec;

use crate::config::{TSCHED_MIN_SLEEP_USEC, TSCHED_MIN_WAKEUP_USEC};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferGeometry {
    pub frame_size: u64,
    pub fragment_size: u64,
    pub nfragments: u32,
    pub hwbuf_size: u64,
    /// Bytes of hardware buffer kept deliberately empty so a missed wakeup
    /// has headroom before the device overruns.
    pub hwbuf_unused: u64,
    pub tsched_watermark: u64,
    pub min_sleep: u64,
    pub min_wakeup: u64,
    pub watermark_step: u64,
}

/// Result of the wakeup budget calculation: how long the thread may sleep
/// and how much buffered time it is expected to drain per wake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SleepBudget {
    pub total_usec: u64,
    pub sleep_usec: u64,
    pub process_usec: u64,
}

impl BufferGeometry {
    pub fn new(
        spec: &SampleSpec,
        nfragments: u32,
        fragment_size: u64,
        tsched_watermark: u64,
        watermark_step: u64,
    ) -> Self {
        let frame_size = spec.frame_size() as u64;
        Self {
            frame_size,
            fragment_size,
            nfragments,
            hwbuf_size: fragment_size * nfragments as u64,
            hwbuf_unused: 0,
            tsched_watermark,
            min_sleep: frame_size,
            min_wakeup: frame_size,
            watermark_step,
        }
    }

    /// Usable buffer: capacity minus the deliberately unused tail.
    pub fn max_use(&self) -> u64 {
        self.hwbuf_size - self.hwbuf_unused
    }

    pub fn fix_min_sleep_wakeup(&mut self, spec: &SampleSpec) {
        let max_use_2 = spec.frame_align(self.max_use() / 2);

        // Lower bound wins over the upper one for degenerate buffers.
        self.min_sleep = spec
            .usec_to_bytes(TSCHED_MIN_SLEEP_USEC)
            .min(max_use_2)
            .max(self.frame_size);
        self.min_wakeup = spec
            .usec_to_bytes(TSCHED_MIN_WAKEUP_USEC)
            .min(max_use_2)
            .max(self.frame_size);
    }

    pub fn fix_tsched_watermark(&mut self) {
        let max_use = self.max_use();

        if self.tsched_watermark > max_use - self.min_sleep {
            self.tsched_watermark = max_use - self.min_sleep;
        }
        if self.tsched_watermark < self.min_wakeup {
            self.tsched_watermark = self.min_wakeup;
        }
    }

    /// Split the requested latency (or the whole buffer when unset) into a
    /// sleep budget and a per-wake drain budget. The watermark band sits
    /// below the usable capacity to absorb scheduling jitter.
    pub fn sleep_budget(&self, spec: &SampleSpec, requested_latency: Option<u64>) -> SleepBudget {
        let total_usec = requested_latency.unwrap_or_else(|| spec.bytes_to_usec(self.hwbuf_size));

        let mut wm = spec.bytes_to_usec(self.tsched_watermark);
        if wm > total_usec {
            wm = total_usec / 2;
        }

        SleepBudget {
            total_usec,
            sleep_usec: total_usec - wm,
            process_usec: wm,
        }
    }

    /// Overrun response, stage one: double the watermark, capped by one
    /// step, re-clamped under the invariants. Returns whether anything
    /// changed; when it did not the caller escalates to the latency range.
    pub fn bump_watermark(&mut self) -> bool {
        let old = self.tsched_watermark;
        self.tsched_watermark =
            (self.tsched_watermark * 2).min(self.tsched_watermark + self.watermark_step);
        self.fix_tsched_watermark();
        old != self.tsched_watermark
    }

    /// Software-parameter recomputation: reserve the buffer tail so that at
    /// most `latency` worth of data sits in the device, then re-derive the
    /// sleep/wakeup bounds.
    pub fn update_for_latency(&mut self, spec: &SampleSpec, latency: Option<u64>) {
        self.hwbuf_unused = 0;

        if let Some(latency) = latency {
            let mut b = spec.usec_to_bytes(latency);

            // We need at least one frame in the buffer.
            if b < self.frame_size {
                b = self.frame_size;
            }

            self.hwbuf_unused = self.hwbuf_size.saturating_sub(b);
        }

        self.fix_min_sleep_wakeup(spec);
        self.fix_tsched_watermark();
    }

    /// avail_min pushed to the driver: one frame, plus the sleep budget
    /// when timer scheduling drives the wakeups.
    pub fn avail_min_frames(
        &self,
        spec: &SampleSpec,
        tsched: bool,
        requested_latency: Option<u64>,
    ) -> u64 {
        let mut avail_min = 1;
        if tsched {
            let budget = self.sleep_budget(spec, requested_latency);
            avail_min += spec.usec_to_bytes(budget.sleep_usec) / self.frame_size;
        }
        avail_min
    }

    pub fn invariants_hold(&self) -> bool {
        let max_use = self.max_use();
        let half = max_use / 2;
        self.frame_size <= self.min_sleep
            && self.min_sleep <= half
            && self.frame_size <= self.min_wakeup
            && self.min_wakeup <= half
            && self.min_wakeup <= self.tsched_watermark
            && self.tsched_watermark <= max_use - self.min_sleep
    }
}
