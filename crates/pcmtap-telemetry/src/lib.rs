//! Capture pipeline metrics.
//!
//! Counters are incremented from the real-time capture thread and read
//! from anywhere, so everything here is a plain atomic behind an `Arc`.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Shared metrics for cross-thread capture monitoring.
#[derive(Clone, Default)]
pub struct CaptureMetrics {
    /// Total bytes delivered downstream since session start.
    pub bytes_read: Arc<AtomicU64>,
    /// Chunks posted to the downstream source.
    pub chunks_posted: Arc<AtomicU64>,

    /// Hardware buffer overruns observed.
    pub overruns: Arc<AtomicU64>,
    /// Successful driver recover calls.
    pub recoveries: Arc<AtomicU64>,
    /// POLLIN wakeups where the driver had nothing to read.
    pub spurious_wakeups: Arc<AtomicU64>,

    /// Completed suspend/resume cycles.
    pub suspend_cycles: Arc<AtomicU64>,
    /// Watermark increases triggered by the overrun adjuster.
    pub watermark_raises: Arc<AtomicU64>,
    /// Minimum-latency increases after the watermark saturated.
    pub latency_raises: Arc<AtomicU64>,

    pub last_post_time: Arc<RwLock<Option<Instant>>>,
}

impl CaptureMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_post(&self, bytes: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
        self.chunks_posted.fetch_add(1, Ordering::Relaxed);
        *self.last_post_time.write() = Some(Instant::now());
    }

    pub fn record_overrun(&self) {
        self.overruns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recovery(&self) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_spurious_wakeup(&self) {
        self.spurious_wakeups.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_suspend_cycle(&self) {
        self.suspend_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_watermark_raise(&self) {
        self.watermark_raises.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_latency_raise(&self) {
        self.latency_raises.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn chunks_posted(&self) -> u64 {
        self.chunks_posted.load(Ordering::Relaxed)
    }

    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    pub fn spurious_wakeups(&self) -> u64 {
        self.spurious_wakeups.load(Ordering::Relaxed)
    }
}
