//! The capture engine.
//!
//! A single capture thread owns the driver handle, the smoother, and the
//! poll core. Each loop iteration drains the device through one of two
//! paths (zero-copy mmap or copy-based read), feeds the smoother, arms
//! the wakeup timer from the sleep budget, and blocks in the poll core.
//! Control messages from the main thread are applied between iterations,
//! so a state transition is always complete before the next read.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Receiver;
use nix::poll::PollFlags;

use pcmtap_foundation::clock::{has_hrtimer, SharedClock};
use pcmtap_foundation::error::{CaptureError, ConfigError, DriverError};
use pcmtap_foundation::ratelimit::LogRateLimiter;
use pcmtap_foundation::sample::{SampleSpec, USEC_PER_MSEC};
use pcmtap_telemetry::CaptureMetrics;

use crate::chunk::{Chunk, MemPool};
use crate::config::{
    effective_tsched, CaptureConfig, DEFAULT_TSCHED_WATERMARK_USEC, TSCHED_WATERMARK_STEP_USEC,
};
use crate::driver::{HwConfig, PcmDriver};
use crate::geometry::BufferGeometry;
use crate::mixer::VolumeControl;
use crate::msg::{control_channel, CaptureStatsSnapshot, ControlMsg, EngineEvent};
use crate::rtpoll::RtPoll;
use crate::smoother::Smoother;
use crate::source::{
    ChunkSink, NoReserve, ReservePolicy, SourceHandle, SourceNames, SourceState, ThreadInfo,
};

/// Upper bound on drain sub-iterations per wake, so a busy device cannot
/// keep the thread out of the poll core indefinitely.
const MAX_SUBITERATIONS: u32 = 10;

const SMOOTHER_MIN_SAMPLES: usize = 5;

/// Everything the engine needs at construction. The driver arrives opened
/// and negotiated; `hw` is what the negotiation settled on.
pub struct EngineParts {
    pub config: CaptureConfig,
    pub hw: HwConfig,
    pub driver: Box<dyn PcmDriver>,
    pub sink: Box<dyn ChunkSink>,
    pub pool: Arc<MemPool>,
    pub clock: SharedClock,
    pub metrics: CaptureMetrics,
    pub volume: Option<Box<dyn VolumeControl>>,
    pub reserve: Option<Box<dyn ReservePolicy>>,
    /// The server's source name registry.
    pub names: Arc<SourceNames>,
}

/// Handle to the spawned capture thread.
pub struct EngineHandle {
    thread: JoinHandle<()>,
}

impl EngineHandle {
    pub fn join(self) {
        let _ = self.thread.join();
    }
}

#[derive(Debug)]
struct PathOutcome {
    work_done: bool,
    sleep_usec: u64,
}

enum Flow {
    Continue,
    Shutdown,
}

pub struct CaptureEngine {
    driver: Box<dyn PcmDriver>,
    sink: Box<dyn ChunkSink>,
    volume: Option<Box<dyn VolumeControl>>,
    pool: Arc<MemPool>,
    clock: SharedClock,
    metrics: CaptureMetrics,
    rtpoll: RtPoll,
    inbox: Receiver<ControlMsg>,
    events: crossbeam_channel::Sender<EngineEvent>,
    smoother: Smoother,
    geometry: BufferGeometry,
    hw: HwConfig,
    info: ThreadInfo,
    read_count: u64,
    use_mmap: bool,
    use_tsched: bool,
    have_pollfds: bool,
    realtime_priority: Option<i32>,
    overrun_log: LogRateLimiter,
    spurious_warned: bool,
}

impl CaptureEngine {
    pub fn new(
        parts: EngineParts,
    ) -> Result<(Self, SourceHandle, Receiver<EngineEvent>), CaptureError> {
        parts.config.validate()?;
        let spec = parts.hw.spec;
        if !spec.is_valid() {
            return Err(ConfigError::SampleSpec.into());
        }

        let mut use_mmap = parts.config.mmap;
        let mut use_tsched = effective_tsched(parts.config.tsched, has_hrtimer());

        if use_mmap && !parts.hw.mmap {
            tracing::info!("device does not support mmap, falling back to serial read mode");
            use_mmap = false;
        }
        if use_tsched && (!parts.hw.mmap || !parts.hw.tsched) {
            tracing::info!("cannot enable timer-based scheduling, falling back to IRQ scheduling");
            use_tsched = false;
        }

        // Negotiation may have tweaked the configured fragment request.
        let requested_fragments = parts.config.fragments_or_default();
        let requested_fragment_size = parts.config.fragment_size_or_default(&spec);
        if parts.hw.nfragments != requested_fragments
            || parts.hw.fragment_size() != requested_fragment_size
        {
            tracing::debug!(
                requested_fragments,
                requested_fragment_size,
                granted_fragments = parts.hw.nfragments,
                granted_fragment_size = parts.hw.fragment_size(),
                "hardware adjusted the requested fragment geometry"
            );
        }

        let mut geometry = BufferGeometry::new(
            &spec,
            parts.hw.nfragments,
            parts.hw.fragment_size(),
            parts.config.tsched_watermark_or_default(&spec),
            spec.usec_to_bytes(TSCHED_WATERMARK_STEP_USEC),
        );
        if use_tsched {
            geometry.fix_min_sleep_wakeup(&spec);
            geometry.fix_tsched_watermark();
        }

        let hwbuf_usec = spec.bytes_to_usec(geometry.hwbuf_size);
        tracing::info!(
            fragments = geometry.nfragments,
            fragment_size = geometry.fragment_size,
            buffer_ms = hwbuf_usec / USEC_PER_MSEC,
            mmap = use_mmap,
            tsched = use_tsched,
            "capture buffer configured"
        );
        if use_tsched {
            tracing::info!(
                watermark_ms = spec.bytes_to_usec(geometry.tsched_watermark) / USEC_PER_MSEC,
                "timer scheduling watermark"
            );
        }

        let min_latency = if use_tsched { 0 } else { hwbuf_usec };
        let info = ThreadInfo::new(min_latency, hwbuf_usec);

        let rtpoll = RtPoll::new()?;
        let (tx, inbox) = control_channel(rtpoll.waker());
        let (event_tx, event_rx) = crossbeam_channel::unbounded();

        let mut smoother = Smoother::new(2 * DEFAULT_TSCHED_WATERMARK_USEC, SMOOTHER_MIN_SAMPLES);
        smoother.set_time_offset(parts.clock.now_usec());

        let (requested_name, collision_fatal) = parts.config.source_name();

        let mut engine = Self {
            driver: parts.driver,
            sink: parts.sink,
            volume: parts.volume,
            pool: parts.pool,
            clock: parts.clock,
            metrics: parts.metrics,
            rtpoll,
            inbox,
            events: event_tx,
            smoother,
            geometry,
            hw: parts.hw,
            info,
            read_count: 0,
            use_mmap,
            use_tsched,
            have_pollfds: false,
            realtime_priority: parts.config.realtime_priority,
            overrun_log: LogRateLimiter::new(Duration::from_secs(5)),
            spurious_warned: false,
        };

        engine.update_sw_params()?;

        // Claim the name last so a failed construction never leaves a
        // stale registration behind.
        let name = parts.names.claim(&requested_name, collision_fatal)?;
        tracing::info!(name = %name, "capture source registered");

        let reserve = parts.reserve.unwrap_or_else(|| Box::new(NoReserve));
        let handle = SourceHandle::new(name, parts.names, tx, reserve);

        Ok((engine, handle, event_rx))
    }

    /// Move the engine onto its capture thread.
    pub fn spawn(self) -> Result<EngineHandle, CaptureError> {
        let thread = thread::Builder::new()
            .name("pcm-capture".to_string())
            .spawn(move || self.run())
            .map_err(|e| CaptureError::Spawn(e.to_string()))?;
        Ok(EngineHandle { thread })
    }

    fn spec(&self) -> SampleSpec {
        self.hw.spec
    }

    fn frame_size(&self) -> u64 {
        self.geometry.frame_size
    }

    /// Recover a transient driver error and restart the stream. Anything
    /// the driver cannot recover in one attempt is fatal to the session.
    fn try_recover(&mut self, call: &'static str, err: DriverError) -> Result<(), CaptureError> {
        tracing::debug!(call, error = %err, "driver error");
        debug_assert!(!matches!(err, DriverError::Busy));

        if let Err(e) = self.driver.recover(&err, true) {
            tracing::error!(call, error = %e, "recovery failed");
            return Err(CaptureError::Driver { call, source: e });
        }
        self.metrics.record_recovery();

        self.driver
            .start()
            .map_err(|e| CaptureError::Driver { call: "start", source: e })?;
        Ok(())
    }

    /// Room left in the usable buffer. Zero means the device overran; the
    /// comparison is `<=` because an overrun only happens after the last
    /// sample was processed, not when it is removed from the buffer.
    fn check_left_to_record(&mut self, n_bytes: u64) -> u64 {
        let rec_space = self.geometry.max_use();

        if n_bytes <= rec_space {
            return rec_space - n_bytes;
        }

        self.metrics.record_overrun();
        if let Some(suppressed) = self.overrun_log.check() {
            tracing::info!(suppressed, "overrun!");
        }
        if self.use_tsched {
            self.adjust_after_overrun();
        }
        0
    }

    /// First try to widen the watermark band; once that saturates, raise
    /// the advertised minimum latency; once both saturate we run at the
    /// worst achievable quality and only note it quietly.
    fn adjust_after_overrun(&mut self) {
        debug_assert!(self.use_tsched);

        if self.geometry.bump_watermark() {
            self.metrics.record_watermark_raise();
            tracing::info!(
                watermark_ms =
                    self.spec().bytes_to_usec(self.geometry.tsched_watermark) / USEC_PER_MSEC,
                "increasing wakeup watermark"
            );
            return;
        }

        let old_min = self.info.min_latency;
        let new_min = (old_min * 2)
            .min(old_min + TSCHED_WATERMARK_STEP_USEC)
            .min(self.info.max_latency);

        if new_min != old_min {
            self.metrics.record_latency_raise();
            tracing::info!(
                min_latency_ms = new_min / USEC_PER_MSEC,
                "increasing minimal latency"
            );
            self.info.min_latency = new_min;
            if let Err(e) = self.update_sw_params() {
                tracing::warn!(error = %e, "failed to push software parameters");
            }
            return;
        }

        tracing::debug!("watermark and latency saturated, running at reduced quality");
    }

    fn warn_spurious_wakeup(&mut self) {
        self.metrics.record_spurious_wakeup();
        if !self.spurious_warned {
            self.spurious_warned = true;
            tracing::warn!(
                device = self.driver.device_name(),
                "woken up with POLLIN set but the device has nothing to read; \
                 most likely a driver bug"
            );
        }
    }

    /// Zero-copy path: acquire mapped regions and post borrowed views
    /// downstream, committing each window after the post returns.
    fn mmap_read(&mut self, mut polled: bool) -> Result<PathOutcome, CaptureError> {
        let mut work_done = false;
        let budget = self.use_tsched.then(|| {
            self.geometry
                .sleep_budget(&self.spec(), self.info.effective_requested_latency())
        });
        let mut left_to_record = 0;
        let mut j = 0;

        loop {
            let n_frames = match self.driver.avail() {
                Ok(n) => n,
                Err(e) => {
                    self.try_recover("avail", e)?;
                    continue;
                }
            };
            let mut n_bytes = n_frames * self.frame_size();

            left_to_record = self.check_left_to_record(n_bytes);

            if let Some(b) = budget {
                if !polled
                    && self.spec().bytes_to_usec(left_to_record)
                        > b.process_usec + b.sleep_usec / 2
                {
                    // Too early; go back to sleep.
                    break;
                }
            }

            if n_bytes == 0 {
                if polled {
                    self.warn_spurious_wakeup();
                }
                break;
            }

            j += 1;
            if j > MAX_SUBITERATIONS {
                break;
            }

            polled = false;

            loop {
                let grant = match self.driver.mmap_begin(n_bytes / self.frame_size()) {
                    Ok(g) => g,
                    Err(e) => {
                        self.try_recover("mmap_begin", e)?;
                        continue;
                    }
                };

                // Downstream copies must fit a single pool block.
                let max_frames = self.pool.block_size_max() as u64 / self.frame_size();
                let grant = grant.truncated(max_frames);

                // A single interleaved buffer is assumed; anything else is
                // a driver adapter bug.
                assert_eq!(grant.first_bit, 0);
                assert_eq!(grant.step_bits as u64, self.frame_size() * 8);

                let data = self.driver.mmap_bytes(&grant);
                self.sink.post(&Chunk::fixed(data));

                let committed = match self.driver.mmap_commit(grant) {
                    Ok(n) => n,
                    Err(e) => {
                        self.try_recover("mmap_commit", e)?;
                        continue;
                    }
                };

                work_done = true;
                let committed_bytes = committed * self.frame_size();
                self.read_count += committed_bytes;
                self.metrics.record_post(committed_bytes);

                if committed_bytes >= n_bytes {
                    break;
                }
                n_bytes -= committed_bytes;
            }
        }

        let sleep_usec = budget
            .map(|b| {
                self.spec()
                    .bytes_to_usec(left_to_record)
                    .saturating_sub(b.process_usec)
            })
            .unwrap_or(0);

        Ok(PathOutcome {
            work_done,
            sleep_usec,
        })
    }

    /// Copy path: read into pooled blocks and post views of them. Used
    /// when the driver cannot mmap or the operator disabled it.
    fn unix_read(&mut self, mut polled: bool) -> Result<PathOutcome, CaptureError> {
        let mut work_done = false;
        let budget = self.use_tsched.then(|| {
            self.geometry
                .sleep_budget(&self.spec(), self.info.effective_requested_latency())
        });
        let mut left_to_record = 0;
        let mut j = 0;

        loop {
            let n_frames = match self.driver.avail() {
                Ok(n) => n,
                Err(e) => {
                    self.try_recover("avail", e)?;
                    continue;
                }
            };
            let mut n_bytes = n_frames * self.frame_size();

            left_to_record = self.check_left_to_record(n_bytes);

            if let Some(b) = budget {
                if !polled
                    && self.spec().bytes_to_usec(left_to_record)
                        > b.process_usec + b.sleep_usec / 2
                {
                    break;
                }
            }

            if n_bytes == 0 {
                if polled {
                    self.warn_spurious_wakeup();
                }
                break;
            }

            j += 1;
            if j > MAX_SUBITERATIONS {
                break;
            }

            polled = false;

            loop {
                let mut block = self.pool.alloc();
                let want_frames =
                    (block.capacity() as u64 / self.frame_size()).min(n_bytes / self.frame_size());
                let want_bytes = (want_frames * self.frame_size()) as usize;

                let frames = match self.driver.read(&mut block.space_mut()[..want_bytes]) {
                    Ok(n) => n,
                    Err(e) => {
                        drop(block);
                        self.try_recover("read", e)?;
                        continue;
                    }
                };
                debug_assert!(frames != 0);

                let bytes = frames * self.frame_size();
                block.set_len(bytes as usize);
                self.sink.post(&Chunk::pooled(block.bytes()));

                work_done = true;
                self.read_count += bytes;
                self.metrics.record_post(bytes);

                if bytes >= n_bytes {
                    break;
                }
                n_bytes -= bytes;
            }
        }

        let sleep_usec = budget
            .map(|b| {
                self.spec()
                    .bytes_to_usec(left_to_record)
                    .saturating_sub(b.process_usec)
            })
            .unwrap_or(0);

        Ok(PathOutcome {
            work_done,
            sleep_usec,
        })
    }

    /// Feed the smoother one (wall, frame-time) observation: the device
    /// position is what we already delivered plus what still sits in the
    /// hardware, stamped with the driver's own timestamp when it has one.
    fn update_smoother(&mut self) {
        let delay = match self.driver.delay() {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(error = %e, "failed to query delay");
                return;
            }
        };

        let now = self
            .driver
            .status_timestamp()
            .filter(|&t| t > 0)
            .unwrap_or_else(|| self.clock.now_usec());

        let position = self.read_count + delay * self.frame_size();
        let position_time = self.spec().bytes_to_usec(position);

        self.smoother.put(now, position_time);
    }

    fn latency(&mut self) -> u64 {
        let now = self.clock.now_usec();
        let position_time = self.smoother.at(now);
        position_time.saturating_sub(self.spec().bytes_to_usec(self.read_count))
    }

    /// Recompute `hwbuf_unused` and push avail_min to the driver.
    fn update_sw_params(&mut self) -> Result<(), CaptureError> {
        let spec = self.spec();
        let latency = if self.use_tsched {
            self.info.effective_requested_latency()
        } else {
            None
        };

        if let Some(l) = latency {
            tracing::debug!(latency_ms = l / USEC_PER_MSEC, "latency request");
        }

        if self.use_tsched {
            self.geometry.update_for_latency(&spec, latency);
        } else {
            self.geometry.hwbuf_unused = 0;
        }
        tracing::debug!(hwbuf_unused = self.geometry.hwbuf_unused, "buffer tail reserved");

        let avail_min = self
            .geometry
            .avail_min_frames(&spec, self.use_tsched, latency);
        tracing::debug!(avail_min, "setting avail_min");

        self.driver
            .set_sw_params(avail_min)
            .map_err(|e| CaptureError::Driver { call: "set_sw_params", source: e })
    }

    fn suspend(&mut self) -> Result<(), CaptureError> {
        debug_assert!(self.info.state.is_opened());

        self.smoother.pause(self.clock.now_usec());
        self.driver.close();
        self.have_pollfds = false;

        tracing::info!("device suspended");
        Ok(())
    }

    /// Reopen and renegotiate. The hardware must hand back exactly the
    /// pre-suspend geometry and access mode, or the session is dead.
    fn unsuspend(&mut self) -> Result<(), CaptureError> {
        tracing::info!("trying resume");

        let granted = self
            .driver
            .reopen(&self.hw)
            .map_err(|e| CaptureError::Driver { call: "reopen", source: e })?;

        if granted != self.hw {
            self.driver.close();
            return Err(CaptureError::ResumeFailed(format!(
                "renegotiation changed the configuration: wanted {:?}, got {:?}",
                self.hw, granted
            )));
        }

        self.update_sw_params()?;
        self.have_pollfds = true;

        self.driver
            .start()
            .map_err(|e| CaptureError::Driver { call: "start", source: e })?;

        // Restore the virtual volume the main thread last told us about.
        if let (Some(ctl), Some(levels)) = (self.volume.as_mut(), self.info.last_volume.as_ref()) {
            ctl.apply(levels);
        }

        self.smoother.resume(self.clock.now_usec());
        self.metrics.record_suspend_cycle();

        tracing::info!("resumed successfully");
        Ok(())
    }

    fn set_state(&mut self, new: SourceState) -> Result<(), CaptureError> {
        match new {
            SourceState::Suspended => {
                if self.info.state.is_opened() {
                    self.suspend()?;
                }
            }
            SourceState::Idle | SourceState::Running => {
                if self.info.state == SourceState::Init {
                    self.have_pollfds = true;
                    self.driver
                        .start()
                        .map_err(|e| CaptureError::Driver { call: "start", source: e })?;
                }
                if self.info.state == SourceState::Suspended {
                    self.unsuspend()?;
                }
            }
            SourceState::Unlinked | SourceState::Init | SourceState::Invalid => {}
        }
        self.info.state = new;
        Ok(())
    }

    fn dispatch(&mut self, msg: ControlMsg) -> Result<Flow, CaptureError> {
        match msg {
            ControlMsg::Shutdown => return Ok(Flow::Shutdown),
            ControlMsg::SetState(new) => self.set_state(new)?,
            ControlMsg::GetLatency(reply) => {
                let latency = if self.info.state.is_opened() {
                    self.latency()
                } else {
                    0
                };
                let _ = reply.send(latency);
            }
            ControlMsg::GetStats(reply) => {
                let _ = reply.send(CaptureStatsSnapshot {
                    read_count: self.read_count,
                });
            }
            ControlMsg::SetVolume(levels) => {
                self.info.last_volume = Some(levels);
            }
            ControlMsg::SetLatencyRange { min_usec, max_usec } => {
                self.info.min_latency = min_usec;
                self.info.max_latency = max_usec;
            }
            ControlMsg::UpdateRequestedLatency(latency) => {
                self.info.requested_latency = latency;
                if self.info.state.is_opened() {
                    if let Err(e) = self.update_sw_params() {
                        tracing::warn!(error = %e, "failed to push software parameters");
                    }
                }
            }
        }
        Ok(Flow::Continue)
    }

    /// One trip around the main loop: drain, arm the timer, block, apply
    /// messages, demangle revents.
    fn iterate(&mut self, polled: &mut bool) -> Result<Flow, CaptureError> {
        if self.info.state.is_opened() {
            let outcome = if self.use_mmap {
                self.mmap_read(*polled)?
            } else {
                self.unix_read(*polled)?
            };

            if outcome.work_done {
                self.update_smoother();
            }

            if self.use_tsched {
                // Convert the sleep budget from the soundcard time domain
                // to the system domain and trust whichever fires first.
                let now = self.clock.now_usec();
                let cusec = self.smoother.translate(now, outcome.sleep_usec);
                self.rtpoll
                    .set_timer_relative(Duration::from_micros(outcome.sleep_usec.min(cusec)));
            } else {
                self.rtpoll.set_timer_disabled();
            }
        } else if self.use_tsched {
            self.rtpoll.set_timer_disabled();
        }

        let run = {
            let fds = if self.info.state.is_opened() && self.have_pollfds {
                self.driver.poll_descriptors()
            } else {
                Vec::new()
            };
            self.rtpoll.run(&fds)?
        };

        // Apply control messages before touching data again, so a state
        // transition is fully done before the next read.
        while let Ok(msg) = self.inbox.try_recv() {
            if let Flow::Shutdown = self.dispatch(msg)? {
                return Ok(Flow::Shutdown);
            }
        }

        *polled = false;
        if self.info.state.is_opened() && self.have_pollfds && !run.driver_revents.is_empty() {
            let revents = self
                .driver
                .poll_revents(&run.driver_revents)
                .map_err(|e| CaptureError::Driver { call: "poll_revents", source: e })?;

            if revents.intersects(!PollFlags::POLLIN) {
                // Error condition on the device fds; suspend-class event.
                tracing::debug!(?revents, "poll signalled an error condition");
                self.try_recover("poll", DriverError::Suspended)?;
            }
            *polled = revents.contains(PollFlags::POLLIN);
        }

        Ok(Flow::Continue)
    }

    fn run(mut self) {
        tracing::debug!("capture thread starting up");

        if let Some(priority) = self.realtime_priority {
            promote_to_realtime(priority);
        }

        let mut polled = false;
        let fatal = loop {
            match self.iterate(&mut polled) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Shutdown) => break None,
                Err(e) => break Some(e),
            }
        };

        if let Some(e) = fatal {
            tracing::error!(error = %e, "capture thread failed, requesting unload");
            let _ = self.events.send(EngineEvent::UnloadRequest);

            // Keep answering the control queue until the shutdown message
            // arrives, so main-thread sends never deadlock.
            while let Ok(msg) = self.inbox.recv() {
                match msg {
                    ControlMsg::Shutdown => break,
                    ControlMsg::GetLatency(reply) => {
                        let _ = reply.send(0);
                    }
                    ControlMsg::GetStats(reply) => {
                        let _ = reply.send(CaptureStatsSnapshot {
                            read_count: self.read_count,
                        });
                    }
                    _ => {}
                }
            }
        }

        tracing::debug!("capture thread shutting down");
    }
}

fn promote_to_realtime(priority: i32) {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    // SAFETY: only changes the scheduling class of the calling thread.
    let rc = unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_RR, &param) };
    if rc == 0 {
        tracing::info!(priority, "capture thread promoted to realtime priority");
    } else {
        tracing::debug!(rc, "realtime priority not granted");
    }
}
