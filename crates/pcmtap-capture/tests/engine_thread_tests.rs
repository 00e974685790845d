//! Thread-level engine tests.
//!
//! These spawn the real capture thread against the scripted mock driver
//! and drive it the way a server would: state changes and queries go
//! through the source handle, data availability is signalled through the
//! driver's poll descriptor.

use std::time::{Duration, Instant};

use pcmtap_capture::engine::{CaptureEngine, EngineParts};
use pcmtap_capture::msg::EngineEvent;
use pcmtap_capture::testing::{test_hw_config, CollectingSink, MockDriver, MockHandle, SinkHandle};
use pcmtap_capture::{CaptureConfig, MemPool, SourceHandle, SourceNames};
use pcmtap_foundation::clock::real_clock;
use pcmtap_foundation::error::DriverError;
use pcmtap_telemetry::CaptureMetrics;

struct Rig {
    source: SourceHandle,
    events: crossbeam_channel::Receiver<EngineEvent>,
    driver: MockHandle,
    sink: SinkHandle,
    metrics: CaptureMetrics,
    engine: Option<pcmtap_capture::EngineHandle>,
}

fn spawn_rig(config: CaptureConfig) -> Rig {
    let hw = test_hw_config(true);
    let (driver, driver_handle) = MockDriver::new(hw.clone());
    let (sink, sink_handle) = CollectingSink::new();
    let metrics = CaptureMetrics::new();

    let (engine, source, events) = CaptureEngine::new(EngineParts {
        config,
        hw,
        driver: Box::new(driver),
        sink: Box::new(sink),
        pool: MemPool::new(65_536),
        clock: real_clock(),
        metrics: metrics.clone(),
        volume: None,
        reserve: None,
        names: SourceNames::new(),
    })
    .expect("engine construction");

    let engine = engine.spawn().expect("spawn capture thread");

    Rig {
        source,
        events,
        driver: driver_handle,
        sink: sink_handle,
        metrics,
        engine: Some(engine),
    }
}

fn irq_config() -> CaptureConfig {
    CaptureConfig {
        tsched: false,
        ..Default::default()
    }
}

fn wait_until(mut cond: impl FnMut() -> bool, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("timed out waiting for {what}");
}

impl Rig {
    fn shutdown(mut self) {
        self.source.shutdown();
        if let Some(engine) = self.engine.take() {
            engine.join();
        }
    }
}

#[test]
fn pollin_wakeup_drives_capture() {
    let rig = spawn_rig(irq_config());

    rig.source.resume(true).unwrap();
    rig.driver.add_pending_frames(441);
    rig.driver.signal_pollin();

    wait_until(|| rig.sink.bytes_posted() >= 441 * 4, "posted bytes");
    assert_eq!(rig.metrics.bytes_read(), rig.sink.bytes_posted() as u64);

    let stats = rig.source.stats().expect("stats reply");
    assert_eq!(stats.read_count, rig.sink.bytes_posted() as u64);

    assert!(rig.source.latency().is_some());

    rig.shutdown();
}

#[test]
fn suspend_resume_preserves_progress_and_geometry() {
    let rig = spawn_rig(irq_config());
    let expected_hw = test_hw_config(true);

    rig.source.resume(true).unwrap();
    rig.driver.add_pending_frames(1024);
    rig.driver.signal_pollin();
    wait_until(|| rig.sink.bytes_posted() >= 1024 * 4, "initial capture");

    let before = rig.source.stats().expect("stats reply");

    rig.source.suspend();
    wait_until(|| !rig.driver.is_open(), "driver closed on suspend");

    // Progress survives the suspend
    let during = rig.source.stats().expect("stats while suspended");
    assert_eq!(during.read_count, before.read_count);

    rig.source.resume(true).unwrap();
    wait_until(|| rig.driver.is_open(), "driver reopened");
    wait_until(|| rig.driver.is_started(), "stream restarted");

    // Renegotiation asked for exactly the original geometry
    assert_eq!(rig.driver.last_reopen_request(), Some(expected_hw));

    // And capture continues from where it left off
    rig.driver.add_pending_frames(441);
    rig.driver.signal_pollin();
    wait_until(
        || rig.sink.bytes_posted() as u64 >= before.read_count + 441 * 4,
        "capture after resume",
    );

    rig.shutdown();
}

#[test]
fn fatal_driver_error_requests_unload_and_drains_until_shutdown() {
    let rig = spawn_rig(irq_config());

    rig.source.resume(true).unwrap();

    rig.driver.push_avail_error(DriverError::Fatal("it died".into()));
    rig.driver.fail_next_recover();
    rig.driver.signal_pollin();

    let event = rig
        .events
        .recv_timeout(Duration::from_secs(2))
        .expect("unload request");
    assert_eq!(event, EngineEvent::UnloadRequest);

    let sink = rig.sink.clone();
    let posted = sink.bytes_posted();

    // The drain loop keeps answering queries so main-thread sends never
    // deadlock, and answers latency with zero.
    assert_eq!(rig.source.latency(), Some(0));

    rig.shutdown();
    assert_eq!(sink.bytes_posted(), posted, "no posts after fatal exit");
}

#[test]
fn shutdown_without_activity_exits_cleanly() {
    let rig = spawn_rig(irq_config());
    rig.shutdown();
}

#[test]
fn timer_scheduling_drains_without_pollin() {
    // tsched on: the armed timer alone must drive the drain.
    let rig = spawn_rig(CaptureConfig::default());

    rig.source.resume(true).unwrap();
    rig.source.update_requested_latency(Some(30_000));

    rig.driver.add_pending_frames(2000);

    wait_until(|| rig.sink.bytes_posted() >= 2000 * 4, "timer-driven drain");

    rig.shutdown();
}

#[test]
fn overrun_on_the_capture_thread_raises_the_watermark() {
    let rig = spawn_rig(CaptureConfig::default());

    rig.source.resume(true).unwrap();
    rig.source.update_requested_latency(Some(30_000));

    // Far more pending than 30ms of usable space
    rig.driver.add_pending_frames(4096);

    wait_until(|| rig.metrics.overruns() >= 1, "overrun observed");
    wait_until(|| rig.sink.bytes_posted() >= 4096 * 4, "data still drained");

    rig.shutdown();
}
