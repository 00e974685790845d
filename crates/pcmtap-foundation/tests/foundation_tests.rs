//! Foundation crate tests
//!
//! Tests cover:
//! - Clock abstraction (RealClock, TestClock, SharedClock)
//! - Error types (DriverError, CaptureError, ConfigError)
//! - Sample spec conversions against known rates

use pcmtap_foundation::clock::{real_clock, Clock, TestClock};
use pcmtap_foundation::error::{CaptureError, ConfigError, DriverError};
use pcmtap_foundation::sample::{SampleFormat, SampleSpec, USEC_PER_MSEC, USEC_PER_SEC};
use std::time::Duration;

// ─── Clock Tests ────────────────────────────────────────────────────

#[test]
fn real_clock_advances_with_wall_time() {
    let clock = real_clock();
    let t0 = clock.now_usec();
    std::thread::sleep(Duration::from_millis(5));
    let t1 = clock.now_usec();
    assert!(t1 > t0);
}

#[test]
fn test_clock_is_fully_manual() {
    let clock = TestClock::new();
    let t0 = clock.now_usec();
    std::thread::sleep(Duration::from_millis(5));
    assert_eq!(clock.now_usec(), t0);

    clock.advance(Duration::from_millis(250));
    assert_eq!(clock.now_usec(), t0 + 250_000);
}

#[test]
fn test_clock_set_jumps() {
    let clock = TestClock::new();
    clock.set_usec(1_000_000);
    assert_eq!(clock.now_usec(), 1_000_000);
}

// ─── Error Type Tests ───────────────────────────────────────────────

#[test]
fn driver_error_messages_name_the_condition() {
    assert!(format!("{}", DriverError::Overrun).contains("overrun"));
    assert!(format!("{}", DriverError::Fatal("gone".into())).contains("gone"));
}

#[test]
fn capture_error_names_the_failing_call() {
    let err = CaptureError::Driver {
        call: "mmap_begin",
        source: DriverError::Overrun,
    };
    let msg = format!("{}", err);
    assert!(msg.contains("mmap_begin"));
    assert!(msg.contains("overrun"));
}

#[test]
fn capture_error_from_config_error() {
    let err: CaptureError = ConfigError::SampleSpec.into();
    assert!(matches!(err, CaptureError::Config(_)));
}

#[test]
fn config_error_names_the_taken_name() {
    let msg = format!("{}", ConfigError::NameTaken("alsa_input.mic".into()));
    assert!(msg.contains("alsa_input.mic"));
}

// ─── Sample Spec Tests ──────────────────────────────────────────────

#[test]
fn cd_quality_one_second() {
    let spec = SampleSpec {
        format: SampleFormat::S16Le,
        rate: 44_100,
        channels: 2,
    };
    assert_eq!(spec.usec_to_bytes(USEC_PER_SEC), 176_400);
    assert_eq!(spec.bytes_to_usec(176_400), USEC_PER_SEC);
}

#[test]
fn twenty_millis_at_48k() {
    let spec = SampleSpec {
        format: SampleFormat::S32Le,
        rate: 48_000,
        channels: 2,
    };
    // 960 frames of 8 bytes
    assert_eq!(spec.usec_to_bytes(20 * USEC_PER_MSEC), 7_680);
}

#[test]
fn conversions_compose() {
    let spec = SampleSpec {
        format: SampleFormat::S16Le,
        rate: 44_100,
        channels: 2,
    };
    for usec in [1_000u64, 4_000, 10_000, 25_000, 2_000_000] {
        let bytes = spec.usec_to_bytes(usec);
        assert_eq!(bytes % spec.frame_size() as u64, 0);
        assert!(spec.bytes_to_usec(bytes) <= usec);
    }
}
