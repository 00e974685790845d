//! Construction-time configuration.
//!
//! Mirrors the option set a server module would parse from its argument
//! string. Byte quantities are derived from the negotiated sample spec at
//! engine construction, not here, since the driver may still tweak the
//! spec during format negotiation.

use pcmtap_foundation::error::ConfigError;
use pcmtap_foundation::sample::{SampleSpec, USEC_PER_MSEC, USEC_PER_SEC};

pub const DEFAULT_DEVICE: &str = "default";
pub const DEFAULT_TSCHED_BUFFER_USEC: u64 = 2 * USEC_PER_SEC;
pub const DEFAULT_TSCHED_WATERMARK_USEC: u64 = 20 * USEC_PER_MSEC;
pub const TSCHED_WATERMARK_STEP_USEC: u64 = 10 * USEC_PER_MSEC;
pub const TSCHED_MIN_SLEEP_USEC: u64 = 10 * USEC_PER_MSEC;
pub const TSCHED_MIN_WAKEUP_USEC: u64 = 4 * USEC_PER_MSEC;

pub const DEFAULT_FRAGMENTS: u32 = 4;
pub const DEFAULT_FRAGMENT_USEC: u64 = 25 * USEC_PER_MSEC;

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Driver device string, e.g. "default" or "hw:0,0".
    pub device: String,
    /// Stable device identifier, preferred over `device` for naming.
    pub device_id: Option<String>,
    /// Explicit source name; collision with an existing registration is
    /// then fatal instead of auto-renamed.
    pub source_name: Option<String>,
    pub name: Option<String>,

    /// Hardware geometry requests, bytes. `None` derives from the spec.
    pub fragments: Option<u32>,
    pub fragment_size: Option<u64>,

    /// Timer-scheduling tuning, bytes under the *requested* spec.
    pub tsched_buffer_size: Option<u64>,
    pub tsched_buffer_watermark: Option<u64>,

    /// Request the zero-copy mmap path.
    pub mmap: bool,
    /// Request timer scheduling. Silently disabled when the kernel lacks
    /// high-resolution timers or the device cannot do mmap.
    pub tsched: bool,
    /// Skip dB-scale negotiation with the mixer.
    pub ignore_db: bool,

    /// Elevate the capture thread to realtime priority when set.
    pub realtime_priority: Option<i32>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: DEFAULT_DEVICE.to_string(),
            device_id: None,
            source_name: None,
            name: None,
            fragments: None,
            fragment_size: None,
            tsched_buffer_size: None,
            tsched_buffer_watermark: None,
            mmap: true,
            tsched: true,
            ignore_db: false,
            realtime_priority: None,
        }
    }
}

impl CaptureConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fragments == Some(0) {
            return Err(ConfigError::BufferMetrics("fragments must be > 0".into()));
        }
        if self.fragment_size == Some(0) {
            return Err(ConfigError::BufferMetrics(
                "fragment_size must be > 0".into(),
            ));
        }
        if self.tsched_buffer_size == Some(0) {
            return Err(ConfigError::BufferMetrics(
                "tsched_buffer_size must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn fragments_or_default(&self) -> u32 {
        self.fragments.unwrap_or(DEFAULT_FRAGMENTS)
    }

    pub fn fragment_size_or_default(&self, spec: &SampleSpec) -> u64 {
        match self.fragment_size {
            Some(b) => b.max(spec.frame_size() as u64),
            None => spec
                .usec_to_bytes(DEFAULT_FRAGMENT_USEC)
                .max(spec.frame_size() as u64),
        }
    }

    pub fn tsched_watermark_or_default(&self, spec: &SampleSpec) -> u64 {
        self.tsched_buffer_watermark
            .unwrap_or_else(|| spec.usec_to_bytes(DEFAULT_TSCHED_WATERMARK_USEC))
    }

    /// Source naming policy: an explicit name makes registry collisions
    /// fatal; a derived name may be auto-renamed by the registry.
    pub fn source_name(&self) -> (String, bool) {
        if let Some(n) = &self.source_name {
            return (n.clone(), true);
        }
        if let Some(n) = &self.name {
            return (format!("alsa_input.{n}"), true);
        }
        let n = self.device_id.as_deref().unwrap_or(&self.device);
        (format!("alsa_input.{n}"), false)
    }
}

/// Timer scheduling needs both a willing configuration and a capable
/// kernel; the fallback is silent apart from a notice.
pub fn effective_tsched(requested: bool, hrtimer_available: bool) -> bool {
    if requested && !hrtimer_available {
        tracing::info!(
            "Disabling timer-based scheduling because high-resolution timers are not available"
        );
        return false;
    }
    requested
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcmtap_foundation::sample::SampleFormat;

    fn spec() -> SampleSpec {
        SampleSpec {
            format: SampleFormat::S16Le,
            rate: 44_100,
            channels: 2,
        }
    }

    #[test]
    fn defaults_convert_to_bytes_under_the_spec() {
        let cfg = CaptureConfig::default();
        let spec = spec();
        assert_eq!(cfg.fragments_or_default(), 4);
        assert_eq!(
            cfg.fragment_size_or_default(&spec),
            spec.usec_to_bytes(25 * USEC_PER_MSEC)
        );
        assert_eq!(
            cfg.tsched_watermark_or_default(&spec),
            spec.usec_to_bytes(20 * USEC_PER_MSEC)
        );
    }

    #[test]
    fn zero_buffer_metrics_are_rejected() {
        let cfg = CaptureConfig {
            fragments: Some(0),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = CaptureConfig {
            fragment_size: Some(0),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn explicit_source_name_is_collision_fatal() {
        let cfg = CaptureConfig {
            source_name: Some("mic".into()),
            ..Default::default()
        };
        assert_eq!(cfg.source_name(), ("mic".into(), true));
    }

    #[test]
    fn derived_name_prefers_device_id() {
        let cfg = CaptureConfig {
            device: "hw:0,0".into(),
            device_id: Some("usb-0001".into()),
            ..Default::default()
        };
        assert_eq!(cfg.source_name(), ("alsa_input.usb-0001".into(), false));

        let cfg = CaptureConfig {
            device: "hw:0,0".into(),
            ..Default::default()
        };
        assert_eq!(cfg.source_name(), ("alsa_input.hw:0,0".into(), false));
    }

    #[test]
    fn tsched_disabled_without_hrtimers() {
        assert!(effective_tsched(true, true));
        assert!(!effective_tsched(true, false));
        assert!(!effective_tsched(false, true));
    }
}
