//! Sample specifications and byte/time conversion.
//!
//! All timing math in the capture engine runs in whole microseconds and
//! whole bytes; conversions here are exact over u64 (widened through u128
//! internally so a 2s buffer at high rates cannot overflow).

pub const USEC_PER_SEC: u64 = 1_000_000;
pub const USEC_PER_MSEC: u64 = 1_000;

const RATE_MAX: u32 = 48_000 * 8;
const CHANNELS_MAX: u8 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    U8,
    S16Le,
    S16Be,
    S24Le,
    S32Le,
    F32Le,
}

impl SampleFormat {
    pub const fn sample_size(self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::S16Le | SampleFormat::S16Be => 2,
            SampleFormat::S24Le => 3,
            SampleFormat::S32Le | SampleFormat::F32Le => 4,
        }
    }
}

/// Immutable for the lifetime of a capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleSpec {
    pub format: SampleFormat,
    pub rate: u32,
    pub channels: u8,
}

impl SampleSpec {
    pub const fn frame_size(&self) -> usize {
        self.format.sample_size() * self.channels as usize
    }

    pub fn is_valid(&self) -> bool {
        self.rate > 0 && self.rate <= RATE_MAX && self.channels > 0 && self.channels <= CHANNELS_MAX
    }

    /// Truncating: full frames only, rounded toward zero.
    pub fn bytes_to_usec(&self, bytes: u64) -> u64 {
        let frames = bytes / self.frame_size() as u64;
        (frames as u128 * USEC_PER_SEC as u128 / self.rate as u128) as u64
    }

    pub fn bytes_to_usec_round_up(&self, bytes: u64) -> u64 {
        let fs = self.frame_size() as u64;
        let frames = (bytes + fs - 1) / fs;
        let num = frames as u128 * USEC_PER_SEC as u128;
        num.div_ceil(self.rate as u128) as u64
    }

    /// Truncating: result is always frame-aligned.
    pub fn usec_to_bytes(&self, usec: u64) -> u64 {
        let frames = (usec as u128 * self.rate as u128 / USEC_PER_SEC as u128) as u64;
        frames * self.frame_size() as u64
    }

    pub fn usec_to_bytes_round_up(&self, usec: u64) -> u64 {
        let num = usec as u128 * self.rate as u128;
        let frames = num.div_ceil(USEC_PER_SEC as u128) as u64;
        frames * self.frame_size() as u64
    }

    /// Round down to the nearest frame boundary.
    pub fn frame_align(&self, bytes: u64) -> u64 {
        bytes - bytes % self.frame_size() as u64
    }
}
