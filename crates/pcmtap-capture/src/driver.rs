//! Driver adapter contract.
//!
//! The engine talks to the soundcard through this trait and nothing else.
//! All calls are synchronous and happen on the capture thread, which owns
//! the driver exclusively. Error integers from the underlying library are
//! translated into the closed [`DriverError`] set at this boundary; the
//! engine never inspects raw codes.

use std::os::fd::BorrowedFd;

use nix::poll::PollFlags;

use pcmtap_foundation::error::DriverError;
use pcmtap_foundation::sample::SampleSpec;

/// The geometry and access mode a device was opened with. Resume must
/// renegotiate to an identical value or the session is dead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HwConfig {
    pub spec: SampleSpec,
    pub nfragments: u32,
    pub period_frames: u64,
    pub mmap: bool,
    pub tsched: bool,
}

impl HwConfig {
    pub fn fragment_size(&self) -> u64 {
        self.period_frames * self.spec.frame_size() as u64
    }

    pub fn hwbuf_frames(&self) -> u64 {
        self.period_frames * self.nfragments as u64
    }
}

/// A granted slice of the driver's mapped ring buffer.
///
/// The bytes behind a grant are reached through
/// [`PcmDriver::mmap_bytes`], which borrows the driver shared, so the
/// borrow necessarily ends before [`PcmDriver::mmap_commit`] takes the
/// driver mutably and consumes the grant. Holding captured data past the
/// commit therefore requires an explicit copy, which is exactly the
/// contract the downstream source must honor.
#[derive(Debug)]
pub struct MmapGrant {
    /// Frame offset of the grant inside the ring buffer.
    pub offset: u64,
    pub frames: u64,
    /// Bit offset of the first sample; anything but 0 is a driver bug.
    pub first_bit: u32,
    /// Distance between frames in bits; must equal frame_size * 8.
    pub step_bits: u32,
}

impl MmapGrant {
    /// Shrink the grant; committing fewer frames than granted is allowed.
    pub fn truncated(mut self, frames: u64) -> Self {
        if frames < self.frames {
            self.frames = frames;
        }
        self
    }
}

/// A pollable descriptor exported by the driver, borrowed for the
/// duration of one poll cycle.
pub struct PollDesc<'a> {
    pub fd: BorrowedFd<'a>,
    pub events: PollFlags,
}

pub trait PcmDriver: Send {
    fn device_name(&self) -> &str;

    /// Frames ready to be read, clamped internally so the answer never
    /// exceeds the configured hardware buffer. A would-block condition is
    /// reported as `Ok(0)`, not an error.
    fn avail(&mut self) -> Result<u64, DriverError>;

    /// Acquire up to `max_frames` of the mapped ring buffer for reading.
    fn mmap_begin(&mut self, max_frames: u64) -> Result<MmapGrant, DriverError>;

    /// The bytes behind a grant. Valid until the grant is committed.
    fn mmap_bytes(&self, grant: &MmapGrant) -> &[u8];

    /// Release a grant back to the hardware. Returns the frames actually
    /// consumed.
    fn mmap_commit(&mut self, grant: MmapGrant) -> Result<u64, DriverError>;

    /// Copy-based read of whole frames into `buf`. Blocks at most one
    /// hardware period. Returns frames read, never 0.
    fn read(&mut self, buf: &mut [u8]) -> Result<u64, DriverError>;

    /// Frames captured by the hardware but not yet delivered.
    fn delay(&mut self) -> Result<u64, DriverError>;

    /// Hardware-latched capture timestamp (monotonic usec) for the most
    /// recent period boundary; `None` when the driver did not set one.
    fn status_timestamp(&mut self) -> Option<u64>;

    fn poll_descriptors(&self) -> Vec<PollDesc<'_>>;

    /// Demangle raw revents for the descriptors returned by
    /// `poll_descriptors`, in the same order.
    fn poll_revents(&mut self, revents: &[PollFlags]) -> Result<PollFlags, DriverError>;

    /// Reset an errored stream without reopening the device. After a
    /// successful recover the stream is stopped; the caller must `start`
    /// again.
    fn recover(&mut self, err: &DriverError, silent: bool) -> Result<(), DriverError>;

    fn start(&mut self) -> Result<(), DriverError>;

    /// Drop the stream and close the device (suspend).
    fn close(&mut self);

    /// Reopen after `close` and renegotiate hardware parameters against
    /// `requested`. Returns what the hardware actually granted.
    fn reopen(&mut self, requested: &HwConfig) -> Result<HwConfig, DriverError>;

    /// Push software parameters: the minimum avail (frames) below which
    /// the device should not bother waking us.
    fn set_sw_params(&mut self, avail_min_frames: u64) -> Result<(), DriverError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcmtap_foundation::sample::SampleFormat;

    #[test]
    fn hw_config_derived_sizes() {
        let hw = HwConfig {
            spec: SampleSpec {
                format: SampleFormat::S16Le,
                rate: 44_100,
                channels: 2,
            },
            nfragments: 4,
            period_frames: 1024,
            mmap: true,
            tsched: true,
        };
        assert_eq!(hw.fragment_size(), 4096);
        assert_eq!(hw.hwbuf_frames(), 4096);
    }

    #[test]
    fn grant_truncation_only_shrinks() {
        let g = MmapGrant {
            offset: 0,
            frames: 100,
            first_bit: 0,
            step_bits: 32,
        };
        let g = g.truncated(40);
        assert_eq!(g.frames, 40);
        let g = g.truncated(400);
        assert_eq!(g.frames, 40);
    }
}
