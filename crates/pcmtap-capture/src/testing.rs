//! Test fixtures shared by the unit and integration suites: a scripted
//! mock driver whose poll descriptor is a real pipe, and a sink that
//! materializes every posted chunk.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::AsFd;
use std::sync::Arc;

use nix::fcntl::OFlag;
use nix::poll::PollFlags;
use nix::unistd::pipe2;

use pcmtap_foundation::error::DriverError;
use pcmtap_foundation::sample::{SampleFormat, SampleSpec};

use crate::chunk::{Chunk, Provenance};
use crate::driver::{HwConfig, MmapGrant, PcmDriver, PollDesc};
use crate::source::ChunkSink;

pub fn test_spec() -> SampleSpec {
    SampleSpec {
        format: SampleFormat::S16Le,
        rate: 44_100,
        channels: 2,
    }
}

/// 4 fragments of 1024 frames (4096 bytes) each.
pub fn test_hw_config(mmap: bool) -> HwConfig {
    HwConfig {
        spec: test_spec(),
        nfragments: 4,
        period_frames: 1024,
        mmap,
        tsched: mmap,
    }
}

#[derive(Default)]
struct MockState {
    pending_frames: u64,
    avail_errors: VecDeque<DriverError>,
    read_errors: VecDeque<DriverError>,
    recover_failures: u32,
    delay_frames: u64,
    timestamp: Option<u64>,
    open: bool,
    started: bool,
    fill: u8,
    start_count: u32,
    recover_count: u32,
    commit_count: u32,
    sw_params: Vec<u64>,
    reopen_override: Option<HwConfig>,
    last_reopen_request: Option<HwConfig>,
}

/// Scripted driver. Behavior is driven through the shared [`MockHandle`]:
/// how many frames are pending, which calls fail, whether recovery
/// succeeds. The poll descriptor is a real pipe so the engine's poll core
/// sees genuine POLLIN when a test signals data.
pub struct MockDriver {
    state: Arc<Mutex<MockState>>,
    hw: HwConfig,
    window: Vec<u8>,
    pipe_r: File,
}

#[derive(Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
    pipe_w: Arc<File>,
}

impl MockDriver {
    pub fn new(hw: HwConfig) -> (Self, MockHandle) {
        let (r, w) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).expect("pipe2");
        let state = Arc::new(Mutex::new(MockState {
            open: true,
            ..Default::default()
        }));
        let window = vec![0u8; (hw.hwbuf_frames() as usize) * hw.spec.frame_size()];
        let driver = Self {
            state: state.clone(),
            hw,
            window,
            pipe_r: File::from(r),
        };
        let handle = MockHandle {
            state,
            pipe_w: Arc::new(File::from(w)),
        };
        (driver, handle)
    }

    fn frame_size(&self) -> u64 {
        self.hw.spec.frame_size() as u64
    }
}

impl PcmDriver for MockDriver {
    fn device_name(&self) -> &str {
        "mock"
    }

    fn avail(&mut self) -> Result<u64, DriverError> {
        let mut st = self.state.lock();
        if let Some(err) = st.avail_errors.pop_front() {
            return Err(err);
        }
        Ok(st.pending_frames.min(self.hw.hwbuf_frames()))
    }

    fn mmap_begin(&mut self, max_frames: u64) -> Result<MmapGrant, DriverError> {
        let (pending, fill) = {
            let st = self.state.lock();
            (st.pending_frames, st.fill)
        };
        let window_frames = self.window.len() as u64 / self.frame_size();
        let frames = max_frames.min(pending).min(window_frames);
        self.window.fill(fill);
        Ok(MmapGrant {
            offset: 0,
            frames,
            first_bit: 0,
            step_bits: (self.frame_size() * 8) as u32,
        })
    }

    fn mmap_bytes(&self, grant: &MmapGrant) -> &[u8] {
        &self.window[..(grant.frames * self.frame_size()) as usize]
    }

    fn mmap_commit(&mut self, grant: MmapGrant) -> Result<u64, DriverError> {
        let mut st = self.state.lock();
        st.pending_frames = st.pending_frames.saturating_sub(grant.frames);
        st.commit_count += 1;
        Ok(grant.frames)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<u64, DriverError> {
        let mut st = self.state.lock();
        if let Some(err) = st.read_errors.pop_front() {
            return Err(err);
        }
        let frames = (buf.len() as u64 / self.frame_size()).min(st.pending_frames);
        let bytes = (frames * self.frame_size()) as usize;
        buf[..bytes].fill(st.fill);
        st.pending_frames -= frames;
        Ok(frames)
    }

    fn delay(&mut self) -> Result<u64, DriverError> {
        Ok(self.state.lock().delay_frames)
    }

    fn status_timestamp(&mut self) -> Option<u64> {
        self.state.lock().timestamp
    }

    fn poll_descriptors(&self) -> Vec<PollDesc<'_>> {
        vec![PollDesc {
            fd: self.pipe_r.as_fd(),
            events: PollFlags::POLLIN,
        }]
    }

    fn poll_revents(&mut self, revents: &[PollFlags]) -> Result<PollFlags, DriverError> {
        let mut buf = [0u8; 64];
        while let Ok(n) = self.pipe_r.read(&mut buf) {
            if n < buf.len() {
                break;
            }
        }
        Ok(revents
            .iter()
            .fold(PollFlags::empty(), |acc, &flags| acc | flags))
    }

    fn recover(&mut self, _err: &DriverError, _silent: bool) -> Result<(), DriverError> {
        let mut st = self.state.lock();
        st.recover_count += 1;
        if st.recover_failures > 0 {
            st.recover_failures -= 1;
            return Err(DriverError::Fatal("recovery failed".into()));
        }
        st.started = false;
        Ok(())
    }

    fn start(&mut self) -> Result<(), DriverError> {
        let mut st = self.state.lock();
        st.started = true;
        st.start_count += 1;
        Ok(())
    }

    fn close(&mut self) {
        let mut st = self.state.lock();
        st.open = false;
        st.started = false;
    }

    fn reopen(&mut self, requested: &HwConfig) -> Result<HwConfig, DriverError> {
        let mut st = self.state.lock();
        st.last_reopen_request = Some(requested.clone());
        st.open = true;
        Ok(st.reopen_override.take().unwrap_or_else(|| requested.clone()))
    }

    fn set_sw_params(&mut self, avail_min_frames: u64) -> Result<(), DriverError> {
        self.state.lock().sw_params.push(avail_min_frames);
        Ok(())
    }
}

impl MockHandle {
    pub fn set_pending_frames(&self, frames: u64) {
        self.state.lock().pending_frames = frames;
    }

    pub fn add_pending_frames(&self, frames: u64) {
        self.state.lock().pending_frames += frames;
    }

    pub fn pending_frames(&self) -> u64 {
        self.state.lock().pending_frames
    }

    pub fn push_avail_error(&self, err: DriverError) {
        self.state.lock().avail_errors.push_back(err);
    }

    pub fn push_read_error(&self, err: DriverError) {
        self.state.lock().read_errors.push_back(err);
    }

    pub fn fail_next_recover(&self) {
        self.state.lock().recover_failures += 1;
    }

    pub fn set_delay_frames(&self, frames: u64) {
        self.state.lock().delay_frames = frames;
    }

    pub fn set_timestamp(&self, usec: Option<u64>) {
        self.state.lock().timestamp = usec;
    }

    pub fn set_fill(&self, byte: u8) {
        self.state.lock().fill = byte;
    }

    pub fn override_reopen(&self, hw: HwConfig) {
        self.state.lock().reopen_override = Some(hw);
    }

    /// Make the driver's poll descriptor readable, as the hardware would
    /// on a period interrupt.
    pub fn signal_pollin(&self) {
        let _ = (&*self.pipe_w).write(&[1u8]);
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    pub fn start_count(&self) -> u32 {
        self.state.lock().start_count
    }

    pub fn recover_count(&self) -> u32 {
        self.state.lock().recover_count
    }

    pub fn commit_count(&self) -> u32 {
        self.state.lock().commit_count
    }

    pub fn last_sw_params(&self) -> Option<u64> {
        self.state.lock().sw_params.last().copied()
    }

    pub fn last_reopen_request(&self) -> Option<HwConfig> {
        self.state.lock().last_reopen_request.clone()
    }
}

#[derive(Default)]
struct Collected {
    chunks: Vec<(Provenance, Vec<u8>)>,
}

/// Sink that copies every posted chunk, as a well-behaved downstream
/// consumer of fixed chunks must.
pub struct CollectingSink {
    inner: Arc<Mutex<Collected>>,
}

#[derive(Clone)]
pub struct SinkHandle {
    inner: Arc<Mutex<Collected>>,
}

impl CollectingSink {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (Self, SinkHandle) {
        let inner = Arc::new(Mutex::new(Collected::default()));
        (
            Self {
                inner: inner.clone(),
            },
            SinkHandle { inner },
        )
    }
}

impl ChunkSink for CollectingSink {
    fn post(&mut self, chunk: &Chunk<'_>) {
        self.inner
            .lock()
            .chunks
            .push((chunk.provenance(), chunk.bytes().to_vec()));
    }
}

impl SinkHandle {
    pub fn collected(&self) -> Vec<(Provenance, Vec<u8>)> {
        self.inner.lock().chunks.clone()
    }

    pub fn chunks_posted(&self) -> usize {
        self.inner.lock().chunks.len()
    }

    pub fn bytes_posted(&self) -> usize {
        self.inner.lock().chunks.iter().map(|(_, d)| d.len()).sum()
    }
}
