//! Downstream source plumbing.
//!
//! The capture thread posts chunks into a [`ChunkSink`]; the provided
//! [`StreamSink`] materializes them into a lock-free byte ring for the
//! application side. Cross-thread state follows the thread-info pattern:
//! the capture thread owns a [`ThreadInfo`] aggregate it mutates only in
//! response to messages, and the main thread talks through a
//! [`SourceHandle`] that never touches real-time state directly.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use pcmtap_foundation::error::ConfigError;

use crate::chunk::Chunk;
use crate::mixer::VolumeLevels;
use crate::msg::{CaptureStatsSnapshot, ControlMsg, MsgSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Init,
    Running,
    Idle,
    Suspended,
    Unlinked,
    Invalid,
}

impl SourceState {
    /// Opened states have a live driver handle behind them.
    pub fn is_opened(self) -> bool {
        matches!(
            self,
            SourceState::Init | SourceState::Running | SourceState::Idle
        )
    }
}

/// Consumer of captured chunks. `post` is fire-and-forget: a fixed chunk
/// is only valid for the duration of the call, so implementations copy
/// whatever they need to keep.
pub trait ChunkSink: Send {
    fn post(&mut self, chunk: &Chunk<'_>);
}

/// Capture-thread-owned mirror of the source's control state, mutated
/// only on the capture thread in response to messages.
#[derive(Debug, Clone)]
pub struct ThreadInfo {
    pub state: SourceState,
    pub min_latency: u64,
    pub max_latency: u64,
    pub requested_latency: Option<u64>,
    pub last_volume: Option<VolumeLevels>,
}

impl ThreadInfo {
    pub fn new(min_latency: u64, max_latency: u64) -> Self {
        Self {
            state: SourceState::Init,
            min_latency,
            max_latency,
            requested_latency: None,
            last_volume: None,
        }
    }

    /// The latency the timer math should aim for, clamped into the
    /// advertised range.
    pub fn effective_requested_latency(&self) -> Option<u64> {
        self.requested_latency
            .map(|l| l.clamp(self.min_latency, self.max_latency))
    }
}

/// Server-wide registry of claimed source names.
///
/// Explicitly requested names must be unique: claiming one that is
/// already taken is fatal to construction. Derived names get a numeric
/// suffix instead. A name is held until the owning [`SourceHandle`] is
/// dropped.
#[derive(Default)]
pub struct SourceNames {
    taken: Mutex<HashSet<String>>,
}

impl SourceNames {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim `name`, returning the name actually registered.
    pub fn claim(&self, name: &str, collision_fatal: bool) -> Result<String, ConfigError> {
        let mut taken = self.taken.lock();

        if !taken.contains(name) {
            taken.insert(name.to_string());
            return Ok(name.to_string());
        }

        if collision_fatal {
            return Err(ConfigError::NameTaken(name.to_string()));
        }

        let mut n = 2u32;
        loop {
            let candidate = format!("{name}.{n}");
            if !taken.contains(&candidate) {
                tracing::debug!(requested = name, registered = %candidate, "source name taken, renamed");
                taken.insert(candidate.clone());
                return Ok(candidate);
            }
            n += 1;
        }
    }

    pub fn release(&self, name: &str) {
        self.taken.lock().remove(name);
    }

    pub fn is_taken(&self, name: &str) -> bool {
        self.taken.lock().contains(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("device is reserved by another process")]
pub struct ReserveBusy;

/// Cross-process device reservation hook. Only the shape is fixed here:
/// `acquire` is re-run before resume reopens the device, `release` on
/// suspend. A policy that must force the device away posts a suspend
/// through the [`SourceHandle`] it was constructed with.
pub trait ReservePolicy: Send {
    fn acquire(&mut self) -> Result<(), ReserveBusy>;
    fn release(&mut self);
}

/// Policy for devices that need no cross-process coordination.
pub struct NoReserve;

impl ReservePolicy for NoReserve {
    fn acquire(&mut self) -> Result<(), ReserveBusy> {
        Ok(())
    }

    fn release(&mut self) {}
}

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Main-thread handle to a running capture engine. Holds the source's
/// registered name; dropping the handle releases it.
pub struct SourceHandle {
    name: String,
    names: Arc<SourceNames>,
    tx: MsgSender,
    state: Mutex<SourceState>,
    reserve: Mutex<Box<dyn ReservePolicy>>,
}

impl SourceHandle {
    pub(crate) fn new(
        name: String,
        names: Arc<SourceNames>,
        tx: MsgSender,
        reserve: Box<dyn ReservePolicy>,
    ) -> Self {
        Self {
            name,
            names,
            tx,
            state: Mutex::new(SourceState::Init),
            reserve: Mutex::new(reserve),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SourceState {
        *self.state.lock()
    }

    /// Close the driver and release the device reservation.
    pub fn suspend(&self) {
        let mut state = self.state.lock();
        if !state.is_opened() {
            return;
        }
        self.reserve.lock().release();
        self.tx.send(ControlMsg::SetState(SourceState::Suspended));
        *state = SourceState::Suspended;
    }

    /// Re-acquire the reservation and reopen the driver. `running` picks
    /// RUNNING over IDLE as the target state.
    pub fn resume(&self, running: bool) -> Result<(), ReserveBusy> {
        let mut state = self.state.lock();
        let target = if running {
            SourceState::Running
        } else {
            SourceState::Idle
        };
        if *state == SourceState::Suspended {
            self.reserve.lock().acquire()?;
        }
        self.tx.send(ControlMsg::SetState(target));
        *state = target;
        Ok(())
    }

    /// Smoothed capture latency in microseconds; `None` when the engine
    /// is gone or unresponsive.
    pub fn latency(&self) -> Option<u64> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        if !self.tx.send(ControlMsg::GetLatency(reply_tx)) {
            return None;
        }
        reply_rx.recv_timeout(REPLY_TIMEOUT).ok()
    }

    pub fn stats(&self) -> Option<CaptureStatsSnapshot> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        if !self.tx.send(ControlMsg::GetStats(reply_tx)) {
            return None;
        }
        reply_rx.recv_timeout(REPLY_TIMEOUT).ok()
    }

    pub fn set_volume(&self, levels: VolumeLevels) {
        self.tx.send(ControlMsg::SetVolume(levels));
    }

    pub fn set_latency_range(&self, min_usec: u64, max_usec: u64) {
        self.tx.send(ControlMsg::SetLatencyRange { min_usec, max_usec });
    }

    pub fn update_requested_latency(&self, latency_usec: Option<u64>) {
        self.tx.send(ControlMsg::UpdateRequestedLatency(latency_usec));
    }

    /// Ask the capture thread to exit its loop.
    pub fn shutdown(&self) {
        self.tx.send(ControlMsg::Shutdown);
    }
}

impl Drop for SourceHandle {
    fn drop(&mut self) {
        self.names.release(&self.name);
    }
}

/// Default [`ChunkSink`]: copies posted chunks into an SPSC byte ring
/// consumed by [`StreamReader`]. Overflow drops the chunk whole so frame
/// boundaries in the ring stay intact.
pub struct StreamSink {
    producer: rtrb::Producer<u8>,
    dropped_chunks: u64,
}

pub struct StreamReader {
    consumer: rtrb::Consumer<u8>,
}

pub fn stream_pair(capacity: usize) -> (StreamSink, StreamReader) {
    let (producer, consumer) = rtrb::RingBuffer::new(capacity);
    (
        StreamSink {
            producer,
            dropped_chunks: 0,
        },
        StreamReader { consumer },
    )
}

impl StreamSink {
    pub fn dropped_chunks(&self) -> u64 {
        self.dropped_chunks
    }
}

impl ChunkSink for StreamSink {
    fn post(&mut self, chunk: &Chunk<'_>) {
        let data = chunk.bytes();
        let mut wc = match self.producer.write_chunk(data.len()) {
            Ok(wc) => wc,
            Err(_) => {
                self.dropped_chunks += 1;
                tracing::warn!(
                    len = data.len(),
                    dropped = self.dropped_chunks,
                    "stream ring full, dropping chunk"
                );
                return;
            }
        };

        let (first, second) = wc.as_mut_slices();
        let split = first.len();
        first.copy_from_slice(&data[..split]);
        second.copy_from_slice(&data[split..]);
        wc.commit_all();
    }
}

impl StreamReader {
    /// Read up to `buf.len()` bytes; returns the number copied.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let want = buf.len().min(self.consumer.slots());
        if want == 0 {
            return 0;
        }
        let rc = match self.consumer.read_chunk(want) {
            Ok(rc) => rc,
            Err(_) => return 0,
        };
        let (first, second) = rc.as_slices();
        let split = first.len();
        buf[..split].copy_from_slice(first);
        buf[split..split + second.len()].copy_from_slice(second);
        let n = split + second.len();
        rc.commit_all();
        n
    }

    pub fn available(&self) -> usize {
        self.consumer.slots()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opened_states() {
        assert!(SourceState::Init.is_opened());
        assert!(SourceState::Running.is_opened());
        assert!(SourceState::Idle.is_opened());
        assert!(!SourceState::Suspended.is_opened());
        assert!(!SourceState::Unlinked.is_opened());
        assert!(!SourceState::Invalid.is_opened());
    }

    #[test]
    fn requested_latency_is_clamped_to_the_range() {
        let mut info = ThreadInfo::new(10_000, 100_000);
        info.requested_latency = Some(5_000);
        assert_eq!(info.effective_requested_latency(), Some(10_000));
        info.requested_latency = Some(500_000);
        assert_eq!(info.effective_requested_latency(), Some(100_000));
        info.requested_latency = None;
        assert_eq!(info.effective_requested_latency(), None);
    }

    #[test]
    fn names_register_and_release() {
        let names = SourceNames::new();
        assert_eq!(names.claim("alsa_input.mic", true).unwrap(), "alsa_input.mic");
        assert!(names.is_taken("alsa_input.mic"));
        names.release("alsa_input.mic");
        assert!(!names.is_taken("alsa_input.mic"));
    }

    #[test]
    fn explicit_name_collision_is_fatal() {
        let names = SourceNames::new();
        names.claim("mic", true).unwrap();
        assert_eq!(
            names.claim("mic", true),
            Err(ConfigError::NameTaken("mic".into()))
        );
    }

    #[test]
    fn derived_name_collision_gets_a_suffix() {
        let names = SourceNames::new();
        names.claim("alsa_input.default", false).unwrap();
        assert_eq!(
            names.claim("alsa_input.default", false).unwrap(),
            "alsa_input.default.2"
        );
        assert_eq!(
            names.claim("alsa_input.default", false).unwrap(),
            "alsa_input.default.3"
        );
    }

    #[test]
    fn released_suffix_is_reused() {
        let names = SourceNames::new();
        names.claim("src", false).unwrap();
        let second = names.claim("src", false).unwrap();
        names.release(&second);
        assert_eq!(names.claim("src", false).unwrap(), "src.2");
    }

    #[test]
    fn stream_sink_round_trips_chunks() {
        let (mut sink, mut reader) = stream_pair(64);
        sink.post(&Chunk::pooled(&[1, 2, 3, 4]));
        sink.post(&Chunk::pooled(&[5, 6]));

        let mut buf = [0u8; 16];
        let n = reader.read(&mut buf);
        assert_eq!(n, 6);
        assert_eq!(&buf[..6], &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn overflow_drops_whole_chunks() {
        let (mut sink, mut reader) = stream_pair(8);
        sink.post(&Chunk::pooled(&[0; 6]));
        sink.post(&Chunk::pooled(&[1; 6])); // does not fit
        assert_eq!(sink.dropped_chunks(), 1);

        let mut buf = [9u8; 16];
        assert_eq!(reader.read(&mut buf), 6);
        assert!(buf[..6].iter().all(|&b| b == 0));
    }
}
