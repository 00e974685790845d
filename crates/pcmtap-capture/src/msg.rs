//! Control messages between the main thread and the capture thread.
//!
//! Messages are serialized by a crossbeam channel and observed in send
//! order; every send also pokes the poll-core waker so the capture
//! thread notices without a timer tick. Queries carry their own reply
//! channel.

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::mixer::VolumeLevels;
use crate::rtpoll::Waker;
use crate::source::SourceState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureStatsSnapshot {
    /// Total bytes delivered downstream since session start.
    pub read_count: u64,
}

pub enum ControlMsg {
    SetState(SourceState),
    SetLatencyRange { min_usec: u64, max_usec: u64 },
    UpdateRequestedLatency(Option<u64>),
    SetVolume(VolumeLevels),
    GetLatency(Sender<u64>),
    GetStats(Sender<CaptureStatsSnapshot>),
    Shutdown,
}

/// Notifications from the capture thread to whoever owns the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    /// The session hit a fatal error; unload the module and send
    /// `Shutdown` so the capture thread can finish draining.
    UnloadRequest,
}

#[derive(Clone)]
pub struct MsgSender {
    tx: Sender<ControlMsg>,
    waker: Waker,
}

impl MsgSender {
    /// False when the capture thread is gone.
    pub fn send(&self, msg: ControlMsg) -> bool {
        let ok = self.tx.send(msg).is_ok();
        self.waker.wake();
        ok
    }
}

pub fn control_channel(waker: Waker) -> (MsgSender, Receiver<ControlMsg>) {
    let (tx, rx) = unbounded();
    (MsgSender { tx, waker }, rx)
}
