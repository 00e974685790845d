//! pcmtap-capture: a timer-scheduled audio capture source.
//!
//! The engine pulls PCM frames from a soundcard driver (zero-copy mmap or
//! copy-based read), timestamps them against a smoothed clock, and posts
//! them to a downstream source with bounded latency. State changes arrive
//! as messages from the main thread; the capture thread owns the driver
//! handle, the smoother, and the poll core exclusively.

pub mod bridge;
pub mod chunk;
pub mod config;
pub mod driver;
pub mod engine;
pub mod geometry;
pub mod mixer;
pub mod msg;
pub mod rtpoll;
pub mod smoother;
pub mod source;
pub mod testing;

// Public API
pub use chunk::{Chunk, MemPool, PoolBlock, Provenance};
pub use config::CaptureConfig;
pub use driver::{HwConfig, MmapGrant, PcmDriver};
pub use engine::{CaptureEngine, EngineHandle, EngineParts};
pub use geometry::BufferGeometry;
pub use mixer::{VolumeControl, VolumeLevels, VolumeRange, VolumeScale};
pub use msg::{CaptureStatsSnapshot, EngineEvent};
pub use smoother::Smoother;
pub use source::{
    stream_pair, ChunkSink, NoReserve, ReserveBusy, ReservePolicy, SourceHandle, SourceNames,
    SourceState, StreamReader, StreamSink, ThreadInfo,
};
