//! # mira-core
//!
//! Core receive pipeline for phone-screen mirroring over TCP.
//!
//! This crate contains:
//! - **Session**: `TransportSession` for the listen/dial socket lifecycle
//! - **Protocol**: `StreamDemuxer` for the framed wire format (device
//!   meta, codec meta, timestamped frame packets)
//! - **NAL**: `NalExtractor` and `ParameterSetCache` for elementary
//!   stream units and SPS/PPS/VPS change tracking
//! - **Frame**: `FrameSlot` latest-wins hand-off and `FrameBroadcaster`
//!   fan-out to render sinks
//! - **Display**: `VsyncRegistry` shared refresh driver and
//!   `PresentationScheduler` paced delivery
//! - **Governor**: `LoadGovernor` memory/CPU pressure policy
//! - **Error**: `MiraError` — typed, `thiserror`-based error hierarchy

pub mod display;
pub mod error;
pub mod frame;
pub mod governor;
pub mod nal;
pub mod protocol;
pub mod session;
pub mod stats;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use display::{FrameNotifier, PresentationScheduler, VsyncHandle, VsyncRegistry};
pub use error::MiraError;
pub use frame::{DecodedImage, FrameBroadcaster, FrameSink, FrameSlot, SharedImage, SinkId};
pub use governor::{FramePolicy, GovernorConfig, LoadGovernor, ProcSampler, SystemSampler};
pub use nal::{NalExtractor, NalUnit, ParameterSetCache};
pub use protocol::demuxer::{MAX_PACKET_SIZE, RawStreamDecoder, StreamDemuxer};
pub use protocol::{CodecMeta, DeviceMeta, FrameHeader, FramePayload, VideoCodec};
pub use session::{SessionChannels, SessionMode, SessionState, TransportSession};
pub use stats::{GovernorState, PipelineStats, StatsSnapshot};
