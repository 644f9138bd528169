//! Receive-side state machine for the device mirroring protocol.
//!
//! [`StreamDemuxer::feed`] accumulates raw socket chunks in a growable
//! buffer and repeatedly consumes complete records for the current
//! [`ParserState`], returning as many frame payloads as are now available
//! and leaving any partial record buffered for the next call. Parsing is
//! synchronous and never blocks; memory is bounded by one record plus the
//! unconsumed tail.
//!
//! Parse anomalies are never fatal: malformed fixed-size records are
//! logged and the buffer is skipped forward one byte to resynchronize.

use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;
use tracing::{debug, trace, warn};

use crate::error::MiraError;
use crate::nal::find_start_code;
use crate::stats::PipelineStats;

use super::{
    CODEC_META_LEN, CodecMeta, DEVICE_META_LEN, DUMMY_BYTE, DeviceMeta, FRAME_HEADER_LEN,
    FrameHeader, FramePayload,
};

/// Upper bound for a single frame payload. Anything larger is treated as
/// a corrupted header and resynchronized away.
pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

// ── ParserState ──────────────────────────────────────────────────

/// Receive-side parser state. State-local data (the just-parsed frame
/// header while its payload is outstanding) rides in the variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    /// Expecting the optional leading dummy byte.
    AwaitDummyByte,
    /// Expecting the 64-byte device metadata record.
    AwaitDeviceMeta,
    /// Expecting the 12-byte codec metadata record.
    AwaitCodecMeta,
    /// Expecting the next 12-byte frame header.
    AwaitFrameHeader,
    /// Expecting `header.packet_size` payload bytes.
    AwaitFrameData(FrameHeader),
    /// No framing at all: the transport delivers a bare Annex-B stream.
    RawStream,
}

// ── StreamDemuxer ────────────────────────────────────────────────

/// Incremental demultiplexer for one connection.
pub struct StreamDemuxer {
    buf: BytesMut,
    state: ParserState,
    device: Option<DeviceMeta>,
    codec: Option<CodecMeta>,
    stats: Arc<PipelineStats>,
}

impl StreamDemuxer {
    /// Demuxer for the full framed protocol.
    pub fn new(stats: Arc<PipelineStats>) -> Self {
        Self {
            buf: BytesMut::with_capacity(64 * 1024),
            state: ParserState::AwaitDummyByte,
            device: None,
            codec: None,
            stats,
        }
    }

    /// Demuxer for transports that already strip the custom framing and
    /// deliver a bare elementary stream.
    pub fn raw(stats: Arc<PipelineStats>) -> Self {
        let mut demuxer = Self::new(stats);
        demuxer.state = ParserState::RawStream;
        demuxer
    }

    /// Current parser state (diagnostics and tests).
    pub fn state(&self) -> ParserState {
        self.state
    }

    /// Device metadata, available once parsed.
    pub fn device(&self) -> Option<&DeviceMeta> {
        self.device.as_ref()
    }

    /// Codec metadata, available once parsed.
    pub fn codec(&self) -> Option<&CodecMeta> {
        self.codec.as_ref()
    }

    /// Bytes currently buffered awaiting a complete record.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Consume a raw socket chunk and return every frame payload that is
    /// now complete.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<FramePayload> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        while self.step(&mut out) {}
        out
    }

    /// Attempt one state transition. Returns `false` when more bytes are
    /// needed.
    fn step(&mut self, out: &mut Vec<FramePayload>) -> bool {
        match self.state {
            ParserState::AwaitDummyByte => {
                if self.buf.is_empty() {
                    return false;
                }
                if self.buf[0] == DUMMY_BYTE {
                    self.buf.advance(1);
                } else {
                    // Compatibility shim: some peers omit the dummy byte.
                    // The first device-name byte is non-zero in practice,
                    // so a non-zero first byte means "no dummy byte sent".
                    debug!(first_byte = self.buf[0], "no dummy byte sent, proceeding");
                }
                self.state = ParserState::AwaitDeviceMeta;
                true
            }
            ParserState::AwaitDeviceMeta => {
                if self.buf.len() < DEVICE_META_LEN {
                    return false;
                }
                match DeviceMeta::decode(&self.buf[..DEVICE_META_LEN]) {
                    Ok(meta) => {
                        debug!(device = %meta.name, "device metadata parsed");
                        self.device = Some(meta);
                        self.buf.advance(DEVICE_META_LEN);
                        self.state = ParserState::AwaitCodecMeta;
                    }
                    Err(e) => self.resync("device meta", e),
                }
                true
            }
            ParserState::AwaitCodecMeta => {
                if self.buf.len() < CODEC_META_LEN {
                    return false;
                }
                match CodecMeta::decode(&self.buf[..CODEC_META_LEN]) {
                    Ok(meta) => {
                        debug!(
                            codec = %meta.codec,
                            width = meta.width,
                            height = meta.height,
                            "codec metadata parsed"
                        );
                        self.codec = Some(meta);
                        self.buf.advance(CODEC_META_LEN);
                        self.state = ParserState::AwaitFrameHeader;
                    }
                    Err(e) => self.resync("codec meta", e),
                }
                true
            }
            ParserState::AwaitFrameHeader => {
                if self.buf.len() < FRAME_HEADER_LEN {
                    return false;
                }
                match FrameHeader::decode(&self.buf[..FRAME_HEADER_LEN]) {
                    Ok(header) if header.packet_size <= MAX_PACKET_SIZE => {
                        trace!(
                            pts_us = header.pts_us,
                            is_config = header.is_config,
                            size = header.packet_size,
                            "frame header parsed"
                        );
                        self.buf.advance(FRAME_HEADER_LEN);
                        self.state = ParserState::AwaitFrameData(header);
                    }
                    Ok(_) => {
                        self.resync(
                            "frame header",
                            MiraError::Protocol("packet size exceeds limit"),
                        );
                    }
                    Err(e) => self.resync("frame header", e),
                }
                true
            }
            ParserState::AwaitFrameData(header) => {
                if self.buf.len() < header.packet_size {
                    return false;
                }
                let data = self.buf.split_to(header.packet_size).freeze();
                out.push(FramePayload {
                    data,
                    pts_us: header.pts_us,
                    is_config: header.is_config,
                });
                self.stats.incr_frames_demuxed();
                self.state = ParserState::AwaitFrameHeader;
                true
            }
            ParserState::RawStream => self.step_raw(out),
        }
    }

    /// Raw mode: each complete start-code-delimited region becomes one
    /// payload (start code included, so downstream extraction is uniform).
    fn step_raw(&mut self, out: &mut Vec<FramePayload>) -> bool {
        let Some((first, first_len)) = find_start_code(&self.buf, 0) else {
            // Nothing resembling a unit yet; keep at most three bytes of
            // potential start-code prefix.
            if self.buf.len() > 3 {
                self.buf.advance(self.buf.len() - 3);
            }
            return false;
        };
        let Some((next, _)) = find_start_code(&self.buf, first + first_len) else {
            return false;
        };
        self.buf.advance(first);
        let data = self.buf.split_to(next - first).freeze();
        out.push(FramePayload {
            data,
            pts_us: 0,
            is_config: false,
        });
        self.stats.incr_frames_demuxed();
        true
    }

    /// Skip forward one byte after a malformed record. Never fatal.
    fn resync(&mut self, record: &'static str, err: MiraError) {
        warn!(record, error = %err, "malformed record, resynchronizing");
        self.buf.advance(1);
    }
}

// ── RawStreamDecoder ─────────────────────────────────────────────

/// `tokio_util` codec wrapper around the raw-stream mode, for plugging an
/// unframed Annex-B transport into a `Framed` read half.
#[derive(Debug, Default)]
pub struct RawStreamDecoder;

impl Decoder for RawStreamDecoder {
    type Item = FramePayload;
    type Error = MiraError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some((first, first_len)) = find_start_code(src, 0) else {
            return Ok(None);
        };
        let Some((next, _)) = find_start_code(src, first + first_len) else {
            return Ok(None);
        };
        src.advance(first);
        let data = src.split_to(next - first).freeze();
        Ok(Some(FramePayload {
            data,
            pts_us: 0,
            is_config: false,
        }))
    }

    /// The final unit has no trailing start code; emit it when the
    /// stream ends instead of reporting leftover bytes.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(payload) = self.decode(src)? {
            return Ok(Some(payload));
        }
        let Some((first, _)) = find_start_code(src, 0) else {
            src.clear();
            return Ok(None);
        };
        src.advance(first);
        let data = src.split_to(src.len()).freeze();
        Ok(Some(FramePayload {
            data,
            pts_us: 0,
            is_config: false,
        }))
    }
}

// ── Tests ────────────────────────────────────────────────────────
