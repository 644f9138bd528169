//! Wire-format records for the device mirroring protocol.
//!
//! Everything on the wire is big-endian. Layout, in stream order:
//!
//! ```text
//! dummy byte:     u8   (1)   always 0x00, may be omitted by some peers
//! device name:    [u8] (64)  UTF-8, nul-padded
//! codec fourcc:   u32  (4)   e.g. "h264", "h265"
//! width:          u32  (4)
//! height:         u32  (4)
//! repeating:
//!   pts | flag:   u64  (8)   bit 63 = config packet, bits 62..0 = µs pts
//!   packet size:  u32  (4)
//!   payload:      [u8] (packet size)  Annex-B elementary stream data
//! ```

pub mod demuxer;

use bytes::Bytes;

use crate::error::MiraError;

// ── Constants ────────────────────────────────────────────────────

/// Value of the optional leading dummy byte.
pub const DUMMY_BYTE: u8 = 0x00;

/// Fixed size of the device metadata record.
pub const DEVICE_META_LEN: usize = 64;

/// Fixed size of the codec metadata record.
pub const CODEC_META_LEN: usize = 12;

/// Fixed size of the per-frame header.
pub const FRAME_HEADER_LEN: usize = 12;

/// Config-packet flag folded into the timestamp's most significant bit.
pub const CONFIG_PACKET_FLAG: u64 = 1 << 63;

// ── VideoCodec ───────────────────────────────────────────────────

/// The two codec families the protocol can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
    H265,
}

impl VideoCodec {
    /// Map a big-endian fourcc to a codec family.
    pub fn from_fourcc(fourcc: u32) -> Result<Self, MiraError> {
        match &fourcc.to_be_bytes() {
            b"h264" | b"avc1" => Ok(Self::H264),
            b"h265" | b"hevc" => Ok(Self::H265),
            _ => Err(MiraError::UnsupportedCodec(fourcc)),
        }
    }

    /// Canonical fourcc for this family.
    pub fn fourcc(&self) -> u32 {
        match self {
            Self::H264 => u32::from_be_bytes(*b"h264"),
            Self::H265 => u32::from_be_bytes(*b"h265"),
        }
    }
}

impl std::fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::H264 => write!(f, "h264"),
            Self::H265 => write!(f, "h265"),
        }
    }
}

// ── DeviceMeta ───────────────────────────────────────────────────

/// 64-byte device identification record, parsed once per connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMeta {
    /// Device name with trailing nul padding stripped.
    pub name: String,
}

impl DeviceMeta {
    /// Parse the fixed-size record. Non-UTF-8 bytes are replaced rather
    /// than rejected; the name is informational only.
    pub fn decode(data: &[u8]) -> Result<Self, MiraError> {
        if data.len() < DEVICE_META_LEN {
            return Err(MiraError::Protocol("device meta record under-length"));
        }
        let end = data[..DEVICE_META_LEN]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(DEVICE_META_LEN);
        let name = String::from_utf8_lossy(&data[..end]).into_owned();
        Ok(Self { name })
    }
}

// ── CodecMeta ────────────────────────────────────────────────────

/// 12-byte codec metadata record, parsed once per connection.
///
/// Establishes the active codec for the rest of the stream; the fourcc
/// never changes mid-connection (a change implies a new connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecMeta {
    pub codec: VideoCodec,
    /// Initial video width in pixels.
    pub width: u32,
    /// Initial video height in pixels.
    pub height: u32,
}

impl CodecMeta {
    /// Parse the fixed-size record (big-endian fields).
    pub fn decode(data: &[u8]) -> Result<Self, MiraError> {
        if data.len() < CODEC_META_LEN {
            return Err(MiraError::Protocol("codec meta record under-length"));
        }
        let fourcc = u32::from_be_bytes(data[0..4].try_into().unwrap());
        let codec = VideoCodec::from_fourcc(fourcc)?;
        Ok(Self {
            codec,
            width: u32::from_be_bytes(data[4..8].try_into().unwrap()),
            height: u32::from_be_bytes(data[8..12].try_into().unwrap()),
        })
    }
}

// ── FrameHeader ──────────────────────────────────────────────────

/// 12-byte per-payload header.
///
/// The 8-byte timestamp field carries the config-packet flag in its most
/// significant bit; the remaining 63 bits are a microsecond presentation
/// timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Presentation timestamp in microseconds (flag bit cleared).
    pub pts_us: u64,
    /// True when the payload carries only parameter-set data.
    pub is_config: bool,
    /// Payload byte count following this header.
    pub packet_size: usize,
}

impl FrameHeader {
    /// Parse the fixed-size record (big-endian fields).
    pub fn decode(data: &[u8]) -> Result<Self, MiraError> {
        if data.len() < FRAME_HEADER_LEN {
            return Err(MiraError::Protocol("frame header record under-length"));
        }
        let raw_pts = u64::from_be_bytes(data[0..8].try_into().unwrap());
        let packet_size = u32::from_be_bytes(data[8..12].try_into().unwrap()) as usize;
        Ok(Self {
            pts_us: raw_pts & !CONFIG_PACKET_FLAG,
            is_config: raw_pts & CONFIG_PACKET_FLAG != 0,
            packet_size,
        })
    }
}

// ── FramePayload ─────────────────────────────────────────────────

/// A complete demultiplexed frame payload, ready for NAL extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramePayload {
    /// Annex-B elementary-stream data, detached from the receive buffer.
    pub data: Bytes,
    /// Presentation timestamp in microseconds.
    pub pts_us: u64,
    /// True when this payload carries only parameter-set data.
    pub is_config: bool,
}

// ── Tests ────────────────────────────────────────────────────────
