//! Elementary-stream (NAL) unit types and start-code scanning.
//!
//! Payloads arrive as Annex-B byte streams: units delimited by 3-byte
//! (`00 00 01`) or 4-byte (`00 00 00 01`) start codes. A unit spans from
//! just after one start code to just before the next (or end of payload).
//!
//! Type extraction differs per codec family:
//! - H.264: low 5 bits of the first payload byte
//! - H.265: bits 6..1 of the first payload byte (`(b >> 1) & 0x3F`)

pub mod extractor;
pub mod params;

pub use extractor::NalExtractor;
pub use params::ParameterSetCache;

use crate::protocol::VideoCodec;

// ── H.264 type codes ─────────────────────────────────────────────

pub const H264_NAL_IDR: u8 = 5;
pub const H264_NAL_SPS: u8 = 7;
pub const H264_NAL_PPS: u8 = 8;
/// Highest type code defined by the H.264 spec.
pub const H264_NAL_MAX: u8 = 31;

// ── H.265 type codes ─────────────────────────────────────────────

pub const H265_NAL_VPS: u8 = 32;
pub const H265_NAL_SPS: u8 = 33;
pub const H265_NAL_PPS: u8 = 34;
/// Highest type code defined by the H.265 spec.
pub const H265_NAL_MAX: u8 = 63;

// ── NalUnit ──────────────────────────────────────────────────────

/// One start-code-delimited unit, copied out of the receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NalUnit {
    /// Codec family this unit belongs to.
    pub codec: VideoCodec,
    /// Codec-specific type code extracted from the first payload byte.
    pub nal_type: u8,
    /// Unit bytes including the type byte, excluding the start code.
    pub data: Vec<u8>,
}

impl NalUnit {
    /// True for SPS/PPS (and VPS in the H.265 family).
    pub fn is_parameter_set(&self) -> bool {
        match self.codec {
            VideoCodec::H264 => matches!(self.nal_type, H264_NAL_SPS | H264_NAL_PPS),
            VideoCodec::H265 => {
                matches!(self.nal_type, H265_NAL_VPS | H265_NAL_SPS | H265_NAL_PPS)
            }
        }
    }

    /// True for key-frame-bearing slice types.
    pub fn is_key_frame(&self) -> bool {
        match self.codec {
            VideoCodec::H264 => self.nal_type == H264_NAL_IDR,
            // BLA/IDR/CRA range (IRAP pictures).
            VideoCodec::H265 => (16..=23).contains(&self.nal_type),
        }
    }
}

// ── Start-code scanning ──────────────────────────────────────────

/// Locate the next 3- or 4-byte start code at or after `from`.
///
/// Returns `(index, length)` of the start code itself. A 4-byte code is
/// preferred when a zero byte precedes the 3-byte pattern.
pub fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    if data.len() < 3 {
        return None;
    }
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            // Fold a preceding zero into a 4-byte code.
            if i > from && data[i - 1] == 0 {
                return Some((i - 1, 4));
            }
            return Some((i, 3));
        }
        i += 1;
    }
    None
}

/// Scan a payload into `(start, end)` unit body ranges (start codes
/// excluded). Bytes before the first start code are ignored.
pub fn scan_units(data: &[u8]) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    let mut cursor = match find_start_code(data, 0) {
        Some((idx, len)) => idx + len,
        None => return ranges,
    };
    loop {
        match find_start_code(data, cursor) {
            Some((idx, len)) => {
                ranges.push((cursor, idx));
                cursor = idx + len;
            }
            None => {
                ranges.push((cursor, data.len()));
                break;
            }
        }
    }
    ranges
}

/// Extract the codec-specific type code from a unit's first byte.
pub fn nal_type_of(codec: VideoCodec, first_byte: u8) -> u8 {
    match codec {
        VideoCodec::H264 => first_byte & 0x1F,
        VideoCodec::H265 => (first_byte >> 1) & 0x3F,
    }
}

// ── Tests ────────────────────────────────────────────────────────
