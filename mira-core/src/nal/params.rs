//! Parameter-set cache with change detection.
//!
//! Holds the most recent VPS (H.265 only), SPS and PPS, replacing older
//! ones in place. A fresh SPS whose bytes differ from the cached one is
//! the signal that the device changed resolution or orientation and the
//! decoder must be rebuilt.

use crate::protocol::VideoCodec;

use super::NalUnit;

/// Latest parameter-set buffers plus the previous SPS held transiently
/// for change detection.
#[derive(Debug, Clone, Default)]
pub struct ParameterSetCache {
    vps: Option<Vec<u8>>,
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
    prev_sps: Option<Vec<u8>>,
}

impl ParameterSetCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a parameter-set unit. Returns `true` when this was an SPS
    /// whose bytes differ from the cached SPS (decoder rebuild needed).
    ///
    /// Non-parameter-set units are ignored.
    pub fn update(&mut self, unit: &NalUnit) -> bool {
        if !unit.is_parameter_set() {
            return false;
        }
        match (unit.codec, unit.nal_type) {
            (VideoCodec::H264, super::H264_NAL_SPS) | (VideoCodec::H265, super::H265_NAL_SPS) => {
                let changed = self
                    .sps
                    .as_deref()
                    .is_some_and(|cached| cached != unit.data.as_slice());
                if changed {
                    self.prev_sps = self.sps.take();
                }
                self.sps = Some(unit.data.clone());
                changed
            }
            (VideoCodec::H264, super::H264_NAL_PPS) | (VideoCodec::H265, super::H265_NAL_PPS) => {
                self.pps = Some(unit.data.clone());
                false
            }
            (VideoCodec::H265, super::H265_NAL_VPS) => {
                self.vps = Some(unit.data.clone());
                false
            }
            _ => false,
        }
    }

    /// Readiness invariant: H.264 needs SPS ∧ PPS, H.265 needs
    /// VPS ∧ SPS ∧ PPS.
    pub fn is_complete(&self, codec: VideoCodec) -> bool {
        match codec {
            VideoCodec::H264 => self.sps.is_some() && self.pps.is_some(),
            VideoCodec::H265 => self.vps.is_some() && self.sps.is_some() && self.pps.is_some(),
        }
    }

    pub fn vps(&self) -> Option<&[u8]> {
        self.vps.as_deref()
    }

    pub fn sps(&self) -> Option<&[u8]> {
        self.sps.as_deref()
    }

    pub fn pps(&self) -> Option<&[u8]> {
        self.pps.as_deref()
    }

    /// The SPS that was current before the last change, if any.
    pub fn previous_sps(&self) -> Option<&[u8]> {
        self.prev_sps.as_deref()
    }

    /// Drop the transiently-held previous SPS once the decoder rebuild
    /// has completed.
    pub fn clear_previous_sps(&mut self) {
        self.prev_sps = None;
    }

    /// Clear everything on stream restart.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// One-line summary for diagnostics.
    pub fn summary(&self) -> String {
        format!(
            "vps={} sps={} pps={}",
            self.vps.as_ref().map_or(0, Vec::len),
            self.sps.as_ref().map_or(0, Vec::len),
            self.pps.as_ref().map_or(0, Vec::len),
        )
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nal::{H264_NAL_PPS, H264_NAL_SPS, H265_NAL_PPS, H265_NAL_SPS, H265_NAL_VPS};

    fn h264_unit(nal_type: u8, data: &[u8]) -> NalUnit {
        NalUnit {
            codec: VideoCodec::H264,
            nal_type,
            data: data.to_vec(),
        }
    }

    fn h265_unit(nal_type: u8, data: &[u8]) -> NalUnit {
        NalUnit {
            codec: VideoCodec::H265,
            nal_type,
            data: data.to_vec(),
        }
    }

    #[test]
    fn h264_completeness() {
        let mut cache = ParameterSetCache::new();
        assert!(!cache.is_complete(VideoCodec::H264));

        cache.update(&h264_unit(H264_NAL_SPS, &[0x67, 0x01]));
        assert!(!cache.is_complete(VideoCodec::H264));

        cache.update(&h264_unit(H264_NAL_PPS, &[0x68, 0x02]));
        assert!(cache.is_complete(VideoCodec::H264));
    }

    #[test]
    fn h265_needs_vps_too() {
        let mut cache = ParameterSetCache::new();
        cache.update(&h265_unit(H265_NAL_SPS, &[0x42, 0x01]));
        cache.update(&h265_unit(H265_NAL_PPS, &[0x44, 0x01]));
        assert!(!cache.is_complete(VideoCodec::H265));

        cache.update(&h265_unit(H265_NAL_VPS, &[0x40, 0x01]));
        assert!(cache.is_complete(VideoCodec::H265));
    }

    #[test]
    fn first_sps_is_not_a_change() {
        let mut cache = ParameterSetCache::new();
        assert!(!cache.update(&h264_unit(H264_NAL_SPS, &[0x67, 0xAA])));
    }

    #[test]
    fn identical_sps_is_not_a_change() {
        let mut cache = ParameterSetCache::new();
        cache.update(&h264_unit(H264_NAL_SPS, &[0x67, 0xAA]));
        assert!(!cache.update(&h264_unit(H264_NAL_SPS, &[0x67, 0xAA])));
        assert!(cache.previous_sps().is_none());
    }

    #[test]
    fn differing_sps_detected_once() {
        let mut cache = ParameterSetCache::new();
        cache.update(&h264_unit(H264_NAL_SPS, &[0x67, 0xAA]));

        assert!(cache.update(&h264_unit(H264_NAL_SPS, &[0x67, 0xBB])));
        assert_eq!(cache.sps(), Some(&[0x67, 0xBB][..]));
        assert_eq!(cache.previous_sps(), Some(&[0x67, 0xAA][..]));

        cache.clear_previous_sps();
        assert!(cache.previous_sps().is_none());

        // Re-feeding the now-current SPS does not fire again.
        assert!(!cache.update(&h264_unit(H264_NAL_SPS, &[0x67, 0xBB])));
    }

    #[test]
    fn non_parameter_units_ignored() {
        let mut cache = ParameterSetCache::new();
        assert!(!cache.update(&h264_unit(super::super::H264_NAL_IDR, &[0x65, 0x01])));
        assert!(!cache.is_complete(VideoCodec::H264));
    }

    #[test]
    fn reset_clears_everything() {
        let mut cache = ParameterSetCache::new();
        cache.update(&h264_unit(H264_NAL_SPS, &[0x67]));
        cache.update(&h264_unit(H264_NAL_PPS, &[0x68]));
        cache.reset();
        assert!(!cache.is_complete(VideoCodec::H264));
        assert!(cache.sps().is_none());
    }
}
