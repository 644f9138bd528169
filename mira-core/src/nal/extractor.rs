//! NAL extractor and parameter-set tracker.
//!
//! Consumes demultiplexed frame payloads, splits them into start-code
//! delimited units, classifies each by codec-specific type, and keeps the
//! parameter-set cache current. When a new SPS differs from the cached
//! one, the registered change listener fires *before* the units are
//! returned so the collaborator can rebuild its decoder ahead of the
//! next key frame.

use std::sync::Arc;

use tracing::{trace, warn};

use crate::protocol::{FramePayload, VideoCodec};
use crate::stats::PipelineStats;

use super::params::ParameterSetCache;
use super::{NalUnit, nal_type_of, scan_units};

/// Called with the updated cache whenever the parameter sets change.
pub type ParameterSetListener = Box<dyn Fn(&ParameterSetCache) + Send>;

/// Stateful extractor for one connection.
pub struct NalExtractor {
    codec: VideoCodec,
    cache: ParameterSetCache,
    listener: Option<ParameterSetListener>,
    stats: Arc<PipelineStats>,
}

impl NalExtractor {
    pub fn new(codec: VideoCodec, stats: Arc<PipelineStats>) -> Self {
        Self {
            codec,
            cache: ParameterSetCache::new(),
            listener: None,
            stats,
        }
    }

    /// Register the decoder-rebuild listener. Replaces any previous one.
    pub fn set_change_listener(&mut self, listener: impl Fn(&ParameterSetCache) + Send + 'static) {
        self.listener = Some(Box::new(listener));
    }

    /// The codec family this extractor was built for.
    pub fn codec(&self) -> VideoCodec {
        self.codec
    }

    /// Current parameter-set cache.
    pub fn parameter_sets(&self) -> &ParameterSetCache {
        &self.cache
    }

    /// Readiness invariant for building a decoder format description.
    pub fn has_complete_parameter_sets(&self) -> bool {
        self.cache.is_complete(self.codec)
    }

    /// Split a payload into classified units, updating the parameter-set
    /// cache as a side effect. Empty units are dropped without error.
    pub fn extract(&mut self, payload: &FramePayload) -> Vec<NalUnit> {
        let units = self.extract_raw(&payload.data);
        trace!(
            pts_us = payload.pts_us,
            is_config = payload.is_config,
            units = units.len(),
            "payload extracted"
        );
        units
    }

    /// Raw-stream variant: start-code scanning only, no payload framing.
    pub fn extract_raw(&mut self, data: &[u8]) -> Vec<NalUnit> {
        let mut units = Vec::new();
        for (start, end) in scan_units(data) {
            if start == end {
                // Zero-length unit between adjacent start codes.
                continue;
            }
            let body = &data[start..end];
            let nal_type = nal_type_of(self.codec, body[0]);
            if !type_in_valid_range(self.codec, nal_type) {
                warn!(
                    codec = %self.codec,
                    nal_type,
                    len = body.len(),
                    "nal type outside valid range, classifying best-effort"
                );
            }
            let unit = NalUnit {
                codec: self.codec,
                nal_type,
                data: body.to_vec(),
            };
            if self.cache.update(&unit) {
                self.stats.incr_parameter_set_changes();
                if let Some(listener) = &self.listener {
                    listener(&self.cache);
                }
                self.cache.clear_previous_sps();
            }
            units.push(unit);
        }
        self.stats.add_units_extracted(units.len() as u64);
        units
    }

    /// Clear per-stream state on restart.
    pub fn reset(&mut self) {
        self.cache.reset();
    }
}

/// Defined type-code range per codec family. Values outside it still
/// produce a unit, but are logged since silent misclassification could
/// hide a decoder desync.
fn type_in_valid_range(codec: VideoCodec, nal_type: u8) -> bool {
    match codec {
        // Type 0 is unspecified in H.264; 1..=23 defined, 24..=31 reserved
        // for packetization layers that never appear in Annex-B.
        VideoCodec::H264 => (1..=23).contains(&nal_type),
        // 0..=40 defined; 41..=47 reserved, 48..=63 unspecified.
        VideoCodec::H265 => nal_type <= 40,
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;

    use super::*;
    use crate::nal::{H264_NAL_PPS, H264_NAL_SPS};

    fn payload(data: &[u8], is_config: bool) -> FramePayload {
        FramePayload {
            data: Bytes::copy_from_slice(data),
            pts_us: 0,
            is_config,
        }
    }

    fn extractor(codec: VideoCodec) -> NalExtractor {
        NalExtractor::new(codec, Arc::new(PipelineStats::new()))
    }

    #[test]
    fn config_payload_splits_into_two_units() {
        let mut ext = extractor(VideoCodec::H264);
        let units = ext.extract(&payload(
            &[
                0x00, 0x00, 0x00, 0x01, 0x67, 0xAA, 0xBB, //
                0x00, 0x00, 0x01, 0x68, 0xCC,
            ],
            true,
        ));

        assert_eq!(units.len(), 2);
        assert_eq!(units[0].nal_type, H264_NAL_SPS);
        assert_eq!(units[0].data, vec![0x67, 0xAA, 0xBB]);
        assert_eq!(units[1].nal_type, H264_NAL_PPS);
        assert_eq!(units[1].data, vec![0x68, 0xCC]);
        assert!(ext.has_complete_parameter_sets());
    }

    #[test]
    fn empty_units_dropped() {
        let mut ext = extractor(VideoCodec::H264);
        // Two adjacent start codes produce a zero-length unit in between.
        let units = ext.extract(&payload(
            &[0x00, 0x00, 0x01, 0x00, 0x00, 0x01, 0x65, 0x01],
            false,
        ));
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].nal_type, crate::nal::H264_NAL_IDR);
    }

    #[test]
    fn change_listener_fires_before_units_return() {
        let mut ext = extractor(VideoCodec::H264);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_listener = fired.clone();
        ext.set_change_listener(move |cache| {
            // Previous SPS is still visible inside the notification.
            assert_eq!(cache.previous_sps(), Some(&[0x67, 0xAA][..]));
            assert_eq!(cache.sps(), Some(&[0x67, 0xBB][..]));
            fired_in_listener.fetch_add(1, Ordering::SeqCst);
        });

        ext.extract(&payload(&[0x00, 0x00, 0x01, 0x67, 0xAA], true));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        ext.extract(&payload(&[0x00, 0x00, 0x01, 0x67, 0xBB], true));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Previous SPS only held transiently, for the notification.
        assert!(ext.parameter_sets().previous_sps().is_none());

        // Re-feeding the same SPS does not fire again.
        ext.extract(&payload(&[0x00, 0x00, 0x01, 0x67, 0xBB], true));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn out_of_range_type_still_returned() {
        let mut ext = extractor(VideoCodec::H265);
        // (0x7E >> 1) & 0x3F = 63 — unspecified for H.265.
        let units = ext.extract(&payload(&[0x00, 0x00, 0x01, 0x7E, 0x01], false));
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].nal_type, 63);
    }

    #[test]
    fn h265_key_frame_classification() {
        let mut ext = extractor(VideoCodec::H265);
        // IDR_W_RADL = 19 → header byte 19 << 1 = 0x26.
        let units = ext.extract(&payload(&[0x00, 0x00, 0x01, 0x26, 0x01], false));
        assert_eq!(units.len(), 1);
        assert!(units[0].is_key_frame());
    }

    #[test]
    fn stats_count_units() {
        let stats = Arc::new(PipelineStats::new());
        let mut ext = NalExtractor::new(VideoCodec::H264, stats.clone());
        ext.extract(&payload(
            &[0x00, 0x00, 0x01, 0x67, 0x00, 0x00, 0x01, 0x68],
            true,
        ));
        assert_eq!(stats.snapshot().units_extracted, 2);
        assert_eq!(stats.snapshot().parameter_set_changes, 0);
    }
}
