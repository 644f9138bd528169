//! Single-slot, latest-write-wins buffer for decoded images.
//!
//! Decouples the decoder callback rate from the display refresh rate:
//! the newest image always wins, the same image is never delivered
//! twice, and a slow consumer costs counted skips instead of memory.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::stats::PipelineStats;

use super::SharedImage;

/// Window over which the interval skip rate is computed.
const SKIP_RATE_WINDOW: Duration = Duration::from_secs(2);

#[derive(Default)]
struct SlotState {
    pending: Option<SharedImage>,
    consumed: bool,
}

/// Diagnostic counters for one slot. Monotonic except `skip_rate`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlotStats {
    pub pushed: u64,
    pub consumed: u64,
    pub skipped: u64,
    /// Skips per second over the most recent window.
    pub skip_rate: f64,
}

/// Thread-safe latest-wins frame buffer.
///
/// All operations are O(1) and safe under one producer thread and one
/// consumer thread without external locking. The single mutex guards
/// only the `(pending, consumed)` pair; counters are atomics.
pub struct FrameSlot {
    state: Mutex<SlotState>,
    pushed: AtomicU64,
    consumed: AtomicU64,
    skipped: AtomicU64,
    rate: Mutex<RateWindow>,
    /// Shared pipeline counters, mirrored on every push/consume/skip.
    pipeline: Option<Arc<PipelineStats>>,
}

#[derive(Debug)]
struct RateWindow {
    window_start: Instant,
    skips_in_window: u64,
    last_rate: f64,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::default()),
            pushed: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            rate: Mutex::new(RateWindow {
                window_start: Instant::now(),
                skips_in_window: 0,
                last_rate: 0.0,
            }),
            pipeline: None,
        }
    }

    /// Slot that also mirrors its counters into the shared pipeline
    /// stats, like the demuxer and extractor do.
    pub fn with_stats(stats: Arc<PipelineStats>) -> Self {
        let mut slot = Self::new();
        slot.pipeline = Some(stats);
        slot
    }

    /// Replace the pending image. Returns `true` when the previous image
    /// had never been consumed (a dropped frame, counted as a skip).
    pub fn push(&self, image: SharedImage) -> bool {
        let was_skipped = {
            let mut state = self.state.lock().unwrap();
            let was_skipped = state.pending.is_some() && !state.consumed;
            state.pending = Some(image);
            state.consumed = false;
            was_skipped
        };
        self.pushed.fetch_add(1, Ordering::Relaxed);
        if was_skipped {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            self.record_skip();
        }
        if let Some(pipeline) = &self.pipeline {
            pipeline.incr_frames_pushed();
            if was_skipped {
                pipeline.incr_frames_skipped();
            }
        }
        was_skipped
    }

    /// Take the pending image if it has not been consumed yet.
    pub fn consume(&self) -> Option<SharedImage> {
        let image = {
            let mut state = self.state.lock().unwrap();
            if state.consumed {
                return None;
            }
            let image = state.pending.clone()?;
            state.consumed = true;
            image
        };
        self.consumed.fetch_add(1, Ordering::Relaxed);
        if let Some(pipeline) = &self.pipeline {
            pipeline.incr_frames_consumed();
        }
        Some(image)
    }

    /// Current image regardless of consumed state. For re-render paths
    /// (e.g. after a resize) that must not wait for a new frame.
    pub fn peek(&self) -> Option<SharedImage> {
        self.state.lock().unwrap().pending.clone()
    }

    /// Clear the slot on stream restart. Counters are kept.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.pending = None;
        state.consumed = false;
    }

    pub fn stats(&self) -> SlotStats {
        SlotStats {
            pushed: self.pushed.load(Ordering::Relaxed),
            consumed: self.consumed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            skip_rate: self.skip_rate(),
        }
    }

    /// Skips per second over the most recent window.
    pub fn skip_rate(&self) -> f64 {
        let mut rate = self.rate.lock().unwrap();
        rate.roll_over_if_elapsed();
        rate.last_rate
    }

    fn record_skip(&self) {
        let mut rate = self.rate.lock().unwrap();
        rate.roll_over_if_elapsed();
        rate.skips_in_window += 1;
    }
}

impl RateWindow {
    fn roll_over_if_elapsed(&mut self) {
        let elapsed = self.window_start.elapsed();
        if elapsed >= SKIP_RATE_WINDOW {
            self.last_rate = self.skips_in_window as f64 / elapsed.as_secs_f64();
            self.skips_in_window = 0;
            self.window_start = Instant::now();
        }
    }
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::frame::test_support::TestImage;

    #[test]
    fn consume_returns_latest_push() {
        let slot = FrameSlot::new();
        slot.push(TestImage::shared(1));
        let img = slot.consume().unwrap();
        assert_eq!(img.timestamp_us(), 1);
    }

    #[test]
    fn latest_wins_with_one_skip() {
        let slot = FrameSlot::new();
        assert!(!slot.push(TestImage::shared(1)));
        // A is replaced before being consumed: exactly one skip.
        assert!(slot.push(TestImage::shared(2)));

        let img = slot.consume().unwrap();
        assert_eq!(img.timestamp_us(), 2);

        // Never deliver the same image twice.
        assert!(slot.consume().is_none());

        let stats = slot.stats();
        assert_eq!(stats.pushed, 2);
        assert_eq!(stats.consumed, 1);
        assert_eq!(stats.skipped, 1);
    }

    #[test]
    fn consume_on_empty_slot() {
        let slot = FrameSlot::new();
        assert!(slot.consume().is_none());
    }

    #[test]
    fn push_after_consume_is_not_a_skip() {
        let slot = FrameSlot::new();
        slot.push(TestImage::shared(1));
        slot.consume().unwrap();
        assert!(!slot.push(TestImage::shared(2)));
        assert_eq!(slot.stats().skipped, 0);
    }

    #[test]
    fn peek_does_not_consume() {
        let slot = FrameSlot::new();
        slot.push(TestImage::shared(5));

        assert_eq!(slot.peek().unwrap().timestamp_us(), 5);
        assert_eq!(slot.consume().unwrap().timestamp_us(), 5);

        // Peek still sees the image after consumption, consume does not.
        assert!(slot.peek().is_some());
        assert!(slot.consume().is_none());
    }

    #[test]
    fn reset_clears_pending_keeps_counters() {
        let slot = FrameSlot::new();
        slot.push(TestImage::shared(1));
        slot.reset();
        assert!(slot.peek().is_none());
        assert!(slot.consume().is_none());
        assert_eq!(slot.stats().pushed, 1);
    }

    #[test]
    fn shared_stats_mirror_slot_counters() {
        let stats = Arc::new(PipelineStats::new());
        let slot = FrameSlot::with_stats(stats.clone());

        slot.push(TestImage::shared(1));
        // Replaced before consumption: one skip.
        slot.push(TestImage::shared(2));
        slot.consume().unwrap();

        let snap = stats.snapshot();
        assert_eq!(snap.frames_pushed, 2);
        assert_eq!(snap.frames_consumed, 1);
        assert_eq!(snap.frames_skipped, 1);

        // Slot-local counters agree.
        let local = slot.stats();
        assert_eq!(local.pushed, snap.frames_pushed);
        assert_eq!(local.consumed, snap.frames_consumed);
        assert_eq!(local.skipped, snap.frames_skipped);
    }

    #[test]
    fn accepts_images_without_debug() {
        // Image handles are opaque; nothing about the slot may demand
        // trait bounds beyond DecodedImage itself.
        struct OpaqueImage;

        impl crate::frame::DecodedImage for OpaqueImage {
            fn width(&self) -> u32 {
                1
            }
            fn height(&self) -> u32 {
                1
            }
            fn timestamp_us(&self) -> u64 {
                0
            }
        }

        let slot = FrameSlot::new();
        slot.push(Arc::new(OpaqueImage));
        assert!(slot.consume().is_some());
    }

    #[test]
    fn concurrent_producer_consumer() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let slot = Arc::new(FrameSlot::new());
        let done = Arc::new(AtomicBool::new(false));

        let producer_slot = slot.clone();
        let producer = std::thread::spawn(move || {
            for pts in 0..1000u64 {
                producer_slot.push(TestImage::shared(pts));
            }
        });

        let consumer_slot = slot.clone();
        let consumer_done = done.clone();
        let consumer = std::thread::spawn(move || {
            let mut last_pts = None::<u64>;
            loop {
                if let Some(img) = consumer_slot.consume() {
                    // Timestamps only move forward.
                    if let Some(prev) = last_pts {
                        assert!(img.timestamp_us() > prev);
                    }
                    last_pts = Some(img.timestamp_us());
                } else if consumer_done.load(Ordering::SeqCst) {
                    break;
                }
                std::thread::yield_now();
            }
        });

        producer.join().unwrap();
        done.store(true, Ordering::SeqCst);
        consumer.join().unwrap();

        // Every push was either consumed or counted as a skip.
        let stats = slot.stats();
        assert_eq!(stats.pushed, 1000);
        assert_eq!(stats.consumed + stats.skipped, 1000);
    }
}
