//! Read-only pipeline diagnostics.
//!
//! A single [`PipelineStats`] instance is shared (via `Arc`) across the
//! session, demuxer, extractor and frame slot. Counters are monotonic
//! and lock-free; they feed logging and telemetry, never control flow.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// Governor state mirrored into the stats block for snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GovernorState {
    Normal = 0,
    Degraded = 1,
}

/// Shared atomic counters for the whole receive pipeline.
#[derive(Debug, Default)]
pub struct PipelineStats {
    /// Raw bytes delivered by the transport session.
    bytes_received: AtomicU64,
    /// Complete frame payloads produced by the demuxer.
    frames_demuxed: AtomicU64,
    /// Elementary-stream units produced by the extractor.
    units_extracted: AtomicU64,
    /// Images pushed into the frame slot.
    frames_pushed: AtomicU64,
    /// Images taken out of the frame slot.
    frames_consumed: AtomicU64,
    /// Images replaced before ever being consumed.
    frames_skipped: AtomicU64,
    /// Parameter-set rebuilds observed (SPS change notifications).
    parameter_set_changes: AtomicU64,
    /// Current governor state (0 = normal, 1 = degraded).
    governor_state: AtomicU8,
}

/// Point-in-time copy of every counter, cheap to log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub bytes_received: u64,
    pub frames_demuxed: u64,
    pub units_extracted: u64,
    pub frames_pushed: u64,
    pub frames_consumed: u64,
    pub frames_skipped: u64,
    pub parameter_set_changes: u64,
    pub governor_state: GovernorState,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bytes_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn incr_frames_demuxed(&self) {
        self.frames_demuxed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_units_extracted(&self, n: u64) {
        self.units_extracted.fetch_add(n, Ordering::Relaxed);
    }

    pub fn incr_frames_pushed(&self) {
        self.frames_pushed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_frames_consumed(&self) {
        self.frames_consumed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_frames_skipped(&self) {
        self.frames_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_parameter_set_changes(&self) {
        self.parameter_set_changes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_governor_state(&self, state: GovernorState) {
        self.governor_state.store(state as u8, Ordering::Relaxed);
    }

    /// Copy every counter at once.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_demuxed: self.frames_demuxed.load(Ordering::Relaxed),
            units_extracted: self.units_extracted.load(Ordering::Relaxed),
            frames_pushed: self.frames_pushed.load(Ordering::Relaxed),
            frames_consumed: self.frames_consumed.load(Ordering::Relaxed),
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
            parameter_set_changes: self.parameter_set_changes.load(Ordering::Relaxed),
            governor_state: if self.governor_state.load(Ordering::Relaxed) == 0 {
                GovernorState::Normal
            } else {
                GovernorState::Degraded
            },
        }
    }
}
