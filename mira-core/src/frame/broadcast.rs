//! Bounded fan-out of decoded images to registered sinks.
//!
//! A sink is typically a render surface wrapping its own [`FrameSlot`]:
//! its `push` never blocks, and drops are absorbed (and counted) by the
//! slot. The sink count is capped so a UI layer that forgets to
//! unregister cannot grow resource use without bound.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::error::MiraError;

use super::SharedImage;

/// Maximum number of concurrently registered sinks.
pub const MAX_SINKS: usize = 8;

/// Opaque registration handle, used for idempotent removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkId(u64);

/// A consumer of decoded images.
pub trait FrameSink: Send + Sync {
    /// Prepare for a stream of `width` x `height` images.
    fn open(&self, width: u32, height: u32) -> Result<(), MiraError>;

    /// Stream ended; release per-stream resources.
    fn close(&self);

    /// Accept one image. Return `false` if the frame could not be
    /// accepted; the broadcaster reports this but keeps delivering.
    fn push(&self, image: SharedImage) -> bool;
}

struct SinkEntry {
    id: SinkId,
    sink: Arc<dyn FrameSink>,
}

/// Fans each decoded image out to every registered sink without
/// blocking the producer.
pub struct FrameBroadcaster {
    sinks: Mutex<Vec<SinkEntry>>,
    next_id: AtomicU64,
    /// `(width, height)` of the currently open stream, if any. Sinks
    /// added mid-stream are opened immediately with these dimensions.
    open_size: Mutex<Option<(u32, u32)>>,
}

impl FrameBroadcaster {
    pub fn new() -> Self {
        Self {
            sinks: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            open_size: Mutex::new(None),
        }
    }

    /// Register a sink. Returns its removal handle, or
    /// [`MiraError::SinkLimit`] when the bound is reached.
    ///
    /// If a stream is already open, the sink is opened before it is
    /// added so it never observes frames without a preceding `open`.
    pub fn add_sink(&self, sink: Arc<dyn FrameSink>) -> Result<SinkId, MiraError> {
        let mut sinks = self.sinks.lock().unwrap();
        if sinks.len() >= MAX_SINKS {
            return Err(MiraError::SinkLimit(MAX_SINKS));
        }
        if let Some((w, h)) = *self.open_size.lock().unwrap() {
            sink.open(w, h)?;
        }
        let id = SinkId(self.next_id.fetch_add(1, Ordering::Relaxed));
        sinks.push(SinkEntry { id, sink });
        debug!(?id, count = sinks.len(), "sink registered");
        Ok(id)
    }

    /// Remove a sink. Idempotent: unknown ids are a no-op.
    pub fn remove_sink(&self, id: SinkId) {
        let mut sinks = self.sinks.lock().unwrap();
        let before = sinks.len();
        sinks.retain(|entry| entry.id != id);
        if sinks.len() != before {
            debug!(?id, count = sinks.len(), "sink removed");
        }
    }

    /// Number of registered sinks.
    pub fn sink_count(&self) -> usize {
        self.sinks.lock().unwrap().len()
    }

    /// Open every sink for a stream of the given dimensions.
    ///
    /// If any sink fails to open, the sinks already opened by this call
    /// are closed again, leaving no sink half-initialized.
    pub fn open(&self, width: u32, height: u32) -> Result<(), MiraError> {
        let sinks = self.sinks.lock().unwrap();
        let mut opened = 0usize;
        for entry in sinks.iter() {
            if let Err(e) = entry.sink.open(width, height) {
                warn!(id = ?entry.id, error = %e, "sink open failed, rolling back");
                for rollback in sinks.iter().take(opened) {
                    rollback.sink.close();
                }
                return Err(e);
            }
            opened += 1;
        }
        *self.open_size.lock().unwrap() = Some((width, height));
        Ok(())
    }

    /// Close every sink and forget the stream dimensions. Idempotent.
    pub fn close(&self) {
        let sinks = self.sinks.lock().unwrap();
        for entry in sinks.iter() {
            entry.sink.close();
        }
        *self.open_size.lock().unwrap() = None;
    }

    /// Deliver an image to every sink in registration order.
    ///
    /// Returns `false` if any sink refused the frame. Default policy is
    /// best-effort: delivery continues to the remaining sinks either way.
    pub fn push_to_sinks(&self, image: SharedImage) -> bool {
        let sinks = self.sinks.lock().unwrap();
        let mut all_accepted = true;
        for entry in sinks.iter() {
            if !entry.sink.push(image.clone()) {
                all_accepted = false;
            }
        }
        all_accepted
    }
}

impl Default for FrameBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ────────────────────────────────────────────────────────
