//! Decoded-image handling: the latest-wins frame slot and the bounded
//! broadcast source.
//!
//! The core never touches pixels. Decoded images are opaque handles
//! produced by the external hardware decoder; they are shared by
//! reference and dropped when the last holder lets go.

pub mod broadcast;
pub mod slot;

pub use broadcast::{FrameBroadcaster, FrameSink, SinkId};
pub use slot::{FrameSlot, SlotStats};

use std::sync::Arc;

/// An externally-produced decoded image.
///
/// Implementations wrap whatever the decoder hands back (a GPU surface,
/// a pixel buffer handle). The core only reads dimensions and timing.
pub trait DecodedImage: Send + Sync {
    /// Image width in pixels.
    fn width(&self) -> u32;
    /// Image height in pixels.
    fn height(&self) -> u32;
    /// Presentation timestamp in microseconds.
    fn timestamp_us(&self) -> u64;
}

/// Copy-free shared handle to a decoded image.
pub type SharedImage = Arc<dyn DecodedImage>;
