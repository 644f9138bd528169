//! Display-side delivery: the shared refresh driver and the
//! latest-wins presentation scheduler.

pub mod scheduler;
pub mod vsync;

pub use scheduler::{FrameNotifier, PresentationScheduler};
pub use vsync::{VsyncHandle, VsyncRegistry};
