//! Frame generation and analysis
//!
//! - `source`: the synthetic bouncing ball (producer side)
//! - `localizer`: colour thresholding and centroid extraction (consumer side)
//! - `codec`: the run-length raster format carried over RTP

pub mod clock;
pub mod codec;
pub mod color;
pub mod frame;
pub mod localizer;
pub mod regions;
pub mod source;

pub use clock::FrameClock;
pub use color::HsvRange;
pub use frame::{FrameBuffer, PixelLayout};
pub use localizer::{Detection, Localizer};
pub use source::{BallSource, BallState};
