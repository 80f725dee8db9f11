//! Localization pipeline and the coordinate feedback loop

pub mod coords;
pub mod feedback;
pub mod monitor;
pub mod pipeline;

pub use coords::{CoordinatePair, CoordinateSlot, ReportParseError};
pub use feedback::{CoordinateReporter, ErrorTracker, LocationError, ReportOutcome};
pub use monitor::ChannelMonitor;
pub use pipeline::{recv_frames, FrameObserver, FramePipeline, PipelineStats};
