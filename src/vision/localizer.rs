//! Colour based object localization
//!
//! A frame is thresholded in HSV, connected regions are labelled and the
//! centroid of the largest one is reported. When nothing matches, `locate`
//! falls back to a uniformly random point inside the bounce area so the
//! feedback loop always has a value to send.

use rand::Rng;

use super::color::{threshold, HsvRange};
use super::frame::FrameBuffer;
use super::regions::{find_regions, largest_region};
use crate::config::{TrackerConfig, VideoConfig};
use crate::tracking::coords::CoordinatePair;

/// Default object size used to bound the random fallback
pub const DEFAULT_OBJECT_SIZE: u32 = 50;

/// A successful detection
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub position: CoordinatePair,
    /// Pixel count of the selected region
    pub area: u64,
}

/// Stateless localizer; safe to share between threads
#[derive(Debug, Clone)]
pub struct Localizer {
    range: HsvRange,
    min_area: u64,
    object_size: u32,
}

impl Default for Localizer {
    fn default() -> Self {
        Self::new(HsvRange::RED, 1, DEFAULT_OBJECT_SIZE)
    }
}

impl Localizer {
    pub fn new(range: HsvRange, min_area: u32, object_size: u32) -> Self {
        Self {
            range,
            min_area: min_area.max(1) as u64,
            object_size,
        }
    }

    pub fn from_config(tracker: &TrackerConfig, video: &VideoConfig) -> Self {
        Self::new(tracker.hsv_range, tracker.min_region_area, video.ball_size)
    }

    pub fn range(&self) -> &HsvRange {
        &self.range
    }

    /// Centroid of the largest matching region, if any
    pub fn detect(&self, frame: &FrameBuffer) -> Option<Detection> {
        let mask = threshold(frame, &self.range);
        let regions = find_regions(&mask);
        let region = largest_region(&regions)?;
        if region.area() < self.min_area {
            return None;
        }
        let (x, y) = region.centroid()?;
        Some(Detection {
            position: CoordinatePair::new(x, y),
            area: region.area(),
        })
    }

    /// Estimate the object position, falling back to a random point
    pub fn locate(&self, frame: &FrameBuffer) -> CoordinatePair {
        self.locate_with(frame, &mut rand::thread_rng())
    }

    /// [`Localizer::locate`] with a caller supplied random source
    pub fn locate_with<R: Rng + ?Sized>(&self, frame: &FrameBuffer, rng: &mut R) -> CoordinatePair {
        match self.detect(frame) {
            Some(detection) => detection.position,
            None => self.fallback(frame.width(), frame.height(), rng),
        }
    }

    fn fallback<R: Rng + ?Sized>(&self, width: u32, height: u32, rng: &mut R) -> CoordinatePair {
        let max_x = width.saturating_sub(self.object_size).max(1);
        let max_y = height.saturating_sub(self.object_size).max(1);
        CoordinatePair::new(rng.gen_range(0..max_x) as f64, rng.gen_range(0..max_y) as f64)
    }
}
