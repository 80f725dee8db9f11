//! Colour space conversion and thresholding
//!
//! HSV uses the 8-bit convention common to vision libraries: hue in
//! `[0, 180)` (degrees halved), saturation and value in `[0, 255]`.
//! Single channel input is expanded to BGR first, so grey pixels always
//! have zero saturation.

use serde::{Deserialize, Serialize};

use super::frame::{FrameBuffer, PixelLayout};

/// One pixel in HSV
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hsv {
    pub h: u8,
    pub s: u8,
    pub v: u8,
}

/// Convert one BGR pixel to HSV
pub fn bgr_to_hsv(b: u8, g: u8, r: u8) -> Hsv {
    let max = b.max(g).max(r);
    let min = b.min(g).min(r);
    let v = max;
    let delta = (max - min) as f32;

    let s = if max == 0 {
        0
    } else {
        (delta * 255.0 / max as f32).round() as u8
    };

    if delta == 0.0 {
        return Hsv { h: 0, s, v };
    }

    let (b, g, r) = (b as f32, g as f32, r as f32);
    let mut h = if max as f32 == r {
        60.0 * (g - b) / delta
    } else if max as f32 == g {
        120.0 + 60.0 * (b - r) / delta
    } else {
        240.0 + 60.0 * (r - g) / delta
    };
    if h < 0.0 {
        h += 360.0;
    }

    // 360 halves to 180 which wraps back to 0
    let h = ((h / 2.0).round() as u16 % 180) as u8;
    Hsv { h, s, v }
}

/// Inclusive HSV bounds selecting the tracked colour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HsvRange {
    pub lower: [u8; 3],
    pub upper: [u8; 3],
}

impl HsvRange {
    /// Saturated red at the low end of the hue circle
    pub const RED: Self = Self {
        lower: [0, 120, 70],
        upper: [10, 255, 255],
    };

    pub fn contains(&self, hsv: Hsv) -> bool {
        (self.lower[0]..=self.upper[0]).contains(&hsv.h)
            && (self.lower[1]..=self.upper[1]).contains(&hsv.s)
            && (self.lower[2]..=self.upper[2]).contains(&hsv.v)
    }
}

impl Default for HsvRange {
    fn default() -> Self {
        Self::RED
    }
}

/// Binary mask with one entry per pixel
#[derive(Debug, Clone)]
pub struct Mask {
    width: u32,
    height: u32,
    bits: Vec<bool>,
}

impl Mask {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn get(&self, x: u32, y: u32) -> bool {
        self.bits[y as usize * self.width as usize + x as usize]
    }

    /// Number of set pixels
    pub fn count(&self) -> usize {
        self.bits.iter().filter(|b| **b).count()
    }

    pub(crate) fn bits(&self) -> &[bool] {
        &self.bits
    }
}

/// Select the pixels of `frame` whose HSV value lies within `range`
pub fn threshold(frame: &FrameBuffer, range: &HsvRange) -> Mask {
    let data = frame.data();
    let bits = match frame.layout() {
        PixelLayout::Gray => data
            .iter()
            .map(|&v| range.contains(bgr_to_hsv(v, v, v)))
            .collect(),
        PixelLayout::Bgr24 => data
            .chunks_exact(3)
            .map(|px| range.contains(bgr_to_hsv(px[0], px[1], px[2])))
            .collect(),
    };

    Mask {
        width: frame.width(),
        height: frame.height(),
        bits,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_colours() {
        assert_eq!(bgr_to_hsv(0, 0, 255), Hsv { h: 0, s: 255, v: 255 });
        assert_eq!(bgr_to_hsv(0, 255, 0), Hsv { h: 60, s: 255, v: 255 });
        assert_eq!(bgr_to_hsv(255, 0, 0), Hsv { h: 120, s: 255, v: 255 });
    }

    #[test]
    fn test_grey_has_no_saturation() {
        for v in [0u8, 76, 128, 255] {
            let hsv = bgr_to_hsv(v, v, v);
            assert_eq!(hsv.s, 0);
            assert_eq!(hsv.v, v);
        }
    }

    #[test]
    fn test_magenta_red_wraps_below_180() {
        // Slightly blue-ish red lands near the top of the hue circle
        let hsv = bgr_to_hsv(10, 0, 255);
        assert!(hsv.h > 170 && hsv.h < 180);
        assert!(!HsvRange::RED.contains(hsv));
    }

    #[test]
    fn test_red_range() {
        assert!(HsvRange::RED.contains(bgr_to_hsv(0, 0, 255)));
        assert!(HsvRange::RED.contains(bgr_to_hsv(20, 30, 200)));
        assert!(!HsvRange::RED.contains(bgr_to_hsv(255, 255, 255)));
        assert!(!HsvRange::RED.contains(bgr_to_hsv(0, 0, 40)));
    }

    #[test]
    fn test_threshold_gray_frame_is_empty() {
        let frame = FrameBuffer::filled(8, 4, PixelLayout::Gray, &[255]);
        let mask = threshold(&frame, &HsvRange::RED);
        assert_eq!(mask.count(), 0);
        assert_eq!((mask.width(), mask.height()), (8, 4));
    }
}
