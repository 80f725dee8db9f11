//! Raster frame buffers

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{AppError, Result};

/// Sample layout of a raster (8 bits per sample)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelLayout {
    /// Single channel luminance
    Gray,
    /// Packed blue, green, red
    Bgr24,
}

impl PixelLayout {
    /// Samples per pixel
    pub fn channels(&self) -> usize {
        match self {
            PixelLayout::Gray => 1,
            PixelLayout::Bgr24 => 3,
        }
    }

    /// Layout for a given channel count
    pub fn from_channels(channels: u8) -> Option<Self> {
        match channels {
            1 => Some(PixelLayout::Gray),
            3 => Some(PixelLayout::Bgr24),
            _ => None,
        }
    }
}

impl fmt::Display for PixelLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelLayout::Gray => write!(f, "GRAY8"),
            PixelLayout::Bgr24 => write!(f, "BGR24"),
        }
    }
}

/// A single decoded raster (height x width x channels, row-major)
///
/// Frames are cheap to clone; the sample data is shared.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameBuffer {
    data: Bytes,
    width: u32,
    height: u32,
    layout: PixelLayout,
    /// Presentation timestamp in 90 kHz ticks
    pub pts: u32,
}

impl FrameBuffer {
    /// Wrap raw samples, checking the length against the extent
    pub fn new(data: Bytes, width: u32, height: u32, layout: PixelLayout, pts: u32) -> Result<Self> {
        let expected = width as usize * height as usize * layout.channels();
        if data.len() != expected {
            return Err(AppError::Codec(format!(
                "{}x{} {} frame needs {} bytes, got {}",
                width,
                height,
                layout,
                expected,
                data.len()
            )));
        }
        Ok(Self {
            data,
            width,
            height,
            layout,
            pts,
        })
    }

    /// Create a frame with every pixel set to `pixel`
    pub fn filled(width: u32, height: u32, layout: PixelLayout, pixel: &[u8]) -> Self {
        debug_assert_eq!(pixel.len(), layout.channels());
        let count = width as usize * height as usize;
        let data: Vec<u8> = pixel.iter().copied().cycle().take(count * pixel.len()).collect();
        Self {
            data: Bytes::from(data),
            width,
            height,
            layout,
            pts: 0,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn layout(&self) -> PixelLayout {
        self.layout
    }

    pub fn channels(&self) -> usize {
        self.layout.channels()
    }

    /// Raw samples
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Raw samples as Bytes (cheap clone)
    pub fn data_bytes(&self) -> Bytes {
        self.data.clone()
    }

    /// Samples of the pixel at (x, y)
    pub fn pixel(&self, x: u32, y: u32) -> &[u8] {
        let ch = self.channels();
        let offset = (y as usize * self.width as usize + x as usize) * ch;
        &self.data[offset..offset + ch]
    }

    /// Number of pixels
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Mutable raster used to render frames before freezing them
pub struct Canvas {
    data: Vec<u8>,
    width: u32,
    height: u32,
    layout: PixelLayout,
}

impl Canvas {
    /// Create a canvas filled with `background`
    pub fn new(width: u32, height: u32, layout: PixelLayout, background: &[u8]) -> Self {
        let frame = FrameBuffer::filled(width, height, layout, background);
        Self {
            data: frame.data.to_vec(),
            width,
            height,
            layout,
        }
    }

    /// Fill a disc centred at (cx, cy); parts outside the canvas are clipped
    pub fn fill_circle(&mut self, cx: i32, cy: i32, radius: i32, color: &[u8]) {
        let ch = self.layout.channels();
        debug_assert_eq!(color.len(), ch);
        if radius < 0 {
            return;
        }

        let y0 = (cy - radius).max(0);
        let y1 = (cy + radius).min(self.height as i32 - 1);
        let r2 = radius as i64 * radius as i64;

        for y in y0..=y1 {
            let dy = (y - cy) as i64;
            // Horizontal half-span of the disc on this row
            let span = ((r2 - dy * dy) as f64).sqrt() as i32;
            let x0 = (cx - span).max(0);
            let x1 = (cx + span).min(self.width as i32 - 1);
            for x in x0..=x1 {
                let offset = (y as usize * self.width as usize + x as usize) * ch;
                self.data[offset..offset + ch].copy_from_slice(color);
            }
        }
    }

    /// Freeze into an immutable frame
    pub fn into_frame(self, pts: u32) -> FrameBuffer {
        FrameBuffer {
            data: Bytes::from(self.data),
            width: self.width,
            height: self.height,
            layout: self.layout,
            pts,
        }
    }
}
