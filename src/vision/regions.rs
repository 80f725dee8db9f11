//! Connected region labelling on binary masks
//!
//! Regions use 8-connectivity and are reported in the raster order of their
//! first pixel, so "first found" is well defined when areas tie.

use super::color::Mask;

/// A connected set of mask pixels with its raw spatial moments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// Zeroth moment (pixel count)
    pub m00: u64,
    /// First moment along x
    pub m10: u64,
    /// First moment along y
    pub m01: u64,
    /// Bounding box as (min_x, min_y, max_x, max_y)
    pub bounds: (u32, u32, u32, u32),
}

impl Region {
    pub fn area(&self) -> u64 {
        self.m00
    }

    /// Centroid `(m10/m00, m01/m00)`, or `None` for a degenerate region
    pub fn centroid(&self) -> Option<(f64, f64)> {
        if self.m00 == 0 {
            return None;
        }
        let m00 = self.m00 as f64;
        Some((self.m10 as f64 / m00, self.m01 as f64 / m00))
    }
}

/// Label every connected region of `mask`
pub fn find_regions(mask: &Mask) -> Vec<Region> {
    let width = mask.width() as usize;
    let height = mask.height() as usize;
    let bits = mask.bits();

    let mut visited = vec![false; bits.len()];
    let mut stack: Vec<usize> = Vec::new();
    let mut regions = Vec::new();

    for start in 0..bits.len() {
        if !bits[start] || visited[start] {
            continue;
        }

        visited[start] = true;
        stack.push(start);

        let sx = (start % width) as u32;
        let sy = (start / width) as u32;
        let mut region = Region {
            m00: 0,
            m10: 0,
            m01: 0,
            bounds: (sx, sy, sx, sy),
        };

        while let Some(idx) = stack.pop() {
            let x = idx % width;
            let y = idx / width;

            region.m00 += 1;
            region.m10 += x as u64;
            region.m01 += y as u64;
            let b = &mut region.bounds;
            b.0 = b.0.min(x as u32);
            b.1 = b.1.min(y as u32);
            b.2 = b.2.max(x as u32);
            b.3 = b.3.max(y as u32);

            let y_lo = y.saturating_sub(1);
            let y_hi = (y + 1).min(height - 1);
            let x_lo = x.saturating_sub(1);
            let x_hi = (x + 1).min(width - 1);
            for ny in y_lo..=y_hi {
                for nx in x_lo..=x_hi {
                    let n = ny * width + nx;
                    if bits[n] && !visited[n] {
                        visited[n] = true;
                        stack.push(n);
                    }
                }
            }
        }

        regions.push(region);
    }

    regions
}

/// The region with the largest area; the earliest one wins a tie
pub fn largest_region(regions: &[Region]) -> Option<&Region> {
    regions.iter().fold(None, |best: Option<&Region>, r| match best {
        Some(b) if b.area() >= r.area() => Some(b),
        _ => Some(r),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::color::{threshold, HsvRange};
    use crate::vision::frame::{Canvas, PixelLayout};

    const WHITE: [u8; 3] = [255, 255, 255];
    const RED: [u8; 3] = [0, 0, 255];

    fn mask_of(canvas: Canvas) -> Mask {
        threshold(&canvas.into_frame(0), &HsvRange::RED)
    }

    #[test]
    fn test_empty_mask_has_no_regions() {
        let canvas = Canvas::new(16, 16, PixelLayout::Bgr24, &WHITE);
        assert!(find_regions(&mask_of(canvas)).is_empty());
    }

    #[test]
    fn test_diagonal_pixels_are_connected() {
        let mut canvas = Canvas::new(8, 8, PixelLayout::Bgr24, &WHITE);
        canvas.fill_circle(2, 2, 0, &RED);
        canvas.fill_circle(3, 3, 0, &RED);
        let regions = find_regions(&mask_of(canvas));
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].area(), 2);
        assert_eq!(regions[0].centroid(), Some((2.5, 2.5)));
    }

    #[test]
    fn test_regions_in_raster_order() {
        let mut canvas = Canvas::new(64, 32, PixelLayout::Bgr24, &WHITE);
        canvas.fill_circle(50, 5, 2, &RED);
        canvas.fill_circle(10, 20, 4, &RED);
        let regions = find_regions(&mask_of(canvas));
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].centroid(), Some((50.0, 5.0)));
        assert_eq!(regions[1].centroid(), Some((10.0, 20.0)));
        assert_eq!(largest_region(&regions), Some(&regions[1]));
    }

    #[test]
    fn test_tie_prefers_first_found() {
        let mut canvas = Canvas::new(64, 32, PixelLayout::Bgr24, &WHITE);
        canvas.fill_circle(10, 10, 3, &RED);
        canvas.fill_circle(40, 10, 3, &RED);
        let regions = find_regions(&mask_of(canvas));
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].area(), regions[1].area());
        assert_eq!(largest_region(&regions).unwrap().centroid(), Some((10.0, 10.0)));
    }

    #[test]
    fn test_degenerate_region_has_no_centroid() {
        let region = Region {
            m00: 0,
            m10: 0,
            m01: 0,
            bounds: (0, 0, 0, 0),
        };
        assert_eq!(region.centroid(), None);
    }
}
