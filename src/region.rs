//! Pixel-space rectangles for detected regions.
//!
//! Coordinates are in frame pixels with exclusive right/bottom edges, so a
//! region covering the whole frame is `(0, 0, width, height)`.

use serde::{Deserialize, Serialize};

/// Padding added around OCR word boxes before blurring.
pub const QUAD_PADDING_PX: u32 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl Region {
    pub fn new(x1: u32, y1: u32, x2: u32, y2: u32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn from_xywh(x: u32, y: u32, w: u32, h: u32) -> Self {
        Self {
            x1: x,
            y1: y,
            x2: x.saturating_add(w),
            y2: y.saturating_add(h),
        }
    }

    pub fn width(&self) -> u32 {
        self.x2.saturating_sub(self.x1)
    }

    pub fn height(&self) -> u32 {
        self.y2.saturating_sub(self.y1)
    }

    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    /// Intersect with a `width` x `height` frame. Returns `None` if nothing is left.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<Region> {
        let clamped = Region {
            x1: self.x1.min(width),
            y1: self.y1.min(height),
            x2: self.x2.min(width),
            y2: self.y2.min(height),
        };
        if clamped.is_empty() {
            None
        } else {
            Some(clamped)
        }
    }

    /// Grow by `padding` on every side, staying inside the frame.
    pub fn padded(&self, padding: u32, width: u32, height: u32) -> Region {
        Region {
            x1: self.x1.saturating_sub(padding),
            y1: self.y1.saturating_sub(padding),
            x2: self.x2.saturating_add(padding).min(width),
            y2: self.y2.saturating_add(padding).min(height),
        }
    }

    pub fn intersection_area(&self, other: &Region) -> u64 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);
        if x2 <= x1 || y2 <= y1 {
            return 0;
        }
        (x2 - x1) as u64 * (y2 - y1) as u64
    }

    pub fn iou(&self, other: &Region) -> f32 {
        let inter = self.intersection_area(other);
        if inter == 0 {
            return 0.0;
        }
        let union = self.area() + other.area() - inter;
        inter as f32 / union as f32
    }

    /// Bounding box of a four-point quad (as returned by OCR engines).
    ///
    /// The box is clamped so it always covers at least one pixel inside the
    /// frame, then padded by [`QUAD_PADDING_PX`].
    pub fn from_quad(points: &[(f32, f32)], width: u32, height: u32) -> Option<Region> {
        if points.len() != 4 || width == 0 || height == 0 {
            return None;
        }
        if points.iter().any(|(x, y)| !x.is_finite() || !y.is_finite()) {
            return None;
        }

        let min_x = points.iter().map(|p| p.0).fold(f32::INFINITY, f32::min);
        let max_x = points.iter().map(|p| p.0).fold(f32::NEG_INFINITY, f32::max);
        let min_y = points.iter().map(|p| p.1).fold(f32::INFINITY, f32::min);
        let max_y = points.iter().map(|p| p.1).fold(f32::NEG_INFINITY, f32::max);

        let (w, h) = (width as i64, height as i64);
        let x1 = (min_x as i64).clamp(0, w - 1);
        let y1 = (min_y as i64).clamp(0, h - 1);
        let x2 = (max_x as i64).min(w).max(x1 + 1);
        let y2 = (max_y as i64).min(h).max(y1 + 1);

        let region = Region::new(x1 as u32, y1 as u32, x2 as u32, y2 as u32);
        Some(region.padded(QUAD_PADDING_PX, width, height))
    }
}
