use std::collections::VecDeque;

use anyhow::Result;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;
use crate::frame::Frame;
use crate::region::Region;
use crate::settings::DetectionKind;

/// Thresholds for green street-name sign detection.
///
/// HSV values use the 8-bit OpenCV scale: hue 0..180, saturation and value 0..255.
#[derive(Clone, Debug)]
pub struct SignDetectorConfig {
    pub hsv_lower: [u8; 3],
    pub hsv_upper: [u8; 3],
    /// Side of the square closing kernel.
    pub close_kernel: u32,
    pub min_area: u32,
    pub max_area: u32,
    pub min_aspect: f32,
    pub max_aspect: f32,
    pub max_regions: usize,
}

impl Default for SignDetectorConfig {
    fn default() -> Self {
        Self {
            hsv_lower: [40, 60, 60],
            hsv_upper: [80, 255, 200],
            close_kernel: 7,
            min_area: 800,
            max_area: 25_000,
            min_aspect: 1.5,
            max_aspect: 6.5,
            max_regions: 3,
        }
    }
}

/// Color-based street sign detector.
///
/// Masks sign-green pixels, closes small gaps, then keeps wide blobs of
/// plausible size.
#[derive(Default)]
pub struct HsvSignBackend {
    config: SignDetectorConfig,
}

impl HsvSignBackend {
    pub fn new(config: SignDetectorConfig) -> Self {
        Self { config }
    }

    fn find_regions(&self, frame: &Frame) -> Vec<Region> {
        let (w, h) = (frame.width() as usize, frame.height() as usize);
        if w == 0 || h == 0 {
            return Vec::new();
        }
        let mask = color_mask(frame, self.config.hsv_lower, self.config.hsv_upper);
        let radius = (self.config.close_kernel / 2) as usize;
        let closed = erode(&dilate(&mask, w, h, radius), w, h, radius);
        let filled = fill_holes(&closed, w, h);

        let mut candidates: Vec<Blob> = components(&filled, w, h)
            .into_iter()
            .filter(|blob| blob.area > self.config.min_area && blob.area < self.config.max_area)
            .filter(|blob| {
                let aspect = blob.bounds.width() as f32 / blob.bounds.height() as f32;
                aspect > self.config.min_aspect && aspect < self.config.max_aspect
            })
            .collect();
        // Largest signs first; ties keep scan order.
        candidates.sort_by(|a, b| b.area.cmp(&a.area));
        candidates
            .into_iter()
            .take(self.config.max_regions)
            .map(|blob| blob.bounds)
            .collect()
    }
}

impl DetectorBackend for HsvSignBackend {
    fn name(&self) -> &'static str {
        "hsv-signs"
    }

    fn kind(&self) -> DetectionKind {
        DetectionKind::StreetSigns
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        Ok(self
            .find_regions(frame)
            .into_iter()
            .map(|region| Detection::new(DetectionKind::StreetSigns, region, 1.0))
            .collect())
    }
}

/// RGB to 8-bit HSV with OpenCV scaling.
pub fn rgb_to_hsv(r: u8, g: u8, b: u8) -> [u8; 3] {
    let (rf, gf, bf) = (r as f32, g as f32, b as f32);
    let max = rf.max(gf).max(bf);
    let min = rf.min(gf).min(bf);
    let diff = max - min;

    let s = if max > 0.0 { 255.0 * diff / max } else { 0.0 };
    let mut hue = if diff == 0.0 {
        0.0
    } else if max == rf {
        60.0 * (gf - bf) / diff
    } else if max == gf {
        120.0 + 60.0 * (bf - rf) / diff
    } else {
        240.0 + 60.0 * (rf - gf) / diff
    };
    if hue < 0.0 {
        hue += 360.0;
    }
    [
        (hue / 2.0).round().min(180.0) as u8,
        s.round() as u8,
        max as u8,
    ]
}

fn color_mask(frame: &Frame, lower: [u8; 3], upper: [u8; 3]) -> Vec<bool> {
    frame
        .pixels()
        .chunks_exact(3)
        .map(|px| {
            let hsv = rgb_to_hsv(px[0], px[1], px[2]);
            (0..3).all(|c| hsv[c] >= lower[c] && hsv[c] <= upper[c])
        })
        .collect()
}

/// Separable max filter over a `(2r+1)` square; pixels outside the image are ignored.
fn dilate(mask: &[bool], w: usize, h: usize, r: usize) -> Vec<bool> {
    morph(mask, w, h, r, true)
}

/// Separable min filter over a `(2r+1)` square; pixels outside the image are ignored.
fn erode(mask: &[bool], w: usize, h: usize, r: usize) -> Vec<bool> {
    morph(mask, w, h, r, false)
}

fn morph(mask: &[bool], w: usize, h: usize, r: usize, dilate: bool) -> Vec<bool> {
    let pass = |src: &[bool], horizontal: bool| -> Vec<bool> {
        let mut out = vec![false; w * h];
        for y in 0..h {
            for x in 0..w {
                let (pos, len) = if horizontal { (x, w) } else { (y, h) };
                let lo = pos.saturating_sub(r);
                let hi = (pos + r).min(len - 1);
                let mut window = (lo..=hi).map(|p| {
                    if horizontal {
                        src[y * w + p]
                    } else {
                        src[p * w + x]
                    }
                });
                out[y * w + x] = if dilate {
                    window.any(|v| v)
                } else {
                    window.all(|v| v)
                };
            }
        }
        out
    };
    pass(&pass(mask, true), false)
}

/// Fill background pockets not connected to the image border.
fn fill_holes(mask: &[bool], w: usize, h: usize) -> Vec<bool> {
    let mut outside = vec![false; w * h];
    let mut queue = VecDeque::new();
    for x in 0..w {
        for y in [0, h - 1] {
            queue.push_back((x, y));
        }
    }
    for y in 0..h {
        for x in [0, w - 1] {
            queue.push_back((x, y));
        }
    }
    while let Some((x, y)) = queue.pop_front() {
        let idx = y * w + x;
        if mask[idx] || outside[idx] {
            continue;
        }
        outside[idx] = true;
        if x > 0 {
            queue.push_back((x - 1, y));
        }
        if x + 1 < w {
            queue.push_back((x + 1, y));
        }
        if y > 0 {
            queue.push_back((x, y - 1));
        }
        if y + 1 < h {
            queue.push_back((x, y + 1));
        }
    }
    outside.into_iter().map(|o| !o).collect()
}

struct Blob {
    bounds: Region,
    area: u32,
}

/// 8-connected components, in scan order of their first pixel.
fn components(mask: &[bool], w: usize, h: usize) -> Vec<Blob> {
    let mut seen = vec![false; w * h];
    let mut blobs = Vec::new();
    let mut stack = Vec::new();
    for start in 0..w * h {
        if !mask[start] || seen[start] {
            continue;
        }
        seen[start] = true;
        stack.push(start);
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (w, h, 0, 0);
        let mut area = 0u32;
        while let Some(idx) = stack.pop() {
            let (x, y) = (idx % w, idx / w);
            area += 1;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
            for dy in -1i64..=1 {
                for dx in -1i64..=1 {
                    let nx = x as i64 + dx;
                    let ny = y as i64 + dy;
                    if nx < 0 || ny < 0 || nx >= w as i64 || ny >= h as i64 {
                        continue;
                    }
                    let n = ny as usize * w + nx as usize;
                    if mask[n] && !seen[n] {
                        seen[n] = true;
                        stack.push(n);
                    }
                }
            }
        }
        blobs.push(Blob {
            bounds: Region::new(
                min_x as u32,
                min_y as u32,
                max_x as u32 + 1,
                max_y as u32 + 1,
            ),
            area,
        });
    }
    blobs
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    const SIGN_GREEN: Rgb<u8> = Rgb([0, 120, 40]);

    fn paint(image: &mut RgbImage, region: Region, color: Rgb<u8>) {
        for y in region.y1..region.y2 {
            for x in region.x1..region.x2 {
                image.put_pixel(x, y, color);
            }
        }
    }

    #[test]
    fn sign_green_is_inside_default_range() {
        let hsv = rgb_to_hsv(0, 120, 40);
        assert_eq!(hsv, [70, 255, 120]);
        assert_eq!(rgb_to_hsv(255, 0, 0), [0, 255, 255]);
        assert_eq!(rgb_to_hsv(0, 0, 255), [120, 255, 255]);
        assert_eq!(rgb_to_hsv(90, 90, 90), [0, 0, 90]);
    }

    #[test]
    fn detects_wide_green_sign_with_lettering() -> Result<()> {
        let mut image = RgbImage::from_pixel(320, 240, Rgb([90, 90, 90]));
        let sign = Region::from_xywh(40, 30, 100, 40);
        paint(&mut image, sign, SIGN_GREEN);
        // White lettering leaves holes in the mask.
        paint(&mut image, Region::from_xywh(55, 40, 20, 15), Rgb([250, 250, 250]));
        paint(&mut image, Region::from_xywh(90, 40, 30, 15), Rgb([250, 250, 250]));

        // Too small and too tall blobs.
        paint(&mut image, Region::from_xywh(200, 200, 10, 10), SIGN_GREEN);
        paint(&mut image, Region::from_xywh(260, 20, 20, 100), SIGN_GREEN);

        let mut backend = HsvSignBackend::default();
        let detections = backend.detect(&Frame::new(image, 1))?;
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].region, sign);
        assert_eq!(detections[0].kind, DetectionKind::StreetSigns);
        Ok(())
    }

    #[test]
    fn closing_bridges_small_gaps() {
        let (w, h) = (20, 5);
        let mut mask = vec![false; w * h];
        for x in (2..8).chain(11..17) {
            mask[2 * w + x] = true;
        }
        let closed = erode(&dilate(&mask, w, h, 3), w, h, 3);
        assert!((2..17).all(|x| closed[2 * w + x]));
        assert!(!closed[2 * w]);
    }

    #[test]
    fn region_count_is_capped() -> Result<()> {
        let mut image = RgbImage::from_pixel(640, 480, Rgb([90, 90, 90]));
        for i in 0..5 {
            paint(&mut image, Region::from_xywh(20, 20 + i * 80, 100, 40), SIGN_GREEN);
        }
        let mut backend = HsvSignBackend::default();
        assert_eq!(backend.detect(&Frame::new(image, 1))?.len(), 3);
        Ok(())
    }

    #[test]
    fn capped_regions_are_the_largest_signs() -> Result<()> {
        let mut image = RgbImage::from_pixel(640, 480, Rgb([90, 90, 90]));
        // Smaller signs sit first in scan order.
        let widths = [70u32, 75, 80, 120, 140];
        for (i, width) in widths.iter().enumerate() {
            paint(
                &mut image,
                Region::from_xywh(20, 20 + i as u32 * 80, *width, 40),
                SIGN_GREEN,
            );
        }
        let mut backend = HsvSignBackend::default();
        let detections = backend.detect(&Frame::new(image, 1))?;
        let kept: Vec<u32> = detections.iter().map(|d| d.region.width()).collect();
        assert_eq!(kept, vec![140, 120, 80]);
        Ok(())
    }
}
