//! Frame container.
//!
//! - `Frame`: owned RGB8 pixels with a capture sequence number.
//!
//! Unredacted pixels are sensitive: frames are zeroized when dropped so that
//! evicted or discarded frames do not linger in freed memory. Sources hand
//! frames to the processor, which redacts them in place.

use anyhow::{anyhow, Result};
use image::RgbImage;
use std::time::{Duration, Instant};
use zeroize::Zeroize;

use crate::region::Region;

/// Owned RGB frame.
#[derive(Clone)]
pub struct Frame {
    image: RgbImage,
    /// Capture order assigned by the source (starts at 1).
    pub sequence: u64,
    captured_at: Instant,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u64) -> Self {
        Self {
            image,
            sequence,
            captured_at: Instant::now(),
        }
    }

    /// Build a frame from packed RGB24 bytes.
    pub fn from_rgb(pixels: Vec<u8>, width: u32, height: u32, sequence: u64) -> Result<Self> {
        let expected = packed_len(width, height)?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                pixels.len()
            ));
        }
        let image = RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| anyhow!("RGB buffer does not fit {}x{}", width, height))?;
        Ok(Self::new(image, sequence))
    }

    /// Build a frame from packed BGR24 bytes (OpenCV / WebRTC `bgr24` layout).
    pub fn from_bgr(mut pixels: Vec<u8>, width: u32, height: u32, sequence: u64) -> Result<Self> {
        for px in pixels.chunks_exact_mut(3) {
            px.swap(0, 2);
        }
        Self::from_rgb(pixels, width, height, sequence)
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Region covering the whole frame.
    pub fn bounds(&self) -> Region {
        Region::new(0, 0, self.width(), self.height())
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn image_mut(&mut self) -> &mut RgbImage {
        &mut self.image
    }

    pub fn pixels(&self) -> &[u8] {
        self.image.as_raw()
    }

    /// Time since the source produced this frame.
    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }

    /// Copy of the pixels in BGR24 order.
    pub fn to_bgr(&self) -> Vec<u8> {
        let mut out = self.image.as_raw().clone();
        for px in out.chunks_exact_mut(3) {
            px.swap(0, 2);
        }
        out
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        let pixels: &mut [u8] = &mut self.image;
        pixels.zeroize();
    }
}

fn packed_len(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(3))
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}
