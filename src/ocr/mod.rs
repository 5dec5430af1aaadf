//! Text recognition for block-number redaction.
//!
//! The recognizer itself sits behind [`OcrEngine`]; everything here is the
//! engine-independent part: image preprocessing, text cleanup and the
//! block-number filter that turns raw readings into regions to blur.

use std::sync::OnceLock;

use anyhow::Result;
use image::{imageops, GrayImage, Luma};
use regex::Regex;

use crate::frame::Frame;
use crate::redact::gaussian_sigma;
use crate::region::Region;

#[cfg(feature = "ocr-tesseract")]
mod tesseract;
#[cfg(feature = "ocr-tesseract")]
pub use tesseract::TesseractEngine;

/// Characters the recognizer is allowed to emit.
pub const OCR_ALLOWLIST: &str = "0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Minimum confidence for a reading to be considered.
pub const MIN_CONFIDENCE: f32 = 0.4;

/// Maximum number of block-number regions per frame.
pub const MAX_BLOCK_REGIONS: usize = 4;

const ADAPTIVE_BLOCK: u32 = 11;
const ADAPTIVE_C: i16 = 2;

/// One recognized word: its corner points in frame pixels, text and confidence in `0..=1`.
#[derive(Clone, Debug, PartialEq)]
pub struct OcrReading {
    pub quad: [(f32, f32); 4],
    pub text: String,
    pub confidence: f32,
}

/// A text recognizer working on preprocessed grayscale images.
pub trait OcrEngine: Send {
    fn name(&self) -> &'static str;

    fn read(&mut self, image: &GrayImage) -> Result<Vec<OcrReading>>;
}

/// Uppercase, drop non-word characters and undo common letter/digit confusions.
pub fn clean_text(raw: &str) -> String {
    raw.trim()
        .to_uppercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .map(|c| match c {
            'O' => '0',
            'I' => '1',
            'S' => '5',
            'G' => '6',
            'Z' => '2',
            'B' => '8',
            other => other,
        })
        .collect()
}

/// One to three digits, optionally followed by a single letter.
pub fn is_block_number(text: &str) -> bool {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let len = text.chars().count();
    if !(1..=4).contains(&len) {
        return false;
    }
    PATTERN
        .get_or_init(|| Regex::new(r"^[0-9]{1,3}[A-Z]?$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(text))
}

/// Grayscale, histogram-equalize and adaptively binarize a frame.
pub fn preprocess(frame: &Frame) -> GrayImage {
    let gray = imageops::grayscale(frame.image());
    let equalized = equalize_histogram(&gray);
    adaptive_threshold(&equalized, ADAPTIVE_BLOCK, ADAPTIVE_C)
}

/// Readings that look like block numbers, as padded frame regions.
pub fn block_regions(readings: &[OcrReading], width: u32, height: u32) -> Vec<Region> {
    readings
        .iter()
        .filter(|r| r.confidence > MIN_CONFIDENCE)
        .filter(|r| is_block_number(&clean_text(&r.text)))
        .filter_map(|r| Region::from_quad(&r.quad, width, height))
        .take(MAX_BLOCK_REGIONS)
        .collect()
}

pub fn equalize_histogram(image: &GrayImage) -> GrayImage {
    let mut hist = [0u32; 256];
    for Luma([v]) in image.pixels() {
        hist[*v as usize] += 1;
    }
    let total: u32 = hist.iter().sum();
    let Some(first) = hist.iter().position(|&c| c > 0) else {
        return image.clone();
    };
    let cdf_min = hist[first];
    if total == cdf_min {
        return image.clone();
    }

    let mut lut = [0u8; 256];
    let mut cdf = 0u32;
    for (value, count) in hist.iter().enumerate() {
        cdf += count;
        let scaled = (cdf.saturating_sub(cdf_min)) as f32 * 255.0 / (total - cdf_min) as f32;
        lut[value] = scaled.round().clamp(0.0, 255.0) as u8;
    }

    let mut out = image.clone();
    for Luma([v]) in out.pixels_mut() {
        *v = lut[*v as usize];
    }
    out
}

/// Gaussian-weighted local mean threshold: white where `pixel > mean - c`.
pub fn adaptive_threshold(image: &GrayImage, block: u32, c: i16) -> GrayImage {
    let mean = imageops::blur(image, gaussian_sigma(block));
    let mut out = GrayImage::new(image.width(), image.height());
    for (x, y, Luma([v])) in image.enumerate_pixels() {
        let threshold = mean.get_pixel(x, y).0[0] as i16 - c;
        let white = (*v as i16) > threshold;
        out.put_pixel(x, y, Luma([if white { 255 } else { 0 }]));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(text: &str, confidence: f32, x: f32, y: f32) -> OcrReading {
        OcrReading {
            quad: [(x, y), (x + 40.0, y), (x + 40.0, y + 20.0), (x, y + 20.0)],
            text: text.to_string(),
            confidence,
        }
    }

    #[test]
    fn cleanup_maps_lookalike_letters() {
        assert_eq!(clean_text(" blk 1o8-b "), "8LK1088");
        assert_eq!(clean_text("12a"), "12A");
        assert_eq!(clean_text("S0"), "50");
        assert_eq!(clean_text("#!"), "");
    }

    #[test]
    fn block_number_pattern() {
        for ok in ["1", "12", "123", "123A", "7K"] {
            assert!(is_block_number(ok), "{ok}");
        }
        for bad in ["", "1234", "A1", "12AB", "ABC", "12a"] {
            assert!(!is_block_number(bad), "{bad}");
        }
    }

    #[test]
    fn only_confident_block_numbers_become_regions() {
        let readings = vec![
            reading("123", 0.9, 100.0, 100.0),
            reading("12O", 0.8, 200.0, 100.0),
            reading("123", 0.3, 300.0, 100.0),
            reading("HELLO", 0.99, 100.0, 200.0),
        ];
        let regions = block_regions(&readings, 640, 480);
        assert_eq!(
            regions,
            vec![Region::new(90, 90, 150, 130), Region::new(190, 90, 250, 130)]
        );
    }

    #[test]
    fn region_count_is_capped() {
        let readings: Vec<_> = (0..6)
            .map(|i| reading("5", 0.9, 10.0 + i as f32 * 60.0, 10.0))
            .collect();
        assert_eq!(block_regions(&readings, 640, 480).len(), MAX_BLOCK_REGIONS);
    }

    #[test]
    fn equalization_stretches_narrow_range() {
        let image = GrayImage::from_fn(4, 1, |x, _| Luma([100 + x as u8]));
        let out = equalize_histogram(&image);
        assert_eq!(out.get_pixel(0, 0).0[0], 0);
        assert_eq!(out.get_pixel(3, 0).0[0], 255);
    }

    #[test]
    fn threshold_keeps_dark_text_dark() {
        let mut image = GrayImage::from_pixel(40, 40, Luma([200]));
        for y in 17..23 {
            for x in 17..23 {
                image.put_pixel(x, y, Luma([20]));
            }
        }
        let out = adaptive_threshold(&image, 11, 2);
        assert_eq!(out.get_pixel(20, 20).0[0], 0);
        assert_eq!(out.get_pixel(2, 2).0[0], 255);
    }
}
