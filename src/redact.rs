//! In-place region blurring.

use image::{imageops, RgbImage};
use serde::{Deserialize, Serialize};

use crate::frame::Frame;
use crate::region::Region;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlurKind {
    /// Gaussian blur; sigma follows the kernel size.
    Gaussian { kernel: u32 },
    /// Normalized box filter.
    Box { kernel: u32 },
}

impl BlurKind {
    pub fn kernel(&self) -> u32 {
        match self {
            BlurKind::Gaussian { kernel } | BlurKind::Box { kernel } => *kernel,
        }
    }
}

/// Sigma OpenCV derives for a Gaussian kernel when none is given.
pub fn gaussian_sigma(kernel: u32) -> f32 {
    0.3 * ((kernel.max(1) as f32 - 1.0) * 0.5 - 1.0) + 0.8
}

/// Blur `region` of `frame` in place. Returns false if the region lies outside the frame.
pub fn redact_region(frame: &mut Frame, region: Region, kind: BlurKind) -> bool {
    let Some(region) = region.clamp_to(frame.width(), frame.height()) else {
        return false;
    };
    let image = frame.image_mut();
    let roi = imageops::crop_imm(
        &*image,
        region.x1,
        region.y1,
        region.width(),
        region.height(),
    )
    .to_image();

    let blurred = match kind {
        BlurKind::Gaussian { kernel } => imageops::blur(&roi, gaussian_sigma(kernel)),
        BlurKind::Box { kernel } => box_blur(&roi, kernel),
    };
    imageops::replace(image, &blurred, region.x1 as i64, region.y1 as i64);
    true
}

/// Normalized box filter with reflect-101 borders.
pub fn box_blur(image: &RgbImage, kernel: u32) -> RgbImage {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 || kernel <= 1 {
        return image.clone();
    }
    let radius = (kernel / 2) as i64;
    let (wu, hu) = (w as usize, h as usize);
    let src = image.as_raw();

    // Horizontal pass into f32 accumulators, then vertical pass.
    let mut horizontal = vec![0f32; wu * hu * 3];
    let mut line = vec![0f32; wu + 2 * radius as usize];
    for y in 0..hu {
        for c in 0..3 {
            for (i, slot) in line.iter_mut().enumerate() {
                let x = reflect101(i as i64 - radius, wu);
                *slot = src[(y * wu + x) * 3 + c] as f32;
            }
            let sums = window_sums(&line, kernel as usize);
            for x in 0..wu {
                horizontal[(y * wu + x) * 3 + c] = sums[x];
            }
        }
    }

    let area = (kernel as u64 * kernel as u64) as f32;
    let mut out = RgbImage::new(w, h);
    let dst: &mut [u8] = &mut out;
    let mut column = vec![0f32; hu + 2 * radius as usize];
    for x in 0..wu {
        for c in 0..3 {
            for (i, slot) in column.iter_mut().enumerate() {
                let y = reflect101(i as i64 - radius, hu);
                *slot = horizontal[(y * wu + x) * 3 + c];
            }
            let sums = window_sums(&column, kernel as usize);
            for y in 0..hu {
                dst[(y * wu + x) * 3 + c] = (sums[y] / area).round().clamp(0.0, 255.0) as u8;
            }
        }
    }
    out
}

/// Sliding sums of `window` consecutive values; yields `values.len() - window + 1` sums.
fn window_sums(values: &[f32], window: usize) -> Vec<f32> {
    let count = values.len() + 1 - window;
    let mut sums = Vec::with_capacity(count);
    let mut acc: f32 = values[..window].iter().sum();
    sums.push(acc);
    for i in 1..count {
        acc += values[i + window - 1] - values[i - 1];
        sums.push(acc);
    }
    sums
}

fn reflect101(mut i: i64, n: usize) -> usize {
    let n = n as i64;
    if n == 1 {
        return 0;
    }
    loop {
        if i < 0 {
            i = -i;
        } else if i >= n {
            i = 2 * n - 2 - i;
        } else {
            return i as usize;
        }
    }
}
