use anyhow::{anyhow, Context, Result};
use image::{Rgb, RgbImage};
use rand::Rng;
use url::Url;

use super::{FrameSource, SourceStats};
use crate::config::SourceSettings;
use crate::frame::Frame;

const SKY: [u8; 3] = [150, 180, 210];
const ROAD: [u8; 3] = [70, 70, 75];
const SIGN_GREEN: [u8; 3] = [0, 120, 40];
const LETTERING: [u8; 3] = [245, 245, 245];
const PLATE: [u8; 3] = [235, 235, 235];

/// Synthetic street scene for `stub://` URIs.
///
/// Each frame has a sky band, a road, a green street-name sign that drifts
/// sideways and a white plate near the bottom, plus low-amplitude noise so
/// consecutive frames differ.
pub struct SyntheticSource {
    uri: String,
    width: u32,
    height: u32,
    limit: Option<u64>,
    frame_count: u64,
}

impl SyntheticSource {
    pub fn new(uri: &str, settings: &SourceSettings) -> Result<Self> {
        let parsed = Url::parse(uri).with_context(|| format!("invalid stub uri '{}'", uri))?;
        let mut limit = None;
        for (key, value) in parsed.query_pairs() {
            if key == "frames" {
                let frames: u64 = value
                    .parse()
                    .map_err(|_| anyhow!("stub frames must be an integer, got '{}'", value))?;
                limit = Some(frames);
            }
        }
        if settings.width == 0 || settings.height == 0 {
            return Err(anyhow!("synthetic frames need a non-zero size"));
        }
        Ok(Self {
            uri: uri.to_string(),
            width: settings.width,
            height: settings.height,
            limit,
            frame_count: 0,
        })
    }

    fn render(&self) -> RgbImage {
        let (w, h) = (self.width, self.height);
        let horizon = h * 2 / 5;
        let mut image = RgbImage::from_fn(w, h, |_, y| Rgb(if y < horizon { SKY } else { ROAD }));

        let sign_w = (w / 5).max(1);
        let sign_h = (w * 3 / 50).max(1);
        let drift = (self.frame_count % 40) as u32;
        let sign_x = (w * 11 / 20 + drift).min(w.saturating_sub(sign_w));
        let sign_y = h * 3 / 20;
        fill(&mut image, sign_x, sign_y, sign_w, sign_h, SIGN_GREEN);
        fill(
            &mut image,
            sign_x + sign_w / 8,
            sign_y + sign_h / 3,
            sign_w * 3 / 4,
            sign_h / 3,
            LETTERING,
        );

        fill(&mut image, w / 10 + 4, h * 4 / 5 + 4, 112, 22, PLATE);

        let mut rng = rand::thread_rng();
        for px in image.pixels_mut() {
            for channel in px.0.iter_mut() {
                let noise: i16 = rng.gen_range(-3..=3);
                *channel = (*channel as i16 + noise).clamp(0, 255) as u8;
            }
        }
        image
    }
}

fn fill(image: &mut RgbImage, x: u32, y: u32, w: u32, h: u32, color: [u8; 3]) {
    let x2 = x.saturating_add(w).min(image.width());
    let y2 = y.saturating_add(h).min(image.height());
    for yy in y..y2 {
        for xx in x..x2 {
            image.put_pixel(xx, yy, Rgb(color));
        }
    }
}

impl FrameSource for SyntheticSource {
    fn connect(&mut self) -> Result<()> {
        log::info!("SyntheticSource: connected to {}", self.uri);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.limit.is_some_and(|limit| self.frame_count >= limit) {
            return Ok(None);
        }
        self.frame_count += 1;
        Ok(Some(Frame::new(self.render(), self.frame_count)))
    }

    fn is_healthy(&self) -> bool {
        true
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            uri: self.uri.clone(),
        }
    }

    fn frame_count_hint(&self) -> Option<u64> {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{DetectorBackend, HsvSignBackend};

    #[test]
    fn frames_use_configured_size_and_sequence() -> Result<()> {
        let settings = SourceSettings {
            width: 320,
            height: 240,
            ..SourceSettings::default()
        };
        let mut source = SyntheticSource::new("stub://street", &settings)?;
        source.connect()?;
        let first = source.next_frame()?.ok_or_else(|| anyhow!("no frame"))?;
        let second = source.next_frame()?.ok_or_else(|| anyhow!("no frame"))?;
        assert_eq!((first.width(), first.height()), (320, 240));
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert_ne!(first.pixels(), second.pixels());
        assert_eq!(source.frame_count_hint(), None);
        Ok(())
    }

    #[test]
    fn scene_contains_a_detectable_sign() -> Result<()> {
        let mut source = SyntheticSource::new("stub://street", &SourceSettings::default())?;
        let frame = source.next_frame()?.ok_or_else(|| anyhow!("no frame"))?;
        let detections = HsvSignBackend::default().detect(&frame)?;
        assert_eq!(detections.len(), 1);
        Ok(())
    }

    #[test]
    fn bad_frame_limit_is_rejected() {
        assert!(SyntheticSource::new("stub://x?frames=many", &SourceSettings::default()).is_err());
    }
}
