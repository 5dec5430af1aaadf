use anyhow::Result;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;
use crate::frame::Frame;
use crate::region::Region;
use crate::settings::DetectionKind;

const PLATE_W: u32 = 120;
const PLATE_H: u32 = 30;

/// Plate backend used when no plate model is available.
///
/// Covers the two spots where plates of vehicles ahead usually appear in a
/// dashcam or street view (bottom left, bottom right).
#[derive(Default)]
pub struct FixedRegionPlateBackend;

impl FixedRegionPlateBackend {
    pub fn new() -> Self {
        Self
    }

    pub fn regions(width: u32, height: u32) -> Vec<Region> {
        let anchors = [
            ((width as f64 * 0.1) as u32, (height as f64 * 0.8) as u32),
            ((width as f64 * 0.7) as u32, (height as f64 * 0.75) as u32),
        ];
        anchors
            .into_iter()
            .filter(|(x, y)| x + PLATE_W < width && y + PLATE_H < height)
            .map(|(x, y)| Region::from_xywh(x, y, PLATE_W, PLATE_H))
            .collect()
    }
}

impl DetectorBackend for FixedRegionPlateBackend {
    fn name(&self) -> &'static str {
        "plate-fallback"
    }

    fn kind(&self) -> DetectionKind {
        DetectionKind::LicensePlates
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        Ok(Self::regions(frame.width(), frame.height())
            .into_iter()
            .map(|region| Detection::fixed(DetectionKind::LicensePlates, region))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_for_vga_frame() {
        let regions = FixedRegionPlateBackend::regions(640, 480);
        assert_eq!(
            regions,
            vec![
                Region::from_xywh(64, 384, 120, 30),
                Region::from_xywh(448, 360, 120, 30),
            ]
        );
    }

    #[test]
    fn regions_that_do_not_fit_are_skipped() {
        // 0.7 * 160 + 120 = 232 > 160, but 0.1 * 160 + 120 = 136 fits.
        let regions = FixedRegionPlateBackend::regions(160, 200);
        assert_eq!(regions, vec![Region::from_xywh(16, 160, 120, 30)]);
        assert!(FixedRegionPlateBackend::regions(100, 100).is_empty());
    }

    #[test]
    fn fallback_detections_are_marked_fixed() -> Result<()> {
        let frame = Frame::new(image::RgbImage::new(640, 480), 1);
        let detections = FixedRegionPlateBackend::new().detect(&frame)?;
        assert_eq!(detections.len(), 2);
        assert!(detections.iter().all(|d| d.fixed && d.confidence == 0.0));
        Ok(())
    }
}
