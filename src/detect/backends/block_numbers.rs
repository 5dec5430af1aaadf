use anyhow::Result;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;
use crate::frame::Frame;
use crate::ocr::{self, OcrEngine};
use crate::settings::DetectionKind;

/// Block-number detector: preprocess, recognize, keep short numeric labels.
///
/// Without an OCR engine the backend reports nothing, so enabling block
/// numbers on a build without OCR degrades to a no-op instead of failing.
pub struct BlockNumberBackend {
    engine: Option<Box<dyn OcrEngine>>,
    warned: bool,
}

impl BlockNumberBackend {
    pub fn new(engine: Box<dyn OcrEngine>) -> Self {
        Self {
            engine: Some(engine),
            warned: false,
        }
    }

    pub fn unavailable() -> Self {
        Self {
            engine: None,
            warned: false,
        }
    }

    pub fn has_engine(&self) -> bool {
        self.engine.is_some()
    }
}

impl DetectorBackend for BlockNumberBackend {
    fn name(&self) -> &'static str {
        match &self.engine {
            Some(engine) => engine.name(),
            None => "ocr-unavailable",
        }
    }

    fn kind(&self) -> DetectionKind {
        DetectionKind::BlockNumbers
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let Some(engine) = self.engine.as_mut() else {
            if !self.warned {
                log::warn!("block number detection requested but no OCR engine is available");
                self.warned = true;
            }
            return Ok(Vec::new());
        };

        let prepared = ocr::preprocess(frame);
        let readings = engine.read(&prepared)?;
        log::debug!(
            "frame {}: {} OCR readings",
            frame.sequence,
            readings.len()
        );
        Ok(ocr::block_regions(&readings, frame.width(), frame.height())
            .into_iter()
            .map(|region| Detection::new(DetectionKind::BlockNumbers, region, 1.0))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocr::OcrReading;
    use crate::region::Region;
    use image::{GrayImage, RgbImage};

    struct ScriptedEngine {
        readings: Vec<OcrReading>,
        seen: Option<(u32, u32)>,
    }

    impl OcrEngine for ScriptedEngine {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn read(&mut self, image: &GrayImage) -> Result<Vec<OcrReading>> {
            self.seen = Some(image.dimensions());
            Ok(self.readings.clone())
        }
    }

    #[test]
    fn engine_readings_become_padded_regions() -> Result<()> {
        let engine = ScriptedEngine {
            readings: vec![
                OcrReading {
                    quad: [(50.0, 50.0), (90.0, 50.0), (90.0, 70.0), (50.0, 70.0)],
                    text: "23b".into(),
                    confidence: 0.75,
                },
                OcrReading {
                    quad: [(10.0, 10.0), (30.0, 10.0), (30.0, 20.0), (10.0, 20.0)],
                    text: "EXIT".into(),
                    confidence: 0.95,
                },
            ],
            seen: None,
        };
        let mut backend = BlockNumberBackend::new(Box::new(engine));
        assert_eq!(backend.name(), "scripted");

        let frame = Frame::new(RgbImage::new(320, 240), 30);
        let detections = backend.detect(&frame)?;
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].region, Region::new(40, 40, 100, 80));
        Ok(())
    }

    #[test]
    fn missing_engine_is_a_noop() -> Result<()> {
        let mut backend = BlockNumberBackend::unavailable();
        assert!(!backend.has_engine());
        let frame = Frame::new(RgbImage::new(64, 64), 0);
        assert!(backend.detect(&frame)?.is_empty());
        assert!(backend.detect(&frame)?.is_empty());
        Ok(())
    }
}
