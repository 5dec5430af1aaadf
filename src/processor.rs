//! Per-frame redaction pipeline.
//!
//! `StreamSafeProcessor` owns one detector per kind and applies them in
//! processing order. Expensive detectors run on a cadence; between runs their
//! last regions stay cached and are blurred on every frame so redaction never
//! flickers off.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::config::DetectorSettings;
use crate::detect::{
    BackendRegistry, BlockNumberBackend, Detection, FixedRegionPlateBackend, HsvSignBackend,
};
use crate::frame::Frame;
use crate::redact::{redact_region, BlurKind};
use crate::region::Region;
use crate::settings::{DetectionKind, DetectionSettings};

/// Builds a fresh processor; used by sessions and jobs that need their own counters.
pub type ProcessorFactory = Arc<dyn Fn() -> Result<StreamSafeProcessor> + Send + Sync>;

/// How one detection kind is scheduled and redacted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KindPolicy {
    /// Run the detector on every n-th frame for this kind.
    pub cadence: u64,
    pub blur: BlurKind,
    pub max_regions: usize,
}

impl KindPolicy {
    pub fn default_for(kind: DetectionKind) -> Self {
        Self::from_settings(kind, &DetectorSettings::default())
    }

    pub fn from_settings(kind: DetectionKind, settings: &DetectorSettings) -> Self {
        match kind {
            DetectionKind::LicensePlates => Self {
                cadence: 1,
                blur: BlurKind::Gaussian {
                    kernel: settings.plate_blur_kernel,
                },
                max_regions: settings.plate_max_detections,
            },
            DetectionKind::BlockNumbers => Self {
                cadence: settings.block_cadence,
                blur: BlurKind::Box {
                    kernel: settings.block_blur_kernel,
                },
                max_regions: crate::ocr::MAX_BLOCK_REGIONS,
            },
            DetectionKind::StreetSigns => Self {
                cadence: settings.sign_cadence,
                blur: BlurKind::Box {
                    kernel: settings.sign_blur_kernel,
                },
                max_regions: 3,
            },
        }
    }
}

/// What happened to one frame.
#[derive(Clone, Debug, Default)]
pub struct FrameReport {
    /// Fresh detections from detectors that ran on this frame.
    pub detections: Vec<Detection>,
    /// Regions blurred, cached ones included.
    pub redacted_regions: usize,
    pub elapsed: Duration,
}

impl FrameReport {
    /// Detections found in the frame; fixed fallback regions are not counted.
    pub fn detection_count(&self) -> usize {
        self.detections.iter().filter(|d| !d.fixed).count()
    }
}

#[derive(Default)]
struct KindState {
    counter: u64,
    cached: Vec<Region>,
}

pub struct StreamSafeProcessor {
    registry: BackendRegistry,
    policies: BTreeMap<DetectionKind, KindPolicy>,
    state: BTreeMap<DetectionKind, KindState>,
}

impl StreamSafeProcessor {
    pub fn new(registry: BackendRegistry) -> Self {
        let policies = DetectionKind::ALL
            .into_iter()
            .map(|kind| (kind, KindPolicy::default_for(kind)))
            .collect();
        Self {
            registry,
            policies,
            state: BTreeMap::new(),
        }
    }

    /// Build the detector set described by `settings`.
    ///
    /// Missing optional pieces (plate model, OCR engine) degrade to the
    /// fallback plate regions and a silent block-number detector.
    pub fn from_config(settings: &DetectorSettings) -> Result<Self> {
        let mut registry = BackendRegistry::new();
        register_plate_backend(&mut registry, settings);
        registry.register(HsvSignBackend::default());
        registry.register(block_number_backend(settings));

        let mut processor = Self::new(registry);
        for kind in DetectionKind::ALL {
            processor.set_policy(kind, KindPolicy::from_settings(kind, settings));
        }
        Ok(processor)
    }

    pub fn factory(settings: DetectorSettings) -> ProcessorFactory {
        Arc::new(move || Self::from_config(&settings))
    }

    pub fn set_policy(&mut self, kind: DetectionKind, policy: KindPolicy) {
        self.policies.insert(kind, policy);
    }

    pub fn policy(&self, kind: DetectionKind) -> Option<KindPolicy> {
        self.policies.get(&kind).copied()
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Redact one frame of a stream in place.
    pub fn process_frame(&mut self, frame: &mut Frame, settings: &DetectionSettings) -> FrameReport {
        let start = Instant::now();
        let mut report = FrameReport::default();

        for kind in settings.enabled() {
            let Some(policy) = self.policies.get(&kind).copied() else {
                continue;
            };
            if !self.registry.contains(kind) {
                continue;
            }
            let state = self.state.entry(kind).or_default();
            state.counter += 1;

            if state.counter % policy.cadence.max(1) == 0 {
                match self.registry.detect(kind, frame) {
                    Ok(mut found) => {
                        found.truncate(policy.max_regions);
                        state.cached = found.iter().map(|d| d.region).collect();
                        report.detections.extend(found);
                    }
                    Err(e) => {
                        log::debug!("{} detection failed on frame {}: {:#}", kind, frame.sequence, e);
                        state.cached.clear();
                    }
                }
            }

            for region in &state.cached {
                if redact_region(frame, *region, policy.blur) {
                    report.redacted_regions += 1;
                }
            }
        }

        report.elapsed = start.elapsed();
        report
    }

    /// Redact a single image: every enabled detector runs now, caches are untouched.
    pub fn process_still(&mut self, frame: &mut Frame, settings: &DetectionSettings) -> FrameReport {
        let start = Instant::now();
        let mut report = FrameReport::default();

        for kind in settings.enabled() {
            let Some(policy) = self.policies.get(&kind).copied() else {
                continue;
            };
            if !self.registry.contains(kind) {
                continue;
            }
            let mut found = match self.registry.detect(kind, frame) {
                Ok(found) => found,
                Err(e) => {
                    log::debug!("{} detection failed: {:#}", kind, e);
                    continue;
                }
            };
            found.truncate(policy.max_regions);
            for detection in &found {
                if redact_region(frame, detection.region, policy.blur) {
                    report.redacted_regions += 1;
                }
            }
            report.detections.extend(found);
        }

        report.elapsed = start.elapsed();
        report
    }

    /// Forget counters and cached regions.
    pub fn reset(&mut self) {
        self.state.clear();
    }

    pub fn warm_up(&self) -> Result<()> {
        self.registry.warm_up()
    }
}

#[cfg(feature = "backend-tract")]
fn register_plate_backend(registry: &mut BackendRegistry, settings: &DetectorSettings) {
    use crate::detect::yolo::YoloParams;
    use crate::detect::YoloPlateBackend;

    let Some(model) = settings.plate_model.as_ref() else {
        log::info!("no plate model configured; blurring fixed plate regions");
        registry.register(FixedRegionPlateBackend::new());
        return;
    };
    let params = YoloParams {
        input_size: settings.plate_input_size,
        confidence_threshold: settings.plate_confidence,
        iou_threshold: settings.plate_iou,
        max_detections: settings.plate_max_detections,
    };
    match YoloPlateBackend::new(model, params) {
        Ok(backend) => registry.register(backend),
        Err(e) => {
            log::warn!("plate model unavailable ({:#}); blurring fixed plate regions", e);
            registry.register(FixedRegionPlateBackend::new());
        }
    }
}

#[cfg(not(feature = "backend-tract"))]
fn register_plate_backend(registry: &mut BackendRegistry, settings: &DetectorSettings) {
    if let Some(model) = settings.plate_model.as_ref() {
        log::warn!(
            "plate model {} ignored: built without backend-tract; blurring fixed plate regions",
            model.display()
        );
    }
    registry.register(FixedRegionPlateBackend::new());
}

#[cfg(feature = "ocr-tesseract")]
fn block_number_backend(settings: &DetectorSettings) -> BlockNumberBackend {
    use crate::ocr::TesseractEngine;

    let data_path = settings
        .tessdata
        .as_ref()
        .and_then(|path| path.to_str().map(str::to_string));
    match TesseractEngine::new(data_path.as_deref(), &settings.ocr_language) {
        Ok(engine) => BlockNumberBackend::new(Box::new(engine)),
        Err(e) => {
            log::warn!("OCR engine unavailable: {:#}", e);
            BlockNumberBackend::unavailable()
        }
    }
}

#[cfg(not(feature = "ocr-tesseract"))]
fn block_number_backend(_settings: &DetectorSettings) -> BlockNumberBackend {
    BlockNumberBackend::unavailable()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::DetectorBackend;
    use anyhow::anyhow;
    use image::{Rgb, RgbImage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedBackend {
        kind: DetectionKind,
        region: Region,
        calls: Arc<AtomicUsize>,
        fail_on: Option<usize>,
    }

    impl DetectorBackend for ScriptedBackend {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn kind(&self) -> DetectionKind {
            self.kind
        }

        fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_on == Some(call) {
                return Err(anyhow!("scripted failure"));
            }
            Ok(vec![Detection::new(self.kind, self.region, 0.9)])
        }
    }

    fn scripted(kind: DetectionKind, fail_on: Option<usize>) -> (ScriptedBackend, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let backend = ScriptedBackend {
            kind,
            region: Region::from_xywh(10, 10, 20, 10),
            calls: calls.clone(),
            fail_on,
        };
        (backend, calls)
    }

    fn striped_frame(sequence: u64) -> Frame {
        let image = RgbImage::from_fn(64, 48, |x, _| {
            if x % 2 == 0 {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        });
        Frame::new(image, sequence)
    }

    fn signs_only() -> DetectionSettings {
        DetectionSettings {
            street_signs: true,
            ..DetectionSettings::default()
        }
    }

    #[test]
    fn sign_detector_runs_every_fifteenth_frame_and_cache_persists() {
        let (backend, calls) = scripted(DetectionKind::StreetSigns, None);
        let mut registry = BackendRegistry::new();
        registry.register(backend);
        let mut processor = StreamSafeProcessor::new(registry);

        for seq in 1..=14 {
            let mut frame = striped_frame(seq);
            let report = processor.process_frame(&mut frame, &signs_only());
            assert_eq!(report.redacted_regions, 0);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let mut frame = striped_frame(15);
        let report = processor.process_frame(&mut frame, &signs_only());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.detection_count(), 1);
        assert_eq!(report.redacted_regions, 1);

        // Cached region is still blurred on the next frame without a new detection.
        let mut frame = striped_frame(16);
        let report = processor.process_frame(&mut frame, &signs_only());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.detection_count(), 0);
        assert_eq!(report.redacted_regions, 1);
        let inside = frame.image().get_pixel(15, 15).0[0];
        assert!(inside > 0 && inside < 255);
        assert_eq!(frame.image().get_pixel(50, 40).0[0], 255);
    }

    #[test]
    fn counters_only_advance_while_enabled() {
        let (backend, calls) = scripted(DetectionKind::StreetSigns, None);
        let mut registry = BackendRegistry::new();
        registry.register(backend);
        let mut processor = StreamSafeProcessor::new(registry);

        let off = DetectionSettings::default();
        for seq in 1..=20 {
            processor.process_frame(&mut striped_frame(seq), &off);
        }
        for seq in 21..=34 {
            processor.process_frame(&mut striped_frame(seq), &signs_only());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        processor.process_frame(&mut striped_frame(35), &signs_only());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn detector_error_clears_cache_but_keeps_frame() {
        let (backend, calls) = scripted(DetectionKind::LicensePlates, Some(2));
        let mut registry = BackendRegistry::new();
        registry.register(backend);
        let mut processor = StreamSafeProcessor::new(registry);
        let plates = DetectionSettings {
            license_plates: true,
            ..DetectionSettings::default()
        };

        let first = processor.process_frame(&mut striped_frame(1), &plates);
        assert_eq!(first.redacted_regions, 1);

        let mut frame = striped_frame(2);
        let before = frame.pixels().to_vec();
        let second = processor.process_frame(&mut frame, &plates);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(second.redacted_regions, 0);
        assert_eq!(frame.pixels(), &before[..]);
    }

    #[test]
    fn still_images_ignore_cadence() {
        let (backend, calls) = scripted(DetectionKind::BlockNumbers, None);
        let mut registry = BackendRegistry::new();
        registry.register(backend);
        let mut processor = StreamSafeProcessor::new(registry);
        let blocks = DetectionSettings {
            block_numbers: true,
            ..DetectionSettings::default()
        };

        let report = processor.process_still(&mut striped_frame(1), &blocks);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.redacted_regions, 1);

        // Still processing does not advance the stream counter.
        for seq in 1..=29 {
            processor.process_frame(&mut striped_frame(seq), &blocks);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        processor.process_frame(&mut striped_frame(30), &blocks);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn reset_restarts_cadence() {
        let (backend, calls) = scripted(DetectionKind::StreetSigns, None);
        let mut registry = BackendRegistry::new();
        registry.register(backend);
        let mut processor = StreamSafeProcessor::new(registry);
        for seq in 1..=10 {
            processor.process_frame(&mut striped_frame(seq), &signs_only());
        }
        processor.reset();
        for seq in 1..=10 {
            processor.process_frame(&mut striped_frame(seq), &signs_only());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn default_config_uses_fallback_plates() -> Result<()> {
        let processor = StreamSafeProcessor::from_config(&DetectorSettings::default())?;
        let names = processor.registry().list()?;
        assert!(names.contains(&(DetectionKind::LicensePlates, "plate-fallback")));
        assert!(names.contains(&(DetectionKind::StreetSigns, "hsv-signs")));
        assert_eq!(
            processor.policy(DetectionKind::StreetSigns).map(|p| p.cadence),
            Some(15)
        );

        let mut processor = processor;
        let mut frame = Frame::new(RgbImage::from_pixel(640, 480, Rgb([200, 200, 200])), 1);
        let plates = DetectionSettings {
            license_plates: true,
            ..DetectionSettings::default()
        };
        let report = processor.process_frame(&mut frame, &plates);
        assert_eq!(report.redacted_regions, 2);
        Ok(())
    }
}
