#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;
use crate::detect::yolo::{self, Letterbox, YoloParams, LETTERBOX_FILL};
use crate::frame::Frame;
use crate::settings::DetectionKind;

/// License plate detector running a YOLO ONNX export through tract.
///
/// The model is loaded from a local file. Frames are letterboxed into the
/// square model input and boxes are mapped back to frame pixels.
pub struct YoloPlateBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    params: YoloParams,
}

impl YoloPlateBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, params: YoloParams) -> Result<Self> {
        let model_path = model_path.as_ref();
        let side = params.input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        log::info!(
            "loaded plate model {} (input {}px, conf {:.2})",
            model_path.display(),
            params.input_size,
            params.confidence_threshold
        );
        Ok(Self { model, params })
    }

    fn build_input(&self, frame: &Frame) -> Tensor {
        let side = self.params.input_size;
        let lb = Letterbox::new(frame.width(), frame.height(), side);
        let resized = imageops::resize(frame.image(), lb.width, lb.height, FilterType::Triangle);
        let mut canvas = image::RgbImage::from_pixel(side, side, image::Rgb([LETTERBOX_FILL; 3]));
        imageops::replace(&mut canvas, &resized, lb.pad_x as i64, lb.pad_y as i64);

        let side = side as usize;
        let pixels = canvas.as_raw();
        tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, channel, y, x)| {
            pixels[(y * side + x) * 3 + channel] as f32 / 255.0
        })
        .into_tensor()
    }
}

impl DetectorBackend for YoloPlateBackend {
    fn name(&self) -> &'static str {
        "yolo-tract"
    }

    fn kind(&self) -> DetectionKind {
        DetectionKind::LicensePlates
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        if frame.width() == 0 || frame.height() == 0 {
            return Ok(Vec::new());
        }
        let input = self.build_input(frame);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape().to_vec();
        let values: Vec<f32> = view.iter().copied().collect();

        let boxes = yolo::decode(&values, &shape, &self.params, frame.width(), frame.height())?;
        Ok(boxes
            .into_iter()
            .map(|b| Detection::new(DetectionKind::LicensePlates, b.region, b.score))
            .collect())
    }

    fn warm_up(&mut self) -> Result<()> {
        let side = self.params.input_size;
        let blank = Frame::new(image::RgbImage::new(side, side), 0);
        self.detect(&blank).map(|_| ())
    }
}
