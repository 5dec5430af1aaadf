//! YOLO output decoding and non-maximum suppression.
//!
//! Two output layouts are supported:
//! - v5: `[1, N, 5 + C]` rows of `cx, cy, w, h, objectness, class scores...`
//! - v8: `[1, 4 + C, N]` channels-first `cx, cy, w, h, class scores...`
//!
//! Frames are letterboxed into the square model input: scaled to fit with the
//! aspect ratio kept and centered on gray padding. Box coordinates come back in
//! model-input pixels and are mapped through the same letterbox to the frame.

use anyhow::{anyhow, Result};

use crate::region::Region;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum YoloLayout {
    V5,
    V8,
}

#[derive(Clone, Copy, Debug)]
pub struct YoloParams {
    /// Square model input size in pixels.
    pub input_size: u32,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
}

impl Default for YoloParams {
    fn default() -> Self {
        Self {
            input_size: 416,
            confidence_threshold: 0.65,
            iou_threshold: 0.7,
            max_detections: 3,
        }
    }
}

/// Gray used for letterbox padding.
pub const LETTERBOX_FILL: u8 = 114;

/// Aspect-preserving fit of a frame into the square model input.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    /// Size of the scaled frame inside the input square.
    pub width: u32,
    pub height: u32,
    /// Offset of the scaled frame from the input's top-left corner.
    pub pad_x: u32,
    pub pad_y: u32,
}

impl Letterbox {
    pub fn new(frame_w: u32, frame_h: u32, input_size: u32) -> Self {
        let side = input_size as f32;
        let scale = (side / frame_w.max(1) as f32).min(side / frame_h.max(1) as f32);
        let width = ((frame_w as f32 * scale).round() as u32).clamp(1, input_size.max(1));
        let height = ((frame_h as f32 * scale).round() as u32).clamp(1, input_size.max(1));
        Self {
            scale,
            width,
            height,
            pad_x: (input_size.saturating_sub(width)) / 2,
            pad_y: (input_size.saturating_sub(height)) / 2,
        }
    }

    /// Map a model-input point back to frame pixels.
    pub fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_x as f32) / self.scale,
            (y - self.pad_y as f32) / self.scale,
        )
    }
}

/// Candidate box before suppression, in frame pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScoredBox {
    pub region: Region,
    pub score: f32,
}

/// Pick the layout from an output shape `[1, a, b]`.
///
/// The anchor axis is always the larger one.
pub fn infer_layout(shape: &[usize]) -> Result<YoloLayout> {
    let [batch, a, b] = shape else {
        return Err(anyhow!("expected a rank-3 YOLO output, got {:?}", shape));
    };
    if *batch != 1 {
        return Err(anyhow!("expected batch size 1, got {}", batch));
    }
    if a > b {
        if *b < 6 {
            return Err(anyhow!("v5 output needs at least 6 columns, got {}", b));
        }
        Ok(YoloLayout::V5)
    } else {
        if *a < 5 {
            return Err(anyhow!("v8 output needs at least 5 channels, got {}", a));
        }
        Ok(YoloLayout::V8)
    }
}

/// Decode raw output values into class-agnostic boxes for a `frame_w` x `frame_h` frame.
pub fn decode(
    values: &[f32],
    shape: &[usize],
    params: &YoloParams,
    frame_w: u32,
    frame_h: u32,
) -> Result<Vec<ScoredBox>> {
    let layout = infer_layout(shape)?;
    let (rows, cols) = (shape[1], shape[2]);
    if values.len() != rows * cols {
        return Err(anyhow!(
            "output has {} values, shape {:?} needs {}",
            values.len(),
            shape,
            rows * cols
        ));
    }

    let letterbox = Letterbox::new(frame_w, frame_h, params.input_size);
    let mut boxes = Vec::new();

    let anchors = match layout {
        YoloLayout::V5 => rows,
        YoloLayout::V8 => cols,
    };
    let at = |anchor: usize, field: usize| match layout {
        YoloLayout::V5 => values[anchor * cols + field],
        YoloLayout::V8 => values[field * cols + anchor],
    };

    for anchor in 0..anchors {
        let score = match layout {
            YoloLayout::V5 => {
                let objectness = at(anchor, 4);
                let class_score = (5..cols).map(|f| at(anchor, f)).fold(0.0f32, f32::max);
                objectness * class_score
            }
            YoloLayout::V8 => (4..rows).map(|f| at(anchor, f)).fold(0.0f32, f32::max),
        };
        if score.is_nan() || score <= params.confidence_threshold {
            continue;
        }

        let (cx, cy, w, h) = (at(anchor, 0), at(anchor, 1), at(anchor, 2), at(anchor, 3));
        let (left, top) = letterbox.to_frame(cx - 0.5 * w, cy - 0.5 * h);
        let (right, bottom) = letterbox.to_frame(cx + 0.5 * w, cy + 0.5 * h);
        let (left, top) = (left.max(0.0), top.max(0.0));
        let (right, bottom) = (right.min(frame_w as f32), bottom.min(frame_h as f32));
        if right <= left || bottom <= top {
            continue;
        }
        let region = Region::new(left as u32, top as u32, right as u32, bottom as u32);
        if region.is_empty() {
            continue;
        }
        boxes.push(ScoredBox { region, score });
    }

    Ok(non_max_suppression(
        boxes,
        params.iou_threshold,
        params.max_detections,
    ))
}

/// Greedy class-agnostic NMS, highest score first.
pub fn non_max_suppression(
    mut boxes: Vec<ScoredBox>,
    iou_threshold: f32,
    max_detections: usize,
) -> Vec<ScoredBox> {
    boxes.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<ScoredBox> = Vec::new();
    for candidate in boxes {
        if kept.len() >= max_detections {
            break;
        }
        if kept
            .iter()
            .all(|k| k.region.iou(&candidate.region) <= iou_threshold)
        {
            kept.push(candidate);
        }
    }
    kept
}
