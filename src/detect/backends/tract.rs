#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, Detection};
use crate::frame::Frame;

const CXYWH_OFFSET: usize = 4;
const DEFAULT_IOU_THRESHOLD: f32 = 0.45;

/// Tract-based backend for YOLOv8-style ONNX detectors.
///
/// Expects one output of shape `[1, 4 + classes, anchors]` with `cx, cy, w, h`
/// in model input pixels followed by per-class scores. Frames are stretched to
/// the model input size; boxes are scaled back to frame pixels.
pub struct TractBackend {
    model: TypedRunnableModel<TypedModel>,
    width: u32,
    height: u32,
    class_names: Vec<String>,
    confidence_threshold: f32,
    iou_threshold: f32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        width: u32,
        height: u32,
        class_names: Vec<String>,
    ) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            width,
            height,
            class_names,
            confidence_threshold: 0.5,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
        })
    }

    /// Override the default confidence threshold.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    fn build_input(&self, frame: &Frame) -> Tensor {
        let resized =
            image::imageops::resize(frame.image(), self.width, self.height, FilterType::Triangle);
        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.height as usize, self.width as usize),
            |(_, channel, y, x)| resized.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0,
        );
        input.into_tensor()
    }

    fn label_for(&self, class_id: usize) -> String {
        self.class_names
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class{}", class_id))
    }

    fn decode(&self, outputs: &TVec<TValue>, frame: &Frame) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let preds = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?
            .into_dimensionality::<tract_ndarray::Ix3>()
            .context("model output was not [batch, channels, anchors]")?;
        let (_, channels, anchors) = preds.dim();
        if channels <= CXYWH_OFFSET {
            return Err(anyhow!("model output has {} channels, expected > 4", channels));
        }

        let sx = frame.width() as f32 / self.width as f32;
        let sy = frame.height() as f32 / self.height as f32;
        let mut candidates = Vec::new();
        for n in 0..anchors {
            let mut best = (0usize, f32::NEG_INFINITY);
            for c in CXYWH_OFFSET..channels {
                let score = preds[[0, c, n]];
                if score > best.1 {
                    best = (c - CXYWH_OFFSET, score);
                }
            }
            if best.1 < self.confidence_threshold {
                continue;
            }
            let (cx, cy, w, h) = (
                preds[[0, 0, n]],
                preds[[0, 1, n]],
                preds[[0, 2, n]],
                preds[[0, 3, n]],
            );
            let bbox = BoundingBox::new(
                ((cx - w / 2.0) * sx).max(0.0),
                ((cy - h / 2.0) * sy).max(0.0),
                ((cx + w / 2.0) * sx).min(frame.width() as f32),
                ((cy + h / 2.0) * sy).min(frame.height() as f32),
            );
            candidates.push(Detection::new(self.label_for(best.0), best.1, bbox));
        }

        non_max_suppression(&mut candidates, self.iou_threshold);
        Ok(candidates)
    }
}

/// Greedy NMS, highest confidence first.
fn non_max_suppression(xs: &mut Vec<Detection>, iou_threshold: f32) {
    xs.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept = 0;
    for index in 0..xs.len() {
        let overlaps = (0..kept).any(|prev| xs[prev].bbox.iou(&xs[index].bbox) > iou_threshold);
        if !overlaps {
            xs.swap(kept, index);
            kept += 1;
        }
    }
    xs.truncate(kept);
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let input = self.build_input(frame);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(&outputs, frame)
    }

    fn warm_up(&mut self) -> Result<()> {
        let blank = Frame::filled(0, self.width, self.height, [0, 0, 0]);
        self.detect(&blank).map(|_| ())
    }
}
