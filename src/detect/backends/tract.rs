#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use tract_onnx::prelude::*;

use crate::detect::backend::Detector;
use crate::detect::non_max_suppression;
use crate::frame::{BoundingBox, Detection, Frame};

const CXYWH_OFFSET: usize = 4;

/// YOLO-style ONNX detector on tract.
///
/// Expects a single output shaped `[1, 4 + classes, anchors]` with
/// centre-x, centre-y, width, height in model-input pixels followed by one
/// score per class. Frames are stretched to the model input size and boxes
/// scaled back.
pub struct TractDetector {
    model: TypedRunnableModel<TypedModel>,
    width: u32,
    height: u32,
    classes: Vec<String>,
    confidence_threshold: f32,
    iou_threshold: f32,
}

impl TractDetector {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        width: u32,
        height: u32,
        classes: Vec<String>,
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

        log::info!(
            "TractDetector: loaded {} ({}x{}, {} classes)",
            model_path.display(),
            width,
            height,
            classes.len()
        );
        Ok(Self {
            model,
            width,
            height,
            classes,
            confidence_threshold: 0.5,
            iou_threshold: 0.4,
        })
    }

    pub fn with_thresholds(mut self, confidence: f32, iou: f32) -> Self {
        self.confidence_threshold = confidence;
        self.iou_threshold = iou;
        self
    }

    fn build_input(&self, frame: &Frame) -> Result<Tensor> {
        let image = frame.to_image()?.to_rgb8();
        let resized = image::imageops::resize(&image, self.width, self.height, FilterType::Triangle);
        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.height as usize, self.width as usize),
            |(_, channel, y, x)| resized.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0,
        );
        Ok(input.into_tensor())
    }

    fn class_name(&self, id: usize) -> String {
        self.classes
            .get(id)
            .cloned()
            .unwrap_or_else(|| format!("class{}", id))
    }

    fn decode(&self, outputs: TVec<TValue>, frame: &Frame) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let preds = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = preds.shape().to_vec();
        if shape.len() != 3 || shape[1] <= CXYWH_OFFSET {
            return Err(anyhow!("unexpected model output shape {:?}", shape));
        }
        let (rows, anchors) = (shape[1], shape[2]);
        let scale_x = frame.width as f32 / self.width as f32;
        let scale_y = frame.height as f32 / self.height as f32;

        let mut found = Vec::new();
        for anchor in 0..anchors {
            let (class_id, confidence) = (CXYWH_OFFSET..rows)
                .map(|row| (row - CXYWH_OFFSET, preds[[0, row, anchor]]))
                .fold((0, f32::NEG_INFINITY), |best, x| if x.1 > best.1 { x } else { best });
            if confidence.is_nan() || confidence < self.confidence_threshold {
                continue;
            }
            let cx = preds[[0, 0, anchor]] * scale_x;
            let cy = preds[[0, 1, anchor]] * scale_y;
            let w = preds[[0, 2, anchor]] * scale_x;
            let h = preds[[0, 3, anchor]] * scale_y;
            let bbox = BoundingBox::clamped_from_xywh(
                cx - w / 2.0,
                cy - h / 2.0,
                w,
                h,
                frame.width,
                frame.height,
            );
            if bbox.area() == 0 {
                continue;
            }
            found.push(Detection::new(self.class_name(class_id), confidence, bbox));
        }

        non_max_suppression(&mut found, self.iou_threshold);
        Ok(found)
    }
}

impl Detector for TractDetector {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let input = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs, frame)
    }

    fn warm_up(&mut self) -> Result<()> {
        let blank = Frame::filled(self.width, self.height, [0, 0, 0]);
        self.detect(&blank).map(|_| ())
    }
}
