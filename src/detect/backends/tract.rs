#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::detect::backend::FaceDetector;
use crate::detect::result::{sort_by_confidence, FaceDetection, RelativeBox};

/// UltraFace "slim/RFB-320" input geometry.
const INPUT_WIDTH: u32 = 320;
const INPUT_HEIGHT: u32 = 240;
const NMS_IOU: f32 = 0.3;

/// Tract-based backend for ONNX face detection.
///
/// Expects an UltraFace-style model: one `1x3xHxW` input normalised to
/// `(p - 127) / 128`, and two outputs, `scores [1, N, 2]` (background, face)
/// and `boxes [1, N, 4]` (relative x1, y1, x2, y2).
pub struct TractFaceDetector {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    confidence_threshold: f32,
}

impl TractFaceDetector {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, INPUT_HEIGHT as usize, INPUT_WIDTH as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            confidence_threshold: 0.5,
        })
    }

    /// Override the default confidence threshold.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    fn build_input(&self, image: &RgbImage) -> Tensor {
        let resized = imageops::resize(image, INPUT_WIDTH, INPUT_HEIGHT, FilterType::Triangle);
        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, INPUT_HEIGHT as usize, INPUT_WIDTH as usize),
            |(_, channel, y, x)| {
                let pixel = resized.get_pixel(x as u32, y as u32);
                (pixel[channel] as f32 - 127.0) / 128.0
            },
        );
        input.into_tensor()
    }

    fn extract_faces(&self, outputs: TVec<TValue>) -> Result<Vec<FaceDetection>> {
        let scores = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no score output"))?
            .to_array_view::<f32>()
            .context("score tensor was not f32")?;
        let boxes = outputs
            .get(1)
            .ok_or_else(|| anyhow!("model produced no box output"))?
            .to_array_view::<f32>()
            .context("box tensor was not f32")?;

        let (score_rows, box_rows) = (scores.len() / 2, boxes.len() / 4);
        let scores = scores
            .into_shape((score_rows, 2))
            .context("unexpected score tensor shape")?;
        let boxes = boxes
            .into_shape((box_rows, 4))
            .context("unexpected box tensor shape")?;

        let mut candidates = Vec::new();
        for (score, bbox) in scores.outer_iter().zip(boxes.outer_iter()) {
            let confidence = score[1];
            if confidence < self.confidence_threshold {
                continue;
            }
            let (x1, y1) = (bbox[0].clamp(0.0, 1.0), bbox[1].clamp(0.0, 1.0));
            let (x2, y2) = (bbox[2].clamp(0.0, 1.0), bbox[3].clamp(0.0, 1.0));
            candidates.push(FaceDetection {
                bbox: RelativeBox {
                    x: x1,
                    y: y1,
                    w: x2 - x1,
                    h: y2 - y1,
                },
                confidence,
            });
        }
        Ok(suppress_overlaps(candidates))
    }
}

/// Greedy non-maximum suppression.
fn suppress_overlaps(mut candidates: Vec<FaceDetection>) -> Vec<FaceDetection> {
    sort_by_confidence(&mut candidates);
    let mut kept: Vec<FaceDetection> = Vec::new();
    for candidate in candidates {
        if kept.iter().all(|k| k.bbox.iou(&candidate.bbox) < NMS_IOU) {
            kept.push(candidate);
        }
    }
    kept
}

impl FaceDetector for TractFaceDetector {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceDetection>> {
        let input = self.build_input(image);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.extract_faces(outputs)
    }

    fn warm_up(&mut self) -> Result<()> {
        self.detect(&RgbImage::new(INPUT_WIDTH, INPUT_HEIGHT)).map(|_| ())
    }
}
