use anyhow::Result;
use image::RgbImage;

use crate::detect::backend::FaceDetector;
use crate::detect::result::{sort_by_confidence, FaceDetection, RelativeBox};

/// Stub backend returning a fixed set of detections for every image.
pub struct StubFaceDetector {
    detections: Vec<FaceDetection>,
    min_confidence: f32,
}

impl StubFaceDetector {
    pub fn new(detections: Vec<FaceDetection>, min_confidence: f32) -> Self {
        Self {
            detections,
            min_confidence,
        }
    }

    /// One confident face in the middle of the frame.
    pub fn centered(min_confidence: f32) -> Self {
        Self::new(
            vec![FaceDetection {
                bbox: RelativeBox {
                    x: 0.4,
                    y: 0.3,
                    w: 0.2,
                    h: 0.25,
                },
                confidence: 0.9,
            }],
            min_confidence,
        )
    }
}

impl FaceDetector for StubFaceDetector {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, _image: &RgbImage) -> Result<Vec<FaceDetection>> {
        let mut detections: Vec<FaceDetection> = self
            .detections
            .iter()
            .copied()
            .filter(|d| d.confidence >= self.min_confidence)
            .collect();
        sort_by_confidence(&mut detections);
        Ok(detections)
    }
}
