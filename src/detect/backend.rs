use anyhow::{anyhow, Result};
use image::RgbImage;
use serde::Deserialize;
use std::path::Path;

use super::backends::StubFaceDetector;
use crate::detect::result::FaceDetection;

/// Face detector backend trait.
///
/// Implementations return detections ordered by descending confidence and
/// drop anything below their configured minimum.
pub trait FaceDetector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a full-resolution RGB frame.
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<FaceDetection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Configured face detector backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaceBackendKind {
    /// Face sampling disabled.
    #[default]
    None,
    /// Fixed detections (bench runs).
    Stub,
    /// ONNX model through tract (feature: backend-tract).
    Tract,
}

/// Build the configured backend. `Ok(None)` means face sampling is disabled.
pub fn build_face_detector(
    kind: FaceBackendKind,
    model_path: Option<&Path>,
    min_confidence: f32,
) -> Result<Option<Box<dyn FaceDetector>>> {
    let mut detector: Box<dyn FaceDetector> = match kind {
        FaceBackendKind::None => return Ok(None),
        FaceBackendKind::Stub => Box::new(StubFaceDetector::centered(min_confidence)),
        FaceBackendKind::Tract => build_tract(model_path, min_confidence)?,
    };
    detector.warm_up()?;
    log::info!("face detector '{}' ready", detector.name());
    Ok(Some(detector))
}

#[cfg(feature = "backend-tract")]
fn build_tract(model_path: Option<&Path>, min_confidence: f32) -> Result<Box<dyn FaceDetector>> {
    let model_path = model_path.ok_or_else(|| anyhow!("tract face backend needs a model path"))?;
    Ok(Box::new(
        super::backends::TractFaceDetector::new(model_path)?.with_threshold(min_confidence),
    ))
}

#[cfg(not(feature = "backend-tract"))]
fn build_tract(_model_path: Option<&Path>, _min_confidence: f32) -> Result<Box<dyn FaceDetector>> {
    Err(anyhow!("face backend 'tract' requires the backend-tract feature"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_names_deserialize_lowercase() {
        let kind: FaceBackendKind = serde_json::from_str("\"stub\"").unwrap();
        assert_eq!(kind, FaceBackendKind::Stub);
        assert!(serde_json::from_str::<FaceBackendKind>("\"haar\"").is_err());
    }

    #[test]
    fn none_backend_disables_sampling() {
        assert!(build_face_detector(FaceBackendKind::None, None, 0.5)
            .unwrap()
            .is_none());
    }

    #[test]
    fn stub_backend_builds() {
        let detector = build_face_detector(FaceBackendKind::Stub, None, 0.5)
            .unwrap()
            .unwrap();
        assert_eq!(detector.name(), "stub");
    }

    #[cfg(not(feature = "backend-tract"))]
    #[test]
    fn tract_backend_requires_feature() {
        assert!(build_face_detector(FaceBackendKind::Tract, None, 0.5).is_err());
    }
}
