//! Face sampling.
//!
//! While motion is active the motion thread hands preview frames to the
//! `FaceSampler`. The sampler rate-limits detector runs, keeps the single most
//! confident face, widens its box, crops, JPEG-encodes and forwards the crop
//! to the uploader. Nothing is written to disk.

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{imageops, RgbImage};
use std::sync::Arc;
use std::time::Duration;

use crate::detect::{FaceDetection, FaceDetector, RelativeBox};
use crate::frame::Frame;
use crate::transport::Uploader;
use crate::{elapsed_between, Timestamp};

pub const DEFAULT_FACE_COOLDOWN: Duration = Duration::from_secs(3);
pub const DEFAULT_MARGIN_SCALE: f32 = 2.0;
pub const DEFAULT_JPEG_QUALITY: u8 = 85;

#[derive(Clone, Debug, PartialEq)]
pub struct FaceSamplerSettings {
    /// Minimum spacing between detector runs.
    pub cooldown: Duration,
    /// Crop size relative to the detected box, centered on it.
    pub margin_scale: f32,
    pub jpeg_quality: u8,
}

impl Default for FaceSamplerSettings {
    fn default() -> Self {
        Self {
            cooldown: DEFAULT_FACE_COOLDOWN,
            margin_scale: DEFAULT_MARGIN_SCALE,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

/// An encoded face crop ready for upload.
#[derive(Clone, Debug)]
pub struct FaceCapture {
    pub jpeg: Vec<u8>,
    pub captured_at: Timestamp,
    pub confidence: f32,
}

/// Result of one `FaceSampler::sample` call.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SampleOutcome {
    /// The detector ran less than a cool-down ago.
    CoolingDown,
    NoFace,
    /// A face was found but its crop was empty after clipping.
    EmptyCrop,
    Captured { confidence: f32 },
}

/// Pixel rectangle inside a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

pub struct FaceSampler {
    detector: Box<dyn FaceDetector>,
    uploader: Arc<dyn Uploader>,
    settings: FaceSamplerSettings,
    last_invocation: Option<Timestamp>,
}

impl FaceSampler {
    pub fn new(
        detector: Box<dyn FaceDetector>,
        uploader: Arc<dyn Uploader>,
        settings: FaceSamplerSettings,
    ) -> Self {
        Self {
            detector,
            uploader,
            settings,
            last_invocation: None,
        }
    }

    pub fn detector_name(&self) -> &'static str {
        self.detector.name()
    }

    pub fn sample(&mut self, frame: &Frame, now: Timestamp) -> SampleOutcome {
        if let Some(last) = self.last_invocation {
            if elapsed_between(last, now) < self.settings.cooldown {
                return SampleOutcome::CoolingDown;
            }
        }
        self.last_invocation = Some(now);

        let detections = match self.detector.detect(frame.image()) {
            Ok(detections) => detections,
            Err(e) => {
                log::warn!("face detector '{}' failed: {:#}", self.detector.name(), e);
                Vec::new()
            }
        };
        let Some(best) = most_confident(&detections) else {
            return SampleOutcome::NoFace;
        };

        let Some(rect) = expand_box(
            &best.bbox,
            self.settings.margin_scale,
            frame.width(),
            frame.height(),
        ) else {
            log::debug!("face crop empty after clipping: {:?}", best.bbox);
            return SampleOutcome::EmptyCrop;
        };

        let jpeg = match encode_crop(frame.image(), rect, self.settings.jpeg_quality) {
            Ok(jpeg) => jpeg,
            Err(e) => {
                log::error!("face crop encoding failed: {:#}", e);
                return SampleOutcome::EmptyCrop;
            }
        };

        let capture = FaceCapture {
            jpeg,
            captured_at: now,
            confidence: best.confidence,
        };
        if let Err(e) = self.uploader.upload_face_crop(capture) {
            log::error!("face crop upload failed: {:#}", e);
        }
        SampleOutcome::Captured {
            confidence: best.confidence,
        }
    }
}

fn most_confident(detections: &[FaceDetection]) -> Option<FaceDetection> {
    detections
        .iter()
        .copied()
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
}

/// Scale `bbox` by `margin_scale` around its center, convert to pixels and
/// clip to the frame. Returns `None` when nothing is left.
pub fn expand_box(
    bbox: &RelativeBox,
    margin_scale: f32,
    width: u32,
    height: u32,
) -> Option<CropRect> {
    let scale = margin_scale.max(0.0);
    let (frame_w, frame_h) = (width as f32, height as f32);
    let center_x = (bbox.x + bbox.w / 2.0) * frame_w;
    let center_y = (bbox.y + bbox.h / 2.0) * frame_h;
    let half_w = bbox.w.max(0.0) * frame_w * scale / 2.0;
    let half_h = bbox.h.max(0.0) * frame_h * scale / 2.0;

    let x0 = (center_x - half_w).round().clamp(0.0, frame_w) as u32;
    let y0 = (center_y - half_h).round().clamp(0.0, frame_h) as u32;
    let x1 = (center_x + half_w).round().clamp(0.0, frame_w) as u32;
    let y1 = (center_y + half_h).round().clamp(0.0, frame_h) as u32;

    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some(CropRect {
        x: x0,
        y: y0,
        width: x1 - x0,
        height: y1 - y0,
    })
}

fn encode_crop(image: &RgbImage, rect: CropRect, quality: u8) -> Result<Vec<u8>> {
    let crop = imageops::crop_imm(image, rect.x, rect.y, rect.width, rect.height).to_image();
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, quality)
        .encode_image(&crop)
        .context("encode face crop as jpeg")?;
    Ok(jpeg)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::StubFaceDetector;
    use crate::transport::EpisodeMetadata;
    use crate::{Clock, ManualClock};
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct CollectingUploader {
        faces: Mutex<Vec<FaceCapture>>,
    }

    impl Uploader for CollectingUploader {
        fn upload_episode_metadata(&self, _metadata: &EpisodeMetadata) -> Result<()> {
            Ok(())
        }

        fn upload_face_crop(&self, capture: FaceCapture) -> Result<()> {
            self.faces.lock().unwrap().push(capture);
            Ok(())
        }
    }

    struct CountingDetector {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl FaceDetector for CountingDetector {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn detect(&mut self, _image: &RgbImage) -> Result<Vec<FaceDetection>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(anyhow!("model exploded"));
            }
            Ok(Vec::new())
        }
    }

    fn frame(clock: &ManualClock) -> Frame {
        Frame::new(RgbImage::from_pixel(200, 160, image::Rgb([90, 90, 90])), clock.now())
    }

    fn bbox(x: f32, y: f32, w: f32, h: f32) -> RelativeBox {
        RelativeBox { x, y, w, h }
    }

    #[test]
    fn expand_box_doubles_around_center() {
        let rect = expand_box(&bbox(0.4, 0.4, 0.2, 0.2), 2.0, 100, 100).unwrap();
        assert_eq!(
            rect,
            CropRect {
                x: 30,
                y: 30,
                width: 40,
                height: 40
            }
        );
    }

    #[test]
    fn expand_box_clips_to_frame() {
        let rect = expand_box(&bbox(0.0, 0.9, 0.2, 0.2), 2.0, 100, 100).unwrap();
        assert_eq!(rect.x, 0);
        assert_eq!(rect.y + rect.height, 100);
        assert!(rect.width <= 40);
    }

    #[test]
    fn expand_box_rejects_empty_crops() {
        assert!(expand_box(&bbox(1.5, 1.5, 0.1, 0.1), 2.0, 100, 100).is_none());
        assert!(expand_box(&bbox(0.5, 0.5, 0.0, 0.2), 2.0, 100, 100).is_none());
    }

    #[test]
    fn captured_face_is_uploaded_as_jpeg() {
        let clock = ManualClock::default();
        let uploader = Arc::new(CollectingUploader::default());
        let mut sampler = FaceSampler::new(
            Box::new(StubFaceDetector::centered(0.5)),
            uploader.clone(),
            FaceSamplerSettings::default(),
        );

        let outcome = sampler.sample(&frame(&clock), clock.now());
        assert_eq!(outcome, SampleOutcome::Captured { confidence: 0.9 });

        let faces = uploader.faces.lock().unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(&faces[0].jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(faces[0].captured_at, clock.now());
    }

    #[test]
    fn detector_runs_at_most_once_per_cooldown() {
        let clock = ManualClock::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut sampler = FaceSampler::new(
            Box::new(CountingDetector {
                calls: calls.clone(),
                fail: false,
            }),
            Arc::new(CollectingUploader::default()),
            FaceSamplerSettings::default(),
        );

        for _ in 0..50 {
            sampler.sample(&frame(&clock), clock.now());
            clock.advance(Duration::from_millis(100));
        }
        // 5 simulated seconds with a 3 s cool-down.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn detector_error_counts_as_no_face() {
        let clock = ManualClock::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let uploader = Arc::new(CollectingUploader::default());
        let mut sampler = FaceSampler::new(
            Box::new(CountingDetector {
                calls: calls.clone(),
                fail: true,
            }),
            uploader.clone(),
            FaceSamplerSettings::default(),
        );

        assert_eq!(sampler.sample(&frame(&clock), clock.now()), SampleOutcome::NoFace);
        assert_eq!(
            sampler.sample(&frame(&clock), clock.now()),
            SampleOutcome::CoolingDown
        );
        assert!(uploader.faces.lock().unwrap().is_empty());
    }

    #[test]
    fn picks_most_confident_detection() {
        let best = most_confident(&[
            FaceDetection {
                bbox: bbox(0.0, 0.0, 0.1, 0.1),
                confidence: 0.6,
            },
            FaceDetection {
                bbox: bbox(0.5, 0.5, 0.1, 0.1),
                confidence: 0.8,
            },
        ])
        .unwrap();
        assert_eq!(best.confidence, 0.8);
    }
}
