//! Frame-differencing motion detector.
//!
//! Each frame is reduced to a small blurred grayscale analysis image and
//! compared against the previous one. The motion ratio is the share of analysis
//! pixels whose intensity changed by more than the sensitivity threshold.

use anyhow::{anyhow, Result};
use image::imageops::{self, FilterType};
use image::GrayImage;

use crate::frame::Frame;

/// Gaussian sigma equivalent to a 5x5 kernel.
pub const DEFAULT_BLUR_SIGMA: f32 = 1.1;

#[derive(Clone, Debug, PartialEq)]
pub struct MotionSettings {
    pub analysis_width: u32,
    pub analysis_height: u32,
    /// Per-pixel intensity delta that counts as changed (exclusive).
    pub sensitivity: u8,
    /// Changed-pixel ratio above which a tick counts as motion (exclusive).
    pub ratio_threshold: f32,
    pub blur_sigma: f32,
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self {
            analysis_width: 320,
            analysis_height: 240,
            sensitivity: 25,
            ratio_threshold: 0.02,
            blur_sigma: DEFAULT_BLUR_SIGMA,
        }
    }
}

/// Result of comparing two consecutive analysis frames.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MotionSample {
    pub ratio: f32,
    pub motion_detected: bool,
}

pub struct MotionAnalyzer {
    settings: MotionSettings,
    previous: Option<GrayImage>,
}

impl MotionAnalyzer {
    pub fn new(settings: MotionSettings) -> Result<Self> {
        if settings.analysis_width == 0 || settings.analysis_height == 0 {
            return Err(anyhow!("analysis resolution must be non-zero"));
        }
        Ok(Self {
            settings,
            previous: None,
        })
    }

    pub fn settings(&self) -> &MotionSettings {
        &self.settings
    }

    /// Score `frame` against the previous call's frame.
    ///
    /// Returns `None` for the first frame after construction.
    pub fn analyze(&mut self, frame: &Frame) -> Option<MotionSample> {
        let current = self.prepare(frame);
        let sample = self.previous.as_ref().map(|previous| {
            let ratio = changed_ratio(previous, &current, self.settings.sensitivity);
            MotionSample {
                ratio,
                motion_detected: ratio > self.settings.ratio_threshold,
            }
        });
        self.previous = Some(current);
        sample
    }

    fn prepare(&self, frame: &Frame) -> GrayImage {
        let resized = imageops::resize(
            frame.image(),
            self.settings.analysis_width,
            self.settings.analysis_height,
            FilterType::Triangle,
        );
        let gray = imageops::grayscale(&resized);
        if self.settings.blur_sigma > 0.0 {
            imageops::blur(&gray, self.settings.blur_sigma)
        } else {
            gray
        }
    }
}

/// Share of pixels whose absolute difference exceeds `sensitivity`.
fn changed_ratio(previous: &GrayImage, current: &GrayImage, sensitivity: u8) -> f32 {
    let total = current.as_raw().len();
    if total == 0 || previous.dimensions() != current.dimensions() {
        return 0.0;
    }
    let changed = previous
        .as_raw()
        .iter()
        .zip(current.as_raw())
        .filter(|(a, b)| a.abs_diff(**b) > sensitivity)
        .count();
    changed as f32 / total as f32
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
