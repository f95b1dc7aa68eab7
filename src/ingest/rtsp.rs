//! RTSP frame source.
//!
//! This module provides `RtspSource` for ingesting frames from IP cameras and
//! local streaming relays.
//!
//! The RTSP source is responsible for:
//! - Connecting to camera streams
//! - Decoding video frames to packed RGB
//! - Stamping frames with their capture time
//! - Reporting stalls as `ReadOutcome::NoFrame` instead of errors
//!
//! `stub://` locators select a synthetic scene generator that needs no network
//! or codec support.

use anyhow::{Context, Result};
use chrono::Local;
#[cfg(feature = "rtsp-gstreamer")]
use gstreamer::prelude::*;
use image::{Rgb, RgbImage};
use std::time::Duration;

use super::{FrameSource, ReadOutcome};
use crate::frame::Frame;

/// Configuration for an RTSP source.
#[derive(Clone, Debug)]
pub struct RtspConfig {
    /// Stream locator (e.g., "rtsp://127.0.0.1:8554/cam" or "stub://front_door").
    pub url: String,
    /// Pacing for synthetic sources (frames per second).
    pub target_fps: u32,
    /// Frame width for synthetic sources.
    pub width: u32,
    /// Frame height for synthetic sources.
    pub height: u32,
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            url: "stub://front_door".to_string(),
            target_fps: 25,
            width: 640,
            height: 480,
        }
    }
}

/// RTSP frame source.
///
/// Uses GStreamer for real decode, with a synthetic fallback for `stub://` URLs.
pub struct RtspSource {
    backend: RtspBackend,
}

enum RtspBackend {
    Synthetic(SyntheticRtspSource),
    #[cfg(feature = "rtsp-gstreamer")]
    Gstreamer(GstreamerRtspSource),
}

impl RtspSource {
    pub fn new(config: RtspConfig) -> Result<Self> {
        if config.url.starts_with("stub://") {
            Ok(Self {
                backend: RtspBackend::Synthetic(SyntheticRtspSource::new(config)),
            })
        } else {
            #[cfg(feature = "rtsp-gstreamer")]
            {
                Ok(Self {
                    backend: RtspBackend::Gstreamer(GstreamerRtspSource::new(config)?),
                })
            }
            #[cfg(not(feature = "rtsp-gstreamer"))]
            {
                anyhow::bail!(
                    "stream '{}' requires the rtsp-gstreamer feature",
                    config.url
                )
            }
        }
    }

    /// Number of frames decoded since creation.
    pub fn frames_captured(&self) -> u64 {
        match &self.backend {
            RtspBackend::Synthetic(source) => source.frame_count,
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.frame_count,
        }
    }
}

impl FrameSource for RtspSource {
    fn open(&mut self) -> Result<()> {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.open(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.open(),
        }
    }

    fn read(&mut self, budget: Duration) -> Result<ReadOutcome> {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.read(budget),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.read(budget),
        }
    }

    fn close(&mut self) {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.close(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.close(),
        }
    }

    fn describe(&self) -> String {
        match &self.backend {
            RtspBackend::Synthetic(source) => format!("{} (synthetic)", source.config.url),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.config.url.clone(),
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://)
// ----------------------------------------------------------------------------

/// Frames per synthetic scene cycle; an "intruder" block crosses the scene
/// during the second half of each cycle.
const SYNTHETIC_CYCLE_FRAMES: u64 = 200;

struct SyntheticRtspSource {
    config: RtspConfig,
    frame_count: u64,
    open: bool,
}

impl SyntheticRtspSource {
    fn new(config: RtspConfig) -> Self {
        Self {
            config,
            frame_count: 0,
            open: false,
        }
    }

    fn open(&mut self) -> Result<()> {
        self.open = true;
        log::info!("RtspSource: connected to {} (synthetic)", self.config.url);
        Ok(())
    }

    fn read(&mut self, budget: Duration) -> Result<ReadOutcome> {
        if !self.open {
            anyhow::bail!("synthetic source {} is not open", self.config.url);
        }
        let interval = if self.config.target_fps == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(1000 / self.config.target_fps as u64)
        };
        if interval > budget {
            std::thread::sleep(budget);
            return Ok(ReadOutcome::NoFrame);
        }
        std::thread::sleep(interval);

        self.frame_count += 1;
        let image = self.render_scene();
        Ok(ReadOutcome::Frame(Frame::new(image, Local::now())))
    }

    /// Static background with a bright block sweeping across it during the
    /// active half of each cycle.
    fn render_scene(&self) -> RgbImage {
        let (width, height) = (self.config.width.max(1), self.config.height.max(1));
        let mut image = RgbImage::from_pixel(width, height, Rgb([64, 64, 64]));

        let phase = self.frame_count % SYNTHETIC_CYCLE_FRAMES;
        let half = SYNTHETIC_CYCLE_FRAMES / 2;
        if phase >= half {
            let block_w = (width / 4).max(1);
            let block_h = (height / 2).max(1);
            let travel = width.saturating_sub(block_w) as u64;
            let x0 = ((phase - half) * travel / half) as u32;
            let y0 = height / 4;
            for y in y0..(y0 + block_h).min(height) {
                for x in x0..(x0 + block_w).min(width) {
                    image.put_pixel(x, y, Rgb([230, 210, 190]));
                }
            }
        }
        image
    }

    fn close(&mut self) {
        self.open = false;
    }
}

// ----------------------------------------------------------------------------
// Production RTSP source using GStreamer
// ----------------------------------------------------------------------------

#[cfg(feature = "rtsp-gstreamer")]
struct GstreamerRtspSource {
    config: RtspConfig,
    pipeline: Option<(gstreamer::Pipeline, gstreamer_app::AppSink)>,
    frame_count: u64,
}

#[cfg(feature = "rtsp-gstreamer")]
impl GstreamerRtspSource {
    fn new(config: RtspConfig) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;
        Ok(Self {
            config,
            pipeline: None,
            frame_count: 0,
        })
    }

    /// Build `rtspsrc ! decodebin ! videoconvert ! appsink` (or `uridecodebin`
    /// for non-RTSP locators) and set it to Playing.
    fn open(&mut self) -> Result<()> {
        self.close();

        let source = if self.config.url.starts_with("rtsp://") {
            format!(
                "rtspsrc location={} latency=0 protocols=tcp ! decodebin",
                self.config.url
            )
        } else {
            format!("uridecodebin uri={}", self.config.url)
        };
        let description = format!(
            "{} ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            source
        );
        let pipeline = gstreamer::parse::launch(&description)
            .context("build stream pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow::anyhow!("stream pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow::anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        pipeline
            .set_state(gstreamer::State::Playing)
            .context("set stream pipeline to Playing")?;
        log::info!("RtspSource: connected to {}", self.config.url);
        self.pipeline = Some((pipeline, appsink));
        Ok(())
    }

    fn read(&mut self, budget: Duration) -> Result<ReadOutcome> {
        let Some((pipeline, appsink)) = &self.pipeline else {
            anyhow::bail!("stream {} is not open", self.config.url);
        };
        check_bus(pipeline)?;

        let timeout = gstreamer::ClockTime::from_mseconds(budget.as_millis() as u64);
        let Some(sample) = appsink.try_pull_sample(timeout) else {
            return Ok(ReadOutcome::NoFrame);
        };

        let (pixels, width, height) = sample_to_pixels(&sample)?;
        self.frame_count += 1;
        let frame = Frame::from_rgb(pixels, width, height, Local::now())?;
        Ok(ReadOutcome::Frame(frame))
    }

    fn close(&mut self) {
        if let Some((pipeline, _)) = self.pipeline.take() {
            if let Err(e) = pipeline.set_state(gstreamer::State::Null) {
                log::warn!("RtspSource: failed to stop pipeline: {}", e);
            }
        }
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn check_bus(pipeline: &gstreamer::Pipeline) -> Result<()> {
    let Some(bus) = pipeline.bus() else {
        return Ok(());
    };
    while let Some(message) = bus.pop() {
        use gstreamer::MessageView;
        match message.view() {
            MessageView::Error(err) => {
                anyhow::bail!(
                    "gstreamer error from {:?}: {}",
                    err.src().map(|s| s.path_string()),
                    err.error()
                );
            }
            MessageView::Eos(..) => anyhow::bail!("gstreamer reached EOS"),
            _ => {}
        }
    }
    Ok(())
}

#[cfg(feature = "rtsp-gstreamer")]
fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("stream sample missing buffer")?;
    let caps = sample.caps().context("stream sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse stream caps as video info")?;

    let width = info.width();
    let height = info.height();
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map stream buffer")?;
    let pixels = pack_rgb_rows(map.as_slice(), width as usize * 3, stride, height as usize)?;
    Ok((pixels, width, height))
}

/// Copy `height` rows of `row_bytes` out of a buffer laid out with `stride`.
#[cfg_attr(not(feature = "rtsp-gstreamer"), allow(dead_code))]
fn pack_rgb_rows(data: &[u8], row_bytes: usize, stride: usize, height: usize) -> Result<Vec<u8>> {
    if stride == row_bytes {
        let packed = data
            .get(..row_bytes * height)
            .context("stream buffer shorter than its frame")?;
        return Ok(packed.to_vec());
    }

    let mut pixels = Vec::with_capacity(row_bytes * height);
    for row in 0..height {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("stream buffer row is out of bounds")?,
        );
    }
    Ok(pixels)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
