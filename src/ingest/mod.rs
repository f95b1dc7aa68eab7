//! Frame ingestion sources.
//!
//! This module provides the sources that feed the capture loop:
//! - Synthetic `stub://` streams (always available; bench runs and tests)
//! - RTSP/URI streams decoded by GStreamer (feature: rtsp-gstreamer)
//!
//! Every source implements `FrameSource`. A read is bounded by a per-attempt
//! budget and distinguishes "nothing decoded yet" (`ReadOutcome::NoFrame`) from
//! hard errors. Both are transient from the capture loop's point of view.

use anyhow::Result;
use std::time::Duration;

use crate::frame::Frame;

pub mod rtsp;

pub use rtsp::{RtspConfig, RtspSource};

/// Outcome of a single bounded read.
#[derive(Debug)]
pub enum ReadOutcome {
    Frame(Frame),
    /// No frame became available within the read budget.
    NoFrame,
}

/// Live video stream handle.
pub trait FrameSource: Send {
    /// Open (or re-open) the underlying stream.
    fn open(&mut self) -> Result<()>;

    /// Decode the next frame, waiting at most `budget`.
    fn read(&mut self, budget: Duration) -> Result<ReadOutcome>;

    /// Release the stream. Safe to call on a closed source.
    fn close(&mut self);

    /// Human-readable locator for logs.
    fn describe(&self) -> String;
}
