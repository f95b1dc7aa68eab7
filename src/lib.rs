//! motion-sentry
//!
//! Motion-triggered recording pipeline for unattended edge cameras.
//!
//! # Architecture
//!
//! Two long-lived workers share a bounded hand-off buffer:
//!
//! 1. **Capture** pulls frames from a `FrameSource` as fast as it can and offers
//!    them to the `FrameRelay` (drop-oldest, never blocks).
//! 2. **Motion** drains the relay to its freshest frame, scores motion against the
//!    previous sample, drives the `RecordingController` state machine and, at a
//!    lower cadence, feeds the `FaceSampler`.
//!
//! The recording subprocess and the streaming-relay service are owned by the
//! `supervisor` module. Uploads are fire-and-forget through `transport`.
//!
//! # Module Structure
//!
//! - `frame`: Frame, FrameRelay, PreviewSlot
//! - `ingest`: Frame sources (synthetic, GStreamer)
//! - `capture`: Capture loop
//! - `motion`: Frame differencing
//! - `recording`: Recording state machine
//! - `faces` / `detect`: Face sampling and detector backends
//! - `supervisor`: Recorder subprocess and relay service
//! - `transport`: Upload collaborators
//! - `pipeline`: Worker threads, cancellation, shutdown
//! - Core types: Clock, Timestamp, CancellationToken

use chrono::{DateTime, Local};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

pub mod capture;
pub mod config;
pub mod detect;
pub mod faces;
pub mod frame;
pub mod ingest;
pub mod logging;
pub mod motion;
pub mod pipeline;
pub mod recording;
pub mod supervisor;
pub mod transport;

pub use capture::{CaptureLoop, CaptureSettings, CaptureStep};
pub use config::SentryConfig;
pub use detect::{FaceDetection, FaceDetector, RelativeBox, StubFaceDetector};
pub use faces::{FaceCapture, FaceSampler, FaceSamplerSettings, SampleOutcome};
pub use frame::{Frame, FrameRelay, OfferOutcome, PreviewSlot, MIN_FRAME_DIMENSION};
pub use ingest::{FrameSource, ReadOutcome, RtspConfig, RtspSource};
pub use motion::{MotionAnalyzer, MotionSample, MotionSettings};
pub use pipeline::{
    MotionWorker, MotionWorkerSettings, Pipeline, PipelineSettings, PipelineStats, StatsSnapshot,
    TickReport,
};
pub use recording::{
    decide, Decision, MotionWindow, RecorderHandle, RecordingAction, RecordingController,
    RecordingEpisode, RecordingState,
};
pub use supervisor::{
    ensure_service_running, FfmpegRecorder, ProcessControl, Recorder, RecorderSettings,
    ServiceSpec, ServiceStatus, StartOutcome, StopOutcome, SystemProcesses,
};
pub use transport::{
    BackgroundUploader, EpisodeMetadata, HttpUploader, HttpUploaderConfig, LogOnlyUploader,
    Uploader,
};

// -------------------- Time --------------------

/// Wall-clock timestamp used for episodes, debounce and cool-downs.
pub type Timestamp = DateTime<Local>;

/// Source of "now" for the motion thread.
///
/// The pipeline reads time only through this trait so debounce windows and
/// face cool-downs can be driven by a simulated clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Local::now()
    }
}

/// Manually advanced clock for tests and replays.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Timestamp>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Local::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Time elapsed from `earlier` to `now`, saturating at zero when the clock stepped back.
pub fn elapsed_between(earlier: Timestamp, now: Timestamp) -> Duration {
    (now - earlier).to_std().unwrap_or(Duration::ZERO)
}

// -------------------- Cancellation --------------------

/// Cooperative cancellation shared by the worker threads.
///
/// Workers check `is_cancelled` at loop top and use `wait_timeout` for every
/// sleep, so a cancel wakes them immediately instead of after the full delay.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, signal) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        signal.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for up to `timeout`. Returns `true` if cancellation was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, signal) = &*self.inner;
        let guard = flag.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = signal
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::default();
        let start = clock.now();
        clock.advance(Duration::from_secs(5));
        assert_eq!(elapsed_between(start, clock.now()), Duration::from_secs(5));
    }

    #[test]
    fn elapsed_between_saturates_when_clock_steps_back() {
        let clock = ManualClock::default();
        let later = clock.now();
        let earlier = later - chrono::Duration::seconds(3);
        assert_eq!(elapsed_between(later, earlier), Duration::ZERO);
    }

    #[test]
    fn cancellation_wakes_waiters_early() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let started = Instant::now();
        let handle = std::thread::spawn(move || waiter.wait_timeout(Duration::from_secs(10)));
        std::thread::sleep(Duration::from_millis(50));
        token.cancel();
        assert!(handle.join().unwrap());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn wait_timeout_returns_false_without_cancel() {
        let token = CancellationToken::new();
        assert!(!token.wait_timeout(Duration::from_millis(10)));
        assert!(!token.is_cancelled());
    }
}
