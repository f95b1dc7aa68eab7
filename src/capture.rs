//! Capture loop.
//!
//! Pulls frames from a `FrameSource` as fast as the source delivers them and
//! offers each one to the `FrameRelay`. Read failures are transient: the loop
//! backs off briefly and tries again, and after a long run of failures it
//! re-opens the source. The loop ends only when its cancellation token fires.

use std::sync::Arc;
use std::time::Duration;

use crate::frame::{FrameRelay, OfferOutcome, MIN_FRAME_DIMENSION};
use crate::ingest::{FrameSource, ReadOutcome};
use crate::pipeline::PipelineStats;
use crate::CancellationToken;

#[derive(Clone, Debug)]
pub struct CaptureSettings {
    /// Budget for a single read attempt.
    pub read_budget: Duration,
    /// Wait after a read that produced no frame.
    pub retry_delay: Duration,
    /// Wait after a read error.
    pub error_backoff: Duration,
    /// Wait between attempts to open the source.
    pub reopen_delay: Duration,
    /// Consecutive failed reads before the source is closed and re-opened.
    pub reopen_after_failures: u32,
    /// Frames smaller than this in either dimension are discarded.
    pub min_dimension: u32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            read_budget: Duration::from_millis(500),
            retry_delay: Duration::from_millis(100),
            error_backoff: Duration::from_secs(1),
            reopen_delay: Duration::from_secs(5),
            reopen_after_failures: 100,
            min_dimension: MIN_FRAME_DIMENSION,
        }
    }
}

/// What a single capture step did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureStep {
    Offered(OfferOutcome),
    Rejected,
    NoFrame,
    ReadFailed,
    OpenFailed,
    Reopened,
}

pub struct CaptureLoop {
    source: Box<dyn FrameSource>,
    relay: Arc<FrameRelay>,
    stats: Arc<PipelineStats>,
    settings: CaptureSettings,
    opened: bool,
    consecutive_failures: u32,
}

impl CaptureLoop {
    pub fn new(
        source: Box<dyn FrameSource>,
        relay: Arc<FrameRelay>,
        stats: Arc<PipelineStats>,
        settings: CaptureSettings,
    ) -> Self {
        Self {
            source,
            relay,
            stats,
            settings,
            opened: false,
            consecutive_failures: 0,
        }
    }

    /// Perform one acquisition attempt without sleeping.
    pub fn step(&mut self) -> CaptureStep {
        if !self.opened {
            return match self.source.open() {
                Ok(()) => {
                    self.opened = true;
                    self.consecutive_failures = 0;
                    CaptureStep::Reopened
                }
                Err(e) => {
                    log::error!("capture: failed to open {}: {:#}", self.source.describe(), e);
                    CaptureStep::OpenFailed
                }
            };
        }

        if self.settings.reopen_after_failures > 0
            && self.consecutive_failures >= self.settings.reopen_after_failures
        {
            log::warn!(
                "capture: {} consecutive failed reads from {}, re-opening",
                self.consecutive_failures,
                self.source.describe()
            );
            self.source.close();
            self.opened = false;
            self.stats.record_reopen();
            return self.step();
        }

        match self.source.read(self.settings.read_budget) {
            Ok(ReadOutcome::Frame(frame)) => {
                self.consecutive_failures = 0;
                if frame.is_undersized(self.settings.min_dimension) {
                    log::debug!(
                        "capture: discarding undersized frame {}x{}",
                        frame.width(),
                        frame.height()
                    );
                    self.stats.record_rejected();
                    return CaptureStep::Rejected;
                }
                self.stats.record_captured();
                CaptureStep::Offered(self.relay.offer(frame))
            }
            Ok(ReadOutcome::NoFrame) => {
                self.consecutive_failures += 1;
                self.stats.record_read_failure();
                CaptureStep::NoFrame
            }
            Err(e) => {
                self.consecutive_failures += 1;
                self.stats.record_read_failure();
                if self.consecutive_failures == 1 || self.consecutive_failures % 50 == 0 {
                    log::warn!(
                        "capture: read from {} failed ({} in a row): {:#}",
                        self.source.describe(),
                        self.consecutive_failures,
                        e
                    );
                }
                CaptureStep::ReadFailed
            }
        }
    }

    /// Run until cancelled, then close the source and hand it back.
    pub fn run(mut self, cancel: &CancellationToken) -> Box<dyn FrameSource> {
        log::info!("capture: starting on {}", self.source.describe());
        while !cancel.is_cancelled() {
            let delay = match self.step() {
                CaptureStep::Offered(_) | CaptureStep::Rejected | CaptureStep::Reopened => continue,
                CaptureStep::NoFrame => self.settings.retry_delay,
                CaptureStep::ReadFailed => self.settings.error_backoff,
                CaptureStep::OpenFailed => self.settings.reopen_delay,
            };
            if cancel.wait_timeout(delay) {
                break;
            }
        }
        self.source.close();
        log::info!("capture: stopped");
        self.source
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
