//! Worker threads and their lifecycle.
//!
//! `Pipeline::spawn` starts the `capture` and `motion` threads around a
//! shared `FrameRelay`. `Pipeline::shutdown` cancels both, joins them with a
//! bounded wait, forces the recording controller back to idle and releases
//! the face detector. A motion thread that misses the deadline or panicked
//! has its recorder stopped through a `RecorderHandle` instead.

use anyhow::{bail, Result};
use image::imageops::{self, FilterType};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::capture::{CaptureLoop, CaptureSettings};
use crate::faces::{FaceSampler, SampleOutcome};
use crate::frame::{Frame, FrameRelay, PreviewSlot, RelayStats, DEFAULT_RELAY_CAPACITY};
use crate::ingest::FrameSource;
use crate::motion::{MotionAnalyzer, MotionSample};
use crate::recording::{RecorderHandle, RecordingAction, RecordingController};
use crate::supervisor::StopOutcome;
use crate::{elapsed_between, CancellationToken, Clock, Timestamp};

pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(3);
const JOIN_POLL: Duration = Duration::from_millis(20);

// -------------------- Stats --------------------

/// Counters shared by the worker threads.
#[derive(Debug, Default)]
pub struct PipelineStats {
    frames_captured: AtomicU64,
    frames_rejected: AtomicU64,
    read_failures: AtomicU64,
    source_reopens: AtomicU64,
    ticks: AtomicU64,
    tick_failures: AtomicU64,
    motion_ticks: AtomicU64,
    episodes_started: AtomicU64,
    episodes_stopped: AtomicU64,
    start_failures: AtomicU64,
    faces_captured: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames_captured: u64,
    pub frames_rejected: u64,
    pub read_failures: u64,
    pub source_reopens: u64,
    pub ticks: u64,
    pub tick_failures: u64,
    pub motion_ticks: u64,
    pub episodes_started: u64,
    pub episodes_stopped: u64,
    pub start_failures: u64,
    pub faces_captured: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl PipelineStats {
    pub fn record_captured(&self) {
        bump(&self.frames_captured);
    }

    pub fn record_rejected(&self) {
        bump(&self.frames_rejected);
    }

    pub fn record_read_failure(&self) {
        bump(&self.read_failures);
    }

    pub fn record_reopen(&self) {
        bump(&self.source_reopens);
    }

    pub fn record_tick(&self, motion_detected: bool) {
        bump(&self.ticks);
        if motion_detected {
            bump(&self.motion_ticks);
        }
    }

    pub fn record_tick_failure(&self) {
        bump(&self.tick_failures);
    }

    pub fn record_episode_started(&self) {
        bump(&self.episodes_started);
    }

    pub fn record_episode_stopped(&self) {
        bump(&self.episodes_stopped);
    }

    pub fn record_start_failure(&self) {
        bump(&self.start_failures);
    }

    pub fn record_face_captured(&self) {
        bump(&self.faces_captured);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            frames_captured: load(&self.frames_captured),
            frames_rejected: load(&self.frames_rejected),
            read_failures: load(&self.read_failures),
            source_reopens: load(&self.source_reopens),
            ticks: load(&self.ticks),
            tick_failures: load(&self.tick_failures),
            motion_ticks: load(&self.motion_ticks),
            episodes_started: load(&self.episodes_started),
            episodes_stopped: load(&self.episodes_stopped),
            start_failures: load(&self.start_failures),
            faces_captured: load(&self.faces_captured),
        }
    }
}

// -------------------- Motion worker --------------------

#[derive(Clone, Debug, PartialEq)]
pub struct MotionWorkerSettings {
    /// Preview resolution handed to the face sampler.
    pub frame_width: u32,
    pub frame_height: u32,
    pub face_scan_interval: Duration,
    /// Pause between motion ticks.
    pub check_interval: Duration,
    /// How long one wait on the relay may block.
    pub relay_timeout: Duration,
    pub error_backoff: Duration,
}

impl MotionWorkerSettings {
    pub fn new(
        frame_width: u32,
        frame_height: u32,
        face_scan_interval: Duration,
        check_interval: Duration,
    ) -> Self {
        Self {
            frame_width,
            frame_height,
            face_scan_interval,
            check_interval,
            relay_timeout: Duration::from_secs(1),
            error_backoff: Duration::from_secs(1),
        }
    }
}

/// What one motion tick did.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TickReport {
    /// `None` for the first frame, which only primes the analyzer.
    pub sample: Option<MotionSample>,
    pub action: Option<RecordingAction>,
    pub face: Option<SampleOutcome>,
}

/// State owned by the motion thread.
pub struct MotionWorker {
    analyzer: MotionAnalyzer,
    controller: RecordingController,
    sampler: Option<FaceSampler>,
    preview: PreviewSlot,
    clock: Arc<dyn Clock>,
    stats: Arc<PipelineStats>,
    settings: MotionWorkerSettings,
    last_face_scan: Option<Timestamp>,
}

impl MotionWorker {
    pub fn new(
        analyzer: MotionAnalyzer,
        controller: RecordingController,
        sampler: Option<FaceSampler>,
        clock: Arc<dyn Clock>,
        stats: Arc<PipelineStats>,
        settings: MotionWorkerSettings,
    ) -> Self {
        Self {
            analyzer,
            controller,
            sampler,
            preview: PreviewSlot::new(),
            clock,
            stats,
            settings,
            last_face_scan: None,
        }
    }

    pub fn controller(&self) -> &RecordingController {
        &self.controller
    }

    pub fn preview(&self) -> PreviewSlot {
        self.preview.clone()
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    /// One tick: face scan (at its own cadence), then motion scoring, then the
    /// recording decision.
    pub fn process_frame(&mut self, frame: &Frame) -> Result<TickReport> {
        let now = self.clock.now();
        let mut report = TickReport::default();

        let scan_due = self
            .last_face_scan
            .map_or(true, |last| elapsed_between(last, now) >= self.settings.face_scan_interval);
        if scan_due {
            self.last_face_scan = Some(now);
            let preview = self.preview_frame(frame)?;
            self.preview.publish(&preview);
            if self.controller.motion_active() {
                if let Some(sampler) = self.sampler.as_mut() {
                    let outcome = sampler.sample(&preview, now);
                    if matches!(outcome, SampleOutcome::Captured { .. }) {
                        self.stats.record_face_captured();
                    }
                    report.face = Some(outcome);
                }
            }
        }

        report.sample = self.analyzer.analyze(frame);
        if let Some(sample) = report.sample {
            self.stats.record_tick(sample.motion_detected);
            if sample.motion_detected {
                log::debug!("motion: ratio {:.4}", sample.ratio);
            }
            report.action = self.controller.on_sample(sample.motion_detected, now);
        }
        Ok(report)
    }

    fn preview_frame(&self, frame: &Frame) -> Result<Frame> {
        let (width, height) = (self.settings.frame_width, self.settings.frame_height);
        if width == 0 || height == 0 {
            bail!("preview resolution {}x{} is empty", width, height);
        }
        if frame.width() == width && frame.height() == height {
            return Ok(frame.clone());
        }
        let resized = imageops::resize(frame.image(), width, height, FilterType::Triangle);
        Ok(Frame::new(resized, frame.captured_at()))
    }

    /// Run until cancelled and hand the worker back for shutdown.
    pub fn run(mut self, relay: &FrameRelay, cancel: &CancellationToken) -> Self {
        log::info!("motion: starting");
        while !cancel.is_cancelled() {
            let Some(frame) = relay.take_latest(self.settings.relay_timeout) else {
                continue;
            };
            if let Err(e) = self.process_frame(&frame) {
                self.stats.record_tick_failure();
                log::error!("motion: tick failed: {:#}", e);
                if cancel.wait_timeout(self.settings.error_backoff) {
                    break;
                }
                continue;
            }
            if cancel.wait_timeout(self.settings.check_interval) {
                break;
            }
        }
        log::info!("motion: stopped");
        self
    }

    /// Stop any active recording and release the face detector.
    pub fn shutdown(&mut self) {
        let now = self.clock.now();
        if let Some(episode) = self.controller.shutdown(now) {
            log::info!(
                "motion: closed episode {} on shutdown",
                episode.output_path.display()
            );
        }
        if let Some(sampler) = self.sampler.take() {
            log::info!("motion: releasing face detector '{}'", sampler.detector_name());
        }
    }
}

// -------------------- Pipeline --------------------

#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub relay_capacity: usize,
    pub capture: CaptureSettings,
    pub join_timeout: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            relay_capacity: DEFAULT_RELAY_CAPACITY,
            capture: CaptureSettings::default(),
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }
}

/// Running capture and motion threads.
pub struct Pipeline {
    cancel: CancellationToken,
    relay: Arc<FrameRelay>,
    stats: Arc<PipelineStats>,
    preview: PreviewSlot,
    capture: Option<JoinHandle<Box<dyn FrameSource>>>,
    motion: Option<JoinHandle<MotionWorker>>,
    recorder: RecorderHandle,
    join_timeout: Duration,
}

impl Pipeline {
    pub fn spawn(
        source: Box<dyn FrameSource>,
        worker: MotionWorker,
        settings: PipelineSettings,
    ) -> Result<Self> {
        let cancel = CancellationToken::new();
        let relay = Arc::new(FrameRelay::new(settings.relay_capacity));
        let stats = worker.stats();
        let preview = worker.preview();
        let recorder = worker.controller().recorder_handle();

        let capture_loop = CaptureLoop::new(source, relay.clone(), stats.clone(), settings.capture);
        let capture_cancel = cancel.clone();
        let capture = std::thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || capture_loop.run(&capture_cancel))?;

        let motion_relay = relay.clone();
        let motion_cancel = cancel.clone();
        let motion = match std::thread::Builder::new()
            .name("motion".to_string())
            .spawn(move || worker.run(&motion_relay, &motion_cancel))
        {
            Ok(handle) => handle,
            Err(e) => {
                cancel.cancel();
                let _ = capture.join();
                return Err(e.into());
            }
        };

        Ok(Self {
            cancel,
            relay,
            stats,
            preview,
            capture: Some(capture),
            motion: Some(motion),
            recorder,
            join_timeout: settings.join_timeout,
        })
    }

    /// Latest preview frame published by the motion thread.
    pub fn preview(&self) -> &PreviewSlot {
        &self.preview
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn relay_stats(&self) -> RelayStats {
        self.relay.stats()
    }

    /// True while both workers are alive. The pipeline is useless once
    /// either of them has exited.
    pub fn is_running(&self) -> bool {
        self.capture.as_ref().is_some_and(|h| !h.is_finished())
            && self.motion.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Cancel both workers, join them and leave the recorder idle.
    pub fn shutdown(mut self) -> StatsSnapshot {
        log::info!("pipeline: shutting down");
        self.cancel.cancel();
        let deadline = Instant::now() + self.join_timeout;

        if self.capture.take().and_then(|h| join_by(h, deadline, "capture")).is_none() {
            log::warn!("pipeline: frame source not released cleanly");
        }
        match self.motion.take().and_then(|h| join_by(h, deadline, "motion")) {
            Some(mut worker) => worker.shutdown(),
            None => self.stop_orphaned_recorder(),
        }

        let snapshot = self.stats.snapshot();
        log::info!("pipeline: stopped ({:?})", snapshot);
        snapshot
    }

    fn stop_orphaned_recorder(&self) {
        match self.recorder.close_within(self.join_timeout) {
            Some(StopOutcome::AlreadyStopped) => {}
            Some(outcome) => {
                self.stats.record_episode_stopped();
                log::warn!(
                    "pipeline: recorder stopped without the motion thread ({:?})",
                    outcome
                );
            }
            None => log::error!("pipeline: recorder busy, recording may still be running"),
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn join_by<T>(handle: JoinHandle<T>, deadline: Instant, name: &str) -> Option<T> {
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            log::error!("pipeline: {} thread did not stop in time, detaching", name);
            return None;
        }
        std::thread::sleep(JOIN_POLL);
    }
    match handle.join() {
        Ok(value) => Some(value),
        Err(_) => {
            log::error!("pipeline: {} thread panicked", name);
            None
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::StubFaceDetector;
    use crate::faces::{FaceCapture, FaceSamplerSettings};
    use crate::motion::MotionSettings;
    use crate::supervisor::{Recorder, StartOutcome};
    use crate::transport::{EpisodeMetadata, Uploader};
    use crate::ManualClock;
    use image::{Rgb, RgbImage};
    use std::path::PathBuf;
    use std::sync::Mutex;

    struct NullRecorder {
        starts: Arc<Mutex<usize>>,
    }

    impl Recorder for NullRecorder {
        fn start(&mut self, _started_at: Timestamp) -> StartOutcome {
            *self.starts.lock().unwrap() += 1;
            StartOutcome::Started {
                pid: 7,
                output_path: PathBuf::from("/tmp/motion_rec.mp4"),
            }
        }

        fn stop(&mut self) -> StopOutcome {
            StopOutcome::Stopped
        }
    }

    #[derive(Default)]
    struct FaceCounter {
        faces: Mutex<usize>,
    }

    impl Uploader for FaceCounter {
        fn upload_episode_metadata(&self, _metadata: &EpisodeMetadata) -> anyhow::Result<()> {
            Ok(())
        }

        fn upload_face_crop(&self, _capture: FaceCapture) -> anyhow::Result<()> {
            *self.faces.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn worker(
        clock: Arc<ManualClock>,
        uploader: Arc<FaceCounter>,
    ) -> (MotionWorker, Arc<Mutex<usize>>) {
        let starts = Arc::new(Mutex::new(0));
        let stats = Arc::new(PipelineStats::default());
        let controller = RecordingController::new(
            Box::new(NullRecorder {
                starts: starts.clone(),
            }),
            uploader.clone(),
            stats.clone(),
            Duration::from_secs(5),
        );
        let sampler = FaceSampler::new(
            Box::new(StubFaceDetector::centered(0.5)),
            uploader,
            FaceSamplerSettings::default(),
        );
        let analyzer = MotionAnalyzer::new(MotionSettings {
            analysis_width: 64,
            analysis_height: 48,
            sensitivity: 25,
            ratio_threshold: 0.1,
            ..MotionSettings::default()
        })
        .unwrap();
        let worker = MotionWorker::new(
            analyzer,
            controller,
            Some(sampler),
            clock,
            stats,
            MotionWorkerSettings::new(320, 240, Duration::from_secs(1), Duration::from_millis(10)),
        );
        (worker, starts)
    }

    fn flat(value: u8, clock: &ManualClock) -> Frame {
        Frame::new(RgbImage::from_pixel(320, 240, Rgb([value; 3])), clock.now())
    }

    #[test]
    fn stats_snapshot_reflects_counters() {
        let stats = PipelineStats::default();
        stats.record_captured();
        stats.record_tick(true);
        stats.record_tick(false);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.frames_captured, 1);
        assert_eq!(snapshot.ticks, 2);
        assert_eq!(snapshot.motion_ticks, 1);
    }

    #[test]
    fn face_scan_waits_for_motion_from_earlier_ticks() {
        let clock = Arc::new(ManualClock::default());
        let uploader = Arc::new(FaceCounter::default());
        let (mut worker, starts) = worker(clock.clone(), uploader.clone());

        // Primes the analyzer; no motion yet, so no face scan.
        let first = worker.process_frame(&flat(0, &clock)).unwrap();
        assert_eq!(first.sample, None);
        assert_eq!(first.face, None);
        assert!(worker.preview().latest().is_some());

        clock.advance(Duration::from_secs(1));
        let second = worker.process_frame(&flat(255, &clock)).unwrap();
        assert_eq!(second.action, Some(RecordingAction::StartRecording));
        assert_eq!(second.face, None);

        clock.advance(Duration::from_secs(1));
        let third = worker.process_frame(&flat(255, &clock)).unwrap();
        assert!(matches!(third.face, Some(SampleOutcome::Captured { .. })));
        assert_eq!(*uploader.faces.lock().unwrap(), 1);
        assert_eq!(*starts.lock().unwrap(), 1);
    }

    #[test]
    fn empty_preview_resolution_fails_the_tick() {
        let clock = Arc::new(ManualClock::default());
        let (mut worker, _) = worker(clock.clone(), Arc::new(FaceCounter::default()));
        worker.settings.frame_width = 0;
        assert!(worker.process_frame(&flat(0, &clock)).is_err());
    }

    #[test]
    fn shutdown_leaves_controller_idle() {
        let clock = Arc::new(ManualClock::default());
        let (mut worker, _) = worker(clock.clone(), Arc::new(FaceCounter::default()));
        worker.process_frame(&flat(0, &clock)).unwrap();
        worker.process_frame(&flat(255, &clock)).unwrap();
        assert!(worker.controller().state().is_recording());

        worker.shutdown();
        assert!(!worker.controller().state().is_recording());
    }
}
