//! Recording state machine.
//!
//! Motion ticks open the debounce window and start an episode; a still
//! stretch longer than the debounce closes it. Decisions come from the pure
//! `decide` function so the timing rules can be exercised without threads or
//! subprocesses. `RecordingController` applies them against a `Recorder` and
//! reports new episodes to the uploader. A `RecorderHandle` lets the shutdown
//! path stop the recorder when the motion thread cannot be joined.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::{Duration, Instant};

use crate::pipeline::PipelineStats;
use crate::supervisor::{Recorder, StartOutcome, StopOutcome};
use crate::transport::{EpisodeMetadata, Uploader};
use crate::{elapsed_between, Timestamp};

/// One contiguous recording.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordingEpisode {
    pub started_at: Timestamp,
    pub output_path: PathBuf,
    pub pid: u32,
    pub ended_at: Option<Timestamp>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub enum RecordingState {
    #[default]
    Idle,
    Recording(RecordingEpisode),
}

impl RecordingState {
    pub fn is_recording(&self) -> bool {
        matches!(self, RecordingState::Recording(_))
    }
}

/// Debounce bookkeeping carried between ticks.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MotionWindow {
    pub last_motion_time: Option<Timestamp>,
    pub motion_active: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordingAction {
    StartRecording,
    StopRecording,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Decision {
    pub window: MotionWindow,
    pub action: Option<RecordingAction>,
}

/// Next debounce window and the action to take for one tick.
pub fn decide(
    state: &RecordingState,
    window: &MotionWindow,
    motion_detected: bool,
    now: Timestamp,
    debounce: Duration,
) -> Decision {
    let mut window = *window;

    if motion_detected {
        window.last_motion_time = Some(now);
        window.motion_active = true;
        let action = (!state.is_recording()).then_some(RecordingAction::StartRecording);
        return Decision { window, action };
    }

    let quiet_for = window
        .last_motion_time
        .map(|last| elapsed_between(last, now));
    let expired = quiet_for.is_some_and(|quiet| quiet > debounce);

    if window.motion_active && expired {
        window.motion_active = false;
    }

    let mut action = None;
    if state.is_recording() && !window.motion_active && expired {
        window.last_motion_time = None;
        action = Some(RecordingAction::StopRecording);
    }
    Decision { window, action }
}

const HANDLE_POLL: Duration = Duration::from_millis(20);

struct RecorderSlot {
    recorder: Box<dyn Recorder>,
    /// Set once the recorder was stopped from outside the motion thread; no
    /// further starts are allowed.
    closed: bool,
}

fn lock_slot(slot: &Mutex<RecorderSlot>) -> MutexGuard<'_, RecorderSlot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Out-of-thread access to the controller's recorder.
#[derive(Clone)]
pub struct RecorderHandle {
    slot: Arc<Mutex<RecorderSlot>>,
}

impl RecorderHandle {
    /// Stop the recorder and refuse later starts.
    ///
    /// Waits at most `timeout` for a start or stop in progress on the motion
    /// thread. Returns `None` when the recorder stayed busy.
    pub fn close_within(&self, timeout: Duration) -> Option<StopOutcome> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut slot = match self.slot.try_lock() {
                Ok(slot) => slot,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        return None;
                    }
                    std::thread::sleep(HANDLE_POLL);
                    continue;
                }
            };
            slot.closed = true;
            return Some(slot.recorder.stop());
        }
    }
}

/// Owns the recorder and applies `decide` on the motion thread.
pub struct RecordingController {
    recorder: Arc<Mutex<RecorderSlot>>,
    uploader: Arc<dyn Uploader>,
    stats: Arc<PipelineStats>,
    debounce: Duration,
    state: RecordingState,
    window: MotionWindow,
}

impl RecordingController {
    pub fn new(
        recorder: Box<dyn Recorder>,
        uploader: Arc<dyn Uploader>,
        stats: Arc<PipelineStats>,
        debounce: Duration,
    ) -> Self {
        Self {
            recorder: Arc::new(Mutex::new(RecorderSlot {
                recorder,
                closed: false,
            })),
            uploader,
            stats,
            debounce,
            state: RecordingState::Idle,
            window: MotionWindow::default(),
        }
    }

    pub fn state(&self) -> &RecordingState {
        &self.state
    }

    pub fn window(&self) -> MotionWindow {
        self.window
    }

    pub fn motion_active(&self) -> bool {
        self.window.motion_active
    }

    pub fn recorder_handle(&self) -> RecorderHandle {
        RecorderHandle {
            slot: self.recorder.clone(),
        }
    }

    /// Feed one motion sample. Returns the action that was applied, if any.
    pub fn on_sample(&mut self, motion_detected: bool, now: Timestamp) -> Option<RecordingAction> {
        let decision = decide(&self.state, &self.window, motion_detected, now, self.debounce);
        self.window = decision.window;
        match decision.action {
            Some(RecordingAction::StartRecording) => self.start(now),
            Some(RecordingAction::StopRecording) => {
                self.stop(now);
            }
            None => {}
        }
        decision.action
    }

    /// Force the controller back to `Idle`, stopping any active recording.
    pub fn shutdown(&mut self, now: Timestamp) -> Option<RecordingEpisode> {
        self.window = MotionWindow::default();
        self.stop(now)
    }

    fn start(&mut self, now: Timestamp) {
        if self.state.is_recording() {
            return;
        }
        let outcome = {
            let mut slot = lock_slot(&self.recorder);
            if slot.closed {
                StartOutcome::StartFailed("recorder closed for shutdown".to_string())
            } else {
                slot.recorder.start(now)
            }
        };
        match outcome {
            StartOutcome::Started { pid, output_path } => {
                self.stats.record_episode_started();
                let metadata = EpisodeMetadata {
                    output_path: output_path.clone(),
                    started_at: now,
                };
                self.state = RecordingState::Recording(RecordingEpisode {
                    started_at: now,
                    output_path,
                    pid,
                    ended_at: None,
                });
                if let Err(e) = self.uploader.upload_episode_metadata(&metadata) {
                    log::error!("episode metadata upload failed: {:#}", e);
                }
            }
            StartOutcome::StartFailed(reason) => {
                self.stats.record_start_failure();
                log::error!("recording start failed: {}", reason);
            }
        }
    }

    fn stop(&mut self, now: Timestamp) -> Option<RecordingEpisode> {
        let RecordingState::Recording(mut episode) = std::mem::take(&mut self.state) else {
            return None;
        };
        let outcome = lock_slot(&self.recorder).recorder.stop();
        if outcome == StopOutcome::KillRequired {
            log::warn!("recorder ignored terminate, process group killed");
        }
        episode.ended_at = Some(now);
        self.stats.record_episode_stopped();
        log::info!(
            "episode ended after {}s: {}",
            elapsed_between(episode.started_at, now).as_secs(),
            episode.output_path.display()
        );
        Some(episode)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::faces::FaceCapture;
    use crate::{Clock, ManualClock};
    use anyhow::Result;
    use std::sync::Mutex;

    const DEBOUNCE: Duration = Duration::from_secs(10);

    #[derive(Default)]
    struct Calls {
        starts: usize,
        stops: usize,
    }

    struct FakeRecorder {
        calls: Arc<Mutex<Calls>>,
        fail_starts: usize,
    }

    impl Recorder for FakeRecorder {
        fn start(&mut self, started_at: Timestamp) -> StartOutcome {
            let mut calls = self.calls.lock().unwrap();
            calls.starts += 1;
            if self.fail_starts > 0 {
                self.fail_starts -= 1;
                return StartOutcome::StartFailed("no such program".to_string());
            }
            StartOutcome::Started {
                pid: 4242,
                output_path: PathBuf::from(format!("/tmp/{}.mp4", started_at.timestamp())),
            }
        }

        fn stop(&mut self) -> StopOutcome {
            self.calls.lock().unwrap().stops += 1;
            StopOutcome::Stopped
        }
    }

    #[derive(Default)]
    struct MetadataLog {
        episodes: Mutex<Vec<EpisodeMetadata>>,
    }

    impl Uploader for MetadataLog {
        fn upload_episode_metadata(&self, metadata: &EpisodeMetadata) -> Result<()> {
            self.episodes.lock().unwrap().push(metadata.clone());
            Ok(())
        }

        fn upload_face_crop(&self, _capture: FaceCapture) -> Result<()> {
            Ok(())
        }
    }

    fn controller(
        fail_starts: usize,
    ) -> (RecordingController, Arc<Mutex<Calls>>, Arc<MetadataLog>) {
        let calls = Arc::new(Mutex::new(Calls::default()));
        let uploads = Arc::new(MetadataLog::default());
        let controller = RecordingController::new(
            Box::new(FakeRecorder {
                calls: calls.clone(),
                fail_starts,
            }),
            uploads.clone(),
            Arc::new(PipelineStats::default()),
            DEBOUNCE,
        );
        (controller, calls, uploads)
    }

    #[test]
    fn motion_while_idle_starts_recording() {
        let clock = ManualClock::default();
        let decision = decide(
            &RecordingState::Idle,
            &MotionWindow::default(),
            true,
            clock.now(),
            DEBOUNCE,
        );
        assert_eq!(decision.action, Some(RecordingAction::StartRecording));
        assert!(decision.window.motion_active);
        assert_eq!(decision.window.last_motion_time, Some(clock.now()));
    }

    #[test]
    fn stillness_inside_debounce_keeps_window_open() {
        let clock = ManualClock::default();
        let window = MotionWindow {
            last_motion_time: Some(clock.now()),
            motion_active: true,
        };
        clock.advance(DEBOUNCE);
        let state = RecordingState::Recording(RecordingEpisode {
            started_at: clock.now(),
            output_path: PathBuf::from("x.mp4"),
            pid: 1,
            ended_at: None,
        });
        let decision = decide(&state, &window, false, clock.now(), DEBOUNCE);
        assert_eq!(decision.action, None);
        assert!(decision.window.motion_active);
    }

    #[test]
    fn stillness_past_debounce_stops_and_clears() {
        let clock = ManualClock::default();
        let window = MotionWindow {
            last_motion_time: Some(clock.now()),
            motion_active: true,
        };
        clock.advance(DEBOUNCE + Duration::from_millis(1));
        let state = RecordingState::Recording(RecordingEpisode {
            started_at: clock.now(),
            output_path: PathBuf::from("x.mp4"),
            pid: 1,
            ended_at: None,
        });
        let decision = decide(&state, &window, false, clock.now(), DEBOUNCE);
        assert_eq!(decision.action, Some(RecordingAction::StopRecording));
        assert_eq!(decision.window, MotionWindow::default());
    }

    #[test]
    fn idle_window_expires_without_actions() {
        let clock = ManualClock::default();
        let window = MotionWindow {
            last_motion_time: Some(clock.now()),
            motion_active: true,
        };
        clock.advance(DEBOUNCE * 2);
        let decision = decide(&RecordingState::Idle, &window, false, clock.now(), DEBOUNCE);
        assert_eq!(decision.action, None);
        assert!(!decision.window.motion_active);
    }

    #[test]
    fn repeated_motion_starts_once() {
        let clock = ManualClock::default();
        let (mut controller, calls, uploads) = controller(0);
        for _ in 0..10 {
            controller.on_sample(true, clock.now());
            clock.advance(Duration::from_secs(1));
        }
        assert!(controller.state().is_recording());
        assert_eq!(calls.lock().unwrap().starts, 1);
        assert_eq!(uploads.episodes.lock().unwrap().len(), 1);
    }

    #[test]
    fn failed_start_stays_idle_and_retries() {
        let clock = ManualClock::default();
        let (mut controller, calls, uploads) = controller(1);

        controller.on_sample(true, clock.now());
        assert_eq!(controller.state(), &RecordingState::Idle);
        assert!(controller.motion_active());
        assert!(uploads.episodes.lock().unwrap().is_empty());

        clock.advance(Duration::from_secs(1));
        controller.on_sample(true, clock.now());
        assert!(controller.state().is_recording());
        assert_eq!(calls.lock().unwrap().starts, 2);
    }

    #[test]
    fn one_stop_after_quiet_period() {
        let clock = ManualClock::default();
        let (mut controller, calls, _) = controller(0);
        controller.on_sample(true, clock.now());

        for _ in 0..30 {
            clock.advance(Duration::from_secs(1));
            controller.on_sample(false, clock.now());
        }
        assert_eq!(controller.state(), &RecordingState::Idle);
        assert_eq!(calls.lock().unwrap().stops, 1);
    }

    #[test]
    fn shutdown_stops_active_episode() {
        let clock = ManualClock::default();
        let (mut controller, calls, _) = controller(0);
        controller.on_sample(true, clock.now());
        clock.advance(Duration::from_secs(2));

        let episode = controller.shutdown(clock.now()).unwrap();
        assert_eq!(episode.ended_at, Some(clock.now()));
        assert_eq!(controller.state(), &RecordingState::Idle);
        assert!(!controller.motion_active());
        assert_eq!(calls.lock().unwrap().stops, 1);
        assert!(controller.shutdown(clock.now()).is_none());
    }

    #[test]
    fn closed_handle_stops_recorder_and_blocks_restarts() {
        let clock = ManualClock::default();
        let (mut controller, calls, _) = controller(0);
        controller.on_sample(true, clock.now());
        let handle = controller.recorder_handle();

        assert_eq!(
            handle.close_within(Duration::from_millis(100)),
            Some(StopOutcome::Stopped)
        );
        assert_eq!(calls.lock().unwrap().stops, 1);

        // Later starts from a late-returning motion thread are refused.
        controller.shutdown(clock.now());
        clock.advance(Duration::from_secs(1));
        controller.on_sample(true, clock.now());
        assert_eq!(controller.state(), &RecordingState::Idle);
        assert_eq!(calls.lock().unwrap().starts, 1);
    }
}
