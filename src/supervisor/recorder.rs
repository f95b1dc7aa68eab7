use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use super::process::{detach, terminate_gracefully};
use super::{Recorder, StartOutcome, StopOutcome};
use crate::Timestamp;

/// Configuration for the recording subprocess.
#[derive(Clone, Debug, PartialEq)]
pub struct RecorderSettings {
    /// Live stream locator handed to the recorder.
    pub stream_url: String,
    pub output_dir: PathBuf,
    /// Where the active recorder pid is persisted.
    pub pid_file: PathBuf,
    /// Recorder executable.
    pub program: String,
    /// Output container extension (without the dot).
    pub extension: String,
    /// How long to wait after the terminate signal before killing.
    pub stop_grace: Duration,
}

impl RecorderSettings {
    pub fn new(stream_url: impl Into<String>, output_dir: PathBuf, pid_file: PathBuf) -> Self {
        Self {
            stream_url: stream_url.into(),
            output_dir,
            pid_file,
            program: "ffmpeg".to_string(),
            extension: "mp4".to_string(),
            stop_grace: Duration::from_secs(3),
        }
    }

    /// Stream-copy arguments writing to `output`.
    pub fn command_args(&self, output: &Path) -> Vec<String> {
        let mut args = Vec::new();
        if self.stream_url.starts_with("rtsp://") {
            args.extend(["-rtsp_transport".to_string(), "tcp".to_string()]);
        }
        args.extend(
            [
                "-i",
                self.stream_url.as_str(),
                "-c:v",
                "copy",
                "-avoid_negative_ts",
                "make_zero",
                "-fflags",
                "+genpts",
            ]
            .map(String::from),
        );
        args.push(output.display().to_string());
        args
    }
}

/// `motion_rec_<YYYY-mm-dd_HH-MM-SS>.<ext>`
pub fn recording_file_name(started_at: Timestamp, extension: &str) -> String {
    format!(
        "motion_rec_{}.{}",
        started_at.format("%Y-%m-%d_%H-%M-%S"),
        extension
    )
}

struct ActiveRecording {
    child: Child,
    output_path: PathBuf,
}

/// Records the live stream with an ffmpeg stream-copy subprocess.
pub struct FfmpegRecorder {
    settings: RecorderSettings,
    active: Option<ActiveRecording>,
}

impl FfmpegRecorder {
    pub fn new(settings: RecorderSettings) -> Self {
        Self {
            settings,
            active: None,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    fn spawn(&self, output_path: &Path) -> std::io::Result<Child> {
        fs::create_dir_all(&self.settings.output_dir)?;
        let mut command = Command::new(&self.settings.program);
        command
            .args(self.settings.command_args(output_path))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        detach(&mut command);
        command.spawn()
    }

    fn clear_pid_file(&self) {
        match fs::remove_file(&self.settings.pid_file) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!(
                "recorder: failed to remove pid file {}: {}",
                self.settings.pid_file.display(),
                e
            ),
        }
    }
}

impl Recorder for FfmpegRecorder {
    fn start(&mut self, started_at: Timestamp) -> StartOutcome {
        if let Some(active) = &self.active {
            return StartOutcome::Started {
                pid: active.child.id(),
                output_path: active.output_path.clone(),
            };
        }

        let output_path = self
            .settings
            .output_dir
            .join(recording_file_name(started_at, &self.settings.extension));
        let child = match self.spawn(&output_path) {
            Ok(child) => child,
            Err(e) => {
                return StartOutcome::StartFailed(format!(
                    "failed to launch {}: {}",
                    self.settings.program, e
                ))
            }
        };
        let pid = child.id();

        if let Err(e) = fs::write(&self.settings.pid_file, pid.to_string()) {
            log::warn!(
                "recorder: failed to write pid file {}: {}",
                self.settings.pid_file.display(),
                e
            );
        }
        log::info!(
            "recorder: recording started (pid {}): {}",
            pid,
            output_path.display()
        );

        self.active = Some(ActiveRecording {
            child,
            output_path: output_path.clone(),
        });
        StartOutcome::Started { pid, output_path }
    }

    fn stop(&mut self) -> StopOutcome {
        let Some(mut active) = self.active.take() else {
            self.clear_pid_file();
            return StopOutcome::AlreadyStopped;
        };

        let outcome = terminate_gracefully(&mut active.child, self.settings.stop_grace);
        self.clear_pid_file();
        log::info!(
            "recorder: recording stopped ({:?}): {}",
            outcome,
            active.output_path.display()
        );
        outcome
    }
}

impl Drop for FfmpegRecorder {
    fn drop(&mut self) {
        if self.active.is_some() {
            self.stop();
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Local, TimeZone};

    fn settings(dir: &Path) -> RecorderSettings {
        RecorderSettings::new(
            "rtsp://127.0.0.1:8554/cam",
            dir.join("recordings"),
            dir.join("ffmpeg.pid"),
        )
    }

    #[test]
    fn file_name_is_timestamped() {
        let ts = Local.with_ymd_and_hms(2026, 3, 7, 18, 5, 9).unwrap();
        assert_eq!(
            recording_file_name(ts, "mp4"),
            "motion_rec_2026-03-07_18-05-09.mp4"
        );
    }

    #[test]
    fn command_copies_rtsp_over_tcp() {
        let settings = settings(Path::new("/var/lib/sentry"));
        let args = settings.command_args(Path::new("/tmp/out.mp4"));
        assert_eq!(
            args,
            [
                "-rtsp_transport",
                "tcp",
                "-i",
                "rtsp://127.0.0.1:8554/cam",
                "-c:v",
                "copy",
                "-avoid_negative_ts",
                "make_zero",
                "-fflags",
                "+genpts",
                "/tmp/out.mp4",
            ]
        );
    }

    #[test]
    fn non_rtsp_locator_skips_transport_flag() {
        let mut settings = settings(Path::new("/var/lib/sentry"));
        settings.stream_url = "http://cam.local/stream.mjpg".to_string();
        let args = settings.command_args(Path::new("out.mp4"));
        assert_eq!(args[0], "-i");
    }

    #[test]
    fn launch_failure_reports_start_failed_without_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path());
        settings.program = dir.path().join("no-such-recorder").display().to_string();
        let mut recorder = FfmpegRecorder::new(settings.clone());

        let outcome = recorder.start(Local::now());
        assert!(matches!(outcome, StartOutcome::StartFailed(_)));
        assert!(!recorder.is_recording());
        assert!(!settings.pid_file.exists());
    }

    #[test]
    fn stop_without_recording_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = FfmpegRecorder::new(settings(dir.path()));
        assert_eq!(recorder.stop(), StopOutcome::AlreadyStopped);
    }

    #[cfg(unix)]
    #[test]
    fn pid_file_tracks_recording_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings(dir.path());
        settings.program = "true".to_string();
        let pid_file = settings.pid_file.clone();
        let mut recorder = FfmpegRecorder::new(settings);

        let StartOutcome::Started { pid, output_path } = recorder.start(Local::now()) else {
            panic!("recorder did not start");
        };
        assert_eq!(fs::read_to_string(&pid_file).unwrap(), pid.to_string());
        assert!(output_path.starts_with(dir.path().join("recordings")));
        assert!(dir.path().join("recordings").is_dir());

        let again = recorder.start(Local::now());
        assert_eq!(
            again,
            StartOutcome::Started {
                pid,
                output_path: output_path.clone()
            }
        );

        assert_eq!(recorder.stop(), StopOutcome::Stopped);
        assert!(!pid_file.exists());
        assert_eq!(recorder.stop(), StopOutcome::AlreadyStopped);
    }
}
