//! External process supervision.
//!
//! Two independent responsibilities:
//! - The streaming-relay service must be running before detection starts
//!   (`ensure_service_running`, fatal on failure).
//! - The recording subprocess is started and stopped by the recording
//!   controller through the `Recorder` trait (`FfmpegRecorder` in production).
//!
//! Outcomes are explicit enums so callers decide on retry or escalation
//! without inspecting error strings.

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::Timestamp;

mod process;
mod recorder;
mod service;

pub use process::{terminate_gracefully, SystemProcesses};
pub use recorder::{recording_file_name, FfmpegRecorder, RecorderSettings};
pub use service::{ensure_service_running, ServiceSpec, ServiceStatus};

/// Process liveness and spawn capability.
pub trait ProcessControl: Send + Sync {
    /// True when a process whose command line matches `name` is running.
    fn is_running(&self, name: &str) -> bool;

    /// Spawn `argv` detached in `cwd` and return its pid.
    fn spawn(&self, argv: &[String], cwd: &Path) -> Result<u32>;
}

/// Result of asking the recorder to start.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    Started { pid: u32, output_path: PathBuf },
    StartFailed(String),
}

/// Result of asking the recorder to stop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    /// The process exited after the graceful terminate signal.
    Stopped,
    /// The process ignored the terminate signal and its group was killed.
    KillRequired,
    /// No recording process was active.
    AlreadyStopped,
}

/// Recording subprocess lifecycle.
pub trait Recorder: Send {
    /// Start recording the live stream. A call while already recording
    /// reports the running process.
    fn start(&mut self, started_at: Timestamp) -> StartOutcome;

    /// Stop recording. Always clears the persisted pid record.
    fn stop(&mut self) -> StopOutcome;
}
