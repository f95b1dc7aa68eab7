//! Upload collaborators.
//!
//! The pipeline reports recording episodes and face crops through the
//! `Uploader` trait. Delivery is best effort: failures are logged by the
//! caller and never change detection or recording state.
//!
//! - `HttpUploader`: posts to the remote server with the device identity header.
//! - `LogOnlyUploader`: used when no remote server is configured.
//! - `BackgroundUploader`: moves delivery onto its own thread behind a bounded
//!   queue so the motion thread never waits on the network.

use anyhow::{anyhow, Result};
use std::path::PathBuf;
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::faces::FaceCapture;
use crate::Timestamp;

mod http;

pub use http::{HttpUploader, HttpUploaderConfig};

/// Default number of uploads that may wait for the background thread.
pub const DEFAULT_UPLOAD_QUEUE: usize = 16;

/// Metadata reported when a recording episode starts.
#[derive(Clone, Debug, PartialEq)]
pub struct EpisodeMetadata {
    pub output_path: PathBuf,
    pub started_at: Timestamp,
}

impl EpisodeMetadata {
    /// File name of the recording (what the server indexes by).
    pub fn file_name(&self) -> String {
        self.output_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.output_path.display().to_string())
    }
}

/// Fire-and-forget upload capability.
pub trait Uploader: Send + Sync {
    fn upload_episode_metadata(&self, metadata: &EpisodeMetadata) -> Result<()>;

    /// Consumes the capture; nothing is retained after transmission.
    fn upload_face_crop(&self, capture: FaceCapture) -> Result<()>;
}

/// Uploader that only logs what it would have sent.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogOnlyUploader;

impl Uploader for LogOnlyUploader {
    fn upload_episode_metadata(&self, metadata: &EpisodeMetadata) -> Result<()> {
        log::info!(
            "upload disabled: episode {} started at {}",
            metadata.file_name(),
            metadata.started_at.to_rfc3339()
        );
        Ok(())
    }

    fn upload_face_crop(&self, capture: FaceCapture) -> Result<()> {
        log::info!(
            "upload disabled: dropping {} byte face crop from {}",
            capture.jpeg.len(),
            capture.captured_at.to_rfc3339()
        );
        Ok(())
    }
}

enum UploadJob {
    Episode(EpisodeMetadata),
    Face(FaceCapture),
}

/// Runs another uploader on a dedicated thread.
///
/// Enqueueing never blocks: when the queue is full the job is rejected with
/// an error the caller logs.
pub struct BackgroundUploader {
    queue: Option<SyncSender<UploadJob>>,
    worker: Option<JoinHandle<()>>,
}

impl BackgroundUploader {
    pub fn spawn(inner: Arc<dyn Uploader>, capacity: usize) -> Result<Self> {
        let (queue, jobs) = mpsc::sync_channel::<UploadJob>(capacity.max(1));
        let worker = std::thread::Builder::new()
            .name("upload".to_string())
            .spawn(move || {
                for job in jobs {
                    let result = match job {
                        UploadJob::Episode(metadata) => inner.upload_episode_metadata(&metadata),
                        UploadJob::Face(capture) => inner.upload_face_crop(capture),
                    };
                    if let Err(e) = result {
                        log::error!("upload failed: {:#}", e);
                    }
                }
            })?;
        Ok(Self {
            queue: Some(queue),
            worker: Some(worker),
        })
    }

    fn enqueue(&self, job: UploadJob) -> Result<()> {
        let queue = self
            .queue
            .as_ref()
            .ok_or_else(|| anyhow!("upload queue closed"))?;
        match queue.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(anyhow!("upload queue full, dropping job")),
            Err(TrySendError::Disconnected(_)) => Err(anyhow!("upload worker stopped")),
        }
    }

    /// Drain pending jobs and stop the worker thread.
    pub fn shutdown(mut self) {
        self.close();
    }

    fn close(&mut self) {
        self.queue.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("upload worker panicked");
            }
        }
    }
}

impl Uploader for BackgroundUploader {
    fn upload_episode_metadata(&self, metadata: &EpisodeMetadata) -> Result<()> {
        self.enqueue(UploadJob::Episode(metadata.clone()))
    }

    fn upload_face_crop(&self, capture: FaceCapture) -> Result<()> {
        self.enqueue(UploadJob::Face(capture))
    }
}

impl Drop for BackgroundUploader {
    fn drop(&mut self) {
        self.close();
    }
}

/// Base name used for uploaded face crops.
pub(crate) fn face_file_name(capture: &FaceCapture) -> String {
    format!("{}.jpg", capture.captured_at.format("%Y-%m-%dT%H-%M-%S%.3f"))
}

/// Resolve an endpoint path against the configured server URL.
pub(crate) fn endpoint(base: &url::Url, path: &str) -> Result<url::Url> {
    base.join(path)
        .map_err(|e| anyhow!("invalid endpoint {} on {}: {}", path, base, e))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
