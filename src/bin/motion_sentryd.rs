//! motion_sentryd - motion-triggered recording daemon
//!
//! This daemon:
//! 1. Makes sure the streaming-relay service is running
//! 2. Captures frames from the configured stream into a drop-oldest relay
//! 3. Scores motion on the freshest frame and records while motion lasts
//! 4. Samples faces during motion and uploads the crops
//! 5. Stops cleanly on SIGINT/SIGTERM, leaving no recorder behind

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use motion_sentry::{
    detect::build_face_detector, ensure_service_running, logging, transport::DEFAULT_UPLOAD_QUEUE,
    BackgroundUploader, FaceSampler, FfmpegRecorder, HttpUploader, LogOnlyUploader,
    MotionAnalyzer, MotionWorker, Pipeline, PipelineStats, RecordingController, RtspSource,
    SentryConfig, SystemClock, SystemProcesses, Uploader,
};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Record the camera stream while motion is detected"
)]
struct Args {
    /// Config file (TOML when the extension is .toml, JSON otherwise).
    #[arg(long, env = "SENTRY_CONFIG")]
    config: Option<PathBuf>,

    /// Mirror log output to this file (appended, rotated by size).
    #[arg(long, env = "SENTRY_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Rotate the log file once it would grow past this many bytes.
    #[arg(long, env = "SENTRY_LOG_MAX_BYTES", default_value_t = logging::DEFAULT_LOG_MAX_BYTES)]
    log_max_bytes: u64,

    /// Rotated log files to keep.
    #[arg(long, env = "SENTRY_LOG_BACKUPS", default_value_t = logging::DEFAULT_LOG_BACKUPS)]
    log_backups: u32,

    /// Do not check or start the streaming-relay service.
    #[arg(long, env = "SENTRY_SKIP_RELAY_SERVICE")]
    skip_relay_service: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging::init_logging(args.log_file.as_ref().map(|path| logging::LogFileSettings {
        path: path.clone(),
        max_bytes: args.log_max_bytes,
        backups: args.log_backups,
    }))?;

    let cfg = SentryConfig::load_from(args.config.as_deref())?;
    log::info!(
        "motion_sentryd {} starting: stream {}, recordings in {}",
        env!("CARGO_PKG_VERSION"),
        cfg.stream_url,
        cfg.output_dir.display()
    );

    if args.skip_relay_service {
        log::warn!("relay service check skipped");
    } else {
        ensure_service_running(&SystemProcesses, &cfg.service_spec(), std::thread::sleep)?;
    }

    let uploader = build_uploader(&cfg)?;
    let stats = Arc::new(PipelineStats::default());

    let controller = RecordingController::new(
        Box::new(FfmpegRecorder::new(cfg.recorder_settings())),
        uploader.clone(),
        stats.clone(),
        cfg.motion.recording_after_motion,
    );

    let sampler = match build_face_detector(
        cfg.faces.backend,
        cfg.faces.model_path.as_deref(),
        cfg.faces.min_confidence,
    ) {
        Ok(Some(detector)) => Some(FaceSampler::new(
            detector,
            uploader.clone(),
            cfg.face_sampler_settings(),
        )),
        Ok(None) => {
            log::info!("face sampling disabled");
            None
        }
        Err(e) => {
            log::error!("face detector unavailable, sampling disabled: {:#}", e);
            None
        }
    };

    let worker = MotionWorker::new(
        MotionAnalyzer::new(cfg.motion_settings())?,
        controller,
        sampler,
        Arc::new(SystemClock),
        stats,
        cfg.worker_settings(),
    );
    let source = RtspSource::new(cfg.rtsp_config())?;
    let pipeline = Pipeline::spawn(Box::new(source), worker, cfg.pipeline_settings())?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("failed to install signal handler: {}", e))?;

    log::info!("motion_sentryd running (Ctrl-C to stop)");
    loop {
        match rx.recv_timeout(HEARTBEAT_INTERVAL) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                let stats = pipeline.stats();
                let relay = pipeline.relay_stats();
                log::info!(
                    "heartbeat: frames={} rejected={} read_failures={} ticks={} motion={} episodes={}/{} faces={} relay_evicted={}",
                    stats.frames_captured,
                    stats.frames_rejected,
                    stats.read_failures,
                    stats.ticks,
                    stats.motion_ticks,
                    stats.episodes_started,
                    stats.episodes_stopped,
                    stats.faces_captured,
                    relay.evicted
                );
                if !pipeline.is_running() {
                    log::error!("worker threads exited unexpectedly");
                    break;
                }
            }
        }
    }

    log::info!("shutdown signal received, stopping pipeline...");
    pipeline.shutdown();
    drop(uploader);
    log::info!("motion_sentryd stopped");
    Ok(())
}

fn build_uploader(cfg: &SentryConfig) -> Result<Arc<dyn Uploader>> {
    match cfg.http_uploader_config() {
        Some(http) => {
            let server = http.server_url.clone();
            let inner = Arc::new(HttpUploader::new(http)?);
            log::info!("uploading to {}", server);
            Ok(Arc::new(BackgroundUploader::spawn(inner, DEFAULT_UPLOAD_QUEUE)?))
        }
        None => {
            log::info!("no upload server configured, uploads are logged only");
            Ok(Arc::new(LogOnlyUploader))
        }
    }
}
