use anyhow::{anyhow, bail, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::capture::CaptureSettings;
use crate::detect::FaceBackendKind;
use crate::faces::{FaceSamplerSettings, DEFAULT_JPEG_QUALITY};
use crate::frame::DEFAULT_RELAY_CAPACITY;
use crate::ingest::RtspConfig;
use crate::motion::{MotionSettings, DEFAULT_BLUR_SIGMA};
use crate::pipeline::{MotionWorkerSettings, PipelineSettings, DEFAULT_JOIN_TIMEOUT};
use crate::supervisor::{RecorderSettings, ServiceSpec};
use crate::transport::HttpUploaderConfig;

const DEFAULT_SERVICE_PROGRAM: &str = "./mediamtx";
const DEFAULT_SERVICE_PROCESS: &str = "mediamtx";
const DEFAULT_SERVICE_ATTEMPTS: u32 = 3;
const DEFAULT_SERVICE_SETTLE_SECS: f64 = 2.0;
const DEFAULT_RECORDER_PROGRAM: &str = "ffmpeg";
const DEFAULT_RECORDER_EXTENSION: &str = "mp4";
const DEFAULT_STOP_GRACE_SECS: f64 = 3.0;
const DEFAULT_FACE_MIN_CONFIDENCE: f32 = 0.5;
const DEFAULT_FACE_COOLDOWN_SECS: f64 = 3.0;
const DEFAULT_FACE_MARGIN_SCALE: f32 = 2.0;
const DEFAULT_UPLOAD_TIMEOUT_SECS: f64 = 10.0;
const DEFAULT_STREAM_FPS: u32 = 25;

#[derive(Debug, Deserialize, Default)]
struct SentryConfigFile {
    stream_url: Option<String>,
    output_dir: Option<PathBuf>,
    pid_file: Option<PathBuf>,
    relay_capacity: Option<usize>,
    motion: Option<MotionConfigFile>,
    frame: Option<FrameConfigFile>,
    faces: Option<FaceConfigFile>,
    relay_service: Option<RelayServiceConfigFile>,
    recorder: Option<RecorderConfigFile>,
    upload: Option<UploadConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct MotionConfigFile {
    ratio_threshold: Option<f32>,
    sensitivity: Option<u32>,
    recording_after_motion_secs: Option<f64>,
    check_interval_secs: Option<f64>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct FrameConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct FaceConfigFile {
    scan_interval_secs: Option<f64>,
    backend: Option<FaceBackendKind>,
    model_path: Option<PathBuf>,
    min_confidence: Option<f32>,
    cooldown_secs: Option<f64>,
    margin_scale: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct RelayServiceConfigFile {
    dir: Option<PathBuf>,
    program: Option<String>,
    process_name: Option<String>,
    max_attempts: Option<u32>,
    settle_secs: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct RecorderConfigFile {
    program: Option<String>,
    extension: Option<String>,
    stop_grace_secs: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct UploadConfigFile {
    server_url: Option<String>,
    device_uid: Option<String>,
    timeout_secs: Option<f64>,
}

/// Resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct SentryConfig {
    pub stream_url: String,
    pub output_dir: PathBuf,
    pub pid_file: PathBuf,
    pub relay_capacity: usize,
    pub motion: MotionConfig,
    pub frame: FrameConfig,
    pub faces: FaceConfig,
    pub relay_service: RelayServiceConfig,
    pub recorder: RecorderConfig,
    pub upload: Option<UploadConfig>,
}

#[derive(Debug, Clone)]
pub struct MotionConfig {
    pub ratio_threshold: f32,
    pub sensitivity: u8,
    /// Debounce window after the last motion tick.
    pub recording_after_motion: Duration,
    pub check_interval: Duration,
    pub analysis_width: u32,
    pub analysis_height: u32,
}

#[derive(Debug, Clone)]
pub struct FrameConfig {
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
}

#[derive(Debug, Clone)]
pub struct FaceConfig {
    pub scan_interval: Duration,
    pub backend: FaceBackendKind,
    pub model_path: Option<PathBuf>,
    pub min_confidence: f32,
    pub cooldown: Duration,
    pub margin_scale: f32,
}

#[derive(Debug, Clone)]
pub struct RelayServiceConfig {
    pub dir: PathBuf,
    pub program: String,
    pub process_name: String,
    pub max_attempts: u32,
    pub settle: Duration,
}

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub program: String,
    pub extension: String,
    pub stop_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub server_url: String,
    pub device_uid: String,
    pub timeout: Duration,
}

impl SentryConfig {
    /// Load from `SENTRY_CONFIG` (if set), then apply environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = env_value("SENTRY_CONFIG").map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Load from an explicit file (or none), then apply environment overrides.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut file = match path {
            Some(path) => read_config_file(path)?,
            None => SentryConfigFile::default(),
        };
        apply_env(&mut file)?;
        let cfg = Self::from_file(file)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SentryConfigFile) -> Result<Self> {
        let motion = file.motion.unwrap_or_default();
        let frame = file.frame.unwrap_or_default();
        let faces = file.faces.unwrap_or_default();
        let service = file.relay_service.unwrap_or_default();
        let recorder = file.recorder.unwrap_or_default();

        let sensitivity = required(motion.sensitivity, "motion.sensitivity")?;
        if !(1..=255).contains(&sensitivity) {
            bail!("motion.sensitivity must be between 1 and 255, got {}", sensitivity);
        }

        let upload = match file.upload {
            Some(upload) => Some(UploadConfig {
                server_url: required(upload.server_url, "upload.server_url")?,
                device_uid: required(upload.device_uid, "upload.device_uid")?,
                timeout: seconds(
                    upload.timeout_secs.unwrap_or(DEFAULT_UPLOAD_TIMEOUT_SECS),
                    "upload.timeout_secs",
                )?,
            }),
            None => None,
        };

        Ok(Self {
            stream_url: required(file.stream_url, "stream_url")?,
            output_dir: required(file.output_dir, "output_dir")?,
            pid_file: required(file.pid_file, "pid_file")?,
            relay_capacity: file.relay_capacity.unwrap_or(DEFAULT_RELAY_CAPACITY),
            motion: MotionConfig {
                ratio_threshold: required(motion.ratio_threshold, "motion.ratio_threshold")?,
                sensitivity: sensitivity as u8,
                recording_after_motion: seconds(
                    required(
                        motion.recording_after_motion_secs,
                        "motion.recording_after_motion_secs",
                    )?,
                    "motion.recording_after_motion_secs",
                )?,
                check_interval: seconds(
                    required(motion.check_interval_secs, "motion.check_interval_secs")?,
                    "motion.check_interval_secs",
                )?,
                analysis_width: required(motion.width, "motion.width")?,
                analysis_height: required(motion.height, "motion.height")?,
            },
            frame: FrameConfig {
                width: required(frame.width, "frame.width")?,
                height: required(frame.height, "frame.height")?,
                target_fps: frame.target_fps.unwrap_or(DEFAULT_STREAM_FPS),
            },
            faces: FaceConfig {
                scan_interval: seconds(
                    required(faces.scan_interval_secs, "faces.scan_interval_secs")?,
                    "faces.scan_interval_secs",
                )?,
                backend: faces.backend.unwrap_or_default(),
                model_path: faces.model_path,
                min_confidence: faces.min_confidence.unwrap_or(DEFAULT_FACE_MIN_CONFIDENCE),
                cooldown: seconds(
                    faces.cooldown_secs.unwrap_or(DEFAULT_FACE_COOLDOWN_SECS),
                    "faces.cooldown_secs",
                )?,
                margin_scale: faces.margin_scale.unwrap_or(DEFAULT_FACE_MARGIN_SCALE),
            },
            relay_service: RelayServiceConfig {
                dir: required(service.dir, "relay_service.dir")?,
                program: service
                    .program
                    .unwrap_or_else(|| DEFAULT_SERVICE_PROGRAM.to_string()),
                process_name: service
                    .process_name
                    .unwrap_or_else(|| DEFAULT_SERVICE_PROCESS.to_string()),
                max_attempts: service.max_attempts.unwrap_or(DEFAULT_SERVICE_ATTEMPTS),
                settle: seconds(
                    service.settle_secs.unwrap_or(DEFAULT_SERVICE_SETTLE_SECS),
                    "relay_service.settle_secs",
                )?,
            },
            recorder: RecorderConfig {
                program: recorder
                    .program
                    .unwrap_or_else(|| DEFAULT_RECORDER_PROGRAM.to_string()),
                extension: recorder
                    .extension
                    .unwrap_or_else(|| DEFAULT_RECORDER_EXTENSION.to_string()),
                stop_grace: seconds(
                    recorder.stop_grace_secs.unwrap_or(DEFAULT_STOP_GRACE_SECS),
                    "recorder.stop_grace_secs",
                )?,
            },
            upload,
        })
    }

    fn validate(&self) -> Result<()> {
        if self.stream_url.trim().is_empty() {
            bail!("stream_url must not be empty");
        }
        if !(0.0..=1.0).contains(&self.motion.ratio_threshold) {
            bail!(
                "motion.ratio_threshold must be between 0 and 1, got {}",
                self.motion.ratio_threshold
            );
        }
        if self.motion.analysis_width == 0 || self.motion.analysis_height == 0 {
            bail!("motion.width and motion.height must be greater than zero");
        }
        if self.frame.width == 0 || self.frame.height == 0 {
            bail!("frame.width and frame.height must be greater than zero");
        }
        if self.frame.target_fps == 0 {
            bail!("frame.target_fps must be greater than zero");
        }
        if self.motion.check_interval.is_zero() {
            bail!("motion.check_interval_secs must be greater than zero");
        }
        if self.relay_capacity == 0 {
            bail!("relay_capacity must be greater than zero");
        }
        if self.relay_service.max_attempts == 0 {
            bail!("relay_service.max_attempts must be greater than zero");
        }
        if !(0.0..=1.0).contains(&self.faces.min_confidence) {
            bail!("faces.min_confidence must be between 0 and 1");
        }
        if !self.faces.margin_scale.is_finite() || self.faces.margin_scale < 1.0 {
            bail!("faces.margin_scale must be at least 1.0");
        }
        if self.faces.backend == FaceBackendKind::Tract && self.faces.model_path.is_none() {
            bail!("faces.model_path is required for the tract backend");
        }
        if self.recorder.extension.trim().is_empty() || self.recorder.extension.contains('/') {
            bail!("recorder.extension must be a bare file extension");
        }
        if let Some(upload) = &self.upload {
            let url = url::Url::parse(&upload.server_url)
                .map_err(|e| anyhow!("invalid upload.server_url '{}': {}", upload.server_url, e))?;
            if !matches!(url.scheme(), "http" | "https") {
                bail!("upload.server_url must be http or https");
            }
            if upload.device_uid.trim().is_empty() {
                bail!("upload.device_uid must not be empty");
            }
        }
        Ok(())
    }

    pub fn motion_settings(&self) -> MotionSettings {
        MotionSettings {
            analysis_width: self.motion.analysis_width,
            analysis_height: self.motion.analysis_height,
            sensitivity: self.motion.sensitivity,
            ratio_threshold: self.motion.ratio_threshold,
            blur_sigma: DEFAULT_BLUR_SIGMA,
        }
    }

    pub fn worker_settings(&self) -> MotionWorkerSettings {
        MotionWorkerSettings::new(
            self.frame.width,
            self.frame.height,
            self.faces.scan_interval,
            self.motion.check_interval,
        )
    }

    pub fn face_sampler_settings(&self) -> FaceSamplerSettings {
        FaceSamplerSettings {
            cooldown: self.faces.cooldown,
            margin_scale: self.faces.margin_scale,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }

    pub fn recorder_settings(&self) -> RecorderSettings {
        RecorderSettings {
            program: self.recorder.program.clone(),
            extension: self.recorder.extension.clone(),
            stop_grace: self.recorder.stop_grace,
            ..RecorderSettings::new(
                self.stream_url.clone(),
                self.output_dir.clone(),
                self.pid_file.clone(),
            )
        }
    }

    pub fn service_spec(&self) -> ServiceSpec {
        ServiceSpec {
            process_name: self.relay_service.process_name.clone(),
            argv: vec![self.relay_service.program.clone()],
            cwd: self.relay_service.dir.clone(),
            max_attempts: self.relay_service.max_attempts,
            settle: self.relay_service.settle,
        }
    }

    pub fn rtsp_config(&self) -> RtspConfig {
        RtspConfig {
            url: self.stream_url.clone(),
            target_fps: self.frame.target_fps,
            width: self.frame.width,
            height: self.frame.height,
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            relay_capacity: self.relay_capacity,
            capture: CaptureSettings::default(),
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }

    pub fn http_uploader_config(&self) -> Option<HttpUploaderConfig> {
        self.upload.as_ref().map(|upload| HttpUploaderConfig {
            server_url: upload.server_url.clone(),
            device_uid: upload.device_uid.clone(),
            timeout: upload.timeout,
        })
    }
}

fn apply_env(file: &mut SentryConfigFile) -> Result<()> {
    if let Some(url) = env_value("SENTRY_STREAM_URL") {
        file.stream_url = Some(url);
    }
    if let Some(dir) = env_value("SENTRY_OUTPUT_DIR") {
        file.output_dir = Some(PathBuf::from(dir));
    }
    if let Some(path) = env_value("SENTRY_PID_FILE") {
        file.pid_file = Some(PathBuf::from(path));
    }

    let motion = file.motion.get_or_insert_with(Default::default);
    override_parsed(&mut motion.ratio_threshold, "SENTRY_MOTION_RATIO_THRESHOLD")?;
    override_parsed(&mut motion.sensitivity, "SENTRY_MOTION_SENSITIVITY")?;
    override_parsed(
        &mut motion.recording_after_motion_secs,
        "SENTRY_RECORDING_AFTER_MOTION",
    )?;
    override_parsed(&mut motion.check_interval_secs, "SENTRY_MOTION_CHECK_INTERVAL")?;
    override_parsed(&mut motion.width, "SENTRY_MOTION_WIDTH")?;
    override_parsed(&mut motion.height, "SENTRY_MOTION_HEIGHT")?;

    let frame = file.frame.get_or_insert_with(Default::default);
    override_parsed(&mut frame.width, "SENTRY_FRAME_WIDTH")?;
    override_parsed(&mut frame.height, "SENTRY_FRAME_HEIGHT")?;

    let faces = file.faces.get_or_insert_with(Default::default);
    override_parsed(&mut faces.scan_interval_secs, "SENTRY_FACE_SCAN_TIME")?;

    if let Some(dir) = env_value("SENTRY_RELAY_SERVICE_DIR") {
        file.relay_service.get_or_insert_with(Default::default).dir = Some(PathBuf::from(dir));
    }

    let server_url = env_value("SENTRY_REMOTE_SERVER_URL");
    let device_uid = env_value("SENTRY_DEVICE_UID");
    if server_url.is_some() || device_uid.is_some() {
        let upload = file.upload.get_or_insert_with(Default::default);
        if server_url.is_some() {
            upload.server_url = server_url;
        }
        if device_uid.is_some() {
            upload.device_uid = device_uid;
        }
    }
    Ok(())
}

fn read_config_file(path: &Path) -> Result<SentryConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn override_parsed<T: FromStr>(slot: &mut Option<T>, key: &str) -> Result<()> {
    if let Some(raw) = env_value(key) {
        let value = raw
            .parse()
            .map_err(|_| anyhow!("{} has an invalid value '{}'", key, raw))?;
        *slot = Some(value);
    }
    Ok(())
}

fn required<T>(value: Option<T>, name: &str) -> Result<T> {
    value.ok_or_else(|| anyhow!("missing required option {}", name))
}

fn seconds(value: f64, name: &str) -> Result<Duration> {
    if !value.is_finite() || value < 0.0 {
        bail!("{} must be a non-negative number of seconds, got {}", name, value);
    }
    Ok(Duration::from_secs_f64(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_file() -> SentryConfigFile {
        SentryConfigFile {
            stream_url: Some("rtsp://127.0.0.1:8554/cam".to_string()),
            output_dir: Some(PathBuf::from("/var/lib/sentry")),
            pid_file: Some(PathBuf::from("/run/sentry/recorder.pid")),
            motion: Some(MotionConfigFile {
                ratio_threshold: Some(0.02),
                sensitivity: Some(25),
                recording_after_motion_secs: Some(10.0),
                check_interval_secs: Some(0.1),
                width: Some(320),
                height: Some(240),
            }),
            frame: Some(FrameConfigFile {
                width: Some(1280),
                height: Some(720),
                target_fps: None,
            }),
            faces: Some(FaceConfigFile {
                scan_interval_secs: Some(1.0),
                ..FaceConfigFile::default()
            }),
            relay_service: Some(RelayServiceConfigFile {
                dir: Some(PathBuf::from("/opt/mediamtx")),
                ..RelayServiceConfigFile::default()
            }),
            ..SentryConfigFile::default()
        }
    }

    #[test]
    fn defaults_fill_optional_sections() {
        let cfg = SentryConfig::from_file(complete_file()).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.relay_service.program, "./mediamtx");
        assert_eq!(cfg.relay_service.max_attempts, 3);
        assert_eq!(cfg.recorder.stop_grace, Duration::from_secs(3));
        assert_eq!(cfg.faces.backend, FaceBackendKind::None);
        assert_eq!(cfg.faces.cooldown, Duration::from_secs(3));
        assert_eq!(cfg.relay_capacity, 3);
        assert!(cfg.upload.is_none());
        assert_eq!(cfg.motion.check_interval, Duration::from_millis(100));
    }

    #[test]
    fn missing_required_option_is_named() {
        let mut file = complete_file();
        file.pid_file = None;
        let err = SentryConfig::from_file(file).unwrap_err();
        assert!(err.to_string().contains("pid_file"), "{}", err);
    }

    #[test]
    fn rejects_out_of_range_motion_values() {
        let mut file = complete_file();
        file.motion.as_mut().unwrap().sensitivity = Some(0);
        assert!(SentryConfig::from_file(file).is_err());

        let mut file = complete_file();
        file.motion.as_mut().unwrap().ratio_threshold = Some(1.5);
        let cfg = SentryConfig::from_file(file).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn tract_backend_needs_model_path() {
        let mut file = complete_file();
        file.faces.as_mut().unwrap().backend = Some(FaceBackendKind::Tract);
        let cfg = SentryConfig::from_file(file).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn derived_settings_follow_config() {
        let cfg = SentryConfig::from_file(complete_file()).unwrap();
        let recorder = cfg.recorder_settings();
        assert_eq!(recorder.program, "ffmpeg");
        assert_eq!(recorder.pid_file, PathBuf::from("/run/sentry/recorder.pid"));
        let spec = cfg.service_spec();
        assert_eq!(spec.argv, vec!["./mediamtx"]);
        assert_eq!(spec.cwd, PathBuf::from("/opt/mediamtx"));
        assert_eq!(cfg.motion_settings().sensitivity, 25);
    }
}
