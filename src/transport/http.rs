use anyhow::{anyhow, bail, Context, Result};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use std::time::Duration;
use url::Url;

use super::{endpoint, face_file_name, EpisodeMetadata, Uploader};
use crate::faces::FaceCapture;

const DEVICE_HEADER: &str = "X-Device-UID";
const EPISODE_PATH: &str = "videos/save-info-about-video/";
const FACE_PATH: &str = "analyze/upload-face-to-analyze/";

#[derive(Clone, Debug)]
pub struct HttpUploaderConfig {
    pub server_url: String,
    pub device_uid: String,
    pub timeout: Duration,
}

#[derive(Serialize)]
struct EpisodeBody<'a> {
    file_path: &'a str,
    recorded_at: String,
}

/// Posts episode metadata and face crops to the remote analysis server.
pub struct HttpUploader {
    agent: ureq::Agent,
    episode_url: Url,
    face_url: Url,
    device_uid: String,
}

impl HttpUploader {
    pub fn new(config: HttpUploaderConfig) -> Result<Self> {
        let mut base = Url::parse(&config.server_url)
            .with_context(|| format!("invalid upload server url '{}'", config.server_url))?;
        if !matches!(base.scheme(), "http" | "https") {
            bail!("upload server url must be http(s), got '{}'", base.scheme());
        }
        // Endpoints are joined relative to the base, which needs a trailing slash.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        if config.device_uid.trim().is_empty() {
            bail!("upload device uid must not be empty");
        }
        let agent = ureq::AgentBuilder::new().timeout(config.timeout).build();
        Ok(Self {
            agent,
            episode_url: endpoint(&base, EPISODE_PATH)?,
            face_url: endpoint(&base, FACE_PATH)?,
            device_uid: config.device_uid,
        })
    }

    pub fn episode_url(&self) -> &Url {
        &self.episode_url
    }

    pub fn face_url(&self) -> &Url {
        &self.face_url
    }

    fn post(&self, url: &Url, content_type: &str, body: &[u8]) -> Result<()> {
        match self
            .agent
            .post(url.as_str())
            .set(DEVICE_HEADER, &self.device_uid)
            .set("Content-Type", content_type)
            .send_bytes(body)
        {
            Ok(response) => {
                log::debug!("POST {} -> {}", url, response.status());
                Ok(())
            }
            Err(ureq::Error::Status(code, _)) => Err(anyhow!("POST {} returned {}", url, code)),
            Err(e) => Err(anyhow!("POST {} failed: {}", url, e)),
        }
    }
}

impl Uploader for HttpUploader {
    fn upload_episode_metadata(&self, metadata: &EpisodeMetadata) -> Result<()> {
        let file_name = metadata.file_name();
        let body = serde_json::to_vec(&EpisodeBody {
            file_path: &file_name,
            recorded_at: metadata.started_at.to_rfc3339(),
        })?;
        self.post(&self.episode_url, "application/json", &body)
            .context("episode metadata upload")?;
        log::info!("episode {} reported", file_name);
        Ok(())
    }

    fn upload_face_crop(&self, capture: FaceCapture) -> Result<()> {
        let boundary = multipart_boundary();
        let body = multipart_body(&boundary, &capture);
        self.post(
            &self.face_url,
            &format!("multipart/form-data; boundary={}", boundary),
            &body,
        )
        .context("face crop upload")?;
        log::info!(
            "face crop uploaded ({} bytes, confidence {:.2})",
            capture.jpeg.len(),
            capture.confidence
        );
        Ok(())
    }
}

fn multipart_boundary() -> String {
    let token: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect();
    format!("----sentry{}", token)
}

/// `recorded_at` text field followed by the JPEG as part `file`.
fn multipart_body(boundary: &str, capture: &FaceCapture) -> Vec<u8> {
    let mut body = Vec::with_capacity(capture.jpeg.len() + 512);
    body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(b"Content-Disposition: form-data; name=\"recorded_at\"\r\n\r\n");
    body.extend_from_slice(capture.captured_at.to_rfc3339().as_bytes());
    body.extend_from_slice(b"\r\n");
    body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\n",
            face_file_name(capture)
        )
        .as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
    body.extend_from_slice(&capture.jpeg);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    body
}
