use anyhow::{anyhow, Result};
use std::path::PathBuf;
use std::time::Duration;

use super::ProcessControl;

/// How to find and start the streaming-relay service.
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceSpec {
    /// Pattern matched against running command lines.
    pub process_name: String,
    /// Command used to start the service.
    pub argv: Vec<String>,
    /// Working directory for the service.
    pub cwd: PathBuf,
    pub max_attempts: u32,
    /// Delay between spawn and the liveness re-check.
    pub settle: Duration,
}

impl ServiceSpec {
    pub fn mediamtx(cwd: PathBuf) -> Self {
        Self {
            process_name: "mediamtx".to_string(),
            argv: vec!["./mediamtx".to_string()],
            cwd,
            max_attempts: 3,
            settle: Duration::from_secs(2),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceStatus {
    AlreadyRunning,
    Started { attempts: u32 },
}

/// Start the service unless it is already running.
///
/// Fails after `max_attempts` spawns that did not leave the service running.
pub fn ensure_service_running(
    control: &dyn ProcessControl,
    spec: &ServiceSpec,
    mut sleep: impl FnMut(Duration),
) -> Result<ServiceStatus> {
    if control.is_running(&spec.process_name) {
        log::info!("supervisor: {} already running", spec.process_name);
        return Ok(ServiceStatus::AlreadyRunning);
    }

    log::info!("supervisor: {} not running, starting it", spec.process_name);
    for attempt in 1..=spec.max_attempts {
        match control.spawn(&spec.argv, &spec.cwd) {
            Ok(pid) => {
                log::info!(
                    "supervisor: {} spawned (pid {}), waiting {:?}",
                    spec.process_name,
                    pid,
                    spec.settle
                );
                sleep(spec.settle);
                if control.is_running(&spec.process_name) {
                    log::info!("supervisor: {} is running", spec.process_name);
                    return Ok(ServiceStatus::Started { attempts: attempt });
                }
                log::warn!(
                    "supervisor: {} not running after start (attempt {}/{})",
                    spec.process_name,
                    attempt,
                    spec.max_attempts
                );
            }
            Err(e) => log::error!(
                "supervisor: failed to start {} (attempt {}/{}): {:#}",
                spec.process_name,
                attempt,
                spec.max_attempts,
                e
            ),
        }
    }

    Err(anyhow!(
        "{} failed to start after {} attempts",
        spec.process_name,
        spec.max_attempts
    ))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
