use anyhow::{Context, Result};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use super::{ProcessControl, StopOutcome};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// `ProcessControl` backed by `pgrep` and `std::process`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemProcesses;

impl ProcessControl for SystemProcesses {
    fn is_running(&self, name: &str) -> bool {
        match Command::new("pgrep")
            .arg("-f")
            .arg(name)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
        {
            Ok(output) => !String::from_utf8_lossy(&output.stdout).trim().is_empty(),
            Err(e) => {
                log::error!("supervisor: failed to query process list for {}: {}", name, e);
                false
            }
        }
    }

    fn spawn(&self, argv: &[String], cwd: &Path) -> Result<u32> {
        let (program, args) = argv
            .split_first()
            .context("cannot spawn an empty command")?;
        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        detach(&mut command);
        let child = command
            .spawn()
            .with_context(|| format!("spawn {} in {}", program, cwd.display()))?;
        Ok(child.id())
    }
}

/// Put the child in its own process group so signals to the daemon do not
/// reach it and a forced kill can take down its whole tree.
pub(crate) fn detach(command: &mut Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    #[cfg(not(unix))]
    let _ = command;
}

/// Ask `child` to exit, wait up to `grace`, then kill its process group.
pub fn terminate_gracefully(child: &mut Child, grace: Duration) -> StopOutcome {
    match child.try_wait() {
        Ok(Some(_)) => return StopOutcome::Stopped,
        Ok(None) => {}
        Err(e) => log::warn!("supervisor: cannot poll pid {}: {}", child.id(), e),
    }

    send_terminate(child);
    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return StopOutcome::Stopped,
            Ok(None) if Instant::now() < deadline => std::thread::sleep(EXIT_POLL_INTERVAL),
            Ok(None) => break,
            Err(e) => {
                log::warn!("supervisor: cannot poll pid {}: {}", child.id(), e);
                break;
            }
        }
    }

    log::warn!(
        "supervisor: pid {} did not exit within {:?}, killing its process group",
        child.id(),
        grace
    );
    kill_group(child);
    if let Err(e) = child.wait() {
        log::error!("supervisor: failed to reap pid {}: {}", child.id(), e);
    }
    StopOutcome::KillRequired
}

#[cfg(unix)]
fn send_terminate(child: &Child) {
    let Ok(pid) = libc::pid_t::try_from(child.id()) else {
        return;
    };
    // SAFETY: plain kill(2) on a pid we spawned and have not reaped yet.
    if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
        log::warn!(
            "supervisor: SIGTERM to pid {} failed: {}",
            pid,
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn send_terminate(_child: &Child) {}

#[cfg(unix)]
fn kill_group(child: &mut Child) {
    let Ok(pgid) = libc::pid_t::try_from(child.id()) else {
        return;
    };
    // SAFETY: the child was spawned with process_group(0), so its pid is its pgid.
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } != 0 {
        log::error!(
            "supervisor: SIGKILL to process group {} failed: {}",
            pgid,
            std::io::Error::last_os_error()
        );
        if let Err(e) = child.kill() {
            log::error!("supervisor: kill of pid {} failed: {}", pgid, e);
        }
    }
}

#[cfg(not(unix))]
fn kill_group(child: &mut Child) {
    if let Err(e) = child.kill() {
        log::error!("supervisor: kill of pid {} failed: {}", child.id(), e);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
