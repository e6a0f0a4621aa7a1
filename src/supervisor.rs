//! Managed overlay process supervision on the node
//!
//! ## Overview
//! - Spawns `nebula -config <dir>/config.yml` and watches it
//! - Exponential backoff on crashes, reset after five good minutes
//! - Graceful stop on restart signals and shutdown
//!
//! The child handle and current backoff live under one mutex; the wait is
//! a short periodic `try_wait` under the guard, so the lock is never held
//! across an await. Output capture reads the PID under the same guard
//! before logging.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Notify, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Initial crash backoff.
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
/// Backoff ceiling.
const BACKOFF_MAX: Duration = Duration::from_secs(60);
/// A run at least this long resets the backoff.
const BACKOFF_RESET_UPTIME: Duration = Duration::from_secs(5 * 60);
/// Grace period between SIGTERM and SIGKILL on stop.
const STOP_GRACE: Duration = Duration::from_secs(10);
/// How often the run loop polls the child for exit.
const WAIT_POLL: Duration = Duration::from_millis(250);

/// Double the delay, capped.
fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(BACKOFF_MAX)
}

/// Observable supervisor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
    Stopping,
    BackingOff,
}

struct Guarded {
    child: Option<Child>,
    backoff: Duration,
    state: SupervisorState,
}

/// Shared view of the supervisor, handed to the poller so an apply can
/// trigger a restart, and to tests.
pub struct SupervisorHandle {
    cluster_id: Uuid,
    guarded: Mutex<Guarded>,
    restart: Notify,
}

impl SupervisorHandle {
    fn new(cluster_id: Uuid) -> Self {
        SupervisorHandle {
            cluster_id,
            guarded: Mutex::new(Guarded {
                child: None,
                backoff: BACKOFF_INITIAL,
                state: SupervisorState::Stopped,
            }),
            restart: Notify::new(),
        }
    }

    /// Ask the run loop to gracefully restart the child (new config on
    /// disk).
    pub fn request_restart(&self) {
        debug!(cluster_id = %self.cluster_id, "restart requested");
        self.restart.notify_one();
    }

    /// Current child PID, if one is running.
    pub fn pid(&self) -> Option<u32> {
        self.guarded.lock().child.as_ref().and_then(|c| c.id())
    }

    pub fn state(&self) -> SupervisorState {
        self.guarded.lock().state
    }

    fn set_state(&self, state: SupervisorState) {
        self.guarded.lock().state = state;
    }
}

/// Owns one overlay child for one cluster worker.
pub struct ProcessSupervisor {
    binary: PathBuf,
    config_dir: PathBuf,
    handle: Arc<SupervisorHandle>,
}

impl ProcessSupervisor {
    pub fn new(cluster_id: Uuid, binary: PathBuf, config_dir: PathBuf) -> Self {
        ProcessSupervisor {
            binary,
            config_dir,
            handle: Arc::new(SupervisorHandle::new(cluster_id)),
        }
    }

    pub fn handle(&self) -> Arc<SupervisorHandle> {
        self.handle.clone()
    }

    fn spawn_child(&self) -> std::io::Result<Child> {
        Command::new(&self.binary)
            .arg("-config")
            .arg(self.config_dir.join("config.yml"))
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }

    /// Pipe child output into the structured log, line by line. The PID
    /// each capture task tags lines with is read under the guard.
    fn capture_output(
        &self,
        stdout: Option<tokio::process::ChildStdout>,
        stderr: Option<tokio::process::ChildStderr>,
    ) {
        let cluster_id = self.handle.cluster_id;
        if let Some(stdout) = stdout {
            let handle = self.handle.clone();
            tokio::spawn(async move {
                let pid = handle.pid();
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(cluster_id = %cluster_id, pid, stream = "stdout", "{line}");
                }
            });
        }
        if let Some(stderr) = stderr {
            let handle = self.handle.clone();
            tokio::spawn(async move {
                let pid = handle.pid();
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(cluster_id = %cluster_id, pid, stream = "stderr", "{line}");
                }
            });
        }
    }

    /// Take the child out of the guard and stop it: SIGTERM, wait up to
    /// the grace period, then SIGKILL.
    async fn stop_child(&self) {
        let child = self.handle.guarded.lock().child.take();
        let Some(mut child) = child else { return };
        self.handle.set_state(SupervisorState::Stopping);

        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            match tokio::time::timeout(STOP_GRACE, child.wait()).await {
                Ok(_) => {
                    debug!(cluster_id = %self.handle.cluster_id, pid, "child exited gracefully");
                    self.handle.set_state(SupervisorState::Stopped);
                    return;
                }
                Err(_) => {
                    warn!(
                        cluster_id = %self.handle.cluster_id,
                        pid,
                        "child ignored SIGTERM, killing"
                    );
                }
            }
        }
        let _ = child.kill().await;
        self.handle.set_state(SupervisorState::Stopped);
    }

    /// Poll the guarded child for exit without holding the lock across an
    /// await. Returns the exit status once observed.
    async fn wait_for_exit(&self) -> Option<std::process::ExitStatus> {
        loop {
            {
                let mut guarded = self.handle.guarded.lock();
                match guarded.child.as_mut().map(|c| c.try_wait()) {
                    None => return None,
                    Some(Ok(Some(status))) => {
                        guarded.child = None;
                        return Some(status);
                    }
                    Some(Ok(None)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "child wait failed");
                        guarded.child = None;
                        return None;
                    }
                }
            }
            tokio::time::sleep(WAIT_POLL).await;
        }
    }

    /// Supervisor loop: Stopped → Starting → Running with crash backoff,
    /// until the shutdown channel flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let cluster_id = self.handle.cluster_id;
        loop {
            if *shutdown.borrow() {
                break;
            }

            self.handle.set_state(SupervisorState::Starting);
            let mut child = match self.spawn_child() {
                Ok(child) => child,
                Err(e) => {
                    let backoff = {
                        let mut guarded = self.handle.guarded.lock();
                        guarded.state = SupervisorState::BackingOff;
                        let current = guarded.backoff;
                        guarded.backoff = next_backoff(current);
                        current
                    };
                    warn!(
                        cluster_id = %cluster_id,
                        binary = %self.binary.display(),
                        error = %e,
                        backoff_secs = backoff.as_secs(),
                        "overlay spawn failed"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => continue,
                        _ = shutdown.changed() => break,
                    }
                }
            };

            let started = Instant::now();
            let pid = child.id();
            let stdout = child.stdout.take();
            let stderr = child.stderr.take();
            {
                let mut guarded = self.handle.guarded.lock();
                guarded.child = Some(child);
                guarded.state = SupervisorState::Running;
            }
            info!(cluster_id = %cluster_id, pid, "overlay process running");
            self.capture_output(stdout, stderr);

            tokio::select! {
                status = self.wait_for_exit() => {
                    let uptime = started.elapsed();
                    let backoff = {
                        let mut guarded = self.handle.guarded.lock();
                        guarded.state = SupervisorState::BackingOff;
                        if uptime >= BACKOFF_RESET_UPTIME {
                            guarded.backoff = BACKOFF_INITIAL;
                        }
                        let current = guarded.backoff;
                        guarded.backoff = next_backoff(current);
                        current
                    };
                    warn!(
                        cluster_id = %cluster_id,
                        status = ?status,
                        uptime_secs = uptime.as_secs(),
                        backoff_secs = backoff.as_secs(),
                        "overlay process exited"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.handle.restart.notified() => {}
                        _ = shutdown.changed() => break,
                    }
                }
                _ = self.handle.restart.notified() => {
                    info!(cluster_id = %cluster_id, "restarting overlay process");
                    self.stop_child().await;
                }
                _ = shutdown.changed() => break,
            }
        }

        self.stop_child().await;
        self.handle.set_state(SupervisorState::Stopped);
        debug!(cluster_id = %cluster_id, "supervisor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut delay = BACKOFF_INITIAL;
        let mut seen = Vec::new();
        for _ in 0..8 {
            seen.push(delay.as_secs());
            delay = next_backoff(delay);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }
}
