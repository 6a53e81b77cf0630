//! Heartbeat watchdog for long-running worker processes.
//!
//! The host process writes its current [`WorkerStatus`] and beats a shared
//! [`Heartbeat`]. The [`Watchdog`] polls it and, once the time since the last
//! beat exceeds the limit for the current status, hands the timeout to its
//! [`Terminator`]. The default terminator kills the whole process group.

use std::fmt::Display;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::getpgrp;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::error::{QueueError, Result};

/// Exit status used after a forced kill (128 + SIGKILL).
pub const KILLED_EXIT_CODE: i32 = 137;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Starting,
    Idle,
    Busy,
    Installing,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Starting => "starting",
            WorkerStatus::Idle => "idle",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Installing => "installing",
        }
    }
}

impl Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub poll_interval: Duration,
    pub starting_timeout: Duration,
    pub idle_timeout: Duration,
    pub busy_timeout: Duration,
    pub installing_timeout: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            starting_timeout: Duration::from_secs(120),
            idle_timeout: Duration::from_secs(120),
            busy_timeout: Duration::from_secs(3600),
            installing_timeout: Duration::from_secs(6 * 3600),
        }
    }
}

impl WatchdogConfig {
    pub fn limit_for(&self, status: WorkerStatus) -> Duration {
        match status {
            WorkerStatus::Starting => self.starting_timeout,
            WorkerStatus::Idle => self.idle_timeout,
            WorkerStatus::Busy => self.busy_timeout,
            WorkerStatus::Installing => self.installing_timeout,
        }
    }
}

#[derive(Debug)]
struct HeartbeatState {
    status: WorkerStatus,
    last_heartbeat: Instant,
}

/// Cloneable handle to the host's heartbeat; every clone sees the same state.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    state: Arc<Mutex<HeartbeatState>>,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

impl Heartbeat {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HeartbeatState {
                status: WorkerStatus::Starting,
                last_heartbeat: Instant::now(),
            })),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut HeartbeatState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut state)
    }

    pub fn beat(&self) {
        self.with_state(|state| state.last_heartbeat = Instant::now());
    }

    /// Switches status and counts as a beat.
    pub fn set_status(&self, status: WorkerStatus) {
        self.with_state(|state| {
            if state.status != status {
                debug!(from = %state.status, to = %status, "Worker status changed");
            }
            state.status = status;
            state.last_heartbeat = Instant::now();
        });
    }

    pub fn status(&self) -> WorkerStatus {
        self.with_state(|state| state.status)
    }

    /// Current status and time since the last beat.
    pub fn snapshot(&self) -> (WorkerStatus, Duration) {
        self.with_state(|state| {
            (
                state.status,
                Instant::now().saturating_duration_since(state.last_heartbeat),
            )
        })
    }
}

/// What to do once a timeout is detected.
pub trait Terminator: Send + Sync + 'static {
    fn terminate(&self, reason: &QueueError);
}

/// SIGKILLs the caller's process group, then exits with status 137.
/// The group includes every tool the worker spawned.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessTreeTerminator;

impl Terminator for ProcessTreeTerminator {
    fn terminate(&self, reason: &QueueError) {
        error!("Watchdog killing process tree: {}", reason);
        if let Err(e) = killpg(getpgrp(), Signal::SIGKILL) {
            error!(error = %e, "Failed to signal process group");
        }
        std::process::exit(KILLED_EXIT_CODE);
    }
}

pub struct Watchdog<T: Terminator = ProcessTreeTerminator> {
    heartbeat: Heartbeat,
    config: WatchdogConfig,
    terminator: T,
    shutdown: Arc<Notify>,
}

impl<T: Terminator> Watchdog<T> {
    pub fn new(heartbeat: Heartbeat, config: WatchdogConfig, terminator: T) -> Self {
        Self {
            heartbeat,
            config,
            terminator,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// `Err(WatchdogTimeout)` once the last beat is older than the current status allows.
    pub fn check(&self) -> Result<()> {
        let (status, age) = self.heartbeat.snapshot();
        let limit = self.config.limit_for(status);
        if age > limit {
            return Err(QueueError::WatchdogTimeout { status, age, limit });
        }
        Ok(())
    }

    /// Polls until shutdown is signalled or a timeout is handed to the terminator.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            busy_timeout_secs = self.config.busy_timeout.as_secs(),
            "Watchdog started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Watchdog received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.check() {
                        self.terminator.terminate(&e);
                        break;
                    }
                }
            }
        }
    }
}
