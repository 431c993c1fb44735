/// Worker host: holds the singleton lock, runs the payload once per tick and
/// publishes a heartbeat at every loop boundary and during the inter-tick
/// sleep.
///
/// Heartbeats are never written while a task is in flight, so a hung task
/// shows up to the watchdog as a stale heartbeat.
use crate::config::{TaskConfig, WorkerConfig};
use crate::heartbeat::{HeartbeatError, HeartbeatStore, StatusTracker, WorkerState};
use crate::lock::{LockError, LockManager};
use crate::runtime_dir::RuntimeDir;
use crate::signals::{self, ShutdownSignal};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;

/// Result of one payload run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded { detail: String },
    Failed { detail: String },
    /// Cut short by an urgent shutdown.
    Aborted,
}

/// Work performed once per tick.
pub trait Payload {
    /// Run one unit of work. Implementations should return `Aborted` promptly
    /// once `shutdown` turns urgent.
    async fn run_task(&mut self, shutdown: &ShutdownSignal) -> TaskOutcome;
}

/// Payload that runs the configured `[task]` command.
#[derive(Debug, Clone)]
pub struct CommandPayload {
    command: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandPayload {
    pub fn from_config(task: &TaskConfig) -> Result<Self, WorkerError> {
        let command = task
            .command
            .clone()
            .filter(|c| !c.trim().is_empty())
            .ok_or(WorkerError::NoTask)?;
        Ok(Self {
            command,
            args: task.args.clone(),
            working_dir: task.working_dir.clone(),
        })
    }
}

impl Payload for CommandPayload {
    async fn run_task(&mut self, shutdown: &ShutdownSignal) -> TaskOutcome {
        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let start = Instant::now();
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return TaskOutcome::Failed {
                    detail: format!("failed to spawn {}: {e}", self.command),
                }
            }
        };
        let pid = child.id().unwrap_or(0);
        tracing::debug!(pid, command = %self.command, "task started");

        tokio::select! {
            status = child.wait() => {
                let duration_ms = start.elapsed().as_millis() as u64;
                match status {
                    Ok(status) if status.success() => TaskOutcome::Succeeded {
                        detail: format!("task ok in {duration_ms}ms"),
                    },
                    Ok(status) => TaskOutcome::Failed {
                        detail: format!("task exited with {status} after {duration_ms}ms"),
                    },
                    Err(e) => TaskOutcome::Failed {
                        detail: format!("failed to wait for task: {e}"),
                    },
                }
            }
            _ = shutdown.urgent() => {
                tracing::warn!(pid, "killing in-flight task");
                if let Err(e) = child.kill().await {
                    tracing::warn!(pid, error = %e, "failed to kill task");
                }
                TaskOutcome::Aborted
            }
        }
    }
}

/// Loop timing and self-health settings.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub tick_interval: Duration,
    pub heartbeat_interval: Duration,
    pub unhealthy_after_failures: u32,
    pub max_diagnostics: usize,
}

impl LoopSettings {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            tick_interval: config.tick_interval(),
            heartbeat_interval: config.heartbeat_interval(),
            unhealthy_after_failures: config.unhealthy_after_failures,
            max_diagnostics: config.max_diagnostics,
        }
    }
}

/// Statistics returned when the loop exits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub ticks: u64,
    pub failed_ticks: u64,
    pub reason: String,
}

pub struct WorkerHost<P: Payload> {
    runtime: RuntimeDir,
    settings: LoopSettings,
    payload: P,
    shutdown: ShutdownSignal,
}

impl<P: Payload> WorkerHost<P> {
    pub fn new(
        runtime: RuntimeDir,
        settings: LoopSettings,
        payload: P,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            runtime,
            settings,
            payload,
            shutdown,
        }
    }

    /// Run until shutdown. Fails fast, before the loop starts, if the lock
    /// is held elsewhere or the first status record cannot be written.
    pub async fn run(mut self) -> Result<WorkerSummary, WorkerError> {
        self.runtime
            .init()
            .map_err(|e| WorkerError::RuntimeDir {
                path: self.runtime.root().to_path_buf(),
                source: e,
            })?;

        let locks = LockManager::new(self.runtime.root());
        let mut lock = locks.acquire(self.runtime.identity())?;
        if let Some(previous) = lock.recovered_from() {
            tracing::info!(previous_pid = previous, "took over from a dead worker");
        }

        let store = HeartbeatStore::new(self.runtime.status());
        let mut tracker = StatusTracker::new(
            store,
            self.settings.unhealthy_after_failures,
            self.settings.max_diagnostics,
        );
        if let Err(e) = tracker.try_update(WorkerState::Starting, "starting") {
            // Nothing can observe us without a status file; give the
            // identity back rather than run invisibly.
            if let Err(release_err) = lock.release() {
                tracing::warn!(error = %release_err, "failed to release lock after startup failure");
            }
            return Err(WorkerError::Status(e));
        }
        tracing::info!(
            identity = %self.runtime.identity(),
            pid = lock.pid(),
            tick_secs = self.settings.tick_interval.as_secs_f64(),
            "worker started"
        );

        let mut summary = WorkerSummary::default();
        let reason = loop {
            if self.shutdown.is_requested() {
                break self.stop_reason();
            }

            let tick_start = Instant::now();
            summary.ticks += 1;
            tracker.update(WorkerState::Running, &format!("tick {}", summary.ticks));

            match self.payload.run_task(&self.shutdown).await {
                TaskOutcome::Succeeded { detail } => {
                    tracing::debug!(tick = summary.ticks, "{detail}");
                    tracker.record_tick(true, &detail);
                }
                TaskOutcome::Failed { detail } => {
                    summary.failed_ticks += 1;
                    tracing::warn!(tick = summary.ticks, "task failed: {detail}");
                    tracker.record_tick(false, &detail);
                }
                TaskOutcome::Aborted => {
                    summary.failed_ticks += 1;
                    tracker.record_tick(false, "task aborted by shutdown");
                    break self.stop_reason();
                }
            }

            if !tracker.self_healthy() {
                let message = format!(
                    "{} consecutive failed ticks",
                    tracker.consecutive_failures()
                );
                tracing::error!("{message}");
                tracker.update(WorkerState::Error, &message);
            }

            if self.shutdown.is_requested() {
                break self.stop_reason();
            }

            self.sleep_until_next_tick(&mut tracker, tick_start).await;
        };

        tracker.update(WorkerState::ShuttingDown, &reason);
        signals::finish(&mut tracker, &mut lock, &reason);
        summary.reason = reason;
        Ok(summary)
    }

    fn stop_reason(&self) -> String {
        match self.shutdown.signal_name() {
            Some(name) => format!("received {name}"),
            None => "shutdown requested".to_string(),
        }
    }

    /// Sleep out the rest of the tick, refreshing the heartbeat every
    /// `heartbeat_interval`. Returns early on shutdown.
    async fn sleep_until_next_tick(&self, tracker: &mut StatusTracker, tick_start: Instant) {
        let next_tick = tick_start + self.settings.tick_interval;
        loop {
            let now = Instant::now();
            if now >= next_tick {
                return;
            }
            let state = if tracker.self_healthy() {
                WorkerState::Sleeping
            } else {
                WorkerState::Error
            };
            let remaining = next_tick - now;
            tracker.update(
                state,
                &format!("next tick in {}s", remaining.as_secs()),
            );
            let slice = remaining.min(self.settings.heartbeat_interval);
            tokio::select! {
                _ = tokio::time::sleep(slice) => {}
                _ = self.shutdown.requested() => return,
            }
        }
    }
}

/// Errors that stop the worker before or outside its loop.
#[derive(Debug)]
pub enum WorkerError {
    /// No `[task] command` configured.
    NoTask,
    RuntimeDir {
        path: PathBuf,
        source: std::io::Error,
    },
    Lock(LockError),
    /// The first status record could not be written.
    Status(HeartbeatError),
    Signals(std::io::Error),
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerError::NoTask => write!(f, "no task command configured ([task] command)"),
            WorkerError::RuntimeDir { path, source } => {
                write!(
                    f,
                    "failed to create runtime directory {}: {}",
                    path.display(),
                    source
                )
            }
            WorkerError::Lock(e) => write!(f, "{e}"),
            WorkerError::Status(e) => write!(f, "failed to publish initial status: {e}"),
            WorkerError::Signals(e) => write!(f, "failed to install signal handlers: {e}"),
        }
    }
}

impl std::error::Error for WorkerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WorkerError::NoTask => None,
            WorkerError::RuntimeDir { source, .. } => Some(source),
            WorkerError::Lock(e) => Some(e),
            WorkerError::Status(e) => Some(e),
            WorkerError::Signals(e) => Some(e),
        }
    }
}

impl From<LockError> for WorkerError {
    fn from(e: LockError) -> Self {
        WorkerError::Lock(e)
    }
}
