/// Status file: the worker's self-report, rewritten on every loop boundary.
///
/// Uses atomic write pattern: write to temp file then rename. The watchdog
/// only ever reads it.
use crate::atomic::{write_atomic, AtomicWriteError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;

/// Worker states written to the status file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Starting,
    Running,
    Sleeping,
    Error,
    ShuttingDown,
    Stopped,
}

/// The JSON payload written to `<identity>.status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub uptime_seconds: u64,
    #[serde(default)]
    pub uptime_human: String,
    /// Self-reported; the watchdog treats it as advisory.
    pub healthy: bool,
    pub state_label: WorkerState,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub ticks_completed: u64,
    #[serde(default)]
    pub ticks_failed: u64,
    #[serde(default)]
    pub last_success_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub diagnostics: Vec<String>,
}

/// Reads and writes the status file.
#[derive(Debug, Clone)]
pub struct HeartbeatStore {
    path: PathBuf,
}

impl HeartbeatStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Atomically replace the status file with `record`.
    pub fn write(&self, record: &StatusRecord) -> Result<(), HeartbeatError> {
        let json = serde_json::to_string_pretty(record)
            .map_err(|e| HeartbeatError::Serialize { source: e })?;
        write_atomic(&self.path, json.as_bytes()).map_err(|e| HeartbeatError::Write { source: e })
    }

    /// Read the current record. `Missing` and `Corrupt` are expected
    /// outcomes the caller must handle, not crashes.
    pub fn read(&self) -> Result<StatusRecord, HeartbeatError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(HeartbeatError::Missing {
                    path: self.path.clone(),
                })
            }
            Err(e) => {
                return Err(HeartbeatError::Read {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };
        serde_json::from_str(&contents).map_err(|e| HeartbeatError::Corrupt {
            path: self.path.clone(),
            source: e,
        })
    }

    /// Remove the status file. Missing is fine.
    pub fn clear(&self) -> std::io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    #[cfg(test)]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

/// Worker-side builder of StatusRecords.
///
/// Keeps `last_heartbeat_at` non-decreasing even if the wall clock steps
/// backwards, and bounds the diagnostics it carries.
pub struct StatusTracker {
    store: HeartbeatStore,
    pid: u32,
    started_at: DateTime<Utc>,
    last_heartbeat_at: Option<DateTime<Utc>>,
    ticks_completed: u64,
    ticks_failed: u64,
    consecutive_failures: u32,
    unhealthy_after_failures: u32,
    last_success_at: Option<DateTime<Utc>>,
    diagnostics: VecDeque<String>,
    max_diagnostics: usize,
}

impl StatusTracker {
    pub fn new(store: HeartbeatStore, unhealthy_after_failures: u32, max_diagnostics: usize) -> Self {
        Self {
            store,
            pid: std::process::id(),
            started_at: Utc::now(),
            last_heartbeat_at: None,
            ticks_completed: 0,
            ticks_failed: 0,
            consecutive_failures: 0,
            unhealthy_after_failures,
            last_success_at: None,
            diagnostics: VecDeque::new(),
            max_diagnostics,
        }
    }

    /// Write a heartbeat; failures are logged, not propagated. Used inside
    /// the run loop where a missed heartbeat must not kill the worker.
    pub fn update(&mut self, state: WorkerState, message: &str) {
        if let Err(e) = self.try_update(state, message) {
            tracing::warn!(error = %e, "failed to write status file");
        }
    }

    /// Write a heartbeat and report failure.
    pub fn try_update(&mut self, state: WorkerState, message: &str) -> Result<(), HeartbeatError> {
        self.try_update_at(state, message, Utc::now())
    }

    fn try_update_at(
        &mut self,
        state: WorkerState,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), HeartbeatError> {
        let record = self.snapshot(state, message, now);
        self.store.write(&record)?;
        self.last_heartbeat_at = Some(record.last_heartbeat_at);
        Ok(())
    }

    /// Build the record that would be written at `now`.
    pub fn snapshot(&self, state: WorkerState, message: &str, now: DateTime<Utc>) -> StatusRecord {
        let heartbeat = match self.last_heartbeat_at {
            Some(prev) if prev > now => prev,
            _ => now,
        };
        let uptime_seconds = (heartbeat - self.started_at).num_seconds().max(0) as u64;
        let healthy = !matches!(state, WorkerState::Stopped | WorkerState::ShuttingDown)
            && self.self_healthy();
        StatusRecord {
            pid: self.pid,
            started_at: self.started_at,
            last_heartbeat_at: heartbeat,
            uptime_seconds,
            uptime_human: format_uptime(uptime_seconds),
            healthy,
            state_label: state,
            message: message.to_string(),
            ticks_completed: self.ticks_completed,
            ticks_failed: self.ticks_failed,
            last_success_at: self.last_success_at,
            diagnostics: self.diagnostics.iter().cloned().collect(),
        }
    }

    /// Record the end of one payload tick.
    pub fn record_tick(&mut self, success: bool, detail: &str) {
        if success {
            self.ticks_completed += 1;
            self.consecutive_failures = 0;
            self.last_success_at = Some(Utc::now());
        } else {
            self.ticks_failed += 1;
            self.consecutive_failures += 1;
        }
        self.push_diagnostic(detail);
    }

    /// Append a diagnostic line, dropping the oldest past the bound.
    pub fn push_diagnostic(&mut self, line: &str) {
        if self.max_diagnostics == 0 {
            return;
        }
        if self.diagnostics.len() == self.max_diagnostics {
            self.diagnostics.pop_front();
        }
        self.diagnostics
            .push_back(format!("{} {line}", Utc::now().format("%Y-%m-%dT%H:%M:%SZ")));
    }

    /// The worker's own verdict: healthy until too many ticks fail in a row.
    pub fn self_healthy(&self) -> bool {
        self.unhealthy_after_failures == 0 || self.consecutive_failures < self.unhealthy_after_failures
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

/// Human readable uptime: `3d 4h 12m`, `4h 12m`, `12m`.
pub fn format_uptime(seconds: u64) -> String {
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3_600;
    let minutes = (seconds % 3_600) / 60;
    if days > 0 {
        format!("{days}d {hours}h {minutes}m")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}

/// Errors from status file operations.
#[derive(Debug)]
pub enum HeartbeatError {
    /// No status file: the worker never started or the artifact was purged.
    Missing { path: PathBuf },
    /// The file exists but is not a status record.
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Serialize {
        source: serde_json::Error,
    },
    Write {
        source: AtomicWriteError,
    },
}

impl std::fmt::Display for HeartbeatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeartbeatError::Missing { path } => {
                write!(f, "no status file at {}", path.display())
            }
            HeartbeatError::Corrupt { path, source } => {
                write!(f, "status file {} is corrupt: {source}", path.display())
            }
            HeartbeatError::Read { path, source } => {
                write!(f, "failed to read status file {}: {source}", path.display())
            }
            HeartbeatError::Serialize { source } => write!(f, "failed to serialize status: {source}"),
            HeartbeatError::Write { source } => write!(f, "failed to write status file: {source}"),
        }
    }
}

impl std::error::Error for HeartbeatError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HeartbeatError::Missing { .. } => None,
            HeartbeatError::Corrupt { source, .. } => Some(source),
            HeartbeatError::Read { source, .. } => Some(source),
            HeartbeatError::Serialize { source } => Some(source),
            HeartbeatError::Write { source } => Some(source),
        }
    }
}
