/// Watchdog side of supervision: one `Supervisor` per invocation.
///
/// Gathers a snapshot of the runtime directory, hands it to the restart state
/// machine and implements the operator commands (status, start, stop, reset).
/// Every mutating command runs under the `<identity>.watchdog` lock so cron
/// runs and operators never act on the same worker at once.
use crate::health::{evaluate, Assessment, Snapshot, StatusUnavailable};
use crate::heartbeat::{HeartbeatError, HeartbeatStore, StatusRecord};
use crate::ledger::{LedgerError, LedgerStore, RestartLedger};
use crate::lock::{LockError, LockHandle, LockManager};
use crate::process::{log_tail, LaunchProbe, ProcessControl, ProcessError};
use crate::restart::{stop_processes, stop_targets, CycleReport, RestartController, RestartPolicy, StopResult};
use crate::runtime_dir::RuntimeDir;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;

/// Result of an evaluate-and-act invocation.
#[derive(Debug)]
pub enum CycleResult {
    Completed(CycleReport),
    /// Another watchdog invocation holds the watchdog lock.
    Busy { pid: Option<u32> },
}

impl CycleResult {
    pub fn exit_code(&self) -> u8 {
        match self {
            CycleResult::Completed(report) => report.outcome.exit_code(),
            CycleResult::Busy { .. } => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started { pid: Option<u32> },
    AlreadyRunning { pid: Option<u32> },
    ExitedEarly { code: Option<i32> },
}

#[derive(Debug, Clone, Serialize)]
pub struct LockView {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub held: bool,
    pub alive: bool,
}

/// Read-only view for `--status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub identity: String,
    pub runtime_dir: PathBuf,
    pub assessment: Assessment,
    pub status: Option<StatusRecord>,
    pub status_error: Option<String>,
    pub lock: Option<LockView>,
    pub restarts: RestartLedger,
    pub max_restart_attempts: u32,
}

impl StatusReport {
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "worker '{}': {} - {}\n",
            self.identity,
            self.assessment.state.as_str(),
            self.assessment.reason
        ));
        out.push_str(&format!("  runtime dir:   {}\n", self.runtime_dir.display()));

        match &self.status {
            Some(record) => {
                out.push_str(&format!("  pid:           {}\n", record.pid));
                out.push_str(&format!("  state:         {:?}\n", record.state_label));
                out.push_str(&format!(
                    "  started:       {}\n",
                    record.started_at.format("%Y-%m-%d %H:%M:%S UTC")
                ));
                out.push_str(&format!("  uptime:        {}\n", record.uptime_human));
                if let Some(age) = self.assessment.heartbeat_age_secs {
                    out.push_str(&format!("  heartbeat:     {age}s ago\n"));
                }
                out.push_str(&format!("  self-healthy:  {}\n", record.healthy));
                out.push_str(&format!(
                    "  ticks:         {} ok, {} failed\n",
                    record.ticks_completed, record.ticks_failed
                ));
                if let Some(last) = record.last_success_at {
                    out.push_str(&format!(
                        "  last success:  {}\n",
                        last.format("%Y-%m-%d %H:%M:%S UTC")
                    ));
                }
                if !record.message.is_empty() {
                    out.push_str(&format!("  message:       {}\n", record.message));
                }
                if !record.diagnostics.is_empty() {
                    out.push_str("  diagnostics:\n");
                    for line in &record.diagnostics {
                        out.push_str(&format!("    {line}\n"));
                    }
                }
            }
            None => {
                let why = self.status_error.as_deref().unwrap_or("no status file");
                out.push_str(&format!("  status:        {why}\n"));
            }
        }

        match &self.lock {
            Some(lock) => out.push_str(&format!(
                "  lock:          pid {} ({}), since {}\n",
                lock.pid,
                match (lock.held, lock.alive) {
                    (false, _) => "not held",
                    (true, true) => "alive",
                    (true, false) => "dead",
                },
                lock.acquired_at.format("%Y-%m-%d %H:%M:%S UTC")
            )),
            None => out.push_str("  lock:          free\n"),
        }

        out.push_str(&format!(
            "  restarts:      {}/{}",
            self.restarts.attempts, self.max_restart_attempts
        ));
        if let Some(at) = self.restarts.exhausted_at {
            out.push_str(&format!(
                " (EXHAUSTED since {})",
                at.format("%Y-%m-%d %H:%M:%S UTC")
            ));
        }
        if let Some(until) = self.restarts.cooldown_until {
            out.push_str(&format!(
                " (cooldown until {})",
                until.format("%H:%M:%S UTC")
            ));
        }
        out.push('\n');
        out
    }
}

pub struct Supervisor<P: ProcessControl> {
    runtime: RuntimeDir,
    locks: LockManager,
    heartbeat: HeartbeatStore,
    ledger: LedgerStore,
    processes: P,
    policy: RestartPolicy,
}

impl<P: ProcessControl> Supervisor<P> {
    pub fn new(runtime: RuntimeDir, policy: RestartPolicy, processes: P) -> Self {
        Self {
            locks: LockManager::new(runtime.root()),
            heartbeat: HeartbeatStore::new(runtime.status()),
            ledger: LedgerStore::new(runtime.ledger()),
            runtime,
            processes,
            policy,
        }
    }

    /// Read the status file and lock owner as they are right now.
    pub fn observe(&self) -> Snapshot {
        let status = match self.heartbeat.read() {
            Ok(record) => Ok(record),
            Err(HeartbeatError::Missing { .. }) => Err(StatusUnavailable::Missing),
            Err(e) => {
                tracing::warn!(error = %e, "status file unusable");
                Err(StatusUnavailable::Corrupt(e.to_string()))
            }
        };
        let status_pid_alive = match &status {
            Ok(record) => self.processes.is_alive(record.pid),
            Err(_) => false,
        };
        let lock_owner = match self.locks.inspect(self.runtime.identity()) {
            Ok(owner) => owner.map(|mut owner| {
                owner.alive = owner.held && self.processes.is_alive(owner.pid);
                owner
            }),
            Err(e) => {
                tracing::warn!(error = %e, "could not inspect worker lock");
                None
            }
        };
        Snapshot {
            status,
            status_pid_alive,
            lock_owner,
        }
    }

    /// Take the watchdog lock. `Ok(None)` when another invocation has it.
    fn serialize(&self) -> Result<Option<LockHandle>, SupervisorError> {
        self.runtime
            .init()
            .map_err(|e| SupervisorError::RuntimeDir {
                path: self.runtime.root().to_path_buf(),
                source: e,
            })?;
        match self.locks.acquire(&self.runtime.watchdog_identity()) {
            Ok(handle) => Ok(Some(handle)),
            Err(LockError::AlreadyRunning { pid, .. }) => {
                tracing::info!(pid = ?pid, "another watchdog cycle is already in progress");
                Ok(None)
            }
            Err(e) => Err(SupervisorError::Lock(e)),
        }
    }

    fn busy_pid(&self) -> Option<u32> {
        self.locks
            .inspect(&self.runtime.watchdog_identity())
            .ok()
            .flatten()
            .map(|owner| owner.pid)
    }

    /// One evaluate-and-act cycle.
    pub async fn run_cycle(&mut self) -> Result<CycleResult, SupervisorError> {
        let Some(mut guard) = self.serialize()? else {
            return Ok(CycleResult::Busy {
                pid: self.busy_pid(),
            });
        };
        let ledger = self.ledger.load().map_err(SupervisorError::Ledger)?;
        let snapshot = self.observe();
        let report = RestartController::new(
            &self.policy,
            &mut self.processes,
            &self.heartbeat,
            &self.ledger,
            ledger,
            Utc::now(),
        )
        .run_cycle(&snapshot)
        .await;
        tracing::info!(
            outcome = ?report.outcome,
            attempts = report.attempts,
            "watchdog cycle complete"
        );
        release(&mut guard);
        Ok(CycleResult::Completed(report))
    }

    /// Report without mutating anything on disk.
    pub fn status_report(&self) -> StatusReport {
        let snapshot = self.observe();
        let assessment = evaluate(&snapshot, Utc::now(), &self.policy.health);
        let restarts = match self.ledger.load() {
            Ok(ledger) => ledger,
            Err(e) => {
                tracing::warn!(error = %e, "could not read restart ledger");
                RestartLedger::default()
            }
        };
        let (status, status_error) = match snapshot.status {
            Ok(record) => (Some(record), None),
            Err(StatusUnavailable::Missing) => (None, None),
            Err(StatusUnavailable::Corrupt(detail)) => (None, Some(detail)),
        };
        StatusReport {
            identity: self.runtime.identity().to_string(),
            runtime_dir: self.runtime.root().to_path_buf(),
            assessment,
            status,
            status_error,
            lock: snapshot.lock_owner.map(|owner| LockView {
                pid: owner.pid,
                acquired_at: owner.acquired_at,
                held: owner.held,
                alive: owner.alive,
            }),
            restarts,
            max_restart_attempts: self.policy.max_attempts,
        }
    }

    /// Start a worker unless one is already running. Does not count against
    /// the restart budget.
    pub async fn force_start(&mut self) -> Result<StartOutcome, SupervisorError> {
        let Some(mut guard) = self.serialize()? else {
            return Err(SupervisorError::Busy {
                pid: self.busy_pid(),
            });
        };
        let snapshot = self.observe();
        let running = snapshot
            .lock_owner
            .filter(|owner| owner.alive)
            .map(|owner| owner.pid)
            .or_else(|| match &snapshot.status {
                Ok(record) if snapshot.status_pid_alive => Some(record.pid),
                _ => None,
            });
        if let Some(pid) = running {
            tracing::info!(pid, "worker already running, not starting another");
            release(&mut guard);
            return Ok(StartOutcome::AlreadyRunning { pid: Some(pid) });
        }

        if let Err(e) = self.heartbeat.clear() {
            tracing::warn!(error = %e, "failed to remove old status file");
        }
        let launched = self.processes.launch();
        let outcome = match launched {
            Ok(pid) => {
                tracing::info!(pid = ?pid, "worker started by operator");
                if !self.policy.launch_settle.is_zero() {
                    tokio::time::sleep(self.policy.launch_settle).await;
                }
                match self.processes.probe_launched() {
                    LaunchProbe::Exited { code } => {
                        tracing::error!(pid = ?pid, exit_code = ?code, "worker exited during startup");
                        if let Some(tail) = self
                            .policy
                            .stderr_log
                            .as_deref()
                            .and_then(|p| log_tail(p, 1000))
                        {
                            tracing::error!("worker startup errors: {tail}");
                        }
                        Ok(StartOutcome::ExitedEarly { code })
                    }
                    LaunchProbe::Running | LaunchProbe::Unknown => {
                        Ok(StartOutcome::Started { pid })
                    }
                }
            }
            Err(e) => Err(SupervisorError::Process(e)),
        };
        release(&mut guard);
        outcome
    }

    /// Graceful stop: SIGTERM, grace period, SIGKILL.
    pub async fn stop(&mut self) -> Result<StopResult, SupervisorError> {
        let Some(mut guard) = self.serialize()? else {
            return Err(SupervisorError::Busy {
                pid: self.busy_pid(),
            });
        };
        let targets = stop_targets(&self.observe());
        let result = stop_processes(&mut self.processes, &targets, &self.policy).await;
        match result {
            StopResult::NotRunning => tracing::info!("worker is not running"),
            StopResult::Graceful | StopResult::Forced => {
                tracing::info!(pids = ?targets, "worker stopped by operator")
            }
            StopResult::Unresponsive => {
                tracing::error!(pids = ?targets, "process not responding to SIGKILL")
            }
        }
        release(&mut guard);
        Ok(result)
    }

    /// Operator reset: clear attempts, cooldown and exhaustion. Returns the
    /// ledger as it was before the reset.
    pub fn reset(&mut self) -> Result<RestartLedger, SupervisorError> {
        let Some(mut guard) = self.serialize()? else {
            return Err(SupervisorError::Busy {
                pid: self.busy_pid(),
            });
        };
        let previous = self.ledger.load().map_err(SupervisorError::Ledger)?;
        let mut ledger = previous.clone();
        ledger.reset();
        self.ledger.save(&ledger).map_err(SupervisorError::Ledger)?;
        tracing::info!(
            previous_attempts = previous.attempts,
            was_exhausted = previous.exhausted_at.is_some(),
            "restart ledger reset by operator"
        );
        release(&mut guard);
        Ok(previous)
    }
}

fn release(guard: &mut LockHandle) {
    if let Err(e) = guard.release() {
        tracing::warn!(error = %e, "failed to release watchdog lock");
    }
}

#[derive(Debug)]
pub enum SupervisorError {
    RuntimeDir {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Another watchdog invocation is running.
    Busy { pid: Option<u32> },
    Lock(LockError),
    Ledger(LedgerError),
    Process(ProcessError),
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::RuntimeDir { path, source } => {
                write!(
                    f,
                    "failed to create runtime directory {}: {}",
                    path.display(),
                    source
                )
            }
            SupervisorError::Busy { pid: Some(pid) } => {
                write!(f, "another watchdog cycle is in progress (pid {pid})")
            }
            SupervisorError::Busy { pid: None } => {
                write!(f, "another watchdog cycle is in progress")
            }
            SupervisorError::Lock(e) => write!(f, "{e}"),
            SupervisorError::Ledger(e) => write!(f, "{e}"),
            SupervisorError::Process(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::RuntimeDir { source, .. } => Some(source),
            SupervisorError::Busy { .. } => None,
            SupervisorError::Lock(e) => Some(e),
            SupervisorError::Ledger(e) => Some(e),
            SupervisorError::Process(e) => Some(e),
        }
    }
}
