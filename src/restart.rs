/// Restart state machine: one evaluate-and-react cycle per watchdog
/// invocation.
///
/// ```text
/// Idle -> Evaluating -> Idle                      (healthy / starting)
///                    -> GracefulStop -> Relaunching -> Cooldown -> Idle
///                       GracefulStop -> ForceStop -> Relaunching
///                    -> Exhausted                  (budget spent; terminal)
/// ```
///
/// Every wait is bounded. The attempt counter is persisted before the
/// relaunch is issued, so a watchdog killed mid-cycle never under-counts.
use crate::config::WatchdogConfig;
use crate::health::{evaluate, Assessment, HealthPolicy, ProcessState, Snapshot};
use crate::heartbeat::HeartbeatStore;
use crate::ledger::{AttemptDecision, LedgerStore, RestartLedger};
use crate::process::{log_tail, LaunchProbe, ProcessControl};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Evaluating,
    GracefulStop,
    ForceStop,
    Relaunching,
    Cooldown,
    Exhausted,
}

/// How the cycle ended, mapped onto `--check` exit codes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum CycleOutcome {
    /// Healthy or starting; nothing done.
    Healthy,
    /// A previous relaunch is still cooling down; not evaluated.
    Deferred { remaining_secs: u64 },
    /// Worker stopped (if needed) and relaunched.
    Relaunched { attempt: u32, pid: Option<u32> },
    /// Could not stop the worker, or could not launch a new one.
    Failed { reason: String },
    /// Retry budget spent; no automatic action until reset.
    Exhausted { attempts: u32 },
}

impl CycleOutcome {
    /// 0 healthy, 1 unhealthy-but-acted, 2 retries exhausted.
    pub fn exit_code(&self) -> u8 {
        match self {
            CycleOutcome::Healthy | CycleOutcome::Deferred { .. } => 0,
            CycleOutcome::Relaunched { .. } | CycleOutcome::Failed { .. } => 1,
            CycleOutcome::Exhausted { .. } => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub health: HealthPolicy,
    pub max_attempts: u32,
    pub restart_delay: Duration,
    pub sustained_health_window: Duration,
    pub grace_timeout: Duration,
    pub kill_timeout: Duration,
    pub launch_settle: Duration,
    pub poll_interval: Duration,
    /// Where the launched worker's stderr goes, for early-exit reports.
    pub stderr_log: Option<PathBuf>,
}

impl RestartPolicy {
    pub fn from_config(watchdog: &WatchdogConfig, stderr_log: Option<PathBuf>) -> Self {
        Self {
            health: HealthPolicy {
                max_heartbeat_age: watchdog.max_heartbeat_age(),
                startup_grace: watchdog.startup_grace(),
            },
            max_attempts: watchdog.max_restart_attempts,
            restart_delay: watchdog.restart_delay(),
            sustained_health_window: watchdog.sustained_health_window(),
            grace_timeout: watchdog.grace_timeout(),
            kill_timeout: watchdog.kill_timeout(),
            launch_settle: watchdog.launch_settle(),
            poll_interval: watchdog.poll_interval(),
            stderr_log,
        }
    }
}

/// Result of one cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    /// None when the cycle was deferred before evaluation.
    pub assessment: Option<Assessment>,
    pub outcome: CycleOutcome,
    pub final_phase: Phase,
    pub transitions: Vec<(Phase, Phase)>,
    pub attempts: u32,
}

/// How a stop request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopResult {
    /// Nothing to stop.
    NotRunning,
    Graceful,
    Forced,
    /// Still alive after SIGKILL and `kill_timeout`.
    Unresponsive,
}

pub struct RestartController<'a, P: ProcessControl> {
    policy: &'a RestartPolicy,
    processes: &'a mut P,
    heartbeat: &'a HeartbeatStore,
    ledger_store: &'a LedgerStore,
    ledger: RestartLedger,
    phase: Phase,
    transitions: Vec<(Phase, Phase)>,
    started_at: DateTime<Utc>,
    started: Instant,
}

impl<'a, P: ProcessControl> RestartController<'a, P> {
    pub fn new(
        policy: &'a RestartPolicy,
        processes: &'a mut P,
        heartbeat: &'a HeartbeatStore,
        ledger_store: &'a LedgerStore,
        ledger: RestartLedger,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            policy,
            processes,
            heartbeat,
            ledger_store,
            ledger,
            phase: Phase::Idle,
            transitions: Vec::new(),
            started_at: now,
            started: Instant::now(),
        }
    }

    /// Invocation time plus real time elapsed since.
    fn now(&self) -> DateTime<Utc> {
        self.started_at
            + chrono::Duration::from_std(self.started.elapsed()).unwrap_or(chrono::Duration::zero())
    }

    fn enter(&mut self, next: Phase) {
        debug!(from = ?self.phase, to = ?next, "restart controller transition");
        self.transitions.push((self.phase, next));
        self.phase = next;
    }

    fn persist(&self) {
        if let Err(e) = self.ledger_store.save(&self.ledger) {
            error!(error = %e, "failed to persist restart ledger");
        }
    }

    fn report(&self, assessment: Option<Assessment>, outcome: CycleOutcome) -> CycleReport {
        CycleReport {
            assessment,
            outcome,
            final_phase: self.phase,
            transitions: self.transitions.clone(),
            attempts: self.ledger.attempts,
        }
    }

    /// Run one full cycle against `snapshot`.
    pub async fn run_cycle(mut self, snapshot: &Snapshot) -> CycleReport {
        // The snapshot was taken at invocation time; judge it at that time.
        let now = self.started_at;
        if let Some(remaining) = self.ledger.cooldown_remaining(now) {
            info!(
                remaining_secs = remaining.as_secs(),
                "restart cooldown in progress, skipping evaluation"
            );
            return self.report(
                None,
                CycleOutcome::Deferred {
                    remaining_secs: remaining.as_secs(),
                },
            );
        }
        if self.ledger.cooldown_until.take().is_some() {
            self.persist();
        }

        self.enter(Phase::Evaluating);
        let assessment = evaluate(snapshot, now, &self.policy.health);
        self.log_assessment(&assessment);

        if !assessment.state.needs_recovery() {
            if assessment.state == ProcessState::Healthy {
                self.ledger
                    .observe_healthy(now, self.policy.sustained_health_window);
            } else {
                // Starting breaks a healthy streak like any other non-healthy
                // observation.
                self.ledger.observe_unhealthy();
            }
            self.persist();
            self.enter(Phase::Idle);
            return self.report(Some(assessment), CycleOutcome::Healthy);
        }
        self.ledger.observe_unhealthy();

        let targets = stop_targets(snapshot);
        let attempt = match self.ledger.decide(self.policy.max_attempts) {
            AttemptDecision::Exhausted => {
                return self.exhaust(assessment, &targets).await;
            }
            AttemptDecision::Restart { attempt } => attempt,
        };

        info!(
            attempt,
            max_attempts = self.policy.max_attempts,
            state = assessment.state.as_str(),
            "worker unhealthy, recovering"
        );
        self.enter(Phase::GracefulStop);
        match self.stop(&targets).await {
            StopResult::Unresponsive => {
                error!(
                    pids = ?targets,
                    "process not responding to SIGKILL, not relaunching over it"
                );
                self.persist();
                let reason = format!("process not responding: {targets:?} survived SIGKILL");
                return self.report(Some(assessment), CycleOutcome::Failed { reason });
            }
            StopResult::NotRunning | StopResult::Graceful | StopResult::Forced => {}
        }

        self.enter(Phase::Relaunching);
        let launched = self.relaunch().await;

        self.enter(Phase::Cooldown);
        self.cool_down().await;
        self.enter(Phase::Idle);

        let outcome = match launched {
            Ok(pid) => CycleOutcome::Relaunched { attempt, pid },
            Err(reason) => CycleOutcome::Failed { reason },
        };
        self.report(Some(assessment), outcome)
    }

    fn log_assessment(&self, assessment: &Assessment) {
        match assessment.state {
            ProcessState::Healthy => {
                info!(pid = ?assessment.pid, "worker status check: healthy - {}", assessment.reason);
                if assessment.nearing_stale {
                    warn!(
                        heartbeat_age_secs = ?assessment.heartbeat_age_secs,
                        threshold_secs = self.policy.health.max_heartbeat_age.as_secs(),
                        "heartbeat is getting old"
                    );
                }
                if assessment.self_reported_unhealthy {
                    warn!("worker reports itself unhealthy; heartbeat is fresh, no action taken");
                }
            }
            ProcessState::Starting => {
                info!(pid = ?assessment.pid, "worker status check: starting - {}", assessment.reason);
            }
            _ => {
                warn!(
                    state = assessment.state.as_str(),
                    "worker status check: not running - {}", assessment.reason
                );
            }
        }
    }

    /// Budget spent: alert once, make sure nothing half-alive is left
    /// running, and take no further action.
    async fn exhaust(mut self, assessment: Assessment, targets: &[u32]) -> CycleReport {
        self.enter(Phase::Exhausted);
        let now = self.now();
        if self.ledger.mark_exhausted(now) {
            error!(
                attempts = self.ledger.attempts,
                max_attempts = self.policy.max_attempts,
                "ALERT: restart attempts exhausted, worker left stopped until an operator resets the restart ledger"
            );
        } else {
            error!(
                attempts = self.ledger.attempts,
                "restart attempts still exhausted, no automatic action"
            );
        }
        self.persist();

        if targets.iter().any(|pid| self.processes.is_alive(*pid)) {
            warn!(pids = ?targets, "stopping unhealthy worker left over after exhaustion");
            if self.stop(targets).await == StopResult::Unresponsive {
                error!(pids = ?targets, "process not responding to SIGKILL");
            }
        }

        let attempts = self.ledger.attempts;
        self.report(Some(assessment), CycleOutcome::Exhausted { attempts })
    }

    /// Stop `targets`, recording the escalation to SIGKILL if one happened.
    async fn stop(&mut self, targets: &[u32]) -> StopResult {
        let result = stop_processes(&mut *self.processes, targets, self.policy).await;
        if self.phase == Phase::GracefulStop
            && matches!(result, StopResult::Forced | StopResult::Unresponsive)
        {
            self.enter(Phase::ForceStop);
        }
        result
    }

    /// Count the attempt, clear the dead worker's status, start a new one and
    /// check it survives `launch_settle`.
    async fn relaunch(&mut self) -> Result<Option<u32>, String> {
        let now = self.now();
        let attempt = self.ledger.begin_attempt(now);
        if let Err(e) = self.ledger_store.save(&self.ledger) {
            // An uncounted relaunch could loop forever; skip it.
            error!(error = %e, "failed to persist restart attempt, not relaunching");
            return Err(format!("restart ledger not writable: {e}"));
        }
        info!(
            attempt,
            max_attempts = self.policy.max_attempts,
            "restart attempt {attempt}/{}",
            self.policy.max_attempts
        );

        if let Err(e) = self.heartbeat.clear() {
            warn!(error = %e, "failed to remove stale status file");
        }

        let pid = match self.processes.launch() {
            Ok(pid) => pid,
            Err(e) => {
                error!(error = %e, attempt, "failed to launch worker");
                return Err(e.to_string());
            }
        };
        info!(pid = ?pid, attempt, "worker launched");

        if !self.policy.launch_settle.is_zero() {
            tokio::time::sleep(self.policy.launch_settle).await;
        }
        match self.processes.probe_launched() {
            LaunchProbe::Exited { code } => {
                error!(pid = ?pid, exit_code = ?code, "worker exited during startup");
                if let Some(tail) = self
                    .policy
                    .stderr_log
                    .as_deref()
                    .and_then(|p| log_tail(p, 1000))
                {
                    error!("worker startup errors: {tail}");
                }
                Err(format!("worker exited during startup (exit code {code:?})"))
            }
            LaunchProbe::Running | LaunchProbe::Unknown => Ok(pid),
        }
    }

    async fn cool_down(&mut self) {
        let now = self.now();
        self.ledger.start_cooldown(now, self.policy.restart_delay);
        self.persist();
        if !self.policy.restart_delay.is_zero() {
            info!(
                delay_secs = self.policy.restart_delay.as_secs(),
                "waiting before next evaluation"
            );
            tokio::time::sleep(self.policy.restart_delay).await;
        }
        self.ledger.end_cooldown();
        self.persist();
    }
}

/// SIGTERM, wait up to `grace_timeout`, then SIGKILL and wait up to
/// `kill_timeout`.
///
/// Each pid gets exactly one delivered SIGTERM: a second one inside the
/// worker's escalation window would abort its in-flight task. Delivery
/// failures are retried on every poll until the grace window closes.
pub async fn stop_processes<P: ProcessControl>(
    processes: &mut P,
    targets: &[u32],
    policy: &RestartPolicy,
) -> StopResult {
    let mut live: Vec<u32> = targets
        .iter()
        .copied()
        .filter(|pid| processes.is_alive(*pid))
        .collect();
    if live.is_empty() {
        debug!("no live worker process to stop");
        return StopResult::NotRunning;
    }

    for pid in &live {
        info!(pid, "stopping worker process (SIGTERM)");
    }
    let deadline = Instant::now() + policy.grace_timeout;
    let mut undelivered = live.clone();
    loop {
        undelivered.retain(|pid| live.contains(pid));
        undelivered.retain(|pid| match processes.terminate(*pid) {
            Ok(()) => false,
            Err(e) => {
                warn!(pid, error = %e, "failed to deliver SIGTERM");
                true
            }
        });
        if wait_for_exit(processes, &mut live, deadline, policy.poll_interval).await {
            info!("worker stopped gracefully");
            return StopResult::Graceful;
        }
        if Instant::now() >= deadline {
            break;
        }
    }

    warn!(pids = ?live, "worker did not stop within grace timeout, force killing");
    let deadline = Instant::now() + policy.kill_timeout;
    loop {
        for pid in &live {
            if let Err(e) = processes.kill(*pid) {
                warn!(pid, error = %e, "failed to deliver SIGKILL");
            }
        }
        if wait_for_exit(processes, &mut live, deadline, policy.poll_interval).await {
            info!("worker force killed");
            return StopResult::Forced;
        }
        if Instant::now() >= deadline {
            return StopResult::Unresponsive;
        }
    }
}

/// Poll until every pid in `live` has exited, or for a few poll intervals
/// (bounded by `deadline`). Returns true once all are gone.
async fn wait_for_exit<P: ProcessControl>(
    processes: &P,
    live: &mut Vec<u32>,
    deadline: Instant,
    poll_interval: Duration,
) -> bool {
    let poll_until = (Instant::now() + poll_interval.saturating_mul(4)).min(deadline);
    loop {
        live.retain(|pid| processes.is_alive(*pid));
        if live.is_empty() {
            return true;
        }
        let now = Instant::now();
        if now >= poll_until {
            return false;
        }
        tokio::time::sleep(poll_interval.min(poll_until - now)).await;
    }
}

/// Pids that may belong to the unhealthy worker: the status record's pid and
/// the lock owner's, deduplicated. Our own pid is never a target.
pub fn stop_targets(snapshot: &Snapshot) -> Vec<u32> {
    let own = std::process::id();
    let mut pids = Vec::new();
    if let Ok(record) = &snapshot.status {
        pids.push(record.pid);
    }
    // A pid in a lock file nobody holds may already belong to someone else.
    if let Some(owner) = snapshot.lock_owner.filter(|owner| owner.held) {
        pids.push(owner.pid);
    }
    pids.retain(|pid| *pid != 0 && *pid != own);
    pids.sort_unstable();
    pids.dedup();
    pids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::StatusUnavailable;
    use crate::heartbeat::{StatusRecord, WorkerState};
    use crate::lock::LockOwner;
    use crate::process::fake::FakeProcesses;
    use chrono::Duration as ChronoDuration;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        heartbeat: HeartbeatStore,
        ledger: LedgerStore,
        policy: RestartPolicy,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        Fixture {
            heartbeat: HeartbeatStore::new(dir.path().join("w.status")),
            ledger: LedgerStore::new(dir.path().join("w.restarts")),
            policy: RestartPolicy {
                health: HealthPolicy {
                    max_heartbeat_age: Duration::from_secs(300),
                    startup_grace: Duration::from_secs(60),
                },
                max_attempts: 3,
                restart_delay: Duration::ZERO,
                sustained_health_window: Duration::from_secs(600),
                grace_timeout: Duration::from_millis(60),
                kill_timeout: Duration::from_millis(60),
                launch_settle: Duration::ZERO,
                poll_interval: Duration::from_millis(5),
                stderr_log: None,
            },
            _dir: dir,
        }
    }

    fn record(pid: u32, now: DateTime<Utc>, heartbeat_age_secs: i64) -> StatusRecord {
        StatusRecord {
            pid,
            started_at: now - ChronoDuration::hours(1),
            last_heartbeat_at: now - ChronoDuration::seconds(heartbeat_age_secs),
            uptime_seconds: 3_600,
            uptime_human: "1h 0m".to_string(),
            healthy: true,
            state_label: WorkerState::Running,
            message: String::new(),
            ticks_completed: 0,
            ticks_failed: 0,
            last_success_at: None,
            diagnostics: Vec::new(),
        }
    }

    fn snapshot(procs: &FakeProcesses, status: StatusRecord) -> Snapshot {
        Snapshot {
            status_pid_alive: procs.is_alive(status.pid),
            status: Ok(status),
            lock_owner: None,
        }
    }

    async fn cycle(
        fx: &Fixture,
        procs: &mut FakeProcesses,
        snap: &Snapshot,
        now: DateTime<Utc>,
    ) -> CycleReport {
        let ledger = fx.ledger.load().unwrap();
        RestartController::new(&fx.policy, procs, &fx.heartbeat, &fx.ledger, ledger, now)
            .run_cycle(snap)
            .await
    }

    #[tokio::test]
    async fn test_healthy_returns_to_idle() {
        let fx = fixture();
        let mut procs = FakeProcesses::with_alive(&[100]);
        let now = Utc::now();
        let snap = snapshot(&procs, record(100, now, 5));

        let report = cycle(&fx, &mut procs, &snap, now).await;
        assert_eq!(report.outcome, CycleOutcome::Healthy);
        assert_eq!(report.final_phase, Phase::Idle);
        assert_eq!(
            report.transitions,
            vec![(Phase::Idle, Phase::Evaluating), (Phase::Evaluating, Phase::Idle)]
        );
        assert_eq!(procs.launches, 0);
        assert!(procs.terminated.is_empty());
    }

    #[tokio::test]
    async fn test_stale_heartbeat_graceful_stop_then_relaunch() {
        let fx = fixture();
        let mut procs = FakeProcesses::with_alive(&[100]);
        let now = Utc::now();
        fx.heartbeat.write(&record(100, now, 600)).unwrap();
        let snap = snapshot(&procs, record(100, now, 600));

        let report = cycle(&fx, &mut procs, &snap, now).await;
        assert_eq!(report.assessment.as_ref().unwrap().state, ProcessState::Stale);
        assert_eq!(
            report.outcome,
            CycleOutcome::Relaunched {
                attempt: 1,
                pid: Some(5001)
            }
        );
        assert_eq!(report.attempts, 1);
        assert_eq!(procs.terminated, vec![100]);
        assert!(procs.killed.is_empty());
        assert_eq!(procs.launches, 1);
        assert_eq!(
            report.transitions,
            vec![
                (Phase::Idle, Phase::Evaluating),
                (Phase::Evaluating, Phase::GracefulStop),
                (Phase::GracefulStop, Phase::Relaunching),
                (Phase::Relaunching, Phase::Cooldown),
                (Phase::Cooldown, Phase::Idle),
            ]
        );
        // The dead worker's status is gone so the new one starts clean.
        assert!(!fx.heartbeat.path().exists());
        assert_eq!(fx.ledger.load().unwrap().attempts, 1);
        assert_eq!(report.outcome.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_stale_heartbeat_escalates_to_force_kill() {
        let fx = fixture();
        let mut procs = FakeProcesses::with_alive(&[100]);
        procs.ignore_term.insert(100);
        let now = Utc::now();
        let snap = snapshot(&procs, record(100, now, 600));

        let report = cycle(&fx, &mut procs, &snap, now).await;
        // One SIGTERM for the whole grace window, then SIGKILL.
        assert_eq!(procs.terminated, vec![100]);
        assert_eq!(procs.killed, vec![100]);
        assert_eq!(procs.launches, 1);
        assert_eq!(report.attempts, 1);
        assert!(report
            .transitions
            .contains(&(Phase::GracefulStop, Phase::ForceStop)));
        assert!(report
            .transitions
            .contains(&(Phase::ForceStop, Phase::Relaunching)));
    }

    #[tokio::test]
    async fn test_unkillable_process_fails_cycle_without_relaunch() {
        let fx = fixture();
        let mut procs = FakeProcesses::with_alive(&[100]);
        procs.ignore_term.insert(100);
        procs.unkillable.insert(100);
        let now = Utc::now();
        let snap = snapshot(&procs, record(100, now, 600));

        let report = cycle(&fx, &mut procs, &snap, now).await;
        assert!(matches!(report.outcome, CycleOutcome::Failed { .. }));
        assert_eq!(report.final_phase, Phase::ForceStop);
        assert_eq!(procs.launches, 0);
        assert_eq!(report.attempts, 0);
        assert_eq!(report.outcome.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_dead_worker_skips_stop() {
        let fx = fixture();
        let mut procs = FakeProcesses::with_alive(&[]);
        let now = Utc::now();
        let snap = snapshot(&procs, record(100, now, 5));

        let report = cycle(&fx, &mut procs, &snap, now).await;
        assert_eq!(report.assessment.unwrap().state, ProcessState::Dead);
        assert!(procs.terminated.is_empty());
        assert_eq!(procs.launches, 1);
        assert!(matches!(report.outcome, CycleOutcome::Relaunched { attempt: 1, .. }));
    }

    #[tokio::test]
    async fn test_missing_status_and_no_lock_relaunches() {
        let fx = fixture();
        let mut procs = FakeProcesses::with_alive(&[]);
        let snap = Snapshot {
            status: Err(StatusUnavailable::Missing),
            status_pid_alive: false,
            lock_owner: None,
        };
        let report = cycle(&fx, &mut procs, &snap, Utc::now()).await;
        assert_eq!(procs.launches, 1);
        assert!(matches!(report.outcome, CycleOutcome::Relaunched { .. }));
    }

    #[tokio::test]
    async fn test_starting_worker_is_left_alone() {
        let fx = fixture();
        let mut procs = FakeProcesses::with_alive(&[100]);
        let now = Utc::now();
        let snap = Snapshot {
            status: Err(StatusUnavailable::Missing),
            status_pid_alive: false,
            lock_owner: Some(LockOwner {
                pid: 100,
                acquired_at: now - ChronoDuration::seconds(5),
                held: true,
                alive: true,
            }),
        };
        let report = cycle(&fx, &mut procs, &snap, now).await;
        assert_eq!(report.outcome, CycleOutcome::Healthy);
        assert_eq!(procs.launches, 0);
        assert_eq!(report.outcome.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_after_max_consecutive_failures() {
        let fx = fixture();
        let mut procs = FakeProcesses::with_alive(&[]);
        let t0 = Utc::now();

        for i in 0..3 {
            let now = t0 + ChronoDuration::minutes(i);
            let snap = snapshot(&procs, record(100, now, 5));
            let report = cycle(&fx, &mut procs, &snap, now).await;
            assert!(
                matches!(report.outcome, CycleOutcome::Relaunched { attempt, .. } if attempt == i as u32 + 1)
            );
            // The relaunched worker dies immediately.
            procs.alive.clear();
        }

        for i in 3..6 {
            let now = t0 + ChronoDuration::minutes(i);
            let snap = snapshot(&procs, record(100, now, 5));
            let report = cycle(&fx, &mut procs, &snap, now).await;
            assert_eq!(report.outcome, CycleOutcome::Exhausted { attempts: 3 });
            assert_eq!(report.final_phase, Phase::Exhausted);
            assert_eq!(report.outcome.exit_code(), 2);
        }
        assert_eq!(procs.launches, 3);
        assert!(fx.ledger.load().unwrap().exhausted_at.is_some());

        // Operator reset re-arms the controller.
        let mut ledger = fx.ledger.load().unwrap();
        ledger.reset();
        fx.ledger.save(&ledger).unwrap();
        let now = t0 + ChronoDuration::minutes(10);
        let snap = snapshot(&procs, record(100, now, 5));
        let report = cycle(&fx, &mut procs, &snap, now).await;
        assert!(matches!(report.outcome, CycleOutcome::Relaunched { attempt: 1, .. }));
    }

    #[tokio::test]
    async fn test_exhausted_stops_live_stale_worker() {
        let fx = fixture();
        let mut ledger = RestartLedger::default();
        let now = Utc::now();
        for _ in 0..3 {
            ledger.begin_attempt(now);
        }
        fx.ledger.save(&ledger).unwrap();

        let mut procs = FakeProcesses::with_alive(&[100]);
        let snap = snapshot(&procs, record(100, now, 600));
        let report = cycle(&fx, &mut procs, &snap, now).await;
        assert_eq!(report.outcome, CycleOutcome::Exhausted { attempts: 3 });
        assert_eq!(procs.terminated, vec![100]);
        assert_eq!(procs.launches, 0);
    }

    #[tokio::test]
    async fn test_counter_resets_after_sustained_health() {
        let fx = fixture();
        let mut procs = FakeProcesses::with_alive(&[]);
        let t0 = Utc::now();

        let snap = snapshot(&procs, record(100, t0, 5));
        cycle(&fx, &mut procs, &snap, t0).await;
        assert_eq!(fx.ledger.load().unwrap().attempts, 1);

        // New worker 5001 stays healthy; observed every five minutes.
        for minutes in [1, 6] {
            let now = t0 + ChronoDuration::minutes(minutes);
            let snap = snapshot(&procs, record(5001, now, 5));
            cycle(&fx, &mut procs, &snap, now).await;
            assert_eq!(fx.ledger.load().unwrap().attempts, 1);
        }
        let now = t0 + ChronoDuration::minutes(11);
        let snap = snapshot(&procs, record(5001, now, 5));
        cycle(&fx, &mut procs, &snap, now).await;
        assert_eq!(fx.ledger.load().unwrap().attempts, 0);
    }

    #[tokio::test]
    async fn test_cooldown_defers_next_evaluation() {
        let mut fx = fixture();
        fx.policy.restart_delay = Duration::from_millis(10);
        let now = Utc::now();
        let mut ledger = RestartLedger::default();
        ledger.start_cooldown(now, Duration::from_secs(30));
        fx.ledger.save(&ledger).unwrap();

        let mut procs = FakeProcesses::with_alive(&[]);
        let snap = snapshot(&procs, record(100, now, 600));
        let report = cycle(&fx, &mut procs, &snap, now + ChronoDuration::seconds(5)).await;
        assert_eq!(report.outcome, CycleOutcome::Deferred { remaining_secs: 25 });
        assert!(report.assessment.is_none());
        assert!(report.transitions.is_empty());
        assert_eq!(procs.launches, 0);
    }

    #[tokio::test]
    async fn test_launch_failure_still_counts_attempt() {
        let fx = fixture();
        let mut procs = FakeProcesses::with_alive(&[]);
        procs.launch_fails = true;
        let now = Utc::now();
        let snap = snapshot(&procs, record(100, now, 5));

        let report = cycle(&fx, &mut procs, &snap, now).await;
        assert!(matches!(report.outcome, CycleOutcome::Failed { .. }));
        assert_eq!(report.attempts, 1);
        assert_eq!(report.final_phase, Phase::Idle);
    }

    #[tokio::test]
    async fn test_early_exit_after_launch_is_reported() {
        let fx = fixture();
        let mut procs = FakeProcesses::with_alive(&[]);
        procs.launched_exits = true;
        let now = Utc::now();
        let snap = snapshot(&procs, record(100, now, 5));

        let report = cycle(&fx, &mut procs, &snap, now).await;
        match report.outcome {
            CycleOutcome::Failed { reason } => assert!(reason.contains("during startup")),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_lock_owner_and_status_pid_both_stopped() {
        let fx = fixture();
        let mut procs = FakeProcesses::with_alive(&[100, 200]);
        let now = Utc::now();
        let mut snap = snapshot(&procs, record(100, now, 600));
        snap.lock_owner = Some(LockOwner {
            pid: 200,
            acquired_at: now - ChronoDuration::hours(1),
            held: true,
            alive: true,
        });

        cycle(&fx, &mut procs, &snap, now).await;
        let mut terminated = procs.terminated.clone();
        terminated.sort_unstable();
        terminated.dedup();
        assert_eq!(terminated, vec![100, 200]);
    }

    #[tokio::test]
    async fn test_unheld_lock_pid_is_never_signalled() {
        let fx = fixture();
        // Worker 100 was SIGKILLed; its pid went to an unrelated process 300
        // that now appears in the leftover lock file.
        let mut procs = FakeProcesses::with_alive(&[300]);
        let now = Utc::now();
        let mut snap = snapshot(&procs, record(100, now, 600));
        snap.lock_owner = Some(LockOwner {
            pid: 300,
            acquired_at: now - ChronoDuration::hours(1),
            held: false,
            alive: false,
        });

        assert_eq!(stop_targets(&snap), vec![100]);
        let report = cycle(&fx, &mut procs, &snap, now).await;
        assert!(matches!(report.outcome, CycleOutcome::Relaunched { .. }));
        assert!(!procs.terminated.contains(&300));
        assert!(!procs.killed.contains(&300));
        assert!(procs.is_alive(300));
    }

    #[tokio::test]
    async fn test_sigterm_redelivered_only_after_failure() {
        let fx = fixture();
        let mut procs = FakeProcesses::with_alive(&[100, 200]);
        procs.ignore_term.extend([100, 200]);
        procs.term_failures = 1;

        let result = stop_processes(&mut procs, &[100, 200], &fx.policy).await;
        assert_eq!(result, StopResult::Forced);
        // The first attempt on 100 failed and was retried; 200 got one.
        assert_eq!(procs.terminated, vec![200, 100]);
    }

    #[tokio::test]
    async fn test_relaunch_without_readable_pid_reports_none() {
        let fx = fixture();
        let mut procs = FakeProcesses::with_alive(&[]);
        procs.launch_reaped = true;
        let now = Utc::now();
        let snap = snapshot(&procs, record(100, now, 5));

        let report = cycle(&fx, &mut procs, &snap, now).await;
        assert!(matches!(
            report.outcome,
            CycleOutcome::Relaunched { attempt: 1, pid: None }
        ));
    }
}
