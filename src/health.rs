/// Health verdicts: a pure mapping from what the watchdog observed on disk
/// (status record, lock owner, pid liveness) and the current time to a
/// `ProcessState`.
///
/// Heartbeat age is ground truth. The worker's own `healthy` flag never makes
/// a stale worker healthy, and never makes a fresh one unhealthy.
use crate::heartbeat::{StatusRecord, WorkerState};
use crate::lock::LockOwner;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// Fraction of `max_heartbeat_age` after which a healthy verdict carries a
/// "nearing stale" warning.
const NEARING_STALE_RATIO: f64 = 0.75;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Healthy,
    /// Heartbeat older than the threshold.
    Stale,
    /// Recorded pid is not running.
    Dead,
    /// No usable status artifact.
    Missing,
    /// No status yet, but a freshly locked live worker is booting.
    Starting,
}

impl ProcessState {
    /// States the restart controller must act on.
    pub fn needs_recovery(self) -> bool {
        matches!(self, ProcessState::Stale | ProcessState::Dead | ProcessState::Missing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessState::Healthy => "healthy",
            ProcessState::Stale => "stale",
            ProcessState::Dead => "dead",
            ProcessState::Missing => "missing",
            ProcessState::Starting => "starting",
        }
    }
}

/// Why the status record could not be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusUnavailable {
    Missing,
    Corrupt(String),
}

/// Everything the evaluator looks at, gathered by the caller.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub status: Result<StatusRecord, StatusUnavailable>,
    /// Liveness of `status.pid`; ignored when the status is unavailable.
    pub status_pid_alive: bool,
    pub lock_owner: Option<LockOwner>,
}

#[derive(Debug, Clone, Copy)]
pub struct HealthPolicy {
    pub max_heartbeat_age: Duration,
    pub startup_grace: Duration,
}

/// Evaluator output: the verdict plus what it was based on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assessment {
    pub state: ProcessState,
    pub reason: String,
    pub pid: Option<u32>,
    pub heartbeat_age_secs: Option<u64>,
    /// Healthy, but the heartbeat is close to the stale threshold.
    pub nearing_stale: bool,
    /// The worker reported itself unhealthy; informational only.
    pub self_reported_unhealthy: bool,
}

impl Assessment {
    fn new(state: ProcessState, reason: String) -> Self {
        Self {
            state,
            reason,
            pid: None,
            heartbeat_age_secs: None,
            nearing_stale: false,
            self_reported_unhealthy: false,
        }
    }
}

pub fn evaluate(snapshot: &Snapshot, now: DateTime<Utc>, policy: &HealthPolicy) -> Assessment {
    let record = match &snapshot.status {
        Ok(record) => record,
        Err(unavailable) => return evaluate_without_status(unavailable, snapshot, now, policy),
    };

    let age = (now - record.last_heartbeat_at).to_std().unwrap_or(Duration::ZERO);
    let mut assessment = if age > policy.max_heartbeat_age {
        Assessment::new(
            ProcessState::Stale,
            format!(
                "heartbeat too old ({}s, threshold {}s)",
                age.as_secs(),
                policy.max_heartbeat_age.as_secs()
            ),
        )
    } else if !snapshot.status_pid_alive {
        let reason = if record.state_label == WorkerState::Stopped {
            format!("process {} not running (stopped: {})", record.pid, record.message)
        } else {
            format!("process {} not running", record.pid)
        };
        Assessment::new(ProcessState::Dead, reason)
    } else {
        let mut healthy = Assessment::new(
            ProcessState::Healthy,
            format!(
                "running (pid {}, uptime {}, heartbeat {}s ago)",
                record.pid,
                record.uptime_human,
                age.as_secs()
            ),
        );
        healthy.nearing_stale =
            age.as_secs_f64() > policy.max_heartbeat_age.as_secs_f64() * NEARING_STALE_RATIO;
        healthy
    };

    assessment.pid = Some(record.pid);
    assessment.heartbeat_age_secs = Some(age.as_secs());
    assessment.self_reported_unhealthy = !record.healthy;
    assessment
}

fn evaluate_without_status(
    unavailable: &StatusUnavailable,
    snapshot: &Snapshot,
    now: DateTime<Utc>,
    policy: &HealthPolicy,
) -> Assessment {
    let why = match unavailable {
        StatusUnavailable::Missing => "no status file".to_string(),
        StatusUnavailable::Corrupt(detail) => format!("status file unreadable ({detail})"),
    };

    if let Some(owner) = snapshot.lock_owner.filter(|o| o.alive) {
        let lock_age = (now - owner.acquired_at).to_std().unwrap_or(Duration::ZERO);
        if lock_age < policy.startup_grace {
            let mut starting = Assessment::new(
                ProcessState::Starting,
                format!(
                    "{why}; pid {} locked {}s ago, within startup grace",
                    owner.pid,
                    lock_age.as_secs()
                ),
            );
            starting.pid = Some(owner.pid);
            return starting;
        }
        let mut missing = Assessment::new(
            ProcessState::Missing,
            format!(
                "{why}; pid {} has held the lock for {}s without publishing status",
                owner.pid,
                lock_age.as_secs()
            ),
        );
        missing.pid = Some(owner.pid);
        return missing;
    }

    Assessment::new(ProcessState::Missing, why)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn policy() -> HealthPolicy {
        HealthPolicy {
            max_heartbeat_age: Duration::from_secs(300),
            startup_grace: Duration::from_secs(60),
        }
    }

    fn record(now: DateTime<Utc>, heartbeat_age_secs: i64, healthy: bool) -> StatusRecord {
        StatusRecord {
            pid: 4321,
            started_at: now - ChronoDuration::hours(2),
            last_heartbeat_at: now - ChronoDuration::seconds(heartbeat_age_secs),
            uptime_seconds: 7_200,
            uptime_human: "2h 0m".to_string(),
            healthy,
            state_label: WorkerState::Sleeping,
            message: String::new(),
            ticks_completed: 0,
            ticks_failed: 0,
            last_success_at: None,
            diagnostics: Vec::new(),
        }
    }

    fn with_status(status: StatusRecord, alive: bool) -> Snapshot {
        Snapshot {
            status: Ok(status),
            status_pid_alive: alive,
            lock_owner: None,
        }
    }

    fn without_status(owner: Option<LockOwner>) -> Snapshot {
        Snapshot {
            status: Err(StatusUnavailable::Missing),
            status_pid_alive: false,
            lock_owner: owner,
        }
    }

    #[test]
    fn test_fresh_heartbeat_is_healthy() {
        let now = Utc::now();
        let a = evaluate(&with_status(record(now, 10, true), true), now, &policy());
        assert_eq!(a.state, ProcessState::Healthy);
        assert_eq!(a.pid, Some(4321));
        assert_eq!(a.heartbeat_age_secs, Some(10));
        assert!(!a.nearing_stale);
    }

    #[test]
    fn test_old_heartbeat_is_stale_even_if_self_reported_healthy() {
        let now = Utc::now();
        for healthy in [true, false] {
            let a = evaluate(&with_status(record(now, 600, healthy), true), now, &policy());
            assert_eq!(a.state, ProcessState::Stale);
            assert!(a.reason.contains("600s"));
        }
    }

    #[test]
    fn test_self_reported_unhealthy_is_advisory() {
        let now = Utc::now();
        let a = evaluate(&with_status(record(now, 5, false), true), now, &policy());
        assert_eq!(a.state, ProcessState::Healthy);
        assert!(a.self_reported_unhealthy);
    }

    #[test]
    fn test_dead_pid_with_fresh_heartbeat() {
        let now = Utc::now();
        let a = evaluate(&with_status(record(now, 5, true), false), now, &policy());
        assert_eq!(a.state, ProcessState::Dead);
        assert!(a.reason.contains("4321"));
    }

    #[test]
    fn test_stale_takes_precedence_over_dead() {
        let now = Utc::now();
        let a = evaluate(&with_status(record(now, 900, true), false), now, &policy());
        assert_eq!(a.state, ProcessState::Stale);
    }

    #[test]
    fn test_exact_threshold_is_not_stale() {
        let now = Utc::now();
        let a = evaluate(&with_status(record(now, 300, true), true), now, &policy());
        assert_eq!(a.state, ProcessState::Healthy);
        assert!(a.nearing_stale);
    }

    #[test]
    fn test_future_heartbeat_counts_as_fresh() {
        let now = Utc::now();
        let a = evaluate(&with_status(record(now, -120, true), true), now, &policy());
        assert_eq!(a.state, ProcessState::Healthy);
        assert_eq!(a.heartbeat_age_secs, Some(0));
    }

    #[test]
    fn test_missing_without_lock() {
        let a = evaluate(&without_status(None), Utc::now(), &policy());
        assert_eq!(a.state, ProcessState::Missing);
        assert!(a.state.needs_recovery());
    }

    #[test]
    fn test_missing_with_young_live_lock_is_starting() {
        let now = Utc::now();
        let owner = LockOwner {
            pid: 77,
            acquired_at: now - ChronoDuration::seconds(20),
            held: true,
            alive: true,
        };
        let a = evaluate(&without_status(Some(owner)), now, &policy());
        assert_eq!(a.state, ProcessState::Starting);
        assert_eq!(a.pid, Some(77));
        assert!(!a.state.needs_recovery());
    }

    #[test]
    fn test_missing_with_old_live_lock_is_missing() {
        let now = Utc::now();
        let owner = LockOwner {
            pid: 77,
            acquired_at: now - ChronoDuration::seconds(120),
            held: true,
            alive: true,
        };
        let a = evaluate(&without_status(Some(owner)), now, &policy());
        assert_eq!(a.state, ProcessState::Missing);
        assert_eq!(a.pid, Some(77));
    }

    #[test]
    fn test_missing_with_dead_lock_owner_is_missing() {
        let now = Utc::now();
        let owner = LockOwner {
            pid: 77,
            acquired_at: now,
            held: true,
            alive: false,
        };
        let a = evaluate(&without_status(Some(owner)), now, &policy());
        assert_eq!(a.state, ProcessState::Missing);
    }

    #[test]
    fn test_corrupt_status_is_treated_as_unavailable() {
        let snapshot = Snapshot {
            status: Err(StatusUnavailable::Corrupt("expected value".to_string())),
            status_pid_alive: false,
            lock_owner: None,
        };
        let a = evaluate(&snapshot, Utc::now(), &policy());
        assert_eq!(a.state, ProcessState::Missing);
        assert!(a.reason.contains("unreadable"));
    }
}
