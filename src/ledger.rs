/// Restart ledger: the watchdog's only memory between invocations.
///
/// Tracks relaunch attempts for the current unhealthy episode, when the
/// worker was first seen healthy, any running cooldown, and whether the
/// retry budget has been exhausted. The counter resets only after the worker
/// has been healthy at every observation across `sustained_health_window`.
use crate::atomic::{write_atomic, AtomicWriteError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Decision for an unhealthy verdict, given the attempts already spent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptDecision {
    /// Budget remains; the next relaunch will be this 1-based attempt.
    Restart { attempt: u32 },
    /// All attempts used.
    Exhausted,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartLedger {
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub healthy_since: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub exhausted_at: Option<DateTime<Utc>>,
}

impl RestartLedger {
    /// Decide what an unhealthy verdict allows.
    pub fn decide(&self, max_attempts: u32) -> AttemptDecision {
        if self.attempts >= max_attempts {
            AttemptDecision::Exhausted
        } else {
            AttemptDecision::Restart {
                attempt: self.attempts + 1,
            }
        }
    }

    /// Record a relaunch. Returns the new attempt number.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) -> u32 {
        self.attempts += 1;
        self.last_attempt_at = Some(now);
        self.healthy_since = None;
        self.attempts
    }

    /// Record a healthy observation. Returns true if this observation
    /// completed a sustained-health window and reset the counter.
    pub fn observe_healthy(&mut self, now: DateTime<Utc>, window: Duration) -> bool {
        let since = *self.healthy_since.get_or_insert(now);
        if self.attempts == 0 && self.exhausted_at.is_none() {
            return false;
        }
        let healthy_for = (now - since).to_std().unwrap_or(Duration::ZERO);
        if healthy_for < window {
            return false;
        }
        info!(
            attempts = self.attempts,
            healthy_for_secs = healthy_for.as_secs(),
            "sustained health reached, resetting restart counter"
        );
        self.attempts = 0;
        self.exhausted_at = None;
        true
    }

    /// Any non-healthy observation breaks the healthy streak.
    pub fn observe_unhealthy(&mut self) {
        self.healthy_since = None;
    }

    /// Mark the retry budget as spent. Returns true the first time, so the
    /// caller raises the alert once per exhaustion.
    pub fn mark_exhausted(&mut self, now: DateTime<Utc>) -> bool {
        if self.exhausted_at.is_some() {
            return false;
        }
        self.exhausted_at = Some(now);
        true
    }

    pub fn start_cooldown(&mut self, now: DateTime<Utc>, delay: Duration) {
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        self.cooldown_until = Some(now + delay);
    }

    /// Remaining cooldown at `now`, if any.
    pub fn cooldown_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        let until = self.cooldown_until?;
        (until - now).to_std().ok().filter(|d| !d.is_zero())
    }

    pub fn end_cooldown(&mut self) {
        self.cooldown_until = None;
    }

    /// Operator reset: forget the episode entirely.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Loads and atomically saves the ledger file.
#[derive(Debug, Clone)]
pub struct LedgerStore {
    path: PathBuf,
}

impl LedgerStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Load the ledger. A missing file is a fresh ledger. A corrupt one is
    /// reported and replaced by a fresh ledger; the file is only ever written
    /// atomically, so corruption means outside tampering.
    pub fn load(&self) -> Result<RestartLedger, LedgerError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(RestartLedger::default())
            }
            Err(e) => {
                return Err(LedgerError::Read {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };
        match serde_json::from_str(&contents) {
            Ok(ledger) => Ok(ledger),
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "restart ledger is corrupt, starting a fresh one"
                );
                Ok(RestartLedger::default())
            }
        }
    }

    pub fn save(&self, ledger: &RestartLedger) -> Result<(), LedgerError> {
        let json = serde_json::to_string_pretty(ledger)
            .map_err(|e| LedgerError::Serialize { source: e })?;
        write_atomic(&self.path, json.as_bytes()).map_err(|e| LedgerError::Write { source: e })
    }

    #[cfg(test)]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

/// Errors from ledger persistence.
#[derive(Debug)]
pub enum LedgerError {
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

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerError::Read { path, source } => {
                write!(f, "failed to read restart ledger {}: {source}", path.display())
            }
            LedgerError::Serialize { source } => {
                write!(f, "failed to serialize restart ledger: {source}")
            }
            LedgerError::Write { source } => write!(f, "failed to write restart ledger: {source}"),
        }
    }
}

impl std::error::Error for LedgerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LedgerError::Read { source, .. } => Some(source),
            LedgerError::Serialize { source } => Some(source),
            LedgerError::Write { source } => Some(source),
        }
    }
}
