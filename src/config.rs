use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from shepherd.toml.
///
/// Loaded once per invocation and never mutated afterwards; CLI overrides are
/// merged in `main` before anything else reads it.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ShepherdConfig {
    pub worker: WorkerConfig,
    pub watchdog: WatchdogConfig,
    pub task: TaskConfig,
    pub launch: LaunchConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Logical worker name; names the lock, status and ledger files.
    pub identity: String,
    /// Directory holding all runtime artifacts. Keep it on local disk.
    pub runtime_dir: PathBuf,
    pub tick_interval_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub unhealthy_after_failures: u32,
    pub max_diagnostics: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub max_heartbeat_age_secs: u64,
    pub max_restart_attempts: u32,
    pub restart_delay_secs: u64,
    pub startup_grace_secs: u64,
    pub sustained_health_window_secs: u64,
    pub grace_timeout_secs: u64,
    pub kill_timeout_secs: u64,
    pub launch_settle_secs: u64,
    pub poll_interval_ms: u64,
}

/// The payload the worker runs once per tick.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TaskConfig {
    pub command: Option<String>,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

/// How the watchdog starts a fresh worker. `command = None` means
/// "this executable, `worker` subcommand".
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LaunchConfig {
    pub command: Option<String>,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

// --- Default implementations ---

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            identity: "worker".to_string(),
            runtime_dir: PathBuf::from("/tmp/shepherd"),
            tick_interval_secs: 30,
            heartbeat_interval_secs: 10,
            unhealthy_after_failures: 3,
            max_diagnostics: 10,
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            max_heartbeat_age_secs: 60,
            max_restart_attempts: 3,
            restart_delay_secs: 30,
            startup_grace_secs: 60,
            sustained_health_window_secs: 600,
            grace_timeout_secs: 30,
            kill_timeout_secs: 5,
            launch_settle_secs: 3,
            poll_interval_ms: 250,
        }
    }
}

impl WatchdogConfig {
    pub fn max_heartbeat_age(&self) -> Duration {
        Duration::from_secs(self.max_heartbeat_age_secs)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_secs(self.startup_grace_secs)
    }

    pub fn sustained_health_window(&self) -> Duration {
        Duration::from_secs(self.sustained_health_window_secs)
    }

    pub fn grace_timeout(&self) -> Duration {
        Duration::from_secs(self.grace_timeout_secs)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_secs(self.kill_timeout_secs)
    }

    pub fn launch_settle(&self) -> Duration {
        Duration::from_secs(self.launch_settle_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl WorkerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    /// Heartbeat refresh cadence while sleeping between ticks. Never longer
    /// than the tick interval itself.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.clamp(1, self.tick_interval_secs.max(1)))
    }
}

impl ShepherdConfig {
    /// Load config from `path`. A missing file yields defaults; a file that
    /// exists but does not parse is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        let config: Self = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(config)
    }

    /// Reject settings that would make the supervisor misbehave silently.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let identity = &self.worker.identity;
        if identity.is_empty() {
            return Err(ConfigError::Invalid("worker.identity must not be empty".into()));
        }
        if identity.contains(['/', '\\']) || identity == "." || identity == ".." {
            return Err(ConfigError::Invalid(format!(
                "worker.identity {identity:?} must be a plain file name"
            )));
        }
        if self.watchdog.max_heartbeat_age_secs == 0 {
            return Err(ConfigError::Invalid(
                "watchdog.max_heartbeat_age_secs must be greater than zero".into(),
            ));
        }
        if self.worker.tick_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "worker.tick_interval_secs must be greater than zero".into(),
            ));
        }
        if self.worker.heartbeat_interval_secs >= self.watchdog.max_heartbeat_age_secs {
            tracing::warn!(
                heartbeat_interval_secs = self.worker.heartbeat_interval_secs,
                max_heartbeat_age_secs = self.watchdog.max_heartbeat_age_secs,
                "heartbeat interval is not shorter than the stale threshold; idle workers will look stale"
            );
        }
        Ok(())
    }
}

/// Errors from loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}
