/// OS process control: liveness probes, signal delivery and detached worker
/// launches, behind the `ProcessControl` capability so the restart state
/// machine can be driven against a simulated process table in tests.
use crate::config::LaunchConfig;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};

/// What the supervisor needs from the operating system.
pub trait ProcessControl {
    /// True if a process with this pid exists (including ones we may not
    /// signal). pid 0 is never alive.
    fn is_alive(&self, pid: u32) -> bool;

    /// Ask the process (and its process group, if it leads one) to exit.
    fn terminate(&mut self, pid: u32) -> Result<(), ProcessError>;

    /// Kill the process (and its group) outright.
    fn kill(&mut self, pid: u32) -> Result<(), ProcessError>;

    /// Start a fresh, detached worker and return its pid, or None if it
    /// already exited and was reaped.
    fn launch(&mut self) -> Result<Option<u32>, ProcessError>;

    /// Whether the most recently launched worker has already exited.
    fn probe_launched(&mut self) -> LaunchProbe;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchProbe {
    Running,
    Exited { code: Option<i32> },
    /// Nothing was launched by this process, or its state is unknowable.
    Unknown,
}

/// Program and arguments the watchdog runs to start a worker.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub stdout_log: PathBuf,
    pub stderr_log: PathBuf,
}

impl LaunchSpec {
    /// Resolve the configured launch command. Without an explicit command the
    /// worker is this executable's `worker` subcommand, pointed at the same
    /// config file and runtime directory override.
    pub fn resolve(
        launch: &LaunchConfig,
        config_path: &Path,
        runtime_dir: Option<&Path>,
        stdout_log: PathBuf,
        stderr_log: PathBuf,
    ) -> std::io::Result<Self> {
        let (program, args) = match &launch.command {
            Some(command) => (PathBuf::from(command), launch.args.clone()),
            None => {
                let exe = std::env::current_exe()?;
                let config = std::path::absolute(config_path)?;
                let mut args = vec![
                    "--config".to_string(),
                    config.to_string_lossy().into_owned(),
                ];
                if let Some(dir) = runtime_dir {
                    args.push("--runtime-dir".to_string());
                    args.push(std::path::absolute(dir)?.to_string_lossy().into_owned());
                }
                args.push("worker".to_string());
                (exe, args)
            }
        };
        Ok(Self {
            program,
            args,
            working_dir: launch.working_dir.clone(),
            stdout_log,
            stderr_log,
        })
    }
}

/// Real process control via `kill(2)` and tokio's process spawning.
pub struct SystemProcesses {
    launch: LaunchSpec,
    own_pid: u32,
    launched: Option<Child>,
}

impl SystemProcesses {
    pub fn new(launch: LaunchSpec) -> Self {
        Self {
            launch,
            own_pid: std::process::id(),
            launched: None,
        }
    }

    fn deliver(&self, pid: u32, signal: nix::sys::signal::Signal) -> Result<(), ProcessError> {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Some(raw) = signal_target(pid, self.own_pid) else {
            return Err(ProcessError::InvalidPid { pid });
        };

        // The worker is launched as a process-group leader so its payload
        // children go down with it. Fall back to the bare pid if it is not.
        match kill(Pid::from_raw(-raw), signal) {
            Ok(()) => return Ok(()),
            Err(Errno::ESRCH) | Err(Errno::EPERM) => {}
            Err(err) => {
                tracing::debug!(pid, ?signal, error = %err, "process group signal failed");
            }
        }
        match kill(Pid::from_raw(raw), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(err) => Err(ProcessError::Signal {
                pid,
                signal: signal.as_str(),
                source: std::io::Error::from(err),
            }),
        }
    }
}

impl ProcessControl for SystemProcesses {
    fn is_alive(&self, pid: u32) -> bool {
        pid_alive(pid)
    }

    fn terminate(&mut self, pid: u32) -> Result<(), ProcessError> {
        self.deliver(pid, nix::sys::signal::Signal::SIGTERM)
    }

    fn kill(&mut self, pid: u32) -> Result<(), ProcessError> {
        self.deliver(pid, nix::sys::signal::Signal::SIGKILL)
    }

    fn launch(&mut self) -> Result<Option<u32>, ProcessError> {
        let spec = &self.launch;
        let stdout = File::create(&spec.stdout_log).map_err(|e| ProcessError::Spawn {
            program: spec.program.clone(),
            source: e,
        })?;
        let stderr = File::create(&spec.stderr_log).map_err(|e| ProcessError::Spawn {
            program: spec.program.clone(),
            source: e,
        })?;

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .process_group(0); // Own group: survives the watchdog, dies as a unit
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        tracing::info!(
            program = %spec.program.display(),
            args = ?spec.args,
            "launching worker"
        );
        let child = command.spawn().map_err(|e| ProcessError::Spawn {
            program: spec.program.clone(),
            source: e,
        })?;
        let pid = child.id();
        self.launched = Some(child);
        Ok(pid)
    }

    fn probe_launched(&mut self) -> LaunchProbe {
        match self.launched.as_mut().map(Child::try_wait) {
            Some(Ok(None)) => LaunchProbe::Running,
            Some(Ok(Some(status))) => LaunchProbe::Exited {
                code: status.code(),
            },
            Some(Err(e)) => {
                tracing::debug!(error = %e, "could not poll launched worker");
                LaunchProbe::Unknown
            }
            None => LaunchProbe::Unknown,
        }
    }
}

/// Convert a recorded pid into something safe to pass to `kill(2)`.
/// Rejects 0, values that overflow `pid_t`, and our own pid.
fn signal_target(pid: u32, own_pid: u32) -> Option<i32> {
    if pid == 0 || pid == own_pid {
        return None;
    }
    i32::try_from(pid).ok()
}

/// Probe a pid with signal 0. EPERM means it exists under another user.
pub fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw == 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None::<Signal>) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Last `max_bytes` of a captured log, for surfacing startup failures.
pub fn log_tail(path: &Path, max_bytes: usize) -> Option<String> {
    let contents = std::fs::read(path).ok()?;
    let start = contents.len().saturating_sub(max_bytes);
    let tail = String::from_utf8_lossy(&contents[start..]).trim().to_string();
    (!tail.is_empty()).then_some(tail)
}

/// Errors from process control operations.
#[derive(Debug)]
pub enum ProcessError {
    InvalidPid {
        pid: u32,
    },
    Signal {
        pid: u32,
        signal: &'static str,
        source: std::io::Error,
    },
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessError::InvalidPid { pid } => write!(f, "refusing to signal pid {pid}"),
            ProcessError::Signal {
                pid,
                signal,
                source,
            } => write!(f, "failed to send {signal} to {pid}: {source}"),
            ProcessError::Spawn { program, source } => {
                write!(f, "failed to launch {}: {source}", program.display())
            }
        }
    }
}

impl std::error::Error for ProcessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProcessError::InvalidPid { .. } => None,
            ProcessError::Signal { source, .. } => Some(source),
            ProcessError::Spawn { source, .. } => Some(source),
        }
    }
}
