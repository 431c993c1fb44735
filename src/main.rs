mod atomic;
mod config;
mod health;
mod heartbeat;
mod ledger;
mod lock;
mod logging;
mod process;
mod restart;
mod runtime_dir;
mod signals;
mod watchdog;
mod worker;

use clap::{Parser, Subcommand};
use config::ShepherdConfig;
use lock::LockError;
use process::{LaunchSpec, SystemProcesses};
use restart::{RestartPolicy, StopResult};
use runtime_dir::RuntimeDir;
use std::path::PathBuf;
use std::process::ExitCode;
use watchdog::{CycleResult, StartOutcome, Supervisor, SupervisorError};
use worker::{CommandPayload, LoopSettings, WorkerError, WorkerHost};

/// Exit code for configuration and internal failures.
const EXIT_INTERNAL: u8 = 3;

/// Keeps one long-running worker alive on a single host: a lock-guarded
/// worker that publishes heartbeats, and a cron-driven watchdog that
/// restarts it when the heartbeat goes stale or the process dies.
#[derive(Parser, Debug)]
#[command(name = "shepherd", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "shepherd.toml", global = true)]
    config: PathBuf,

    /// Runtime directory for lock, status and ledger files (overrides config)
    #[arg(long, global = true)]
    runtime_dir: Option<PathBuf>,

    /// Print worker status and exit without acting
    #[arg(long, group = "mode")]
    status: bool,

    /// Print status as JSON (with --status)
    #[arg(long, requires = "status")]
    json: bool,

    /// Start the worker if it is not already running
    #[arg(long, group = "mode")]
    start: bool,

    /// Stop the worker gracefully (SIGTERM, then SIGKILL after the grace period)
    #[arg(long, group = "mode")]
    stop: bool,

    /// Evaluate and act; exit 0 healthy, 1 unhealthy (acted), 2 retries exhausted
    #[arg(long, group = "mode")]
    check: bool,

    /// Clear the restart counter and any exhausted state
    #[arg(long, group = "mode")]
    reset: bool,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the supervised worker loop (normally launched by the watchdog)
    Worker,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match ShepherdConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            logging::init(cli.verbose, cli.quiet, None);
            tracing::error!("{e}");
            return ExitCode::from(EXIT_INTERNAL);
        }
    };
    if let Some(dir) = &cli.runtime_dir {
        config.worker.runtime_dir = dir.clone();
    }
    let runtime = RuntimeDir::new(&config.worker.runtime_dir, &config.worker.identity);

    // The watchdog keeps a decision log in the runtime directory; the worker
    // logs to stderr, which the watchdog captures.
    let watchdog_acts = cli.command.is_none() && !cli.status;
    let log_file = if watchdog_acts && runtime.init().is_ok() {
        Some(runtime.watchdog_log())
    } else {
        None
    };
    logging::init(cli.verbose, cli.quiet, log_file.as_deref());
    tracing::debug!(?cli, "parsed CLI arguments");

    if let Err(e) = config.validate() {
        tracing::error!("{e}");
        return ExitCode::from(EXIT_INTERNAL);
    }

    match cli.command {
        Some(Command::Worker) => run_worker(&config, runtime).await,
        None => run_watchdog(&cli, &config, runtime).await,
    }
}

async fn run_worker(config: &ShepherdConfig, runtime: RuntimeDir) -> ExitCode {
    let payload = match CommandPayload::from_config(&config.task) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::error!("{e}");
            return ExitCode::from(EXIT_INTERNAL);
        }
    };
    let shutdown = signals::ShutdownSignal::new();
    if let Err(e) = shutdown.install() {
        tracing::error!("{}", WorkerError::Signals(e));
        return ExitCode::from(EXIT_INTERNAL);
    }

    let host = WorkerHost::new(
        runtime,
        LoopSettings::from_config(&config.worker),
        payload,
        shutdown,
    );
    match host.run().await {
        Ok(summary) => {
            tracing::info!(
                ticks = summary.ticks,
                failed_ticks = summary.failed_ticks,
                "worker exiting: {}",
                summary.reason
            );
            ExitCode::SUCCESS
        }
        Err(WorkerError::Lock(e @ LockError::AlreadyRunning { .. })) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::from(EXIT_INTERNAL)
        }
    }
}

async fn run_watchdog(cli: &Cli, config: &ShepherdConfig, runtime: RuntimeDir) -> ExitCode {
    let spec = match LaunchSpec::resolve(
        &config.launch,
        &cli.config,
        cli.runtime_dir.as_deref(),
        runtime.stdout_log(),
        runtime.stderr_log(),
    ) {
        Ok(spec) => spec,
        Err(e) => {
            tracing::error!(error = %e, "cannot resolve worker launch command");
            return ExitCode::from(EXIT_INTERNAL);
        }
    };
    let policy = RestartPolicy::from_config(&config.watchdog, Some(runtime.stderr_log()));
    let mut supervisor = Supervisor::new(runtime, policy, SystemProcesses::new(spec));

    if cli.status {
        let report = supervisor.status_report();
        if cli.json {
            match serde_json::to_string_pretty(&report) {
                Ok(json) => println!("{json}"),
                Err(e) => {
                    tracing::error!(error = %e, "failed to serialize status report");
                    return ExitCode::from(EXIT_INTERNAL);
                }
            }
        } else {
            print!("{}", report.render_text());
        }
        return ExitCode::SUCCESS;
    }

    if cli.start {
        return match supervisor.force_start().await {
            Ok(StartOutcome::Started { pid }) => {
                match pid {
                    Some(pid) => println!("started worker (pid {pid})"),
                    None => println!("started worker"),
                }
                ExitCode::SUCCESS
            }
            Ok(StartOutcome::AlreadyRunning { pid }) => {
                match pid {
                    Some(pid) => println!("worker already running (pid {pid})"),
                    None => println!("worker already running"),
                }
                ExitCode::SUCCESS
            }
            Ok(StartOutcome::ExitedEarly { code }) => {
                println!("worker exited during startup (exit code {code:?})");
                ExitCode::FAILURE
            }
            Err(e) => supervisor_failure(e),
        };
    }

    if cli.stop {
        return match supervisor.stop().await {
            Ok(StopResult::NotRunning) => {
                println!("worker is not running");
                ExitCode::SUCCESS
            }
            Ok(StopResult::Graceful) | Ok(StopResult::Forced) => {
                println!("worker stopped");
                ExitCode::SUCCESS
            }
            Ok(StopResult::Unresponsive) => {
                println!("worker did not respond to SIGKILL");
                ExitCode::FAILURE
            }
            Err(e) => supervisor_failure(e),
        };
    }

    if cli.reset {
        return match supervisor.reset() {
            Ok(previous) => {
                println!(
                    "restart ledger reset (was {} attempts{})",
                    previous.attempts,
                    if previous.exhausted_at.is_some() { ", exhausted" } else { "" }
                );
                ExitCode::SUCCESS
            }
            Err(e) => supervisor_failure(e),
        };
    }

    let result = match supervisor.run_cycle().await {
        Ok(result) => result,
        Err(e) => {
            tracing::error!("{e}");
            return ExitCode::from(EXIT_INTERNAL);
        }
    };
    if cli.check {
        println!("{}", check_line(&result));
        ExitCode::from(result.exit_code())
    } else {
        ExitCode::SUCCESS
    }
}

fn supervisor_failure(e: SupervisorError) -> ExitCode {
    tracing::error!("{e}");
    match e {
        SupervisorError::Busy { .. } => ExitCode::FAILURE,
        _ => ExitCode::from(EXIT_INTERNAL),
    }
}

/// One-line `key=value` summary for `--check`.
fn check_line(result: &CycleResult) -> String {
    use restart::CycleOutcome;

    let report = match result {
        CycleResult::Busy { .. } => return "outcome=busy exit=0".to_string(),
        CycleResult::Completed(report) => report,
    };
    let state = report
        .assessment
        .as_ref()
        .map(|a| a.state.as_str())
        .unwrap_or("unknown");
    let outcome = match &report.outcome {
        CycleOutcome::Healthy => "healthy".to_string(),
        CycleOutcome::Deferred { remaining_secs } => format!("deferred cooldown_secs={remaining_secs}"),
        CycleOutcome::Relaunched { attempt, pid } => match pid {
            Some(pid) => format!("relaunched attempt={attempt} pid={pid}"),
            None => format!("relaunched attempt={attempt}"),
        },
        CycleOutcome::Failed { .. } => "failed".to_string(),
        CycleOutcome::Exhausted { .. } => "exhausted".to_string(),
    };
    format!(
        "state={state} outcome={outcome} attempts={} exit={}",
        report.attempts,
        result.exit_code()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_modes_are_mutually_exclusive() {
        assert!(Cli::try_parse_from(["shepherd", "--status", "--stop"]).is_err());
        assert!(Cli::try_parse_from(["shepherd", "--json"]).is_err());
        let cli = Cli::try_parse_from(["shepherd", "--status", "--json"]).unwrap();
        assert!(cli.status && cli.json);
    }

    #[test]
    fn test_worker_subcommand_with_global_flags() {
        let cli = Cli::try_parse_from([
            "shepherd",
            "--config",
            "/etc/shepherd.toml",
            "--runtime-dir",
            "/srv/run",
            "worker",
        ])
        .unwrap();
        assert!(matches!(cli.command, Some(Command::Worker)));
        assert_eq!(cli.config, PathBuf::from("/etc/shepherd.toml"));
        assert_eq!(cli.runtime_dir, Some(PathBuf::from("/srv/run")));
    }

    #[test]
    fn test_check_line_for_busy_cycle() {
        assert_eq!(
            check_line(&CycleResult::Busy { pid: Some(1) }),
            "outcome=busy exit=0"
        );
    }
}
