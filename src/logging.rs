//! tracing-subscriber setup shared by the watchdog and worker entry points.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Default filter directive from the `-v` / `-q` flags. `RUST_LOG` wins when
/// set.
pub fn default_directive(verbose: bool, quiet: bool) -> &'static str {
    if verbose {
        "shepherd=debug"
    } else if quiet {
        "shepherd=warn"
    } else {
        "shepherd=info"
    }
}

/// Log to stderr and, if `log_file` is given, append plain-text lines to it
/// as well. A log file that cannot be opened is reported and skipped.
pub fn init(verbose: bool, quiet: bool, log_file: Option<&Path>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose, quiet)));

    let mut open_error = None;
    let file_layer = log_file.and_then(|path| {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .with_target(false),
            ),
            Err(e) => {
                open_error = Some((path.to_path_buf(), e));
                None
            }
        }
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(file_layer)
        .init();

    if let Some((path, e)) = open_error {
        tracing::warn!(path = %path.display(), error = %e, "cannot open log file, logging to stderr only");
    }
}
