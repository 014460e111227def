//! Tracing subscriber assembly: an `EnvFilter`-gated `fmt` layer on stderr, plus an optional
//! non-blocking file layer when `--log-file` is given.
//!
//! Grounded in the `tracing_subscriber::Registry` + `EnvFilter` + `fmt::layer()` composition used
//! throughout `lib/vector-buffers/src/disk_v2/tests/mod.rs`, wired here for production use instead
//! of a test-only installer.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

/// Holds the non-blocking file writer's flush guard; must be kept alive for the process lifetime
/// when a log file is configured, or buffered log lines are lost on exit.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Installs the global subscriber. `RUST_LOG` (read by [`EnvFilter::from_default_env`]) controls
/// verbosity; absent that, everything at `info` and above is emitted.
pub fn init(log_file: Option<&Path>) -> Result<LoggingGuard, std::io::Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_target(false);

    let (file_layer, file_guard) = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
            let (non_blocking, guard) = tracing_appender::non_blocking(file);
            let layer = tracing_subscriber::fmt::layer().with_writer(non_blocking).json();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    Registry::default().with(filter).with(stderr_layer).with(file_layer).init();

    Ok(LoggingGuard { _file_guard: file_guard })
}
