//! Tracing setup for the `cloudvm` binary.
//!
//! Stderr output is filtered by `RUST_LOG` (default `warn`). With
//! `CLOUDVM_LOG=1` a second layer (default `info`) also writes to
//! `cloudvm/cloudvm.log` under the local data directory.

use std::path::PathBuf;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub const LOG_ENV: &str = "CLOUDVM_LOG";
pub const LOG_FILE: &str = "cloudvm.log";

/// Keeps the non-blocking file writer alive. Hold it until the process exits.
pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Install the global subscriber. `verbose` raises the default level to `debug`.
pub fn init(verbose: bool) -> LogGuard {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if std::env::var(LOG_ENV).as_deref() != Ok("1") {
        tracing_subscriber::registry()
            .with(filter())
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .init();
        return LogGuard { _file_guard: None };
    }

    let dir = log_dir();
    let _ = std::fs::create_dir_all(&dir);
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(&dir, LOG_FILE));

    let file_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false).with_filter(filter()))
        .with(fmt::layer().with_writer(writer).with_ansi(false).with_filter(file_filter))
        .init();

    LogGuard { _file_guard: Some(guard) }
}

pub fn log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("cloudvm")
}
