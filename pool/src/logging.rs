//! Tracing subscriber setup for the CLI and worker processes.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::{LogLevel, LoggingConfig};

/// Application-specific environment variable for log filtering (overrides config).
pub const LOG_ENV_VAR: &str = "SPEECH_POOL_LOG";

/// Build the filter: `SPEECH_POOL_LOG` if set and valid, otherwise the configured level.
pub fn filter(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new(level.as_directive()))
}

/// Worker processes log to stderr only; stdout carries protocol frames.
pub fn init_worker(level: LogLevel) -> Result<()> {
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .with_target(false),
        )
        .with(filter(level))
        .try_init()
        .context("Failed to install worker log subscriber")
}

/// CLI logs to stderr and optionally to `spctl.log` in the state directory.
///
/// The returned guard flushes the file writer on drop and must be held for
/// the lifetime of the program.
pub fn init_cli(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let (file_layer, guard) = if config.file {
        let log_path = speech_pool_common::dirs::log_path().context("Failed to determine log path")?;
        let log_dir = log_path.parent().context("Log path has no parent")?;
        let log_filename = log_path.file_name().context("Log path has no file name")?;

        let file_appender = tracing_appender::rolling::never(log_dir, log_filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        (
            Some(fmt::layer().with_writer(non_blocking).with_ansi(false)),
            Some(guard),
        )
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .with(filter(config.level))
        .try_init()
        .context("Failed to install log subscriber")?;

    Ok(guard)
}
