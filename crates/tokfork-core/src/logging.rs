//! Tracing subscriber setup.
//!
//! `TOKFORK_LOG` takes precedence over the configured level and accepts any
//! `EnvFilter` directive (e.g. `TOKFORK_LOG=tokfork_core=debug`).

use std::fs;

use anyhow::{Context, Result, anyhow};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::{LogConfig, paths};

pub const LOG_ENV: &str = "TOKFORK_LOG";
pub const LOG_FILE_NAME: &str = "tokfork.log";

/// Keeps the background log writer alive. Hold it until exit so buffered
/// lines are flushed.
#[must_use = "dropping the guard stops the log writer"]
pub struct LogGuard {
    _writer: Option<WorkerGuard>,
}

fn env_filter(config: &LogConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_env(LOG_ENV) {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level)
            .with_context(|| format!("Invalid log level '{}'", config.level)),
    }
}

/// Installs the global subscriber.
///
/// Logs go to `$TOKFORK_HOME/logs/tokfork.log`, or to stderr when `verbose`
/// is set or file logging is disabled.
///
/// # Errors
/// Returns an error for an invalid level, an unwritable log directory or when
/// a global subscriber is already installed.
pub fn init(config: &LogConfig, verbose: bool) -> Result<LogGuard> {
    let filter = env_filter(config)?;

    if verbose || !config.file {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|e| anyhow!("Failed to install logger: {e}"))?;
        return Ok(LogGuard { _writer: None });
    }

    let dir = paths::log_dir();
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
    let appender = tracing_appender::rolling::never(&dir, LOG_FILE_NAME);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(writer)
        .try_init()
        .map_err(|e| anyhow!("Failed to install logger: {e}"))?;
    Ok(LogGuard {
        _writer: Some(guard),
    })
}
