//! Log setup
//!
//! Always logs to stdout. When a directory is configured, also writes a
//! daily-rolling file through a non-blocking writer; the returned guard must be
//! held for the life of the process or buffered lines are lost.

use crate::config::LoggingConfig;
use crate::error::{RelayError, Result};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "sentinel_relay=info,info";

/// `RUST_LOG`, or [`DEFAULT_FILTER`]
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into())
}

/// Install the global subscriber
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let (file_layer, guard) = match file_writer(config)? {
        Some((writer, guard)) => (
            Some(fmt::layer().with_ansi(false).with_writer(writer)),
            Some(guard),
        ),
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer())
        .with(file_layer)
        .try_init()
        .map_err(|e| RelayError::config(format!("failed to install logger: {}", e)))?;

    Ok(guard)
}

fn file_writer(config: &LoggingConfig) -> Result<Option<(NonBlocking, WorkerGuard)>> {
    let Some(directory) = &config.directory else {
        return Ok(None);
    };

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(&config.file_prefix)
        .build(directory)
        .map_err(|e| {
            RelayError::config(format!("cannot log to {}: {}", directory.display(), e))
        })?;

    Ok(Some(tracing_appender::non_blocking(appender)))
}
