//! Tracing subscriber setup for the CLI.
//!
//! Reads `REFSMITH_LOG` (an `EnvFilter` directive). Defaults to `info`, or
//! `debug` with `--verbose`. Output goes to stderr, human-readable or JSON,
//! plus an optional daily-rolling file under `<data_dir>/logs`.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LogFormat, LoggingConfig};

pub const LOG_ENV: &str = "REFSMITH_LOG";

/// Build the filter from `REFSMITH_LOG`, falling back to `default_directive`.
pub fn env_filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// Install the global subscriber. The returned guard must be held for the
/// life of the process when file logging is on, or buffered lines are lost.
pub fn init(config: &LoggingConfig, logs_dir: &Path, verbose: bool) -> Result<Option<WorkerGuard>> {
    let filter = env_filter(if verbose { "debug" } else { "info" });

    let (pretty, json) = match config.format {
        LogFormat::Pretty => (
            Some(fmt::layer().with_writer(std::io::stderr).compact()),
            None,
        ),
        LogFormat::Json => (
            None,
            Some(fmt::layer().json().with_writer(std::io::stderr)),
        ),
    };

    let (file, guard) = if config.file {
        std::fs::create_dir_all(logs_dir)
            .with_context(|| format!("Failed to create {}", logs_dir.display()))?;
        let appender = tracing_appender::rolling::daily(logs_dir, "refsmith.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        (
            Some(fmt::layer().with_ansi(false).with_writer(writer)),
            Some(guard),
        )
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(pretty)
        .with(json)
        .with(file)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_filter_default_directive() {
        // REFSMITH_LOG is not set under test
        let filter = env_filter("warn");
        assert!(filter.to_string().contains("warn"));
    }
}
