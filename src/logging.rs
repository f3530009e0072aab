//! Logging setup
//!
//! Human-readable logs go to stderr. When `AGENT_HIVE_LOG_DIR` is set, JSON
//! logs are also written to a daily rolling file in that directory.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Directory for JSON log files
pub const LOG_DIR_ENV: &str = "AGENT_HIVE_LOG_DIR";

const LOG_FILE_PREFIX: &str = "agent-hive.log";

/// Install the global subscriber
///
/// The filter defaults to `info` and follows `RUST_LOG`. Keep the returned
/// guard alive for the life of the process so the file writer flushes.
pub fn init_logging() -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

    let (file_layer, guard) = match std::env::var(LOG_DIR_ENV) {
        Ok(dir) if !dir.trim().is_empty() => {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create log directory {dir}"))?;
            let appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .boxed();
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}
