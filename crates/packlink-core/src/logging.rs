//! Logging configuration using tracing

use std::path::PathBuf;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::Result;

/// Environment variable controlling the log filter.
pub const LOG_ENV_VAR: &str = "PACKLINK_LOG";

const DEFAULT_FILTER: &str = "packlink=info,packlink_client=info,warn";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Initialize the logging subsystem
///
/// Logs are written to `~/.local/share/packlink/logs/`
/// Log level is controlled by the `PACKLINK_LOG` environment variable.
///
/// # Examples
/// ```bash
/// PACKLINK_LOG=debug packlink listen
/// PACKLINK_LOG=packlink_client=trace packlink listen
/// ```
pub fn init() -> Result<()> {
    let log_dir = get_log_directory()?;
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "packlink.log");

    tracing_subscriber::registry()
        .with(env_filter())
        .with(
            fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(true)
                .with_line_number(true)
                .with_timer(fmt::time::ChronoLocal::new(TIMESTAMP_FORMAT.to_string())),
        )
        .init();

    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("packlink starting");
    tracing::info!("Log directory: {}", log_dir.display());
    tracing::info!("═══════════════════════════════════════════════════════");

    Ok(())
}

/// Initialize logging to stderr instead of the rolling log file.
pub fn init_stderr() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_timer(fmt::time::ChronoLocal::new(TIMESTAMP_FORMAT.to_string())),
        )
        .init();
}

fn env_filter() -> EnvFilter {
    // Default to info, allow override via PACKLINK_LOG
    EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Get the log directory path
fn get_log_directory() -> Result<PathBuf> {
    let base = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    Ok(base.join("packlink").join("logs"))
}

/// Get the log file path for the current day
pub fn get_current_log_file() -> Result<PathBuf> {
    let dir = get_log_directory()?;
    Ok(dir.join("packlink.log"))
}
