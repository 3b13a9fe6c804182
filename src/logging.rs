//! Log setup. Output goes to a daily rolling file so the CLI's stdout
//! stays clean for results.

use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the log filter, e.g. "socialsync=debug".
pub const LOG_ENV: &str = "SOCIALSYNC_LOG";

const DEFAULT_FILTER: &str = "info";

/// Directory log files are written to.
pub fn log_dir() -> Result<PathBuf> {
  dirs::data_dir()
    .map(|dir| dir.join("socialsync").join("logs"))
    .ok_or_else(|| eyre!("Could not determine data directory"))
}

/// Install the global subscriber. Keep the returned guard alive until exit
/// or buffered lines are lost.
pub fn init() -> Result<WorkerGuard> {
  let dir = log_dir()?;
  std::fs::create_dir_all(&dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(&dir, "socialsync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter =
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

  tracing_subscriber::registry()
    .with(filter)
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false),
    )
    .try_init()
    .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;

  Ok(guard)
}
