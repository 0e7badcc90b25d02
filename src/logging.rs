//! Tracing subscriber setup for the CLI.
//!
//! The filter comes from `SMARTCART_LOG`, falling back to the configured level.
//! Output goes to a daily-rotated file under `<data_dir>/logs`, or to stderr
//! when `--verbose` is given.

use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const LOG_ENV: &str = "SMARTCART_LOG";

/// Install the global subscriber.
///
/// The returned guard flushes buffered file output on drop; keep it alive
/// until the program exits.
pub fn init(level: &str, data_dir: &Path, verbose: bool) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_env(LOG_ENV)
    .or_else(|_| EnvFilter::try_new(level))
    .map_err(|e| eyre!("Invalid log filter: {e}"))?;

  if verbose {
    tracing_subscriber::registry()
      .with(filter)
      .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
      .try_init()
      .map_err(|e| eyre!("Failed to install logger: {e}"))?;
    return Ok(None);
  }

  let appender = tracing_appender::rolling::daily(data_dir.join("logs"), "smartcart.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);
  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .try_init()
    .map_err(|e| eyre!("Failed to install logger: {e}"))?;

  Ok(Some(guard))
}
