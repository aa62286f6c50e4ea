use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;

/// Install the global subscriber.
///
/// Logs go to stderr, and additionally to `fieldsync.log.<date>` when a
/// directory is configured. Keep the returned guard alive until exit or
/// buffered file output is lost.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(&config.level))
    .map_err(|e| eyre!("Invalid log level {:?}: {}", config.level, e))?;

  let stderr = fmt::layer().with_writer(std::io::stderr).with_target(false);

  let (file, guard) = match &config.directory {
    Some(dir) => {
      std::fs::create_dir_all(dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;
      let appender = tracing_appender::rolling::daily(dir, "fieldsync.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let layer = fmt::layer().with_writer(writer).with_ansi(false).boxed();
      (Some(layer), Some(guard))
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(filter)
    .with(stderr)
    .with(file)
    .try_init()
    .map_err(|e| eyre!("Failed to install logger: {}", e))?;

  tracing::debug!(level = %config.level, "logging initialized");
  Ok(guard)
}
