use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

const LOG_FILE_PREFIX: &str = "fieldsync.log";
const DEFAULT_LEVEL: &str = "info";

/// Filter from `RUST_LOG`, falling back to the configured level.
pub fn filter(config: &LoggingConfig) -> Result<EnvFilter> {
  if let Ok(filter) = EnvFilter::try_from_default_env() {
    return Ok(filter);
  }
  let level = config.level.as_deref().unwrap_or(DEFAULT_LEVEL);
  EnvFilter::try_new(level).map_err(|e| eyre!("Invalid log level '{}': {}", level, e))
}

/// Install the global subscriber.
///
/// Logs go to a daily rolling file when a directory is configured, otherwise
/// to stderr. The returned guard flushes the file writer when dropped and
/// must be held for the life of the process.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
  let filter = filter(config)?;

  match &config.directory {
    Some(directory) => {
      std::fs::create_dir_all(directory)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", directory.display(), e))?;
      let appender = tracing_appender::rolling::daily(directory, LOG_FILE_PREFIX);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .map_err(|e| eyre!("Failed to install logger: {}", e))?;
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| eyre!("Failed to install logger: {}", e))?;
      Ok(None)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_invalid_level_is_rejected() {
    if std::env::var_os("RUST_LOG").is_some() {
      return;
    }
    let config = LoggingConfig {
      directory: None,
      level: Some("fieldsync=loud".into()),
    };
    assert!(filter(&config).is_err());

    let config = LoggingConfig {
      directory: None,
      level: Some("fieldsync=debug,warn".into()),
    };
    assert!(filter(&config).is_ok());
  }
}
