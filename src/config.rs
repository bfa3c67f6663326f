use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::CacheSettings;
use crate::sync::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncSettings,
  #[serde(default)]
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base URL of the remote service
  pub url: String,
  /// Acting user forwarded to handlers as `user_id`
  pub user_id: Option<String>,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
  /// Optional endpoint for fire-and-forget outcome logging
  pub log_endpoint: Option<String>,
}

fn default_timeout_secs() -> u64 {
  30
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
  /// Cache directory (defaults to the platform cache dir)
  pub dir: Option<PathBuf>,
  /// Per entity type settings, keyed by entity type name
  #[serde(default)]
  pub entities: BTreeMap<String, EntityCacheConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntityCacheConfig {
  /// File name without extension (defaults to the entity type name)
  pub file_name: Option<String>,
  #[serde(default = "default_cache_version")]
  pub version: u32,
  #[serde(default = "default_ttl_secs")]
  pub ttl_secs: u64,
}

fn default_cache_version() -> u32 {
  1
}

fn default_ttl_secs() -> u64 {
  3600
}

impl CacheConfig {
  /// Resolve the cache directory.
  pub fn dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.dir {
      return Ok(dir.clone());
    }
    let cache_dir = dirs::cache_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".cache")))
      .ok_or_else(|| eyre!("Could not determine cache directory"))?;
    Ok(cache_dir.join("fieldsync"))
  }

  /// Settings for an entity type, falling back to defaults when unconfigured.
  pub fn settings_for(&self, entity_type: &str) -> CacheSettings {
    match self.entities.get(entity_type) {
      Some(entity) => CacheSettings::new(
        entity
          .file_name
          .clone()
          .unwrap_or_else(|| entity_type.to_string()),
        entity.version,
        Duration::from_secs(entity.ttl_secs),
      ),
      None => CacheSettings::new(
        entity_type,
        default_cache_version(),
        Duration::from_secs(default_ttl_secs()),
      ),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncSettings {
  /// Path of the job database (defaults to the platform data dir)
  pub database: Option<PathBuf>,
  #[serde(default = "default_poll_interval_ms")]
  pub poll_interval_ms: u64,
  /// Maximum jobs executing at once
  #[serde(default = "default_concurrency")]
  pub concurrency: usize,
  #[serde(default)]
  pub retry: RetryPolicy,
}

fn default_poll_interval_ms() -> u64 {
  5_000
}

fn default_concurrency() -> usize {
  4
}

impl Default for SyncSettings {
  fn default() -> Self {
    Self {
      database: None,
      poll_interval_ms: default_poll_interval_ms(),
      concurrency: default_concurrency(),
      retry: RetryPolicy::default(),
    }
  }
}

impl SyncSettings {
  /// Resolve the job database path.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.database {
      return Ok(path.clone());
    }
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;
    Ok(data_dir.join("fieldsync").join("fieldsync.db"))
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_millis(self.poll_interval_ms)
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
  /// Directory for daily rolling log files; stderr when unset
  pub directory: Option<PathBuf>,
  /// Default filter when RUST_LOG is unset (e.g. "info", "fieldsync=debug")
  pub level: Option<String>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./fieldsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/fieldsync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/fieldsync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("fieldsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("fieldsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Get the API token from the environment, if any.
  ///
  /// Checks FIELDSYNC_API_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("FIELDSYNC_API_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::parse("api:\n  url: https://ventas.example.com/api/\n").unwrap();

    assert_eq!(config.api.timeout_secs, 30);
    assert_eq!(config.sync.concurrency, 4);
    assert_eq!(config.sync.retry, RetryPolicy::default());
    assert!(config.logging.directory.is_none());

    let settings = config.cache.settings_for("clients");
    assert_eq!(settings.file_name, "clients");
    assert_eq!(settings.version, 1);
    assert_eq!(settings.ttl, Duration::from_secs(3600));
  }

  #[test]
  fn test_full_config() {
    let yaml = r#"
api:
  url: https://ventas.example.com/api/
  user_id: vendedor-12
  timeout_secs: 10
cache:
  dir: /tmp/fieldsync-cache
  entities:
    clients:
      file_name: clients_cache
      version: 3
      ttl_secs: 600
sync:
  database: /tmp/fieldsync.db
  poll_interval_ms: 250
  concurrency: 2
  retry:
    max_attempts: 8
    base_delay_ms: 1000
    max_delay_ms: 60000
logging:
  directory: /tmp/logs
  level: debug
"#;
    let config = Config::parse(yaml).unwrap();

    assert_eq!(config.api.user_id.as_deref(), Some("vendedor-12"));
    assert_eq!(config.cache.dir().unwrap(), PathBuf::from("/tmp/fieldsync-cache"));
    let settings = config.cache.settings_for("clients");
    assert_eq!(settings.file_name, "clients_cache");
    assert_eq!(settings.version, 3);
    assert_eq!(settings.ttl, Duration::from_secs(600));
    assert_eq!(config.sync.poll_interval(), Duration::from_millis(250));
    assert_eq!(config.sync.retry.max_attempts, 8);
    assert_eq!(
      config.sync.database_path().unwrap(),
      PathBuf::from("/tmp/fieldsync.db")
    );
    assert_eq!(config.logging.level.as_deref(), Some("debug"));
  }

  #[test]
  fn test_missing_api_section_is_error() {
    assert!(Config::parse("cache: {}\n").is_err());
  }

  #[test]
  fn test_explicit_missing_path_is_error() {
    let err = Config::load(Some(Path::new("/definitely/not/here.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }
}
