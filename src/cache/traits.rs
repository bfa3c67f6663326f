//! Core traits and types for the caching system.

use chrono::Utc;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;

use super::storage::CacheError;

/// Trait for entities that can be cached.
///
/// Implementors must provide a unique cache key and the entity type name used
/// to name the durable cache file.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Unique identifier for this entity (e.g., client id)
  fn cache_key(&self) -> String;

  /// Entity type name for storage organization (e.g., "clients", "sales")
  fn entity_type() -> &'static str;
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheSource {
  /// Saved from a remote response
  Remote,
  /// Saved from locally produced data (e.g. rows created offline)
  Local,
}

/// Staleness information stored next to every cached list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetadata {
  /// When the data was saved, in milliseconds since the Unix epoch
  pub timestamp: i64,
  /// Schema version the data was written with
  pub version: u32,
  /// How long the data stays fresh
  pub ttl_millis: u64,
  pub source: CacheSource,
}

impl CacheMetadata {
  /// Create metadata stamped with the current time.
  pub fn new(version: u32, ttl: Duration, source: CacheSource) -> Self {
    Self {
      timestamp: now_millis(),
      version,
      ttl_millis: ttl.as_millis() as u64,
      source,
    }
  }

  /// Check if the data is older than its TTL.
  pub fn is_expired(&self) -> bool {
    self.is_expired_at(now_millis())
  }

  /// Check expiry against an explicit clock reading (milliseconds).
  pub fn is_expired_at(&self, now: i64) -> bool {
    now - self.timestamp > self.ttl_millis as i64
  }

  /// Time elapsed since the data was saved.
  pub fn age(&self) -> Duration {
    Duration::from_millis((now_millis() - self.timestamp).max(0) as u64)
  }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
  Utc::now().timestamp_millis()
}

/// Result from a cache read.
///
/// Exactly one variant is active; only `Success` and `Expired` carry data.
#[derive(Debug, Clone)]
pub enum CacheResult<T> {
  /// Data is within its TTL
  Success { data: T, metadata: CacheMetadata },
  /// Data is past its TTL but still usable offline
  Expired { data: T, metadata: CacheMetadata },
  /// Nothing cached
  Empty,
  /// The cache could not be read or written
  Error(CacheError),
}

impl<T> CacheResult<T> {
  /// Classify data by its metadata.
  pub fn classify(data: T, metadata: CacheMetadata) -> Self {
    if metadata.is_expired() {
      CacheResult::Expired { data, metadata }
    } else {
      CacheResult::Success { data, metadata }
    }
  }

  pub fn has_data(&self) -> bool {
    matches!(
      self,
      CacheResult::Success { .. } | CacheResult::Expired { .. }
    )
  }

  pub fn is_success(&self) -> bool {
    matches!(self, CacheResult::Success { .. })
  }

  pub fn is_expired(&self) -> bool {
    matches!(self, CacheResult::Expired { .. })
  }

  pub fn is_empty(&self) -> bool {
    matches!(self, CacheResult::Empty)
  }

  pub fn is_error(&self) -> bool {
    matches!(self, CacheResult::Error(_))
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      CacheResult::Success { data, .. } | CacheResult::Expired { data, .. } => Some(data),
      _ => None,
    }
  }

  pub fn metadata(&self) -> Option<&CacheMetadata> {
    match self {
      CacheResult::Success { metadata, .. } | CacheResult::Expired { metadata, .. } => {
        Some(metadata)
      }
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&CacheError> {
    match self {
      CacheResult::Error(e) => Some(e),
      _ => None,
    }
  }

  pub fn into_data(self) -> Option<T> {
    match self {
      CacheResult::Success { data, .. } | CacheResult::Expired { data, .. } => Some(data),
      _ => None,
    }
  }
}
