//! Offline cache that serves entity lists from memory or a durable file.

use std::fmt::Display;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::storage::{self, CacheError, CacheFile, CacheWrapper};
use super::traits::{CacheMetadata, CacheResult, CacheSource, Cacheable};

/// Per-entity-type cache configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
  /// File name without the `.json` suffix
  pub file_name: String,
  /// Bumped whenever the cached schema changes
  pub version: u32,
  /// How long before cached data is considered stale
  pub ttl: Duration,
}

impl CacheSettings {
  pub fn new(file_name: impl Into<String>, version: u32, ttl: Duration) -> Self {
    Self {
      file_name: file_name.into(),
      version,
      ttl,
    }
  }
}

struct CacheState<T> {
  snapshot: Option<CacheWrapper<T>>,
  version: u32,
}

/// Cache for one entity type with an in-memory and a file tier.
///
/// Every operation runs under one async mutex per instance, so save/get/clear
/// calls on the same entity type serialize while different instances never
/// contend. Cloning shares the same state.
pub struct OfflineCache<T: Cacheable> {
  file: CacheFile,
  ttl: Duration,
  state: Arc<Mutex<CacheState<T>>>,
}

impl<T: Cacheable> OfflineCache<T> {
  /// Create a cache rooted at `dir`. Nothing is read until the first `get()`.
  pub fn new(dir: &Path, settings: CacheSettings) -> Self {
    Self {
      file: CacheFile::new(dir, &settings.file_name),
      ttl: settings.ttl,
      state: Arc::new(Mutex::new(CacheState {
        snapshot: None,
        version: settings.version,
      })),
    }
  }

  pub fn path(&self) -> &Path {
    self.file.path()
  }

  pub fn ttl(&self) -> Duration {
    self.ttl
  }

  pub async fn version(&self) -> u32 {
    self.state.lock().await.version
  }

  /// Change the configured version. Data written with another version is
  /// discarded on the next read.
  pub async fn set_version(&self, version: u32) {
    self.state.lock().await.version = version;
  }

  /// Replace the cached list with data from a remote response.
  pub async fn save(&self, items: Vec<T>) -> CacheResult<Vec<T>> {
    self.store(items, CacheSource::Remote).await
  }

  /// Replace the cached list with locally produced data.
  pub async fn save_local(&self, items: Vec<T>) -> CacheResult<Vec<T>> {
    self.store(items, CacheSource::Local).await
  }

  async fn store(&self, items: Vec<T>, source: CacheSource) -> CacheResult<Vec<T>> {
    let mut state = self.state.lock().await;

    let wrapper = CacheWrapper {
      data: items,
      metadata: CacheMetadata::new(state.version, self.ttl, source),
    };

    if let Err(e) = self.file.write(&wrapper).await {
      warn!("Failed to save {}: {}", self.file.path().display(), e);
      return CacheResult::Error(e);
    }

    debug!(
      "Cached {} items in {}",
      wrapper.data.len(),
      self.file.path().display()
    );
    let result = CacheResult::Success {
      data: wrapper.data.clone(),
      metadata: wrapper.metadata.clone(),
    };
    state.snapshot = Some(wrapper);
    result
  }

  /// Read the cached list.
  ///
  /// Serves the in-memory snapshot when present, otherwise loads the file and
  /// promotes it into memory. Data stored under a different version is
  /// deleted and reported as `Empty`.
  pub async fn get(&self) -> CacheResult<Vec<T>> {
    let mut state = self.state.lock().await;
    self.load(&mut state).await
  }

  async fn load(&self, state: &mut CacheState<T>) -> CacheResult<Vec<T>> {
    if let Some(wrapper) = &state.snapshot {
      if wrapper.metadata.version == state.version {
        return CacheResult::classify(wrapper.data.clone(), wrapper.metadata.clone());
      }
      let reason = format!(
        "snapshot version {} != configured version {}",
        wrapper.metadata.version, state.version
      );
      state.snapshot = None;
      return self.discard(reason).await;
    }

    let bytes = match self.file.read_bytes().await {
      Ok(Some(bytes)) => bytes,
      Ok(None) => return CacheResult::Empty,
      Err(e) => return CacheResult::Error(e),
    };

    let stored = match storage::decode_metadata(&bytes) {
      Ok(metadata) => metadata,
      Err(e) => {
        warn!("Unreadable cache file {}: {}", self.file.path().display(), e);
        return CacheResult::Error(e);
      }
    };

    if stored.version != state.version {
      return self
        .discard(format!(
          "stored version {} != configured version {}",
          stored.version, state.version
        ))
        .await;
    }

    let wrapper: CacheWrapper<T> = match storage::decode(&bytes) {
      Ok(wrapper) => wrapper,
      Err(e) => {
        warn!("Unreadable cache file {}: {}", self.file.path().display(), e);
        return CacheResult::Error(e);
      }
    };

    let result = CacheResult::classify(wrapper.data.clone(), wrapper.metadata.clone());
    state.snapshot = Some(wrapper);
    result
  }

  async fn discard(&self, reason: String) -> CacheResult<Vec<T>> {
    info!(
      "Discarding cache {}: {}",
      self.file.path().display(),
      reason
    );
    match self.file.remove().await {
      Ok(()) => CacheResult::Empty,
      Err(e) => CacheResult::Error(e),
    }
  }

  /// Filter cached items. Never triggers a network fetch.
  pub async fn search<P>(&self, predicate: P) -> Vec<T>
  where
    P: Fn(&T) -> bool,
  {
    self
      .get()
      .await
      .into_data()
      .map(|items| items.into_iter().filter(|item| predicate(item)).collect())
      .unwrap_or_default()
  }

  /// Look up a cached item by its cache key.
  pub async fn find(&self, key: &str) -> Option<T> {
    self
      .get()
      .await
      .into_data()?
      .into_iter()
      .find(|item| item.cache_key() == key)
  }

  /// Delete both tiers. Clearing an empty cache succeeds.
  pub async fn clear(&self) -> Result<(), CacheError> {
    let mut state = self.state.lock().await;
    state.snapshot = None;
    self.file.remove().await
  }

  pub async fn has_data(&self) -> bool {
    self.get().await.has_data()
  }

  pub async fn count(&self) -> usize {
    self.get().await.data().map(Vec::len).unwrap_or(0)
  }

  pub async fn is_expired(&self) -> bool {
    self.get().await.is_expired()
  }

  /// Fetch a list with cache-first strategy.
  ///
  /// 1. Fresh cache is returned immediately
  /// 2. Stale or missing cache triggers the fetcher
  /// 3. On fetch failure, stale cache is returned (offline mode)
  /// 4. Fetched data replaces the cache
  pub async fn fetch_list<F, Fut, E>(&self, fetcher: F) -> CacheResult<Vec<T>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Vec<T>, E>>,
    E: Display,
  {
    let cached = self.get().await;
    if cached.is_success() {
      return cached;
    }

    match fetcher().await {
      Ok(items) => self.save(items).await,
      Err(e) => {
        warn!(
          "Fetch for {} failed, serving cached data: {}",
          self.file.path().display(),
          e
        );
        match cached {
          CacheResult::Expired { .. } => cached,
          _ => CacheResult::Error(CacheError::Fetch(e.to_string())),
        }
      }
    }
  }
}

impl<T: Cacheable> Clone for OfflineCache<T> {
  fn clone(&self) -> Self {
    Self {
      file: self.file.clone(),
      ttl: self.ttl,
      state: Arc::clone(&self.state),
    }
  }
}
