//! Durable file tier of the offline cache.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use super::traits::CacheMetadata;

/// Cache read/write failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
  /// File could not be read, written or removed
  #[error("cache io error: {0}")]
  Io(String),

  /// File contents could not be decoded
  #[error("corrupted cache file: {0}")]
  Decode(String),

  /// Data could not be encoded
  #[error("cache serialization failed: {0}")]
  Encode(String),

  /// Remote fetch failed and nothing usable was cached
  #[error("fetch failed: {0}")]
  Fetch(String),
}

/// On-disk representation of one cached list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheWrapper<T> {
  pub data: Vec<T>,
  pub metadata: CacheMetadata,
}

/// Only the metadata half of a cache file, decoded before the payload so a
/// version mismatch is detected even when the payload schema changed.
#[derive(Deserialize)]
struct MetadataEnvelope {
  metadata: CacheMetadata,
}

/// A single JSON cache file.
#[derive(Debug, Clone)]
pub struct CacheFile {
  path: PathBuf,
}

impl CacheFile {
  /// File named `<file_name>.json` inside `dir`.
  pub fn new(dir: &Path, file_name: &str) -> Self {
    Self {
      path: dir.join(format!("{}.json", file_name)),
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Read the raw file contents. A missing file is `Ok(None)`.
  pub async fn read_bytes(&self) -> Result<Option<Vec<u8>>, CacheError> {
    match tokio::fs::read(&self.path).await {
      Ok(bytes) => Ok(Some(bytes)),
      Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
      Err(e) => Err(CacheError::Io(format!(
        "Failed to read {}: {}",
        self.path.display(),
        e
      ))),
    }
  }

  /// Save using atomic write (temp file + rename).
  pub async fn write<T: Serialize>(&self, wrapper: &CacheWrapper<T>) -> Result<(), CacheError> {
    if let Some(parent) = self.path.parent() {
      tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| CacheError::Io(format!("Failed to create cache directory: {}", e)))?;
    }

    let content =
      serde_json::to_vec(wrapper).map_err(|e| CacheError::Encode(e.to_string()))?;

    let temp_path = self.path.with_extension("json.tmp");
    {
      let mut file = tokio::fs::File::create(&temp_path)
        .await
        .map_err(|e| CacheError::Io(format!("Failed to create temp file: {}", e)))?;
      file
        .write_all(&content)
        .await
        .map_err(|e| CacheError::Io(format!("Failed to write temp file: {}", e)))?;
      file
        .sync_all()
        .await
        .map_err(|e| CacheError::Io(format!("Failed to sync temp file: {}", e)))?;
    }

    tokio::fs::rename(&temp_path, &self.path)
      .await
      .map_err(|e| CacheError::Io(format!("Failed to rename temp file: {}", e)))?;

    Ok(())
  }

  /// Delete the file. Deleting a missing file succeeds.
  pub async fn remove(&self) -> Result<(), CacheError> {
    match tokio::fs::remove_file(&self.path).await {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
      Err(e) => Err(CacheError::Io(format!(
        "Failed to remove {}: {}",
        self.path.display(),
        e
      ))),
    }
  }

  pub async fn exists(&self) -> bool {
    tokio::fs::try_exists(&self.path).await.unwrap_or(false)
  }
}

/// Decode just the metadata of a cache file.
pub fn decode_metadata(bytes: &[u8]) -> Result<CacheMetadata, CacheError> {
  serde_json::from_slice::<MetadataEnvelope>(bytes)
    .map(|envelope| envelope.metadata)
    .map_err(|e| CacheError::Decode(e.to_string()))
}

/// Decode a whole cache file.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<CacheWrapper<T>, CacheError> {
  serde_json::from_slice(bytes).map_err(|e| CacheError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::traits::CacheSource;
  use std::time::Duration;
  use tempfile::TempDir;

  #[test]
  fn test_cache_path_format() {
    let file = CacheFile::new(Path::new("/tmp/cache"), "clients_cache");
    assert_eq!(file.path(), Path::new("/tmp/cache/clients_cache.json"));
  }

  #[tokio::test]
  async fn test_missing_file_reads_none() {
    let temp = TempDir::new().unwrap();
    let file = CacheFile::new(temp.path(), "nothing");
    assert!(file.read_bytes().await.unwrap().is_none());
    // Removing twice is fine
    file.remove().await.unwrap();
    file.remove().await.unwrap();
  }

  #[tokio::test]
  async fn test_write_leaves_no_temp_file() {
    let temp = TempDir::new().unwrap();
    let file = CacheFile::new(temp.path().join("nested").as_path(), "sales");
    let wrapper = CacheWrapper {
      data: vec!["a".to_string()],
      metadata: CacheMetadata::new(3, Duration::from_secs(1), CacheSource::Remote),
    };

    file.write(&wrapper).await.unwrap();

    assert!(file.exists().await);
    assert!(!file.path().with_extension("json.tmp").exists());

    let bytes = file.read_bytes().await.unwrap().unwrap();
    assert_eq!(decode_metadata(&bytes).unwrap().version, 3);
    let decoded: CacheWrapper<String> = decode(&bytes).unwrap();
    assert_eq!(decoded.data, vec!["a".to_string()]);
  }

  #[test]
  fn test_metadata_decodes_despite_payload_schema_change() {
    let bytes = serde_json::to_vec(&serde_json::json!({
      "data": [{"legacy": true}],
      "metadata": {"timestamp": 1, "version": 1, "ttlMillis": 5, "source": "remote"}
    }))
    .unwrap();

    assert_eq!(decode_metadata(&bytes).unwrap().version, 1);
    assert!(matches!(decode::<u32>(&bytes), Err(CacheError::Decode(_))));
  }
}
