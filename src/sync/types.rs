//! Data model for pending mutations and their outcomes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Kind of mutation, independent of its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
  Create,
  Update,
  Delete,
}

impl OperationKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      OperationKind::Create => "create",
      OperationKind::Update => "update",
      OperationKind::Delete => "delete",
    }
  }
}

impl fmt::Display for OperationKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.pad(self.as_str())
  }
}

impl FromStr for OperationKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "create" => Ok(OperationKind::Create),
      "update" => Ok(OperationKind::Update),
      "delete" => Ok(OperationKind::Delete),
      other => Err(format!("unknown operation: {}", other)),
    }
  }
}

/// Immutable description of a pending mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SyncOperation {
  Create {
    entity_id: String,
    entity_type: String,
  },
  Update {
    entity_id: String,
    entity_type: String,
  },
  Delete {
    entity_id: String,
    entity_type: String,
  },
}

impl SyncOperation {
  pub fn new(kind: OperationKind, entity_type: &str, entity_id: &str) -> Self {
    let entity_id = entity_id.to_string();
    let entity_type = entity_type.to_string();
    match kind {
      OperationKind::Create => SyncOperation::Create {
        entity_id,
        entity_type,
      },
      OperationKind::Update => SyncOperation::Update {
        entity_id,
        entity_type,
      },
      OperationKind::Delete => SyncOperation::Delete {
        entity_id,
        entity_type,
      },
    }
  }

  pub fn create(entity_type: &str, entity_id: &str) -> Self {
    Self::new(OperationKind::Create, entity_type, entity_id)
  }

  pub fn update(entity_type: &str, entity_id: &str) -> Self {
    Self::new(OperationKind::Update, entity_type, entity_id)
  }

  pub fn delete(entity_type: &str, entity_id: &str) -> Self {
    Self::new(OperationKind::Delete, entity_type, entity_id)
  }

  pub fn kind(&self) -> OperationKind {
    match self {
      SyncOperation::Create { .. } => OperationKind::Create,
      SyncOperation::Update { .. } => OperationKind::Update,
      SyncOperation::Delete { .. } => OperationKind::Delete,
    }
  }

  pub fn entity_id(&self) -> &str {
    match self {
      SyncOperation::Create { entity_id, .. }
      | SyncOperation::Update { entity_id, .. }
      | SyncOperation::Delete { entity_id, .. } => entity_id,
    }
  }

  pub fn entity_type(&self) -> &str {
    match self {
      SyncOperation::Create { entity_type, .. }
      | SyncOperation::Update { entity_type, .. }
      | SyncOperation::Delete { entity_type, .. } => entity_type,
    }
  }
}

/// How aggressively failed attempts are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
  /// Total attempts before a job is permanently failed
  pub max_attempts: u32,
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 5,
      base_delay_ms: 30_000,
      max_delay_ms: 3_600_000,
    }
  }
}

impl RetryPolicy {
  /// Capped exponential backoff after the given (1-based) failed attempt.
  pub fn backoff(&self, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    let delay = self
      .base_delay_ms
      .saturating_mul(2u64.saturating_pow(exponent));
    Duration::from_millis(delay.min(self.max_delay_ms))
  }

  /// Whether another attempt is allowed after `attempts` have been made.
  pub fn allows_retry(&self, attempts: u32) -> bool {
    attempts < self.max_attempts
  }
}

/// Transmission preset shared by all jobs of one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
  pub entity_type: String,
  /// Package requests as multipart with binary attachments
  pub supports_attachments: bool,
  pub retry_policy: RetryPolicy,
}

impl SyncConfig {
  /// JSON-only transmission with the default retry policy.
  pub fn standard(entity_type: &str) -> Self {
    Self {
      entity_type: entity_type.to_string(),
      supports_attachments: false,
      retry_policy: RetryPolicy::default(),
    }
  }

  /// Multipart transmission with the default retry policy.
  pub fn with_attachments(entity_type: &str) -> Self {
    Self {
      supports_attachments: true,
      ..Self::standard(entity_type)
    }
  }

  pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
    self.retry_policy = retry_policy;
    self
  }
}

/// Read-only auxiliary parameters passed from `enqueue` to the handler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncContext {
  values: BTreeMap<String, String>,
}

impl SyncContext {
  pub const USER_ID: &'static str = "user_id";
  pub const DELETED_ATTACHMENT_IDS: &'static str = "deleted_attachment_ids";
  pub const ADDED_ATTACHMENT_IDS: &'static str = "added_attachment_ids";
  pub const SOURCE_WAREHOUSE_ID: &'static str = "source_warehouse_id";
  pub const DESTINATION_WAREHOUSE_ID: &'static str = "destination_warehouse_id";

  pub fn new() -> Self {
    Self::default()
  }

  /// Add a value. Only used while building the context before `enqueue`.
  pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
    self.values.insert(key.to_string(), value.into());
    self
  }

  /// Add a comma-joined list.
  pub fn with_list<I, S>(self, key: &str, items: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    let joined = items
      .into_iter()
      .map(|s| s.as_ref().to_string())
      .collect::<Vec<_>>()
      .join(",");
    self.with(key, joined)
  }

  pub fn get(&self, key: &str) -> Option<&str> {
    self.values.get(key).map(String::as_str)
  }

  /// Split a comma-joined value, skipping blanks.
  pub fn list(&self, key: &str) -> Vec<String> {
    self
      .get(key)
      .map(|v| {
        v.split(',')
          .map(str::trim)
          .filter(|s| !s.is_empty())
          .map(String::from)
          .collect()
      })
      .unwrap_or_default()
  }

  pub fn user_id(&self) -> Option<&str> {
    self.get(Self::USER_ID)
  }

  pub fn is_empty(&self) -> bool {
    self.values.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for SyncContext {
  fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
    Self {
      values: iter
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect(),
    }
  }
}

/// Semantic class of a server-side conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictType {
  Duplicate,
  InsufficientStock,
  Other,
}

impl fmt::Display for ConflictType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      ConflictType::Duplicate => "DUPLICATE",
      ConflictType::InsufficientStock => "INSUFFICIENT_STOCK",
      ConflictType::Other => "OTHER",
    };
    f.write_str(name)
  }
}

/// Outcome of one transmission attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncResult<R> {
  Success(R),
  /// Remote state disagrees with the mutation; never retried
  Conflict {
    conflict_type: ConflictType,
    raw: Option<String>,
  },
  /// Network or server hiccup; eligible for retry
  TransientError(String),
  /// Well-formed rejection; not retried
  PermanentError(String),
}

/// Failure passed to `on_sync_error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncFailure {
  Transient(String),
  Permanent(String),
}

impl SyncFailure {
  pub fn message(&self) -> &str {
    match self {
      SyncFailure::Transient(m) | SyncFailure::Permanent(m) => m,
    }
  }
}

impl fmt::Display for SyncFailure {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SyncFailure::Transient(m) => write!(f, "transient: {}", m),
      SyncFailure::Permanent(m) => write!(f, "permanent: {}", m),
    }
  }
}

/// Conflict passed to `on_conflict`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
  pub conflict_type: ConflictType,
  pub operation: OperationKind,
  /// Error body as returned by the server
  pub raw: Option<String>,
}

/// Lifecycle state of a persisted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
  Enqueued,
  Running,
  /// Waiting for its backoff delay before the next attempt
  Retrying,
  Succeeded,
  Conflicted,
  PermanentlyFailed,
}

impl JobState {
  pub fn as_str(&self) -> &'static str {
    match self {
      JobState::Enqueued => "enqueued",
      JobState::Running => "running",
      JobState::Retrying => "retrying",
      JobState::Succeeded => "succeeded",
      JobState::Conflicted => "conflicted",
      JobState::PermanentlyFailed => "permanently_failed",
    }
  }

  /// Waiting to run (not yet started, or between attempts).
  pub fn is_pending(&self) -> bool {
    matches!(self, JobState::Enqueued | JobState::Retrying)
  }
}

impl fmt::Display for JobState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.pad(self.as_str())
  }
}

impl FromStr for JobState {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "enqueued" => Ok(JobState::Enqueued),
      "running" => Ok(JobState::Running),
      "retrying" => Ok(JobState::Retrying),
      "succeeded" => Ok(JobState::Succeeded),
      "conflicted" => Ok(JobState::Conflicted),
      "permanently_failed" => Ok(JobState::PermanentlyFailed),
      other => Err(format!("unknown job state: {}", other)),
    }
  }
}
