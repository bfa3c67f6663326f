//! Per-entity-type sync strategy.
//!
//! The worker, queue, retry policy and attachment packaging are shared by all
//! entity types; a [`SyncHandler`] supplies only the entity-specific steps:
//! loading the local row, building the request, transmitting it and
//! reconciling local state afterwards.

use async_trait::async_trait;
use color_eyre::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::conflict::ConflictClassifier;
use super::types::{
  Conflict, ConflictType, SyncConfig, SyncContext, SyncFailure, SyncOperation, SyncResult,
};
use crate::api::{ApiError, ApiRequest};

/// A request ready for transmission.
pub type SyncRequest = ApiRequest;

#[async_trait]
pub trait SyncHandler: Send + Sync + 'static {
  type Entity: Send + Sync + 'static;
  type Response: Send + 'static;

  /// Entity type this handler is registered under.
  fn entity_type(&self) -> &str;

  /// Load the current local row. `None` means there is nothing to sync.
  async fn get_entity(&self, entity_id: &str) -> Result<Option<Self::Entity>>;

  /// Build the request from local state, the operation and the job context.
  async fn prepare_request(
    &self,
    entity: &Self::Entity,
    operation: &SyncOperation,
    config: &SyncConfig,
    context: &SyncContext,
  ) -> Result<SyncRequest>;

  /// Transmit the request, mapping failures with [`SyncResult::from_api`].
  async fn execute_sync(
    &self,
    entity: &Self::Entity,
    operation: &SyncOperation,
    request: SyncRequest,
  ) -> SyncResult<Self::Response>;

  /// Mark the local row as synchronized.
  async fn on_sync_success(&self, entity: &Self::Entity, response: Self::Response) -> Result<()>;

  /// Best-effort local bookkeeping of a failed attempt.
  async fn on_sync_error(&self, _entity: &Self::Entity, _error: &SyncFailure) -> Result<()> {
    Ok(())
  }

  /// Entity-specific reconciliation of a conflict.
  async fn on_conflict(&self, entity: &Self::Entity, conflict: &Conflict) -> Result<()>;
}

impl<R> SyncResult<R> {
  /// Normalize a remote call result.
  ///
  /// - transport failures, undecodable responses, 408, 429 and 5xx are transient
  /// - 4xx bodies recognized by the classifier are conflicts
  /// - 409 with an unrecognized body is an `Other` conflict
  /// - any other rejection is permanent
  pub fn from_api(result: Result<R, ApiError>, classifier: &ConflictClassifier) -> Self {
    let error = match result {
      Ok(response) => return SyncResult::Success(response),
      Err(error) => error,
    };

    match error {
      ApiError::Transport(cause) => SyncResult::TransientError(cause),
      ApiError::Decode(cause) => {
        SyncResult::TransientError(format!("undecodable response: {}", cause))
      }
      ApiError::Request(message) => SyncResult::PermanentError(message),
      ApiError::Status { status, body } => match status {
        408 | 429 | 500..=599 => SyncResult::TransientError(format!(
          "server returned {}: {}",
          status,
          body.as_deref().unwrap_or("")
        )),
        400..=499 => match classifier.recognize(body.as_deref()) {
          Some(conflict_type) => SyncResult::Conflict {
            conflict_type,
            raw: body,
          },
          None if status == 409 => SyncResult::Conflict {
            conflict_type: ConflictType::Other,
            raw: body,
          },
          None => SyncResult::PermanentError(format!(
            "server rejected request ({}): {}",
            status,
            body.as_deref().unwrap_or("")
          )),
        },
        _ => SyncResult::PermanentError(format!("unexpected status {}", status)),
      },
    }
  }
}

/// What one attempt amounted to, before the retry policy is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
  /// The entity no longer exists locally
  NothingToSync,
  Synced,
  Conflicted(ConflictType),
  Transient(String),
  Permanent(String),
}

/// Object-safe view of a [`SyncHandler`] so handlers with different entity
/// types can share one registry.
#[async_trait]
pub trait DynSyncHandler: Send + Sync {
  fn entity_type(&self) -> &str;

  /// Run one attempt: resolve, build, transmit, then invoke exactly one of
  /// the success/error/conflict hooks.
  async fn run(
    &self,
    operation: &SyncOperation,
    config: &SyncConfig,
    context: &SyncContext,
  ) -> AttemptOutcome;
}

#[async_trait]
impl<H: SyncHandler> DynSyncHandler for H {
  fn entity_type(&self) -> &str {
    SyncHandler::entity_type(self)
  }

  async fn run(
    &self,
    operation: &SyncOperation,
    config: &SyncConfig,
    context: &SyncContext,
  ) -> AttemptOutcome {
    let entity = match self.get_entity(operation.entity_id()).await {
      Ok(Some(entity)) => entity,
      Ok(None) => {
        debug!(
          "{} {} not found locally, nothing to sync",
          operation.entity_type(),
          operation.entity_id()
        );
        return AttemptOutcome::NothingToSync;
      }
      Err(e) => return AttemptOutcome::Transient(format!("failed to load entity: {}", e)),
    };

    let request = match self
      .prepare_request(&entity, operation, config, context)
      .await
    {
      Ok(request) => request,
      Err(e) => return AttemptOutcome::Transient(format!("failed to build request: {}", e)),
    };

    match self.execute_sync(&entity, operation, request).await {
      SyncResult::Success(response) => match self.on_sync_success(&entity, response).await {
        Ok(()) => AttemptOutcome::Synced,
        Err(e) => AttemptOutcome::Transient(format!("failed to mark synchronized: {}", e)),
      },
      SyncResult::TransientError(cause) => {
        let failure = SyncFailure::Transient(cause.clone());
        if let Err(e) = self.on_sync_error(&entity, &failure).await {
          warn!("on_sync_error failed: {}", e);
        }
        AttemptOutcome::Transient(cause)
      }
      SyncResult::PermanentError(message) => {
        let failure = SyncFailure::Permanent(message.clone());
        if let Err(e) = self.on_sync_error(&entity, &failure).await {
          warn!("on_sync_error failed: {}", e);
        }
        AttemptOutcome::Permanent(message)
      }
      SyncResult::Conflict { conflict_type, raw } => {
        let conflict = Conflict {
          conflict_type,
          operation: operation.kind(),
          raw,
        };
        if let Err(e) = self.on_conflict(&entity, &conflict).await {
          warn!("on_conflict failed: {}", e);
        }
        AttemptOutcome::Conflicted(conflict_type)
      }
    }
  }
}

/// Handlers keyed by entity type.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
  handlers: HashMap<String, Arc<dyn DynSyncHandler>>,
}

impl HandlerRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a handler, replacing any previous one for the same type.
  pub fn register<H: SyncHandler>(&mut self, handler: H) -> &mut Self {
    self.register_shared(Arc::new(handler))
  }

  /// Register a handler the caller keeps a reference to.
  pub fn register_shared<H: SyncHandler>(&mut self, handler: Arc<H>) -> &mut Self {
    let handler: Arc<dyn DynSyncHandler> = handler;
    self
      .handlers
      .insert(handler.entity_type().to_string(), handler);
    self
  }

  pub fn get(&self, entity_type: &str) -> Option<Arc<dyn DynSyncHandler>> {
    self.handlers.get(entity_type).cloned()
  }

  pub fn entity_types(&self) -> Vec<&str> {
    let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
    types.sort_unstable();
    types
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use color_eyre::eyre::eyre;
  use reqwest::Method;
  use serde_json::json;
  use std::sync::Mutex;

  fn status(status: u16, body: &str) -> Result<(), ApiError> {
    Err(ApiError::Status {
      status,
      body: Some(body.to_string()),
    })
  }

  #[test]
  fn test_from_api_mapping() {
    let classifier = ConflictClassifier::default();

    assert_eq!(
      SyncResult::from_api(Ok(7), &classifier),
      SyncResult::Success(7)
    );
    assert!(matches!(
      SyncResult::from_api(Err::<(), _>(ApiError::Transport("reset".into())), &classifier),
      SyncResult::TransientError(_)
    ));
    assert!(matches!(
      SyncResult::from_api(status(503, "maintenance"), &classifier),
      SyncResult::TransientError(_)
    ));
    assert!(matches!(
      SyncResult::from_api(status(429, "slow down"), &classifier),
      SyncResult::TransientError(_)
    ));
    assert!(matches!(
      SyncResult::from_api(status(400, "campo requerido: nombre"), &classifier),
      SyncResult::PermanentError(_)
    ));
    assert_eq!(
      SyncResult::from_api(status(422, "Cliente Duplicado"), &classifier),
      SyncResult::Conflict {
        conflict_type: ConflictType::Duplicate,
        raw: Some("Cliente Duplicado".into())
      }
    );
    assert_eq!(
      SyncResult::from_api(status(409, "version mismatch"), &classifier),
      SyncResult::Conflict {
        conflict_type: ConflictType::Other,
        raw: Some("version mismatch".into())
      }
    );
  }

  #[test]
  fn test_server_error_with_conflict_token_is_still_transient() {
    let result = SyncResult::from_api(status(500, "duplicado"), &ConflictClassifier::default());
    assert!(matches!(result, SyncResult::TransientError(_)));
  }

  /// Handler whose remote result is scripted; records which hooks ran.
  pub(crate) struct ScriptedHandler {
    pub entity_type: String,
    pub exists: bool,
    pub result: Mutex<Vec<SyncResult<()>>>,
    pub calls: Mutex<Vec<String>>,
  }

  impl ScriptedHandler {
    pub fn new(entity_type: &str, results: Vec<SyncResult<()>>) -> Self {
      Self {
        entity_type: entity_type.to_string(),
        exists: true,
        result: Mutex::new(results),
        calls: Mutex::new(Vec::new()),
      }
    }

    pub fn calls(&self) -> Vec<String> {
      self.calls.lock().unwrap().clone()
    }

    fn log(&self, call: &str) {
      self.calls.lock().unwrap().push(call.to_string());
    }
  }

  #[async_trait]
  impl SyncHandler for ScriptedHandler {
    type Entity = String;
    type Response = ();

    fn entity_type(&self) -> &str {
      &self.entity_type
    }

    async fn get_entity(&self, entity_id: &str) -> Result<Option<String>> {
      self.log("get_entity");
      if entity_id == "broken" {
        return Err(eyre!("database locked"));
      }
      Ok(self.exists.then(|| entity_id.to_string()))
    }

    async fn prepare_request(
      &self,
      entity: &String,
      _operation: &SyncOperation,
      _config: &SyncConfig,
      _context: &SyncContext,
    ) -> Result<SyncRequest> {
      Ok(ApiRequest::json(Method::POST, "things", json!({ "id": entity })))
    }

    async fn execute_sync(
      &self,
      _entity: &String,
      _operation: &SyncOperation,
      _request: SyncRequest,
    ) -> SyncResult<()> {
      self.log("execute_sync");
      let mut results = self.result.lock().unwrap();
      if results.is_empty() {
        SyncResult::Success(())
      } else {
        results.remove(0)
      }
    }

    async fn on_sync_success(&self, _entity: &String, _response: ()) -> Result<()> {
      self.log("on_sync_success");
      Ok(())
    }

    async fn on_sync_error(&self, _entity: &String, _error: &SyncFailure) -> Result<()> {
      self.log("on_sync_error");
      Ok(())
    }

    async fn on_conflict(&self, _entity: &String, _conflict: &Conflict) -> Result<()> {
      self.log("on_conflict");
      Ok(())
    }
  }

  async fn run_once(handler: &ScriptedHandler, entity_id: &str) -> AttemptOutcome {
    let config = SyncConfig::standard("things");
    DynSyncHandler::run(
      handler,
      &SyncOperation::create("things", entity_id),
      &config,
      &SyncContext::new(),
    )
    .await
  }

  #[tokio::test]
  async fn test_success_invokes_only_success_hook() {
    let handler = ScriptedHandler::new("things", vec![]);
    assert_eq!(run_once(&handler, "1").await, AttemptOutcome::Synced);
    assert_eq!(
      handler.calls(),
      vec!["get_entity", "execute_sync", "on_sync_success"]
    );
  }

  #[tokio::test]
  async fn test_conflict_invokes_only_conflict_hook() {
    let handler = ScriptedHandler::new(
      "things",
      vec![SyncResult::Conflict {
        conflict_type: ConflictType::InsufficientStock,
        raw: None,
      }],
    );
    assert_eq!(
      run_once(&handler, "1").await,
      AttemptOutcome::Conflicted(ConflictType::InsufficientStock)
    );
    assert_eq!(handler.calls(), vec!["get_entity", "execute_sync", "on_conflict"]);
  }

  #[tokio::test]
  async fn test_errors_invoke_error_hook() {
    let handler = ScriptedHandler::new(
      "things",
      vec![
        SyncResult::TransientError("timeout".into()),
        SyncResult::PermanentError("bad request".into()),
      ],
    );
    assert_eq!(
      run_once(&handler, "1").await,
      AttemptOutcome::Transient("timeout".into())
    );
    assert_eq!(
      run_once(&handler, "1").await,
      AttemptOutcome::Permanent("bad request".into())
    );
    assert_eq!(
      handler
        .calls()
        .iter()
        .filter(|c| c.as_str() == "on_sync_error")
        .count(),
      2
    );
  }

  #[tokio::test]
  async fn test_missing_entity_skips_transmission() {
    let mut handler = ScriptedHandler::new("things", vec![]);
    handler.exists = false;
    assert_eq!(run_once(&handler, "1").await, AttemptOutcome::NothingToSync);
    assert_eq!(handler.calls(), vec!["get_entity"]);
  }

  #[tokio::test]
  async fn test_load_failure_is_transient() {
    let handler = ScriptedHandler::new("things", vec![]);
    assert!(matches!(
      run_once(&handler, "broken").await,
      AttemptOutcome::Transient(_)
    ));
  }

  #[test]
  fn test_registry_lookup() {
    let mut registry = HandlerRegistry::new();
    registry
      .register(ScriptedHandler::new("sales", vec![]))
      .register(ScriptedHandler::new("clients", vec![]));

    assert_eq!(registry.entity_types(), vec!["clients", "sales"]);
    assert!(registry.get("sales").is_some());
    assert!(registry.get("payments").is_none());
  }
}
