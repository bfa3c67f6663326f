use async_trait::async_trait;
use color_eyre::Result;
use reqwest::Method;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use super::server_id;
use crate::api::{RemoteApi, RequestBody};
use crate::entities::{Client, ClientAttachment, ClientStore, CLIENTS};
use crate::sync::{
  Conflict, ConflictClassifier, ConflictType, MultipartRequest, OperationKind, SyncConfig,
  SyncContext, SyncFailure, SyncHandler, SyncOperation, SyncRequest, SyncResult,
};

/// A client row together with its attachments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRecord {
  pub client: Client,
  pub attachments: Vec<ClientAttachment>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientSyncResponse {
  pub server_id: Option<String>,
  /// Attachments that were part of the accepted request
  pub uploaded_attachment_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ClientPayload<'a> {
  id: &'a str,
  name: &'a str,
  #[serde(skip_serializing_if = "Option::is_none")]
  tax_id: Option<&'a str>,
  #[serde(skip_serializing_if = "Option::is_none")]
  phone: Option<&'a str>,
  #[serde(skip_serializing_if = "Option::is_none")]
  address: Option<&'a str>,
  #[serde(skip_serializing_if = "Option::is_none")]
  user_id: Option<&'a str>,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  deleted_attachment_ids: Vec<String>,
}

/// Sends client records, with their captured photos and documents.
pub struct ClientSyncHandler {
  store: Arc<dyn ClientStore>,
  api: Arc<dyn RemoteApi>,
  classifier: ConflictClassifier,
}

impl ClientSyncHandler {
  pub fn new(store: Arc<dyn ClientStore>, api: Arc<dyn RemoteApi>) -> Self {
    Self {
      store,
      api,
      classifier: ConflictClassifier::default(),
    }
  }

  pub fn with_classifier(mut self, classifier: ConflictClassifier) -> Self {
    self.classifier = classifier;
    self
  }

  /// Attachments to upload: unsynced ones, narrowed to the explicitly added
  /// ids on update when the caller listed them.
  fn pending_attachments<'a>(
    record: &'a ClientRecord,
    kind: OperationKind,
    context: &SyncContext,
  ) -> Vec<&'a ClientAttachment> {
    let added = context.list(SyncContext::ADDED_ATTACHMENT_IDS);
    record
      .attachments
      .iter()
      .filter(|a| !a.synced)
      .filter(|a| kind != OperationKind::Update || added.is_empty() || added.contains(&a.id))
      .collect()
  }
}

#[async_trait]
impl SyncHandler for ClientSyncHandler {
  type Entity = ClientRecord;
  type Response = ClientSyncResponse;

  fn entity_type(&self) -> &str {
    CLIENTS
  }

  async fn get_entity(&self, entity_id: &str) -> Result<Option<ClientRecord>> {
    let Some(client) = self.store.client(entity_id)? else {
      return Ok(None);
    };
    let attachments = self.store.attachments(entity_id)?;
    Ok(Some(ClientRecord {
      client,
      attachments,
    }))
  }

  async fn prepare_request(
    &self,
    record: &ClientRecord,
    operation: &SyncOperation,
    config: &SyncConfig,
    context: &SyncContext,
  ) -> Result<SyncRequest> {
    let client = &record.client;
    let (method, path) = match operation.kind() {
      OperationKind::Create => (Method::POST, CLIENTS.to_string()),
      OperationKind::Update => (Method::PUT, format!("{}/{}", CLIENTS, client.remote_id())),
      OperationKind::Delete => {
        return Ok(SyncRequest::empty(
          Method::DELETE,
          format!("{}/{}", CLIENTS, client.remote_id()),
        ))
      }
    };

    let payload = ClientPayload {
      id: &client.id,
      name: &client.name,
      tax_id: client.tax_id.as_deref(),
      phone: client.phone.as_deref(),
      address: client.address.as_deref(),
      user_id: context.user_id(),
      deleted_attachment_ids: match operation.kind() {
        OperationKind::Update => context.list(SyncContext::DELETED_ATTACHMENT_IDS),
        _ => Vec::new(),
      },
    };
    let json = serde_json::to_value(&payload)?;

    if !config.supports_attachments {
      return Ok(SyncRequest::json(method, path, json));
    }

    let multipart = Self::pending_attachments(record, operation.kind(), context)
      .into_iter()
      .fold(MultipartRequest::builder(json), |builder, a| {
        builder.attachment(&a.id, &a.file_name, &a.mime_type, a.data.clone())
      })
      .build();
    Ok(SyncRequest::multipart(method, path, multipart))
  }

  async fn execute_sync(
    &self,
    _record: &ClientRecord,
    _operation: &SyncOperation,
    request: SyncRequest,
  ) -> SyncResult<ClientSyncResponse> {
    let uploaded_attachment_ids = match &request.body {
      RequestBody::Multipart(multipart) => multipart
        .parts()
        .iter()
        .map(|part| part.stable_id.clone())
        .collect(),
      _ => Vec::new(),
    };

    let result = self.api.send(request).await.map(|body| ClientSyncResponse {
      server_id: server_id(&body),
      uploaded_attachment_ids,
    });
    SyncResult::from_api(result, &self.classifier)
  }

  async fn on_sync_success(
    &self,
    record: &ClientRecord,
    response: ClientSyncResponse,
  ) -> Result<()> {
    self
      .store
      .mark_client_synced(&record.client.id, response.server_id.as_deref())?;
    if !response.uploaded_attachment_ids.is_empty() {
      self
        .store
        .mark_attachments_synced(&response.uploaded_attachment_ids)?;
    }
    Ok(())
  }

  async fn on_sync_error(&self, record: &ClientRecord, error: &SyncFailure) -> Result<()> {
    self
      .store
      .record_client_error(&record.client.id, error.message())
  }

  async fn on_conflict(&self, record: &ClientRecord, conflict: &Conflict) -> Result<()> {
    match (conflict.conflict_type, conflict.operation) {
      (ConflictType::Duplicate, OperationKind::Create) => {
        info!(
          "Client {} already exists remotely, marking synchronized",
          record.client.id
        );
        self.store.mark_client_synced(&record.client.id, None)
      }
      (conflict_type, _) => {
        warn!(
          "Client {} conflicted ({}): {}",
          record.client.id,
          conflict_type,
          conflict.raw.as_deref().unwrap_or("")
        );
        self.store.record_client_error(
          &record.client.id,
          &format!("conflict: {}", conflict.raw.as_deref().unwrap_or("unknown")),
        )
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::ApiError;
  use crate::db::{Database, SqliteStore};
  use crate::handlers::tests::FakeApi;
  use crate::sync::{AttemptOutcome, DynSyncHandler};
  use serde_json::json;

  struct Fixture {
    store: SqliteStore,
    api: Arc<FakeApi>,
    handler: ClientSyncHandler,
  }

  fn fixture(responses: Vec<Result<serde_json::Value, ApiError>>) -> Fixture {
    let store = SqliteStore::new(Arc::new(Database::open_in_memory().unwrap()));
    let api = Arc::new(FakeApi::new(responses));
    let handler = ClientSyncHandler::new(Arc::new(store.clone()), api.clone());

    let mut client = Client::new("c-1", "Ferreteria Lopez");
    client.phone = Some("555-0101".into());
    store.save_client(&client).unwrap();
    for (id, synced) in [("a-1", true), ("a-2", false), ("a-3", false)] {
      store
        .add_attachment(&ClientAttachment {
          id: id.into(),
          client_id: "c-1".into(),
          file_name: format!("{}.jpg", id),
          mime_type: "image/jpeg".into(),
          data: id.as_bytes().to_vec(),
          synced,
        })
        .unwrap();
    }

    Fixture {
      store,
      api,
      handler,
    }
  }

  async fn run(
    handler: &ClientSyncHandler,
    kind: OperationKind,
    config: &SyncConfig,
    context: &SyncContext,
  ) -> AttemptOutcome {
    DynSyncHandler::run(
      handler,
      &SyncOperation::new(kind, CLIENTS, "c-1"),
      config,
      context,
    )
    .await
  }

  fn multipart_ids(request: &SyncRequest) -> Vec<String> {
    match &request.body {
      RequestBody::Multipart(m) => m.parts().iter().map(|p| p.stable_id.clone()).collect(),
      other => panic!("expected multipart, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_create_uploads_unsynced_attachments() {
    let f = fixture(vec![Ok(json!({"id": "srv-7"}))]);
    let context = SyncContext::new().with(SyncContext::USER_ID, "u-9");

    let outcome = run(
      &f.handler,
      OperationKind::Create,
      &SyncConfig::with_attachments(CLIENTS),
      &context,
    )
    .await;
    assert_eq!(outcome, AttemptOutcome::Synced);

    let requests = f.api.requests();
    assert_eq!(requests[0].method, Method::POST);
    assert_eq!(requests[0].path, "clients");
    assert_eq!(multipart_ids(&requests[0]), vec!["a-2", "a-3"]);
    if let RequestBody::Multipart(m) = &requests[0].body {
      assert_eq!(m.json()["user_id"], "u-9");
      assert_eq!(m.json()["phone"], "555-0101");
    }

    let client = f.store.client("c-1").unwrap().unwrap();
    assert!(client.synced);
    assert_eq!(client.server_id.as_deref(), Some("srv-7"));
    assert!(f.store.attachments("c-1").unwrap().iter().all(|a| a.synced));
  }

  #[tokio::test]
  async fn test_update_sends_only_added_attachments_and_deletions() {
    let f = fixture(vec![]);
    let context = SyncContext::new()
      .with_list(SyncContext::ADDED_ATTACHMENT_IDS, ["a-3"])
      .with_list(SyncContext::DELETED_ATTACHMENT_IDS, ["old-1", "old-2"]);

    run(
      &f.handler,
      OperationKind::Update,
      &SyncConfig::with_attachments(CLIENTS),
      &context,
    )
    .await;

    let requests = f.api.requests();
    let request = &requests[0];
    assert_eq!(request.method, Method::PUT);
    assert_eq!(request.path, "clients/c-1");
    assert_eq!(multipart_ids(request), vec!["a-3"]);
    if let RequestBody::Multipart(m) = &request.body {
      assert_eq!(m.json()["deleted_attachment_ids"], json!(["old-1", "old-2"]));
    }

    let pending: Vec<String> = f
      .store
      .attachments("c-1")
      .unwrap()
      .into_iter()
      .filter(|a| !a.synced)
      .map(|a| a.id)
      .collect();
    assert_eq!(pending, vec!["a-2"]);
  }

  #[tokio::test]
  async fn test_json_only_without_attachment_support() {
    let f = fixture(vec![]);
    run(
      &f.handler,
      OperationKind::Create,
      &SyncConfig::standard(CLIENTS),
      &SyncContext::new(),
    )
    .await;

    let requests = f.api.requests();
    let request = &requests[0];
    assert!(matches!(request.body, RequestBody::Json(_)));
    assert_eq!(
      f.store
        .attachments("c-1")
        .unwrap()
        .iter()
        .filter(|a| a.synced)
        .count(),
      1
    );
  }

  #[tokio::test]
  async fn test_duplicate_create_is_reconciled() {
    let f = fixture(vec![Err(ApiError::Status {
      status: 422,
      body: Some("{\"error\":\"DUPLICADO\"}".into()),
    })]);

    let outcome = run(
      &f.handler,
      OperationKind::Create,
      &SyncConfig::standard(CLIENTS),
      &SyncContext::new(),
    )
    .await;
    assert_eq!(outcome, AttemptOutcome::Conflicted(ConflictType::Duplicate));
    assert!(f.store.client("c-1").unwrap().unwrap().synced);
  }

  #[tokio::test]
  async fn test_failures_are_recorded_on_the_row() {
    let f = fixture(vec![Err(ApiError::Status {
      status: 400,
      body: Some("nombre requerido".into()),
    })]);

    let outcome = run(
      &f.handler,
      OperationKind::Update,
      &SyncConfig::standard(CLIENTS),
      &SyncContext::new(),
    )
    .await;
    assert!(matches!(outcome, AttemptOutcome::Permanent(_)));

    let client = f.store.client("c-1").unwrap().unwrap();
    assert!(!client.synced);
    assert!(client
      .sync_error
      .as_deref()
      .unwrap_or_default()
      .contains("nombre requerido"));
  }

  #[tokio::test]
  async fn test_delete_targets_remote_id() {
    let f = fixture(vec![]);
    f.store.mark_client_synced("c-1", Some("srv-3")).unwrap();

    run(
      &f.handler,
      OperationKind::Delete,
      &SyncConfig::with_attachments(CLIENTS),
      &SyncContext::new(),
    )
    .await;

    let requests = f.api.requests();
    let request = &requests[0];
    assert_eq!(request.method, Method::DELETE);
    assert_eq!(request.path, "clients/srv-3");
    assert_eq!(request.body, RequestBody::Empty);
  }
}
