use async_trait::async_trait;
use color_eyre::Result;
use reqwest::Method;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use super::server_id;
use crate::api::RemoteApi;
use crate::entities::{TransferLine, TransferStore, WarehouseTransfer, WAREHOUSE_TRANSFERS};
use crate::sync::{
  Conflict, ConflictClassifier, ConflictType, OperationKind, SyncConfig, SyncContext,
  SyncFailure, SyncHandler, SyncOperation, SyncRequest, SyncResult,
};

const TRANSFERS_PATH: &str = "warehouse-transfers";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferSyncResponse {
  pub server_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct TransferPayload<'a> {
  id: &'a str,
  source_warehouse_id: &'a str,
  destination_warehouse_id: &'a str,
  lines: &'a [TransferLine],
  #[serde(skip_serializing_if = "Option::is_none")]
  user_id: Option<&'a str>,
}

/// Sends stock movements between warehouses. Transfers carry no files.
pub struct TransferSyncHandler {
  store: Arc<dyn TransferStore>,
  api: Arc<dyn RemoteApi>,
  classifier: ConflictClassifier,
}

impl TransferSyncHandler {
  pub fn new(store: Arc<dyn TransferStore>, api: Arc<dyn RemoteApi>) -> Self {
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
}

#[async_trait]
impl SyncHandler for TransferSyncHandler {
  type Entity = WarehouseTransfer;
  type Response = TransferSyncResponse;

  fn entity_type(&self) -> &str {
    WAREHOUSE_TRANSFERS
  }

  async fn get_entity(&self, entity_id: &str) -> Result<Option<WarehouseTransfer>> {
    self.store.transfer(entity_id)
  }

  async fn prepare_request(
    &self,
    transfer: &WarehouseTransfer,
    operation: &SyncOperation,
    _config: &SyncConfig,
    context: &SyncContext,
  ) -> Result<SyncRequest> {
    let remote_path = format!("{}/{}", TRANSFERS_PATH, transfer.remote_id());
    let (method, path) = match operation.kind() {
      OperationKind::Create => (Method::POST, TRANSFERS_PATH.to_string()),
      OperationKind::Update => (Method::PUT, remote_path),
      OperationKind::Delete => return Ok(SyncRequest::empty(Method::DELETE, remote_path)),
    };

    // Warehouses chosen at enqueue time win over the stored row
    let payload = TransferPayload {
      id: &transfer.id,
      source_warehouse_id: context
        .get(SyncContext::SOURCE_WAREHOUSE_ID)
        .unwrap_or(transfer.source_warehouse_id.as_str()),
      destination_warehouse_id: context
        .get(SyncContext::DESTINATION_WAREHOUSE_ID)
        .unwrap_or(transfer.destination_warehouse_id.as_str()),
      lines: &transfer.lines,
      user_id: context.user_id(),
    };
    Ok(SyncRequest::json(method, path, serde_json::to_value(&payload)?))
  }

  async fn execute_sync(
    &self,
    _transfer: &WarehouseTransfer,
    _operation: &SyncOperation,
    request: SyncRequest,
  ) -> SyncResult<TransferSyncResponse> {
    let result = self
      .api
      .send(request)
      .await
      .map(|body| TransferSyncResponse {
        server_id: server_id(&body),
      });
    SyncResult::from_api(result, &self.classifier)
  }

  async fn on_sync_success(
    &self,
    transfer: &WarehouseTransfer,
    response: TransferSyncResponse,
  ) -> Result<()> {
    self
      .store
      .mark_transfer_synced(&transfer.id, response.server_id.as_deref())
  }

  async fn on_sync_error(&self, transfer: &WarehouseTransfer, error: &SyncFailure) -> Result<()> {
    self.store.record_transfer_error(&transfer.id, error.message())
  }

  async fn on_conflict(&self, transfer: &WarehouseTransfer, conflict: &Conflict) -> Result<()> {
    let raw = conflict.raw.as_deref().unwrap_or("");
    match (conflict.conflict_type, conflict.operation) {
      (ConflictType::InsufficientStock, _) => {
        warn!(
          "Transfer {} rejected for insufficient stock, flagged for review",
          transfer.id
        );
        self
          .store
          .flag_transfer(&transfer.id, &format!("insufficient stock: {}", raw))
      }
      (ConflictType::Duplicate, OperationKind::Create) => {
        info!(
          "Transfer {} already exists remotely, marking synchronized",
          transfer.id
        );
        self.store.mark_transfer_synced(&transfer.id, None)
      }
      (conflict_type, _) => {
        warn!("Transfer {} conflicted ({}): {}", transfer.id, conflict_type, raw);
        self
          .store
          .record_transfer_error(&transfer.id, &format!("conflict: {}", raw))
      }
    }
  }
}
