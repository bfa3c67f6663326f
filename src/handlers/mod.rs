//! Sync handlers for the bundled entity types.

mod client;
mod transfer;

pub use client::{ClientRecord, ClientSyncHandler, ClientSyncResponse};
pub use transfer::{TransferSyncHandler, TransferSyncResponse};

use serde_json::Value;

/// Server-assigned identifier from a create/update response body.
fn server_id(body: &Value) -> Option<String> {
  match body.get("id")? {
    Value::String(id) if !id.is_empty() => Some(id.clone()),
    Value::Number(id) => Some(id.to_string()),
    _ => None,
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::api::{ApiError, ApiRequest, RemoteApi};
  use async_trait::async_trait;
  use serde_json::json;
  use std::sync::Mutex;

  /// Remote API double returning scripted responses and keeping every request.
  #[derive(Default)]
  pub(crate) struct FakeApi {
    pub responses: Mutex<Vec<Result<Value, ApiError>>>,
    pub requests: Mutex<Vec<ApiRequest>>,
  }

  impl FakeApi {
    pub fn new(responses: Vec<Result<Value, ApiError>>) -> Self {
      Self {
        responses: Mutex::new(responses),
        requests: Mutex::new(Vec::new()),
      }
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
      self.requests.lock().unwrap().clone()
    }
  }

  #[async_trait]
  impl RemoteApi for FakeApi {
    async fn send(&self, request: ApiRequest) -> Result<Value, ApiError> {
      self.requests.lock().unwrap().push(request);
      let mut responses = self.responses.lock().unwrap();
      if responses.is_empty() {
        Ok(Value::Null)
      } else {
        responses.remove(0)
      }
    }
  }

  #[test]
  fn test_server_id_accepts_strings_and_numbers() {
    assert_eq!(server_id(&json!({"id": "srv-1"})), Some("srv-1".into()));
    assert_eq!(server_id(&json!({"id": 42})), Some("42".into()));
    assert_eq!(server_id(&json!({"id": ""})), None);
    assert_eq!(server_id(&Value::Null), None);
  }
}
