//! Fire-and-forget recording of sync outcomes.

use reqwest::Method;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::api::{ApiRequest, RemoteApi};
use crate::sync::{JobState, OperationKind};

/// One finished sync attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncEvent {
  pub job_id: i64,
  pub entity_type: String,
  pub entity_id: String,
  pub operation: OperationKind,
  pub attempt: u32,
  pub state: JobState,
  pub detail: Option<String>,
}

/// Outcome sink. Implementations must not block or fail the caller.
pub trait RemoteLog: Send + Sync {
  fn record(&self, event: SyncEvent);
}

/// Writes events to the local tracing subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLog;

impl RemoteLog for TracingLog {
  fn record(&self, event: SyncEvent) {
    info!(
      target: "fieldsync::outcome",
      job_id = event.job_id,
      entity_type = %event.entity_type,
      entity_id = %event.entity_id,
      operation = %event.operation,
      attempt = event.attempt,
      state = %event.state,
      detail = event.detail.as_deref().unwrap_or(""),
      "sync attempt finished"
    );
  }
}

/// Posts events to a logging endpoint of the remote service.
pub struct HttpRemoteLog {
  api: Arc<dyn RemoteApi>,
  path: String,
}

impl HttpRemoteLog {
  pub fn new(api: Arc<dyn RemoteApi>, path: impl Into<String>) -> Self {
    Self {
      api,
      path: path.into(),
    }
  }
}

impl RemoteLog for HttpRemoteLog {
  fn record(&self, event: SyncEvent) {
    let body = match serde_json::to_value(&event) {
      Ok(body) => body,
      Err(e) => {
        debug!("Dropping sync event: {}", e);
        return;
      }
    };
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
      debug!("Dropping sync event outside of a runtime");
      return;
    };

    let api = Arc::clone(&self.api);
    let request = ApiRequest::json(Method::POST, self.path.clone(), body);
    runtime.spawn(async move {
      if let Err(e) = api.send(request).await {
        debug!("Remote log delivery failed: {}", e);
      }
    });
  }
}

/// Sends every event to each inner sink.
pub struct FanoutLog(pub Vec<Arc<dyn RemoteLog>>);

impl RemoteLog for FanoutLog {
  fn record(&self, event: SyncEvent) {
    for sink in &self.0 {
      sink.record(event.clone());
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::{ApiError, RequestBody};
  use async_trait::async_trait;
  use serde_json::Value;
  use std::time::Duration;
  use tokio::sync::mpsc;

  struct ChannelApi(mpsc::UnboundedSender<ApiRequest>);

  #[async_trait]
  impl RemoteApi for ChannelApi {
    async fn send(&self, request: ApiRequest) -> Result<Value, ApiError> {
      let _ = self.0.send(request);
      Err(ApiError::Transport("offline".into()))
    }
  }

  fn event() -> SyncEvent {
    SyncEvent {
      job_id: 3,
      entity_type: "clients".into(),
      entity_id: "c-1".into(),
      operation: OperationKind::Create,
      attempt: 1,
      state: JobState::Succeeded,
      detail: None,
    }
  }

  #[tokio::test]
  async fn test_http_log_posts_event_and_ignores_failure() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let log = HttpRemoteLog::new(Arc::new(ChannelApi(tx)), "logs/sync");

    log.record(event());

    let request = tokio::time::timeout(Duration::from_secs(1), rx.recv())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(request.method, Method::POST);
    assert_eq!(request.path, "logs/sync");
    match request.body {
      RequestBody::Json(body) => {
        assert_eq!(body["entity_id"], "c-1");
        assert_eq!(body["state"], "succeeded");
        assert_eq!(body["operation"], "create");
      }
      other => panic!("unexpected body {:?}", other),
    }
  }

  #[test]
  fn test_http_log_without_runtime_is_noop() {
    let (tx, _rx) = mpsc::unbounded_channel();
    HttpRemoteLog::new(Arc::new(ChannelApi(tx)), "logs").record(event());
  }
}
