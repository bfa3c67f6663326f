use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::types::{ApiError, ApiRequest, RequestBody};
use crate::config::{ApiConfig, Config};

/// Transmits requests to the remote service.
#[async_trait]
pub trait RemoteApi: Send + Sync {
  /// Send a request and return the decoded JSON response (`Null` when the
  /// body is empty).
  async fn send(&self, request: ApiRequest) -> Result<Value, ApiError>;
}

/// HTTP client for the field-sales service
#[derive(Clone)]
pub struct RemoteClient {
  http: reqwest::Client,
  base_url: Url,
  token: Option<String>,
}

impl RemoteClient {
  pub fn new(config: &ApiConfig) -> Result<Self> {
    Self::with_token(config, Config::get_api_token())
  }

  pub fn with_token(config: &ApiConfig, token: Option<String>) -> Result<Self> {
    // A trailing slash keeps relative joins inside the base path
    let mut base = config.url.clone();
    if !base.ends_with('/') {
      base.push('/');
    }
    let base_url =
      Url::parse(&base).map_err(|e| eyre!("Invalid API url {}: {}", config.url, e))?;

    let http = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base_url,
      token,
    })
  }

  pub fn base_url(&self) -> &Url {
    &self.base_url
  }

  fn url(&self, path: &str) -> Result<Url, ApiError> {
    self
      .base_url
      .join(path.trim_start_matches('/'))
      .map_err(|e| ApiError::Request(format!("Invalid path {}: {}", path, e)))
  }
}

#[async_trait]
impl RemoteApi for RemoteClient {
  async fn send(&self, request: ApiRequest) -> Result<Value, ApiError> {
    let url = self.url(&request.path)?;
    debug!("{} {}", request.method, url);

    let mut builder = self.http.request(request.method, url);
    if let Some(token) = &self.token {
      builder = builder.bearer_auth(token);
    }

    builder = match request.body {
      RequestBody::Empty => builder,
      RequestBody::Json(body) => builder.json(&body),
      RequestBody::Multipart(multipart) => {
        let form = multipart
          .into_form()
          .map_err(|e| ApiError::Request(e.to_string()))?;
        builder.multipart(form)
      }
    };

    let response = builder
      .send()
      .await
      .map_err(|e| ApiError::Transport(e.to_string()))?;

    let status = response.status();
    let body = response
      .text()
      .await
      .map_err(|e| ApiError::Transport(format!("Failed to read response body: {}", e)))?;

    if !status.is_success() {
      return Err(ApiError::Status {
        status: status.as_u16(),
        body: if body.trim().is_empty() {
          None
        } else {
          Some(body)
        },
      });
    }

    if body.trim().is_empty() {
      return Ok(Value::Null);
    }

    serde_json::from_str(&body).map_err(|e| ApiError::Decode(e.to_string()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use reqwest::Method;
  use serde_json::json;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::TcpListener;

  fn api_config(url: &str) -> ApiConfig {
    ApiConfig {
      url: url.to_string(),
      user_id: None,
      timeout_secs: 5,
      log_endpoint: None,
    }
  }

  /// Serve one canned HTTP response on a random local port.
  async fn serve_once(status_line: &'static str, body: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      let (mut socket, _) = listener.accept().await.unwrap();
      let mut buf = vec![0u8; 64 * 1024];
      let _ = socket.read(&mut buf).await;
      let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status_line,
        body.len(),
        body
      );
      let _ = socket.write_all(response.as_bytes()).await;
      let _ = socket.shutdown().await;
    });
    format!("http://{}/api", addr)
  }

  #[test]
  fn test_paths_join_under_base() {
    let client = RemoteClient::with_token(&api_config("https://ventas.example.com/api"), None)
      .unwrap();
    assert_eq!(
      client.url("/clients/7").unwrap().as_str(),
      "https://ventas.example.com/api/clients/7"
    );
  }

  #[test]
  fn test_invalid_base_url() {
    assert!(RemoteClient::with_token(&api_config("not a url"), None).is_err());
  }

  #[tokio::test]
  async fn test_success_body_is_decoded() {
    let url = serve_once("201 Created", r#"{"id":"srv-1"}"#).await;
    let client = RemoteClient::with_token(&api_config(&url), Some("t".into())).unwrap();

    let value = client
      .send(ApiRequest::json(Method::POST, "clients", json!({"name": "x"})))
      .await
      .unwrap();
    assert_eq!(value["id"], "srv-1");
  }

  #[tokio::test]
  async fn test_error_status_keeps_body() {
    let url = serve_once("409 Conflict", "cliente duplicado").await;
    let client = RemoteClient::with_token(&api_config(&url), None).unwrap();

    let err = client
      .send(ApiRequest::json(Method::POST, "clients", json!({})))
      .await
      .unwrap_err();
    assert_eq!(
      err,
      ApiError::Status {
        status: 409,
        body: Some("cliente duplicado".into())
      }
    );
  }

  #[tokio::test]
  async fn test_connection_refused_is_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client =
      RemoteClient::with_token(&api_config(&format!("http://{}/", addr)), None).unwrap();
    let err = client
      .send(ApiRequest::empty(Method::DELETE, "clients/1"))
      .await
      .unwrap_err();
    assert!(matches!(err, ApiError::Transport(_)));
  }
}
