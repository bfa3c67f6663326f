use reqwest::Method;
use serde_json::Value;
use thiserror::Error;

use crate::sync::MultipartRequest;

/// Error returned by the remote service collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
  /// Connection, timeout or other failure before a response arrived
  #[error("transport error: {0}")]
  Transport(String),

  /// The server answered with a non-success status
  #[error("server returned {status}: {}", .body.as_deref().unwrap_or("<empty body>"))]
  Status { status: u16, body: Option<String> },

  /// The response body could not be parsed
  #[error("decode error: {0}")]
  Decode(String),

  /// The request could not be built (bad URL, bad MIME type)
  #[error("invalid request: {0}")]
  Request(String),
}

impl ApiError {
  pub fn status(&self) -> Option<u16> {
    match self {
      ApiError::Status { status, .. } => Some(*status),
      _ => None,
    }
  }

  pub fn body(&self) -> Option<&str> {
    match self {
      ApiError::Status { body, .. } => body.as_deref(),
      _ => None,
    }
  }
}

/// Payload of an outgoing request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
  Empty,
  Json(Value),
  Multipart(MultipartRequest),
}

/// A transmittable request, relative to the service base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
  pub method: Method,
  pub path: String,
  pub body: RequestBody,
}

impl ApiRequest {
  pub fn json(method: Method, path: impl Into<String>, body: Value) -> Self {
    Self {
      method,
      path: path.into(),
      body: RequestBody::Json(body),
    }
  }

  pub fn multipart(method: Method, path: impl Into<String>, request: MultipartRequest) -> Self {
    Self {
      method,
      path: path.into(),
      body: RequestBody::Multipart(request),
    }
  }

  pub fn empty(method: Method, path: impl Into<String>) -> Self {
    Self {
      method,
      path: path.into(),
      body: RequestBody::Empty,
    }
  }
}
