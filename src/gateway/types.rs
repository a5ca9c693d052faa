//! Request/response shapes shared by every gateway call.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;

/// HTTP verb of a gateway request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    }
  }
}

impl std::fmt::Display for Method {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Options for a single gateway request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOptions {
  pub method: Method,
  pub body: Option<Value>,
  pub token: Option<String>,
}

impl RequestOptions {
  pub fn get() -> Self {
    Self::new(Method::Get)
  }

  pub fn new(method: Method) -> Self {
    Self {
      method,
      body: None,
      token: None,
    }
  }

  pub fn with_body(mut self, body: Value) -> Self {
    self.body = Some(body);
    self
  }

  pub fn with_token(mut self, token: Option<String>) -> Self {
    self.token = token;
    self
  }
}

/// Normalized outcome of a gateway call.
///
/// `status` is 0 when no HTTP response was received at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayResponse {
  pub data: Option<Value>,
  pub error: Option<String>,
  pub status: u16,
}

impl GatewayResponse {
  pub fn ok(status: u16, data: Option<Value>) -> Self {
    Self {
      data,
      error: None,
      status,
    }
  }

  pub fn failed(status: u16, error: impl Into<String>) -> Self {
    Self {
      data: None,
      error: Some(error.into()),
      status,
    }
  }

  /// Response for a request that never reached the server.
  pub fn network_error(error: impl Into<String>) -> Self {
    Self::failed(0, error)
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Convert into the raw payload or a classified error.
  pub fn into_result(self) -> Result<Option<Value>, SyncError> {
    if self.is_success() {
      Ok(self.data)
    } else {
      Err(SyncError::from_status(self.status, self.error))
    }
  }

  /// Convert into a typed payload; a missing body decodes as JSON `null`.
  pub fn decode<T: DeserializeOwned>(self) -> Result<T, SyncError> {
    let data = self.into_result()?.unwrap_or(Value::Null);
    decode(data)
  }
}

/// Decode a JSON value into a typed record.
pub fn decode<T: DeserializeOwned>(value: Value) -> Result<T, SyncError> {
  serde_json::from_value(value).map_err(SyncError::from)
}

/// Shape of error bodies returned by the server.
#[derive(Debug, Deserialize)]
pub(crate) struct ApiErrorBody {
  pub error: Option<String>,
  pub message: Option<String>,
}

impl ApiErrorBody {
  pub fn into_message(self) -> Option<String> {
    self.error.or(self.message)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_success_into_result() {
    let resp = GatewayResponse::ok(201, Some(json!({"id": 1})));
    assert_eq!(resp.into_result(), Ok(Some(json!({"id": 1}))));
  }

  #[test]
  fn test_failure_into_result_is_classified() {
    let resp = GatewayResponse::network_error("connection refused");
    assert_eq!(
      resp.into_result(),
      Err(SyncError::Connectivity("connection refused".into()))
    );

    let resp = GatewayResponse::failed(401, "token expired");
    assert_eq!(resp.into_result(), Err(SyncError::Unauthorized));
  }

  #[test]
  fn test_decode_reports_shape_mismatch() {
    let resp = GatewayResponse::ok(200, Some(json!({"unexpected": true})));
    let result: Result<Vec<i64>, _> = resp.decode();
    assert!(matches!(result, Err(SyncError::Decode(_))));
  }
}
