//! Error types for the request pipeline.
//!
//! Every failure a caller can see is an [`ApiError`]: transport failures,
//! cancellations, non-2xx responses and undecodable bodies all arrive in
//! the same shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const TIMEOUT_MESSAGE: &str = "Request timed out";
pub const NETWORK_MESSAGE: &str = "Network error";
pub const FALLBACK_MESSAGE: &str = "Request failed";
pub const INVALID_RESPONSE_MESSAGE: &str = "Invalid response";

/// Where a failure originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
  /// Transport failure unrelated to cancellation
  Network,
  /// Deadline elapsed or the caller cancelled
  Timeout,
  /// Non-2xx response
  Http,
  /// A 2xx response whose body could not be decoded
  Decode,
}

/// Normalized request error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct ApiError {
  pub message: String,
  /// HTTP status, 0 when no response was received
  pub status: u16,
  pub kind: ErrorKind,
  /// Machine-readable code when the backend supplied one
  pub code: Option<String>,
  /// The decoded error body, for callers needing structured inspection
  pub payload: Option<Value>,
}

impl ApiError {
  pub fn timeout() -> Self {
    Self::transport(ErrorKind::Timeout, TIMEOUT_MESSAGE)
  }

  pub fn network() -> Self {
    Self::transport(ErrorKind::Network, NETWORK_MESSAGE)
  }

  /// A request that was rejected before anything was sent.
  pub fn invalid_request(message: impl Into<String>) -> Self {
    Self::transport(ErrorKind::Network, message)
  }

  pub fn decode(status: u16) -> Self {
    Self {
      message: INVALID_RESPONSE_MESSAGE.to_string(),
      status,
      kind: ErrorKind::Decode,
      code: None,
      payload: None,
    }
  }

  fn transport(kind: ErrorKind, message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
      status: 0,
      kind,
      code: None,
      payload: None,
    }
  }

  pub fn is_timeout(&self) -> bool {
    self.kind == ErrorKind::Timeout
  }

  pub fn is_unauthorized(&self) -> bool {
    self.status == 401
  }

  /// Whether the backend signalled rate limiting, either by status, by code,
  /// or by a `rateLimited` flag in the payload.
  pub fn is_rate_limited(&self) -> bool {
    self.status == 429
      || self.code.as_deref() == Some("rate_limited")
      || self
        .payload
        .as_ref()
        .and_then(|p| p.get("rateLimited"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
  }
}

/// Errors raised while constructing a pipeline.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
  #[error("invalid base url '{url}': {source}")]
  InvalidBaseUrl {
    url: String,
    #[source]
    source: url::ParseError,
  },

  #[error("failed to build HTTP client: {0}")]
  Client(#[from] reqwest::Error),
}

/// Map an error payload and status into an [`ApiError`].
///
/// Message precedence: `error`, then `message`, then `errors[0].message`,
/// then a generic fallback. Payloads of any shape are accepted.
pub fn normalize(payload: &Value, status: u16) -> ApiError {
  let message = extract_message(payload)
    .unwrap_or(FALLBACK_MESSAGE)
    .to_string();

  ApiError {
    message,
    status,
    kind: ErrorKind::Http,
    code: extract_code(payload),
    payload: Some(payload.clone()),
  }
}

fn extract_message(payload: &Value) -> Option<&str> {
  payload
    .get("error")
    .and_then(Value::as_str)
    .or_else(|| payload.get("message").and_then(Value::as_str))
    .or_else(|| {
      first_error(payload)
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
    })
}

fn extract_code(payload: &Value) -> Option<String> {
  payload
    .get("code")
    .and_then(Value::as_str)
    .or_else(|| {
      first_error(payload)
        .and_then(|e| e.get("code"))
        .and_then(Value::as_str)
    })
    .map(String::from)
}

/// Validation libraries report a list of issues; the first one wins.
fn first_error(payload: &Value) -> Option<&Value> {
  payload
    .get("errors")
    .and_then(Value::as_array)
    .and_then(|errors| errors.first())
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_error_field_wins() {
    let err = normalize(&json!({"error": "Nope", "message": "Other"}), 403);
    assert_eq!(err.message, "Nope");
    assert_eq!(err.status, 403);
    assert_eq!(err.kind, ErrorKind::Http);
  }

  #[test]
  fn test_message_field() {
    let err = normalize(&json!({"message": "Slow down"}), 429);
    assert_eq!(err.message, "Slow down");
    assert!(err.is_rate_limited());
  }

  #[test]
  fn test_validation_errors_array() {
    let err = normalize(&json!({"errors": [{"message": "Invalid email"}]}), 400);
    assert_eq!(err.message, "Invalid email");
    assert_eq!(err.status, 400);
    assert_eq!(
      err.payload,
      Some(json!({"errors": [{"message": "Invalid email"}]}))
    );
  }

  #[test]
  fn test_non_string_error_falls_through() {
    let err = normalize(&json!({"error": {"nested": true}, "message": "Readable"}), 500);
    assert_eq!(err.message, "Readable");
  }

  #[test]
  fn test_unrecognized_shapes_use_fallback() {
    for payload in [
      json!(null),
      json!("plain text"),
      json!([1, 2, 3]),
      json!({"errors": []}),
      json!({"errors": [{"msg": "x"}]}),
      json!({"detail": "something"}),
    ] {
      let err = normalize(&payload, 502);
      assert_eq!(err.message, FALLBACK_MESSAGE, "payload: {}", payload);
      assert_eq!(err.status, 502);
    }
  }

  #[test]
  fn test_code_extraction() {
    let err = normalize(&json!({"error": "Too many", "code": "rate_limited"}), 400);
    assert_eq!(err.code.as_deref(), Some("rate_limited"));
    assert!(err.is_rate_limited());

    let err = normalize(
      &json!({"errors": [{"message": "Bad", "code": "invalid_email"}]}),
      422,
    );
    assert_eq!(err.code.as_deref(), Some("invalid_email"));
    assert!(!err.is_rate_limited());
  }

  #[test]
  fn test_nested_rate_limit_flag() {
    let err = normalize(&json!({"error": "Wait", "rateLimited": true}), 400);
    assert!(err.is_rate_limited());
  }

  #[test]
  fn test_transport_errors_have_zero_status() {
    assert_eq!(ApiError::timeout().status, 0);
    assert!(ApiError::timeout().is_timeout());
    assert_eq!(ApiError::network().kind, ErrorKind::Network);
    assert_eq!(ApiError::network().to_string(), NETWORK_MESSAGE);
  }
}
