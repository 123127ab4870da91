//! Request descriptors.
//!
//! A descriptor is plain data: method, path, body and an optional timeout or
//! cancellation signal. Endpoint wrappers build one and hand it to the
//! pipeline; they never carry control flow of their own.

use std::time::Duration;

use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Method;
use serde_json::Value;

use super::signal::AbortSignal;

/// Request body.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
  /// Serialized as JSON and sent with `Content-Type: application/json`
  Json(Value),
  /// Sent as-is. The pipeline never sets a Content-Type for binary bodies;
  /// `content_type` is forwarded only when the caller supplies one.
  Binary {
    bytes: Vec<u8>,
    content_type: Option<String>,
  },
}

/// Everything needed to execute one HTTP call.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
  method: Method,
  path: String,
  headers: Vec<(HeaderName, HeaderValue)>,
  body: Option<Body>,
  timeout: Option<Duration>,
  signal: Option<AbortSignal>,
}

impl RequestDescriptor {
  pub fn new(method: Method, path: impl Into<String>) -> Self {
    Self {
      method,
      path: path.into(),
      headers: Vec::new(),
      body: None,
      timeout: None,
      signal: None,
    }
  }

  pub fn get(path: impl Into<String>) -> Self {
    Self::new(Method::GET, path)
  }

  pub fn post(path: impl Into<String>) -> Self {
    Self::new(Method::POST, path)
  }

  pub fn put(path: impl Into<String>) -> Self {
    Self::new(Method::PUT, path)
  }

  pub fn patch(path: impl Into<String>) -> Self {
    Self::new(Method::PATCH, path)
  }

  pub fn delete(path: impl Into<String>) -> Self {
    Self::new(Method::DELETE, path)
  }

  /// Attach a JSON body.
  pub fn json(mut self, body: Value) -> Self {
    self.body = Some(Body::Json(body));
    self
  }

  /// Attach a binary body (uploads, multipart payloads encoded by the caller).
  pub fn binary(mut self, bytes: Vec<u8>, content_type: Option<String>) -> Self {
    self.body = Some(Body::Binary {
      bytes,
      content_type,
    });
    self
  }

  /// Override the pipeline's default timeout. A zero duration is ignored.
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout).filter(|t| !t.is_zero());
    self
  }

  /// Let the caller cancel the request.
  pub fn with_signal(mut self, signal: AbortSignal) -> Self {
    self.signal = Some(signal);
    self
  }

  pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
    self.headers.push((name, value));
    self
  }

  pub fn method(&self) -> &Method {
    &self.method
  }

  pub fn path(&self) -> &str {
    &self.path
  }

  pub fn headers(&self) -> &[(HeaderName, HeaderValue)] {
    &self.headers
  }

  pub fn body(&self) -> Option<&Body> {
    self.body.as_ref()
  }

  pub fn timeout(&self) -> Option<Duration> {
    self.timeout
  }

  pub fn signal(&self) -> Option<&AbortSignal> {
    self.signal.as_ref()
  }
}
