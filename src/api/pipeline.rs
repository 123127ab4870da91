//! The request pipeline: one place for headers, auth, deadlines,
//! cancellation, decoding and error normalization.

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::auth::{NoToken, TokenSource, UnauthorizedContext, UnauthorizedHandler};
use super::error::{normalize, ApiError, SetupError, INVALID_RESPONSE_MESSAGE};
use super::request::{Body, RequestDescriptor};
use super::signal::{merge, AbortController};

const USER_AGENT_VALUE: &str = concat!("patron/", env!("CARGO_PKG_VERSION"));

/// Construction-time settings for a [`RequestPipeline`].
#[derive(Debug, Clone)]
pub struct ApiConfig {
  pub base_url: String,
  /// Used when a descriptor carries no timeout of its own
  pub default_timeout: Duration,
}

impl ApiConfig {
  pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

  pub fn new(base_url: impl Into<String>) -> Self {
    Self {
      base_url: base_url.into(),
      default_timeout: Self::DEFAULT_TIMEOUT,
    }
  }

  pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
    self.default_timeout = timeout;
    self
  }
}

/// Executes [`RequestDescriptor`]s against a configured API.
///
/// Cheap to clone; clones share the HTTP client (and its cookie jar).
#[derive(Clone)]
pub struct RequestPipeline {
  http: reqwest::Client,
  base_url: String,
  default_timeout: Duration,
  tokens: Arc<dyn TokenSource>,
  on_unauthorized: Option<Arc<dyn UnauthorizedHandler>>,
}

impl RequestPipeline {
  pub fn new(config: ApiConfig) -> Result<Self, SetupError> {
    url::Url::parse(&config.base_url).map_err(|source| SetupError::InvalidBaseUrl {
      url: config.base_url.clone(),
      source,
    })?;

    let http = reqwest::Client::builder()
      .cookie_store(true)
      .user_agent(USER_AGENT_VALUE)
      .build()?;

    Ok(Self {
      http,
      base_url: config.base_url.trim_end_matches('/').to_string(),
      default_timeout: config.default_timeout,
      tokens: Arc::new(NoToken),
      on_unauthorized: None,
    })
  }

  pub fn with_token_source(mut self, tokens: Arc<dyn TokenSource>) -> Self {
    self.tokens = tokens;
    self
  }

  pub fn with_unauthorized_handler(mut self, handler: Arc<dyn UnauthorizedHandler>) -> Self {
    self.on_unauthorized = Some(handler);
    self
  }

  pub fn base_url(&self) -> &str {
    &self.base_url
  }

  /// Execute a request and decode a 2xx body into `T`.
  ///
  /// Resolves exactly once: with the decoded value, or with an [`ApiError`].
  /// Cancellation through the descriptor's signal and deadline expiry both
  /// surface as [`ErrorKind::Timeout`](super::ErrorKind::Timeout).
  pub async fn execute<T: DeserializeOwned>(
    &self,
    descriptor: &RequestDescriptor,
  ) -> Result<T, ApiError> {
    let path = descriptor.path();
    if path.is_empty() {
      return Err(ApiError::invalid_request("Request path is empty"));
    }

    let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
    let token = self.tokens.token();
    let had_credential = token.is_some();
    let request = self.build_request(&url, descriptor, token.as_deref());

    let controller = AbortController::new();
    let signal = match descriptor.signal() {
      Some(external) => merge(&controller.signal(), external),
      None => controller.signal(),
    };
    if signal.is_aborted() {
      debug!(path, "request cancelled before dispatch");
      return Err(ApiError::timeout());
    }

    let timeout = descriptor.timeout().unwrap_or(self.default_timeout);
    let deadline = Deadline::arm(&controller, timeout);
    let started = Instant::now();

    let exchange = async {
      let response = request.send().await?;
      let status = response.status();
      let bytes = response.bytes().await?;
      Ok::<_, reqwest::Error>((status, bytes))
    };

    let outcome = tokio::select! {
      biased;
      _ = signal.aborted() => None,
      result = exchange => Some(result),
    };
    drop(deadline);

    let (status, bytes) = match outcome {
      None => {
        debug!(
          path,
          timeout_ms = timeout.as_millis() as u64,
          "request aborted"
        );
        return Err(ApiError::timeout());
      }
      Some(Err(e)) => {
        warn!(path, error = %e, "request failed");
        return Err(ApiError::network());
      }
      Some(Ok(parts)) => parts,
    };

    debug!(
      method = %descriptor.method(),
      path,
      status = status.as_u16(),
      elapsed_ms = started.elapsed().as_millis() as u64,
      "request completed"
    );

    let parsed: serde_json::Result<Value> = if bytes.is_empty() {
      Ok(Value::Null)
    } else {
      serde_json::from_slice(&bytes)
    };

    if !status.is_success() {
      let payload = parsed.unwrap_or_else(|_| json!({ "error": INVALID_RESPONSE_MESSAGE }));
      let error = normalize(&payload, status.as_u16());

      if status == StatusCode::UNAUTHORIZED {
        if let Some(handler) = &self.on_unauthorized {
          handler.on_unauthorized(&UnauthorizedContext {
            path: path.to_string(),
            had_credential,
          });
        }
      }

      return Err(error);
    }

    let value = parsed.map_err(|e| {
      debug!(path, error = %e, "response body is not JSON");
      ApiError::decode(status.as_u16())
    })?;

    serde_json::from_value(value).map_err(|e| {
      debug!(path, error = %e, "response body does not match the expected shape");
      ApiError::decode(status.as_u16())
    })
  }

  /// [`execute`](Self::execute) without a target type.
  pub async fn execute_json(&self, descriptor: &RequestDescriptor) -> Result<Value, ApiError> {
    self.execute(descriptor).await
  }

  fn build_request(
    &self,
    url: &str,
    descriptor: &RequestDescriptor,
    token: Option<&str>,
  ) -> reqwest::RequestBuilder {
    let mut request = self
      .http
      .request(descriptor.method().clone(), url)
      .header(ACCEPT, "application/json");

    if let Some(token) = token {
      request = request.header(AUTHORIZATION, format!("Bearer {}", token));
    }

    // Only JSON bodies get a Content-Type from us; body-less requests stay
    // "simple" and skip the CORS preflight.
    match descriptor.body() {
      Some(Body::Json(value)) => {
        request = request
          .header(CONTENT_TYPE, "application/json")
          .body(value.to_string());
      }
      Some(Body::Binary {
        bytes,
        content_type,
      }) => {
        if let Some(content_type) = content_type {
          request = request.header(CONTENT_TYPE, content_type.as_str());
        }
        request = request.body(bytes.clone());
      }
      None => {}
    }

    for (name, value) in descriptor.headers() {
      request = request.header(name.clone(), value.clone());
    }

    request
  }
}

impl std::fmt::Debug for RequestPipeline {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RequestPipeline")
      .field("base_url", &self.base_url)
      .field("default_timeout", &self.default_timeout)
      .finish_non_exhaustive()
  }
}

/// The per-request timer. Aborts its controller when it fires and is
/// cancelled when dropped, so it can never outlive the request.
struct Deadline {
  timer: JoinHandle<()>,
}

impl Deadline {
  fn arm(controller: &AbortController, after: Duration) -> Self {
    let controller = controller.clone();
    let timer = tokio::spawn(async move {
      tokio::time::sleep(after).await;
      controller.abort();
    });
    #[cfg(test)]
    live_deadlines::inc();
    Self { timer }
  }
}

impl Drop for Deadline {
  fn drop(&mut self) {
    self.timer.abort();
    #[cfg(test)]
    live_deadlines::dec();
  }
}


#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::{AbortSignal, ErrorKind};
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Mutex;
  use wiremock::matchers::{body_json, header, method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn pipeline_for(server: &MockServer) -> RequestPipeline {
    RequestPipeline::new(ApiConfig::new(server.uri())).expect("failed to build pipeline")
  }

  #[tokio::test]
  async fn test_admin_dashboard_returned_verbatim() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/admin/dashboard"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"users": {"total": 100}})))
      .mount(&server)
      .await;

    let descriptor =
      RequestDescriptor::get("/admin/dashboard").with_timeout(Duration::from_millis(20_000));
    let value = pipeline_for(&server)
      .execute_json(&descriptor)
      .await
      .expect("request failed");

    assert_eq!(value, json!({"users": {"total": 100}}));
  }

  #[tokio::test]
  async fn test_typed_decode() {
    #[derive(serde::Deserialize)]
    struct Totals {
      users: Users,
    }
    #[derive(serde::Deserialize)]
    struct Users {
      total: u64,
    }

    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/admin/dashboard"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"users": {"total": 7}})))
      .mount(&server)
      .await;

    let totals: Totals = pipeline_for(&server)
      .execute(&RequestDescriptor::get("/admin/dashboard"))
      .await
      .unwrap();
    assert_eq!(totals.users.total, 7);
  }

  #[tokio::test]
  async fn test_times_out_when_server_never_answers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/slow"))
      .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
      .mount(&server)
      .await;

    let started = Instant::now();
    let err = pipeline_for(&server)
      .execute_json(&RequestDescriptor::get("/slow").with_timeout(Duration::from_millis(100)))
      .await
      .unwrap_err();

    assert_eq!(err.kind, ErrorKind::Timeout);
    assert_eq!(err.status, 0);
    assert!(started.elapsed() < Duration::from_secs(2));
  }

  #[tokio::test]
  async fn test_default_timeout_applies() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/slow"))
      .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
      .mount(&server)
      .await;

    let pipeline = RequestPipeline::new(
      ApiConfig::new(server.uri()).with_default_timeout(Duration::from_millis(100)),
    )
    .unwrap();
    let err = pipeline
      .execute_json(&RequestDescriptor::get("/slow"))
      .await
      .unwrap_err();
    assert!(err.is_timeout());
  }

  #[tokio::test]
  async fn test_pre_aborted_signal_skips_transport() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .respond_with(ResponseTemplate::new(200))
      .expect(0)
      .mount(&server)
      .await;

    let descriptor = RequestDescriptor::get("/anything").with_signal(AbortSignal::aborted_signal());
    let err = pipeline_for(&server)
      .execute_json(&descriptor)
      .await
      .unwrap_err();

    assert_eq!(err.kind, ErrorKind::Timeout);
    assert_eq!(err.message, "Request timed out");
  }

  #[tokio::test]
  async fn test_external_cancel_surfaces_as_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/slow"))
      .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
      .mount(&server)
      .await;

    let controller = AbortController::new();
    let descriptor = RequestDescriptor::get("/slow")
      .with_timeout(Duration::from_secs(30))
      .with_signal(controller.signal());

    let canceller = tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(50)).await;
      controller.abort();
    });

    let started = Instant::now();
    let err = pipeline_for(&server)
      .execute_json(&descriptor)
      .await
      .unwrap_err();
    canceller.await.unwrap();

    assert_eq!(err.kind, ErrorKind::Timeout);
    assert!(started.elapsed() < Duration::from_secs(5));
  }

  #[tokio::test]
  async fn test_get_without_body_has_no_content_type() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/profile"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
      .mount(&server)
      .await;

    pipeline_for(&server)
      .execute_json(&RequestDescriptor::get("/profile"))
      .await
      .unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].headers.get("content-type").is_none());
    assert_eq!(
      requests[0].headers.get("accept").unwrap(),
      "application/json"
    );
    assert!(requests[0].headers.get("authorization").is_none());
  }

  #[tokio::test]
  async fn test_json_body_sets_content_type() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/profile"))
      .and(header("content-type", "application/json"))
      .and(body_json(json!({"name": "Ada"})))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
      .expect(1)
      .mount(&server)
      .await;

    let value = pipeline_for(&server)
      .execute_json(&RequestDescriptor::post("/profile").json(json!({"name": "Ada"})))
      .await
      .unwrap();
    assert_eq!(value, json!({"ok": true}));
  }

  #[tokio::test]
  async fn test_binary_body_has_no_implicit_content_type() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/upload"))
      .respond_with(ResponseTemplate::new(204))
      .mount(&server)
      .await;

    pipeline_for(&server)
      .execute::<()>(&RequestDescriptor::post("/upload").binary(vec![1, 2, 3], None))
      .await
      .unwrap();

    let requests = server.received_requests().await.unwrap();
    assert!(requests[0].headers.get("content-type").is_none());
    assert_eq!(requests[0].body, vec![1, 2, 3]);
  }

  #[tokio::test]
  async fn test_token_is_looked_up_per_call() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/me"))
      .and(header("authorization", "Bearer first"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"n": 1})))
      .expect(1)
      .mount(&server)
      .await;
    Mock::given(method("GET"))
      .and(path("/me"))
      .and(header("authorization", "Bearer second"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"n": 2})))
      .expect(1)
      .mount(&server)
      .await;

    let current = Arc::new(Mutex::new(Some("first".to_string())));
    let source = current.clone();
    let pipeline = pipeline_for(&server)
      .with_token_source(Arc::new(move || source.lock().unwrap().clone()));

    let first = pipeline
      .execute_json(&RequestDescriptor::get("/me"))
      .await
      .unwrap();
    *current.lock().unwrap() = Some("second".to_string());
    let second = pipeline
      .execute_json(&RequestDescriptor::get("/me"))
      .await
      .unwrap();

    assert_eq!(first, json!({"n": 1}));
    assert_eq!(second, json!({"n": 2}));
  }

  #[tokio::test]
  async fn test_error_body_is_normalized() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/auth/verify"))
      .respond_with(
        ResponseTemplate::new(400).set_body_json(json!({"errors": [{"message": "Invalid email"}]})),
      )
      .mount(&server)
      .await;

    let err = pipeline_for(&server)
      .execute_json(&RequestDescriptor::post("/auth/verify").json(json!({"email": "x"})))
      .await
      .unwrap_err();

    assert_eq!(err.message, "Invalid email");
    assert_eq!(err.status, 400);
    assert_eq!(err.kind, ErrorKind::Http);
    assert!(err.payload.is_some());
  }

  #[tokio::test]
  async fn test_non_json_error_body_uses_placeholder() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/broken"))
      .respond_with(ResponseTemplate::new(502).set_body_string("<html>Bad Gateway</html>"))
      .mount(&server)
      .await;

    let err = pipeline_for(&server)
      .execute_json(&RequestDescriptor::get("/broken"))
      .await
      .unwrap_err();

    assert_eq!(err.message, INVALID_RESPONSE_MESSAGE);
    assert_eq!(err.status, 502);
    assert_eq!(err.kind, ErrorKind::Http);
  }

  #[tokio::test]
  async fn test_non_json_success_body_is_decode_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/weird"))
      .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
      .mount(&server)
      .await;

    let err = pipeline_for(&server)
      .execute_json(&RequestDescriptor::get("/weird"))
      .await
      .unwrap_err();

    assert_eq!(err.kind, ErrorKind::Decode);
    assert_eq!(err.status, 200);
  }

  #[tokio::test]
  async fn test_network_failure() {
    // Nothing listens on port 1.
    let pipeline = RequestPipeline::new(ApiConfig::new("http://127.0.0.1:1")).unwrap();
    let err = pipeline
      .execute_json(&RequestDescriptor::get("/x").with_timeout(Duration::from_secs(5)))
      .await
      .unwrap_err();

    assert_eq!(err.kind, ErrorKind::Network);
    assert_eq!(err.status, 0);
  }

  #[tokio::test]
  async fn test_empty_path_is_rejected_without_dispatch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .respond_with(ResponseTemplate::new(200))
      .expect(0)
      .mount(&server)
      .await;

    let err = pipeline_for(&server)
      .execute_json(&RequestDescriptor::get(""))
      .await
      .unwrap_err();
    assert_eq!(err.status, 0);
  }

  #[tokio::test]
  async fn test_unauthorized_handler_called_once_with_path() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/creator/earnings"))
      .respond_with(ResponseTemplate::new(401).set_body_json(json!({"error": "Unauthorized"})))
      .mount(&server)
      .await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let pipeline = pipeline_for(&server)
      .with_token_source(Arc::new(|| Some("tok".to_string())))
      .with_unauthorized_handler(Arc::new(move |ctx: &UnauthorizedContext| {
        sink.lock().unwrap().push(ctx.clone());
      }));

    let err = pipeline
      .execute_json(&RequestDescriptor::get("/creator/earnings"))
      .await
      .unwrap_err();

    assert!(err.is_unauthorized());
    let seen = seen.lock().unwrap();
    assert_eq!(
      *seen,
      vec![UnauthorizedContext {
        path: "/creator/earnings".to_string(),
        had_credential: true,
      }]
    );
  }

  #[tokio::test]
  async fn test_handler_not_called_for_other_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .respond_with(ResponseTemplate::new(403).set_body_json(json!({"error": "Forbidden"})))
      .mount(&server)
      .await;

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let pipeline = pipeline_for(&server).with_unauthorized_handler(Arc::new(
      move |_: &UnauthorizedContext| {
        counter.fetch_add(1, Ordering::SeqCst);
      },
    ));

    let err = pipeline
      .execute_json(&RequestDescriptor::get("/admin/users"))
      .await
      .unwrap_err();
    assert_eq!(err.status, 403);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_identical_concurrent_calls_are_independent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/metrics"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"views": 3})))
      .expect(2)
      .mount(&server)
      .await;

    let pipeline = pipeline_for(&server);
    let descriptor = RequestDescriptor::get("/metrics");
    let (a, b) = tokio::join!(
      pipeline.execute_json(&descriptor),
      pipeline.execute_json(&descriptor)
    );

    assert_eq!(a.unwrap(), json!({"views": 3}));
    assert_eq!(b.unwrap(), json!({"views": 3}));
  }

  #[tokio::test]
  async fn test_deadline_is_disarmed_on_every_exit() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/creator/profile"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "Ada"})))
      .mount(&server)
      .await;
    Mock::given(method("GET"))
      .and(path("/creator/metrics"))
      .respond_with(ResponseTemplate::new(500).set_body_json(json!({"error": "boom"})))
      .mount(&server)
      .await;

    let pipeline = pipeline_for(&server);
    let descriptor = |p: &str| RequestDescriptor::get(p).with_timeout(Duration::from_millis(200));
    assert_eq!(live_deadlines::count(), 0);

    pipeline
      .execute_json(&descriptor("/creator/profile"))
      .await
      .unwrap();
    assert_eq!(live_deadlines::count(), 0);

    let err = pipeline
      .execute_json(&descriptor("/creator/metrics"))
      .await
      .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Http);
    assert_eq!(live_deadlines::count(), 0);

    let offline = RequestPipeline::new(ApiConfig::new("http://127.0.0.1:1")).unwrap();
    let err = offline
      .execute_json(&descriptor("/creator/profile"))
      .await
      .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Network);
    assert_eq!(live_deadlines::count(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_dropped_deadline_never_fires() {
    let controller = AbortController::new();
    let deadline = Deadline::arm(&controller, Duration::from_millis(50));
    drop(deadline);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!controller.signal().is_aborted());

    let _armed = Deadline::arm(&controller, Duration::from_millis(50));
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(controller.signal().is_aborted());
  }

  #[test]
  fn test_invalid_base_url_is_rejected() {
    let err = RequestPipeline::new(ApiConfig::new("not a url")).unwrap_err();
    assert!(matches!(err, SetupError::InvalidBaseUrl { .. }));
  }
}
