//! Client that pairs the request pipeline with the result cache.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;

use crate::api::{
  ApiConfig, ApiError, RequestDescriptor, RequestPipeline, SetupError, UnauthorizedHandler,
};
use crate::cache::{CacheConfig, CacheKey, PersistentCacheStore, SafeStorage};
use crate::session::{CredentialStore, SessionEvent, SessionGuard};

/// Everything a client instance needs, supplied explicitly.
#[derive(Debug, Clone)]
pub struct ClientConfig {
  pub api: ApiConfig,
  /// Path prefixes where an anonymous 401 is expected
  pub public_paths: Vec<String>,
  pub cache: CacheConfig,
}

/// One surface's view of the API: pipeline, cache, credential and session
/// policy, with no state shared with other instances.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct PatronClient {
  pipeline: RequestPipeline,
  cache: PersistentCacheStore,
  credentials: CredentialStore,
  session: Arc<SessionGuard>,
}

impl PatronClient {
  /// Build a client. Must be called inside a Tokio runtime.
  pub fn new(
    config: ClientConfig,
    storage: SafeStorage,
    on_unauthorized: Option<Arc<dyn UnauthorizedHandler>>,
  ) -> Result<Self, SetupError> {
    let credentials = CredentialStore::new();

    let mut guard = SessionGuard::new(config.public_paths, credentials.clone());
    if let Some(callback) = on_unauthorized {
      guard = guard.with_callback(callback);
    }
    let session = Arc::new(guard);

    let pipeline = RequestPipeline::new(config.api)?
      .with_token_source(Arc::new(credentials.clone()))
      .with_unauthorized_handler(session.clone());

    let cache = PersistentCacheStore::new(config.cache, storage);

    Ok(Self {
      pipeline,
      cache,
      credentials,
      session,
    })
  }

  pub fn pipeline(&self) -> &RequestPipeline {
    &self.pipeline
  }

  pub fn cache(&self) -> &PersistentCacheStore {
    &self.cache
  }

  pub fn credentials(&self) -> &CredentialStore {
    &self.credentials
  }

  pub fn subscribe_session(&self) -> broadcast::Receiver<SessionEvent> {
    self.session.subscribe()
  }

  /// Store a verified bearer token.
  pub fn sign_in(&self, token: impl Into<String>) {
    self.credentials.set(token);
  }

  /// Drop the credential and every cached result, in memory and on disk.
  /// Used on logout and after account deletion.
  pub fn end_session(&self) {
    self.credentials.clear();
    self.cache.clear();
    info!("session ended");
  }

  /// Uncached call.
  pub async fn execute<T: DeserializeOwned>(
    &self,
    descriptor: &RequestDescriptor,
  ) -> Result<T, ApiError> {
    self.pipeline.execute(descriptor).await
  }

  /// Cached call: serves a fresh entry for `key`, otherwise executes
  /// `descriptor` and records the outcome.
  pub async fn query<T>(
    &self,
    key: CacheKey,
    descriptor: &RequestDescriptor,
    stale_time: Duration,
  ) -> Result<T, ApiError>
  where
    T: Serialize + DeserializeOwned,
  {
    self
      .cache
      .fetch_query(key, stale_time, || self.pipeline.execute(descriptor))
      .await
  }
}

impl std::fmt::Debug for PatronClient {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PatronClient")
      .field("pipeline", &self.pipeline)
      .field("cache", &self.cache)
      .field("signed_in", &self.credentials.is_present())
      .finish()
  }
}
