//! Credential storage and the 401 policy.
//!
//! A 401 from a public endpoint while logged out is expected (someone
//! browsing a creator page anonymously). A 401 from anywhere else, or from a
//! public endpoint while a token was attached, means the session is gone:
//! the token is cleared and a [`SessionEvent::Expired`] is broadcast.

use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::api::{TokenSource, UnauthorizedContext, UnauthorizedHandler};

/// Holds the bearer token, if any.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
  token: Arc<RwLock<Option<String>>>,
}

impl CredentialStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Store a verified token, replacing any previous one.
  pub fn set(&self, token: impl Into<String>) {
    *self.token.write().unwrap_or_else(PoisonError::into_inner) = Some(token.into());
  }

  pub fn get(&self) -> Option<String> {
    self
      .token
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  pub fn clear(&self) {
    self
      .token
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .take();
  }

  pub fn is_present(&self) -> bool {
    self
      .token
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .is_some()
  }
}

impl TokenSource for CredentialStore {
  fn token(&self) -> Option<String> {
    self.get()
  }
}

/// App-wide session notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
  /// A request was rejected with 401 and the credential was dropped
  Expired { path: String },
}

/// Decides whether a 401 invalidates the session, and acts on it.
pub struct SessionGuard {
  public_prefixes: Vec<String>,
  credentials: CredentialStore,
  events: broadcast::Sender<SessionEvent>,
  callback: Option<Arc<dyn UnauthorizedHandler>>,
}

impl SessionGuard {
  pub fn new(public_prefixes: Vec<String>, credentials: CredentialStore) -> Self {
    let (events, _) = broadcast::channel(16);
    Self {
      public_prefixes,
      credentials,
      events,
      callback: None,
    }
  }

  /// Extra hook run after the session has been invalidated.
  pub fn with_callback(mut self, callback: Arc<dyn UnauthorizedHandler>) -> Self {
    self.callback = Some(callback);
    self
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
    self.events.subscribe()
  }

  pub fn is_public(&self, path: &str) -> bool {
    self
      .public_prefixes
      .iter()
      .any(|prefix| path.starts_with(prefix.as_str()))
  }

  /// True unless this is an anonymous 401 on a public endpoint.
  pub fn should_invalidate(&self, ctx: &UnauthorizedContext) -> bool {
    !self.is_public(&ctx.path) || ctx.had_credential
  }
}

impl UnauthorizedHandler for SessionGuard {
  fn on_unauthorized(&self, ctx: &UnauthorizedContext) {
    if !self.should_invalidate(ctx) {
      debug!(path = %ctx.path, "anonymous 401 on public endpoint");
      return;
    }

    warn!(path = %ctx.path, had_credential = ctx.had_credential, "session rejected");
    self.credentials.clear();
    // No subscribers is fine.
    let _ = self.events.send(SessionEvent::Expired {
      path: ctx.path.clone(),
    });

    if let Some(callback) = &self.callback {
      callback.on_unauthorized(ctx);
    }
  }
}

impl std::fmt::Debug for SessionGuard {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SessionGuard")
      .field("public_prefixes", &self.public_prefixes)
      .field("has_callback", &self.callback.is_some())
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn guard(credentials: &CredentialStore) -> SessionGuard {
    SessionGuard::new(
      vec!["/public/".to_string(), "/creators/".to_string()],
      credentials.clone(),
    )
  }

  fn ctx(path: &str, had_credential: bool) -> UnauthorizedContext {
    UnauthorizedContext {
      path: path.to_string(),
      had_credential,
    }
  }

  #[test]
  fn test_policy_matrix() {
    let guard = guard(&CredentialStore::new());

    assert!(guard.should_invalidate(&ctx("/creator/earnings", false)));
    assert!(guard.should_invalidate(&ctx("/creator/earnings", true)));
    assert!(guard.should_invalidate(&ctx("/creators/ada", true)));
    assert!(!guard.should_invalidate(&ctx("/creators/ada", false)));
    assert!(!guard.should_invalidate(&ctx("/public/pricing", false)));
  }

  #[test]
  fn test_protected_401_clears_credential_and_broadcasts() {
    let credentials = CredentialStore::new();
    credentials.set("tok");
    let guard = guard(&credentials);
    let mut events = guard.subscribe();

    guard.on_unauthorized(&ctx("/creator/earnings", true));

    assert!(!credentials.is_present());
    assert_eq!(
      events.try_recv().unwrap(),
      SessionEvent::Expired {
        path: "/creator/earnings".to_string()
      }
    );
  }

  #[test]
  fn test_anonymous_public_401_is_ignored() {
    let credentials = CredentialStore::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let guard = guard(&credentials).with_callback(Arc::new(move |_: &UnauthorizedContext| {
      counter.fetch_add(1, Ordering::SeqCst);
    }));
    let mut events = guard.subscribe();

    guard.on_unauthorized(&ctx("/creators/ada", false));

    assert!(events.try_recv().is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn test_callback_runs_after_invalidation() {
    let credentials = CredentialStore::new();
    credentials.set("tok");
    let observed = Arc::new(RwLock::new(None));
    let sink = observed.clone();
    let store = credentials.clone();
    let guard = guard(&credentials).with_callback(Arc::new(move |_: &UnauthorizedContext| {
      *sink.write().unwrap() = Some(store.is_present());
    }));

    guard.on_unauthorized(&ctx("/creators/ada", true));

    assert_eq!(*observed.read().unwrap(), Some(false));
  }

  #[test]
  fn test_credential_store_roundtrip() {
    let store = CredentialStore::new();
    assert_eq!(store.token(), None);
    store.set("a");
    assert_eq!(store.token().as_deref(), Some("a"));
    store.set("b");
    assert_eq!(store.get().as_deref(), Some("b"));
    store.clear();
    assert!(!store.is_present());
  }
}
