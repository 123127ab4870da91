//! Hooks the pipeline calls into for credentials and rejected sessions.

/// Supplies the bearer token for a request.
///
/// Looked up on every call so a rotated or cleared token takes effect
/// immediately.
pub trait TokenSource: Send + Sync {
  fn token(&self) -> Option<String>;
}

impl<F> TokenSource for F
where
  F: Fn() -> Option<String> + Send + Sync,
{
  fn token(&self) -> Option<String> {
    self()
  }
}

/// Token source for pipelines that never authenticate with a bearer token.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoToken;

impl TokenSource for NoToken {
  fn token(&self) -> Option<String> {
    None
  }
}

/// What the pipeline knows about a request that came back 401.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnauthorizedContext {
  pub path: String,
  /// Whether a bearer token was attached to the rejected request
  pub had_credential: bool,
}

/// Called once per 401 response, before the error reaches the caller.
pub trait UnauthorizedHandler: Send + Sync {
  fn on_unauthorized(&self, ctx: &UnauthorizedContext);
}

impl<F> UnauthorizedHandler for F
where
  F: Fn(&UnauthorizedContext) + Send + Sync,
{
  fn on_unauthorized(&self, ctx: &UnauthorizedContext) {
    self(ctx)
  }
}
