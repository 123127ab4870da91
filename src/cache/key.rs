use std::fmt;

use serde::{Deserialize, Serialize};

/// Key of a cached result: a root name followed by filter/id parameters.
///
/// Only the root decides whether an entry may be persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(Vec<String>);

impl CacheKey {
  pub fn new(root: impl Into<String>) -> Self {
    Self(vec![root.into()])
  }

  /// Append a parameter.
  pub fn with(mut self, part: impl fmt::Display) -> Self {
    self.0.push(part.to_string());
    self
  }

  pub fn root(&self) -> &str {
    self.0.first().map(String::as_str).unwrap_or("")
  }

  pub fn parts(&self) -> &[String] {
    &self.0
  }
}

impl From<&str> for CacheKey {
  fn from(root: &str) -> Self {
    Self::new(root)
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0.join(":"))
  }
}
