//! Cache entry model.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::key::CacheKey;
use crate::api::ApiError;

/// A cached result.
///
/// Paginated results are kept apart from single values so the persistence
/// layer can refuse to serialize them.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedValue {
  Single(Value),
  Paginated {
    pages: Vec<Value>,
    next_cursor: Option<String>,
  },
}

impl CachedValue {
  pub fn as_single(&self) -> Option<&Value> {
    match self {
      CachedValue::Single(value) => Some(value),
      CachedValue::Paginated { .. } => None,
    }
  }
}

/// Lifecycle of an entry.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryState {
  /// A fetch is in flight and nothing has been stored yet
  Pending,
  Success(CachedValue),
  Error(ApiError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
  Pending,
  Success,
  Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
  pub key: CacheKey,
  pub state: EntryState,
  pub updated_at: DateTime<Utc>,
}

impl CacheEntry {
  pub fn new(key: CacheKey, state: EntryState) -> Self {
    Self {
      key,
      state,
      updated_at: Utc::now(),
    }
  }

  pub fn status(&self) -> EntryStatus {
    match self.state {
      EntryState::Pending => EntryStatus::Pending,
      EntryState::Success(_) => EntryStatus::Success,
      EntryState::Error(_) => EntryStatus::Error,
    }
  }

  pub fn value(&self) -> Option<&CachedValue> {
    match &self.state {
      EntryState::Success(value) => Some(value),
      _ => None,
    }
  }

  /// Whether the entry is older than `stale_time` at `now`.
  pub fn is_stale(&self, stale_time: Duration, now: DateTime<Utc>) -> bool {
    match (now - self.updated_at).to_std() {
      Ok(age) => age > stale_time,
      // Timestamp in the future
      Err(_) => false,
    }
  }
}
