//! Durable snapshot format.
//!
//! One JSON blob per schema version. Only single successful values can be
//! represented; there is no way to build a [`PersistedEntry`] from a
//! pending, failed or paginated entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::entry::{CacheEntry, CachedValue, EntryState};
use super::key::CacheKey;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedEntry {
  pub key: CacheKey,
  pub value: Value,
  pub updated_at: DateTime<Utc>,
}

impl PersistedEntry {
  /// Returns `None` for anything but a successful single value.
  pub fn from_entry(entry: &CacheEntry) -> Option<Self> {
    match &entry.state {
      EntryState::Success(CachedValue::Single(value)) => Some(Self {
        key: entry.key.clone(),
        value: value.clone(),
        updated_at: entry.updated_at,
      }),
      _ => None,
    }
  }

  pub fn into_entry(self) -> CacheEntry {
    CacheEntry {
      key: self.key,
      state: EntryState::Success(CachedValue::Single(self.value)),
      updated_at: self.updated_at,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSnapshot {
  pub schema_version: u32,
  pub saved_at: DateTime<Utc>,
  /// SHA-256 over the serialized entries
  pub digest: String,
  pub entries: Vec<PersistedEntry>,
}

impl PersistedSnapshot {
  pub fn new(schema_version: u32, entries: Vec<PersistedEntry>) -> Self {
    Self {
      schema_version,
      saved_at: Utc::now(),
      digest: digest_entries(&entries),
      entries,
    }
  }

  pub fn encode(&self) -> serde_json::Result<String> {
    serde_json::to_string(self)
  }

  /// Parse a stored blob. Malformed JSON, a different schema version or a
  /// digest mismatch all read as "nothing stored".
  pub fn decode(raw: &str, expected_version: u32) -> Option<Self> {
    let snapshot: Self = match serde_json::from_str(raw) {
      Ok(snapshot) => snapshot,
      Err(e) => {
        debug!(error = %e, "discarding malformed cache snapshot");
        return None;
      }
    };

    if snapshot.schema_version != expected_version {
      debug!(
        found = snapshot.schema_version,
        expected = expected_version,
        "discarding cache snapshot from another schema version"
      );
      return None;
    }

    if snapshot.digest != digest_entries(&snapshot.entries) {
      debug!("discarding cache snapshot with mismatched digest");
      return None;
    }

    Some(snapshot)
  }
}

fn digest_entries(entries: &[PersistedEntry]) -> String {
  let bytes = serde_json::to_vec(entries).unwrap_or_default();
  hex::encode(Sha256::digest(&bytes))
}
