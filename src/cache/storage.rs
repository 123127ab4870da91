//! Durable key/value storage and the fail-silent wrapper around it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

const PROBE_KEY: &str = "__patron_storage_probe__";
const PROBE_VALUE: &str = "1";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("storage unavailable: {0}")]
  Unavailable(String),
}

/// A durable string store. Implementations may fail on any call.
pub trait KeyValueStore: Send + Sync {
  fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

  fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

  fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// SQLite-backed store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open (or create) the store at the default location.
  pub fn open_default() -> Result<Self, StorageError> {
    Self::open(&Self::default_path()?)
  }

  pub fn open(path: &Path) -> Result<Self, StorageError> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(path)?;
    conn.execute_batch(KV_SCHEMA)?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf, StorageError> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| StorageError::Unavailable("could not determine data directory".into()))?;

    Ok(data_dir.join("patron").join("cache.db"))
  }

  fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StorageError> {
    self
      .conn
      .lock()
      .map_err(|e| StorageError::Unavailable(format!("lock poisoned: {}", e)))
  }
}

const KV_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl KeyValueStore for SqliteStore {
  fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
    let conn = self.conn()?;
    let value = conn
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()?;
    Ok(value)
  }

  fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
    let conn = self.conn()?;
    conn.execute(
      "INSERT OR REPLACE INTO kv_store (key, value, updated_at)
       VALUES (?, ?, datetime('now'))",
      params![key, value],
    )?;
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<(), StorageError> {
    let conn = self.conn()?;
    conn.execute("DELETE FROM kv_store WHERE key = ?", params![key])?;
    Ok(())
  }
}

/// Process-local store. Clones share contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
  values: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn values(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
    self.values.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

impl KeyValueStore for MemoryStore {
  fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
    Ok(self.values().get(key).cloned())
  }

  fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
    self.values().insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<(), StorageError> {
    self.values().remove(key);
    Ok(())
  }
}

/// Fail-silent access to an optional durable store.
///
/// Reads that fail are reported as absent, writes and removals that fail
/// are dropped. When the store is missing or fails the construction-time
/// probe, every call is a no-op and callers see an empty store.
#[derive(Clone)]
pub struct SafeStorage {
  backend: Option<Arc<dyn KeyValueStore>>,
}

impl SafeStorage {
  pub fn new(store: impl KeyValueStore + 'static) -> Self {
    Self::from_backend(Some(Arc::new(store) as Arc<dyn KeyValueStore>))
  }

  /// Storage that never persists anything.
  pub fn memory_only() -> Self {
    Self { backend: None }
  }

  /// Open SQLite storage at `path` (or the default location), falling back
  /// to memory-only mode when that fails.
  pub fn open(path: Option<&Path>) -> Self {
    let store = match path {
      Some(path) => SqliteStore::open(path),
      None => SqliteStore::open_default(),
    };

    match store {
      Ok(store) => Self::new(store),
      Err(e) => {
        warn!(error = %e, "durable cache storage unavailable, continuing in memory");
        Self::memory_only()
      }
    }
  }

  pub fn from_backend(backend: Option<Arc<dyn KeyValueStore>>) -> Self {
    let backend = backend.filter(|store| {
      let usable = probe(store.as_ref());
      if !usable {
        warn!("durable cache storage failed its probe, continuing in memory");
      }
      usable
    });
    Self { backend }
  }

  /// Whether writes can reach durable storage this session.
  pub fn is_persistent(&self) -> bool {
    self.backend.is_some()
  }

  pub fn get(&self, key: &str) -> Option<String> {
    let backend = self.backend.as_ref()?;
    match backend.get(key) {
      Ok(value) => value,
      Err(e) => {
        debug!(key, error = %e, "storage read failed, treating as absent");
        None
      }
    }
  }

  pub fn set(&self, key: &str, value: &str) {
    if let Some(backend) = &self.backend {
      if let Err(e) = backend.set(key, value) {
        debug!(key, error = %e, "storage write failed, dropping");
      }
    }
  }

  pub fn remove(&self, key: &str) {
    if let Some(backend) = &self.backend {
      if let Err(e) = backend.remove(key) {
        debug!(key, error = %e, "storage removal failed, ignoring");
      }
    }
  }
}

impl std::fmt::Debug for SafeStorage {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SafeStorage")
      .field("persistent", &self.is_persistent())
      .finish()
  }
}

/// Write a sentinel, read it back, remove it.
fn probe(store: &dyn KeyValueStore) -> bool {
  let roundtrip = || -> Result<bool, StorageError> {
    store.set(PROBE_KEY, PROBE_VALUE)?;
    let read = store.get(PROBE_KEY)?;
    store.remove(PROBE_KEY)?;
    Ok(read.as_deref() == Some(PROBE_VALUE))
  };
  roundtrip().unwrap_or(false)
}

#[cfg(test)]
pub(crate) mod testing {
  use super::*;
  use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

  /// Memory store whose calls can be made to fail after construction.
  #[derive(Debug, Clone, Default)]
  pub(crate) struct FlakyStore {
    pub(crate) inner: MemoryStore,
    pub(crate) fail_reads: Arc<AtomicBool>,
    pub(crate) fail_writes: Arc<AtomicBool>,
    pub(crate) writes: Arc<AtomicUsize>,
  }

  impl FlakyStore {
    /// Successful writes, excluding the probe.
    pub(crate) fn write_count(&self) -> usize {
      self.writes.load(Ordering::SeqCst)
    }
  }

  impl KeyValueStore for FlakyStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
      if self.fail_reads.load(Ordering::SeqCst) {
        return Err(StorageError::Unavailable("read refused".into()));
      }
      self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
      if self.fail_writes.load(Ordering::SeqCst) {
        return Err(StorageError::Unavailable("quota exceeded".into()));
      }
      if key != PROBE_KEY {
        self.writes.fetch_add(1, Ordering::SeqCst);
      }
      self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
      if self.fail_writes.load(Ordering::SeqCst) {
        return Err(StorageError::Unavailable("remove refused".into()));
      }
      self.inner.remove(key)
    }
  }

  /// Memory store whose writes (other than the probe) block for `delay`.
  #[derive(Debug, Clone)]
  pub(crate) struct SlowStore {
    pub(crate) inner: MemoryStore,
    pub(crate) delay: std::time::Duration,
    pub(crate) writing: Arc<AtomicBool>,
  }

  impl SlowStore {
    pub(crate) fn new(delay: std::time::Duration) -> Self {
      Self {
        inner: MemoryStore::new(),
        delay,
        writing: Arc::new(AtomicBool::new(false)),
      }
    }
  }

  impl KeyValueStore for SlowStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
      self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
      if key != PROBE_KEY {
        self.writing.store(true, Ordering::SeqCst);
        std::thread::sleep(self.delay);
      }
      self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
      self.inner.remove(key)
    }
  }
}
