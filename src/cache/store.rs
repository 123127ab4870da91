//! In-memory result cache with selective, throttled persistence.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::entry::{CacheEntry, CachedValue, EntryState, EntryStatus};
use super::key::CacheKey;
use super::snapshot::{PersistedEntry, PersistedSnapshot};
use super::storage::SafeStorage;
use crate::api::ApiError;

/// Construction-time settings for a [`PersistentCacheStore`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
  /// Base storage key. The snapshot lives under `{storage_key}-v{schema_version}`;
  /// the bare key is the pre-versioning legacy location.
  pub storage_key: String,
  pub schema_version: u32,
  /// Key roots eligible for persistence. Empty means nothing is persisted.
  pub whitelist: BTreeSet<String>,
  /// Persisted entries older than this are dropped on hydration
  pub max_age: Duration,
  /// Delay between the first mutation and the flush that covers it
  pub flush_interval: Duration,
}

impl CacheConfig {
  pub const DEFAULT_STORAGE_KEY: &'static str = "patron-query-cache";

  pub fn with_whitelist<I, S>(mut self, roots: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.whitelist = roots.into_iter().map(Into::into).collect();
    self
  }

  pub fn with_schema_version(mut self, version: u32) -> Self {
    self.schema_version = version;
    self
  }

  pub fn with_flush_interval(mut self, interval: Duration) -> Self {
    self.flush_interval = interval;
    self
  }

  pub fn with_max_age(mut self, max_age: Duration) -> Self {
    self.max_age = max_age;
    self
  }

  pub fn versioned_key(&self) -> String {
    self.key_for_version(self.schema_version)
  }

  pub fn legacy_key(&self) -> &str {
    &self.storage_key
  }

  pub fn is_whitelisted(&self, root: &str) -> bool {
    self.whitelist.contains(root)
  }

  fn key_for_version(&self, version: u32) -> String {
    format!("{}-v{}", self.storage_key, version)
  }
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      storage_key: Self::DEFAULT_STORAGE_KEY.to_string(),
      schema_version: 1,
      whitelist: BTreeSet::new(),
      max_age: Duration::from_secs(24 * 60 * 60),
      flush_interval: Duration::from_secs(1),
    }
  }
}

struct Inner {
  config: CacheConfig,
  storage: SafeStorage,
  entries: Mutex<HashMap<CacheKey, CacheEntry>>,
  flush_scheduled: AtomicBool,
  dirty: Arc<Notify>,
  restoring: watch::Sender<bool>,
  /// Bumped by `clear` so in-flight hydrations and fetches can't resurrect data
  generation: AtomicU64,
  /// Held from snapshot selection through the storage write, and by `clear`
  /// across its removals.
  persist: Mutex<()>,
}

impl Inner {
  fn lock_entries(&self) -> MutexGuard<'_, HashMap<CacheKey, CacheEntry>> {
    self.entries.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn lock_persist(&self) -> MutexGuard<'_, ()> {
    self.persist.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn schedule_flush(&self) {
    if !self.flush_scheduled.swap(true, Ordering::SeqCst) {
      self.dirty.notify_one();
    }
  }

  async fn hydrate(&self) {
    let generation = self.generation.load(Ordering::SeqCst);
    let storage = self.storage.clone();
    let key = self.config.versioned_key();
    let raw = tokio::task::spawn_blocking(move || storage.get(&key))
      .await
      .unwrap_or_else(|e| {
        warn!(error = %e, "cache hydration task failed");
        None
      });

    let snapshot = raw
      .as_deref()
      .and_then(|raw| PersistedSnapshot::decode(raw, self.config.schema_version));

    if let Some(snapshot) = snapshot {
      let now = Utc::now();
      let mut restored = 0usize;
      let mut dropped = 0usize;
      let mut entries = self.lock_entries();

      if self.generation.load(Ordering::SeqCst) != generation {
        debug!("cache cleared during hydration, discarding snapshot");
      } else {
        for persisted in snapshot.entries {
          if !self.config.is_whitelisted(persisted.key.root())
            || is_expired(persisted.updated_at, self.config.max_age, now)
          {
            dropped += 1;
            continue;
          }
          // A result written while we were restoring is newer than the snapshot.
          if entries.contains_key(&persisted.key) {
            continue;
          }
          entries.insert(persisted.key.clone(), persisted.into_entry());
          restored += 1;
        }
        info!(restored, dropped, "cache hydrated");
      }
    }

    self.restoring.send_replace(false);
  }

  fn flush(&self) -> usize {
    if *self.restoring.borrow() {
      debug!("skipping cache flush while restoring");
      return 0;
    }

    let _persist = self.lock_persist();
    let mut persisted: Vec<PersistedEntry> = self
      .lock_entries()
      .values()
      .filter(|entry| self.config.is_whitelisted(entry.key.root()))
      .filter_map(PersistedEntry::from_entry)
      .collect();
    persisted.sort_by(|a, b| a.key.cmp(&b.key));
    let count = persisted.len();

    if !self.storage.is_persistent() {
      return count;
    }

    match PersistedSnapshot::new(self.config.schema_version, persisted).encode() {
      Ok(blob) => self.storage.set(&self.config.versioned_key(), &blob),
      Err(e) => warn!(error = %e, "failed to encode cache snapshot"),
    }
    debug!(count, "cache flushed");
    count
  }
}

fn is_expired(updated_at: DateTime<Utc>, max_age: Duration, now: DateTime<Utc>) -> bool {
  match (now - updated_at).to_std() {
    Ok(age) => age > max_age,
    Err(_) => false,
  }
}

/// Aborts the background task when the last store handle goes away.
struct Worker {
  handle: JoinHandle<()>,
}

impl Drop for Worker {
  fn drop(&mut self) {
    self.handle.abort();
  }
}

/// Hydrates once, then flushes after each burst of mutations.
async fn run_worker(inner: Weak<Inner>, dirty: Arc<Notify>) {
  let interval = match inner.upgrade() {
    Some(inner) => {
      inner.hydrate().await;
      inner.config.flush_interval
    }
    None => return,
  };

  loop {
    dirty.notified().await;
    tokio::time::sleep(interval).await;

    let Some(store) = inner.upgrade() else {
      break;
    };
    store.flush_scheduled.store(false, Ordering::SeqCst);
    if let Err(e) = tokio::task::spawn_blocking(move || store.flush()).await {
      warn!(error = %e, "cache flush task failed");
    }
  }
}

/// Keyed result cache that persists whitelisted successful entries.
///
/// Construction starts hydration in the background; until it finishes
/// [`is_restoring`](Self::is_restoring) is true and no flush is written.
/// Mutations schedule a throttled flush. If durable storage is unusable the
/// store behaves identically, minus persistence.
///
/// Must be created inside a Tokio runtime. Clones share state.
#[derive(Clone)]
pub struct PersistentCacheStore {
  inner: Arc<Inner>,
  _worker: Arc<Worker>,
}

impl PersistentCacheStore {
  pub fn new(config: CacheConfig, storage: SafeStorage) -> Self {
    let (restoring, _) = watch::channel(true);
    let dirty = Arc::new(Notify::new());
    let inner = Arc::new(Inner {
      config,
      storage,
      entries: Mutex::new(HashMap::new()),
      flush_scheduled: AtomicBool::new(false),
      dirty: dirty.clone(),
      restoring,
      generation: AtomicU64::new(0),
      persist: Mutex::new(()),
    });

    let handle = tokio::spawn(run_worker(Arc::downgrade(&inner), dirty));

    Self {
      inner,
      _worker: Arc::new(Worker { handle }),
    }
  }

  pub fn config(&self) -> &CacheConfig {
    &self.inner.config
  }

  pub fn is_persistent(&self) -> bool {
    self.inner.storage.is_persistent()
  }

  /// True until persisted entries have been loaded.
  pub fn is_restoring(&self) -> bool {
    *self.inner.restoring.borrow()
  }

  /// Wait for hydration to finish.
  pub async fn restored(&self) {
    let mut rx = self.inner.restoring.subscribe();
    loop {
      if !*rx.borrow_and_update() {
        return;
      }
      if rx.changed().await.is_err() {
        return;
      }
    }
  }

  pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
    self.inner.lock_entries().get(key).cloned()
  }

  /// Decode a successful single value.
  pub fn get_value<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
    let entries = self.inner.lock_entries();
    let value = entries.get(key)?.value()?.as_single()?.clone();
    drop(entries);
    serde_json::from_value(value).ok()
  }

  pub fn entries(&self) -> Vec<CacheEntry> {
    let mut entries: Vec<CacheEntry> = self.inner.lock_entries().values().cloned().collect();
    entries.sort_by(|a, b| a.key.cmp(&b.key));
    entries
  }

  pub fn len(&self) -> usize {
    self.inner.lock_entries().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn set_pending(&self, key: CacheKey) {
    self.write(key, EntryState::Pending);
  }

  pub fn set_success(&self, key: CacheKey, value: CachedValue) {
    self.write(key, EntryState::Success(value));
  }

  pub fn set_error(&self, key: CacheKey, error: ApiError) {
    self.write(key, EntryState::Error(error));
  }

  /// Append a page to a paginated entry, replacing any non-paginated state.
  pub fn append_page(&self, key: CacheKey, page: Value, next_cursor: Option<String>) {
    {
      let mut entries = self.inner.lock_entries();
      let entry = entries
        .entry(key.clone())
        .or_insert_with(|| CacheEntry::new(key, EntryState::Pending));

      match &mut entry.state {
        EntryState::Success(CachedValue::Paginated {
          pages,
          next_cursor: cursor,
        }) => {
          pages.push(page);
          *cursor = next_cursor;
        }
        state => {
          *state = EntryState::Success(CachedValue::Paginated {
            pages: vec![page],
            next_cursor,
          });
        }
      }
      entry.updated_at = Utc::now();
    }
    self.inner.schedule_flush();
  }

  pub fn remove(&self, key: &CacheKey) -> Option<CacheEntry> {
    let removed = self.inner.lock_entries().remove(key);
    if removed.is_some() {
      self.inner.schedule_flush();
    }
    removed
  }

  /// Drop every entry under `root`. Returns how many were removed.
  pub fn invalidate_root(&self, root: &str) -> usize {
    let removed = {
      let mut entries = self.inner.lock_entries();
      let before = entries.len();
      entries.retain(|key, _| key.root() != root);
      before - entries.len()
    };
    if removed > 0 {
      self.inner.schedule_flush();
    }
    removed
  }

  /// Write eligible entries to storage now. Returns how many were eligible.
  pub fn flush(&self) -> usize {
    self.inner.flush()
  }

  /// Forget everything, in memory and on disk.
  ///
  /// Removes the snapshot of every schema version up to the current one as
  /// well as the legacy unversioned key. Waits for a flush that is already
  /// writing, so its snapshot is removed rather than left behind.
  pub fn clear(&self) {
    let _persist = self.inner.lock_persist();
    self.inner.generation.fetch_add(1, Ordering::SeqCst);
    self.inner.lock_entries().clear();

    let config = &self.inner.config;
    for version in 1..=config.schema_version {
      self.inner.storage.remove(&config.key_for_version(version));
    }
    self.inner.storage.remove(config.legacy_key());
    info!("cache cleared");
  }

  /// Cache-first fetch.
  ///
  /// Waits for hydration, serves a fresh successful entry when one decodes
  /// into `T`, and otherwise runs `fetcher`, recording its outcome. Identical
  /// concurrent calls each run their own fetcher. An outcome that settles
  /// after a `clear` is returned but not recorded.
  pub async fn fetch_query<T, F, Fut>(
    &self,
    key: CacheKey,
    stale_time: Duration,
    fetcher: F,
  ) -> Result<T, ApiError>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
  {
    self.restored().await;

    let cached = self.get(&key);
    if let Some(entry) = &cached {
      if !entry.is_stale(stale_time, Utc::now()) {
        if let Some(value) = entry.value().and_then(CachedValue::as_single) {
          match serde_json::from_value(value.clone()) {
            Ok(data) => {
              debug!(key = %key, "cache hit");
              return Ok(data);
            }
            Err(e) => debug!(key = %key, error = %e, "cached value has a different shape"),
          }
        }
      }
    }

    let generation = self.inner.generation.load(Ordering::SeqCst);

    // Keep serving the previous value while a refresh is in flight.
    if cached.as_ref().map(CacheEntry::status) != Some(EntryStatus::Success) {
      self.set_pending(key.clone());
    }

    let outcome = fetcher().await;
    if self.inner.generation.load(Ordering::SeqCst) != generation {
      debug!(key = %key, "cache cleared during fetch, result not recorded");
      return outcome;
    }

    match outcome {
      Ok(data) => {
        match serde_json::to_value(&data) {
          Ok(value) => self.set_success(key, CachedValue::Single(value)),
          Err(e) => {
            warn!(key = %key, error = %e, "result is not cacheable");
            self.remove(&key);
          }
        }
        Ok(data)
      }
      Err(error) => {
        self.set_error(key, error.clone());
        Err(error)
      }
    }
  }

  fn write(&self, key: CacheKey, state: EntryState) {
    self
      .inner
      .lock_entries()
      .insert(key.clone(), CacheEntry::new(key, state));
    self.inner.schedule_flush();
  }
}

impl std::fmt::Debug for PersistentCacheStore {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PersistentCacheStore")
      .field("config", &self.inner.config)
      .field("storage", &self.inner.storage)
      .field("entries", &self.len())
      .finish()
  }
}
