//! Client-side result cache with selective durable persistence.
//!
//! This module provides:
//! - A keyed in-memory cache of request outcomes (pending, success, error)
//! - Throttled dehydration of whitelisted successful entries into durable storage
//! - Versioned snapshots, so a schema bump never reads old-shaped data
//! - Fail-silent storage, degrading to memory-only when persistence is unavailable

mod entry;
mod key;
mod snapshot;
mod storage;
mod store;

pub use entry::{CacheEntry, CachedValue, EntryState, EntryStatus};
pub use key::CacheKey;
pub use snapshot::{PersistedEntry, PersistedSnapshot};
pub use storage::{KeyValueStore, MemoryStore, SafeStorage, SqliteStore, StorageError};
pub use store::{CacheConfig, PersistentCacheStore};
