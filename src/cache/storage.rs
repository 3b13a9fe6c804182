//! Cache storage trait and in-memory implementation.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;

use super::traits::{KeyPattern, QueryKey};

/// Lifecycle state of a cached entry. Absent entries have no state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
  /// Result of the latest successful load, not invalidated since
  Fresh,
  /// Invalidated, or its last refetch failed; next read reloads it
  Stale,
  /// A refetch is in flight
  Loading,
}

/// A single cached entry.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  /// Most recent successful result
  pub value: Value,
  /// When the value was stored
  pub cached_at: DateTime<Utc>,
  pub state: EntryState,
  /// Error of the last failed refetch, cleared by the next success
  pub error: Option<String>,
}

impl CachedEntry {
  pub fn new(value: Value) -> Self {
    Self {
      value,
      cached_at: Utc::now(),
      state: EntryState::Fresh,
      error: None,
    }
  }

  /// Whether the entry can be served without a backend call.
  pub fn is_fresh(&self, stale_time: Option<Duration>) -> bool {
    if self.state != EntryState::Fresh {
      return false;
    }
    match stale_time {
      Some(limit) => Utc::now() - self.cached_at <= limit,
      None => true,
    }
  }
}

/// Trait for cache storage backends.
pub trait CacheStorage<K: QueryKey>: Send + Sync {
  /// Get the entry for a key.
  fn get(&self, key: &K) -> Result<Option<CachedEntry>>;

  /// Store a successful result, replacing whatever was there.
  fn store(&self, key: &K, value: Value) -> Result<()>;

  /// Store a result that was invalidated while it loaded. The value is
  /// kept for display but the next read reloads it.
  fn store_stale(&self, key: &K, value: Value) -> Result<()>;

  /// Mark an existing entry as being refetched. No-op for absent keys.
  fn mark_loading(&self, key: &K) -> Result<()>;

  /// Record a failed load. The previous value is kept and becomes stale.
  fn record_error(&self, key: &K, error: &str) -> Result<()>;

  /// Mark every matching entry stale, loading ones included. Returns how
  /// many entries matched.
  fn invalidate(&self, pattern: &KeyPattern<K>) -> Result<usize>;

  /// Drop every entry.
  fn clear(&self) -> Result<()>;

  /// Number of entries held.
  fn len(&self) -> Result<usize>;
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl<K: QueryKey> CacheStorage<K> for NoopStorage {
  fn get(&self, _key: &K) -> Result<Option<CachedEntry>> {
    Ok(None) // Always miss
  }

  fn store(&self, _key: &K, _value: Value) -> Result<()> {
    Ok(()) // Discard
  }

  fn store_stale(&self, _key: &K, _value: Value) -> Result<()> {
    Ok(())
  }

  fn mark_loading(&self, _key: &K) -> Result<()> {
    Ok(())
  }

  fn record_error(&self, _key: &K, _error: &str) -> Result<()> {
    Ok(())
  }

  fn invalidate(&self, _pattern: &KeyPattern<K>) -> Result<usize> {
    Ok(0)
  }

  fn clear(&self) -> Result<()> {
    Ok(())
  }

  fn len(&self) -> Result<usize> {
    Ok(0)
  }
}

/// In-process storage. Entries live until invalidated-and-replaced or cleared.
pub struct MemoryStorage<K: QueryKey> {
  entries: RwLock<HashMap<K, CachedEntry>>,
}

impl<K: QueryKey> MemoryStorage<K> {
  pub fn new() -> Self {
    Self {
      entries: RwLock::new(HashMap::new()),
    }
  }
}

impl<K: QueryKey> Default for MemoryStorage<K> {
  fn default() -> Self {
    Self::new()
  }
}

fn poisoned<E: std::fmt::Display>(e: E) -> color_eyre::Report {
  eyre!("Lock poisoned: {}", e)
}

impl<K: QueryKey> CacheStorage<K> for MemoryStorage<K> {
  fn get(&self, key: &K) -> Result<Option<CachedEntry>> {
    let entries = self.entries.read().map_err(poisoned)?;
    Ok(entries.get(key).cloned())
  }

  fn store(&self, key: &K, value: Value) -> Result<()> {
    let mut entries = self.entries.write().map_err(poisoned)?;
    entries.insert(key.clone(), CachedEntry::new(value));
    Ok(())
  }

  fn store_stale(&self, key: &K, value: Value) -> Result<()> {
    let mut entries = self.entries.write().map_err(poisoned)?;
    let mut entry = CachedEntry::new(value);
    entry.state = EntryState::Stale;
    entries.insert(key.clone(), entry);
    Ok(())
  }

  fn mark_loading(&self, key: &K) -> Result<()> {
    let mut entries = self.entries.write().map_err(poisoned)?;
    if let Some(entry) = entries.get_mut(key) {
      entry.state = EntryState::Loading;
    }
    Ok(())
  }

  fn record_error(&self, key: &K, error: &str) -> Result<()> {
    let mut entries = self.entries.write().map_err(poisoned)?;
    if let Some(entry) = entries.get_mut(key) {
      entry.state = EntryState::Stale;
      entry.error = Some(error.to_string());
    }
    Ok(())
  }

  fn invalidate(&self, pattern: &KeyPattern<K>) -> Result<usize> {
    let mut entries = self.entries.write().map_err(poisoned)?;
    let mut matched = 0;
    for (key, entry) in entries.iter_mut() {
      if pattern.matches(key) {
        entry.state = EntryState::Stale;
        matched += 1;
      }
    }
    Ok(matched)
  }

  fn clear(&self) -> Result<()> {
    let mut entries = self.entries.write().map_err(poisoned)?;
    entries.clear();
    Ok(())
  }

  fn len(&self) -> Result<usize> {
    let entries = self.entries.read().map_err(poisoned)?;
    Ok(entries.len())
  }
}
