//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;
use std::hash::Hash;

/// Trait for values that can be stored in the cache.
///
/// Values are kept as JSON inside the storage so that one store can hold
/// every result type the application reads.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> Cacheable for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Entities addressable by a stable identifier.
///
/// Paged queries use the identifier of the last item as the next cursor.
pub trait Identified {
  fn cache_key(&self) -> &str;
}

/// A closed set of cache keys.
///
/// Every key belongs to exactly one tag (its resource class). Invalidation
/// can target a single key or every key sharing a tag.
pub trait QueryKey: Clone + Debug + Eq + Hash + Send + Sync + 'static {
  /// Resource class of a key, independent of its discriminator.
  type Tag: Copy + Debug + Eq + Send + Sync + 'static;

  fn tag(&self) -> Self::Tag;

  /// Human readable description for logs.
  fn description(&self) -> String;
}

/// Selects the entries an invalidation applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPattern<K: QueryKey> {
  /// Exactly this key
  Exact(K),
  /// Every key with this tag, whatever its discriminator
  Tag(K::Tag),
  /// Every key
  All,
}

impl<K: QueryKey> KeyPattern<K> {
  pub fn matches(&self, key: &K) -> bool {
    match self {
      Self::Exact(k) => k == key,
      Self::Tag(tag) => key.tag() == *tag,
      Self::All => true,
    }
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from a load started by another reader.
  pub fn joined(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Joined,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where a result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// This reader triggered the backend call
  Network,
  /// Another reader's in-flight call for the same key was awaited
  Joined,
  /// Fresh cached entry, no backend call
  Cache,
}
