//! Cache layer that orchestrates caching logic with backend fetching.

use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use super::pages::{InfinitePages, NextPage};
use super::storage::{CacheStorage, CachedEntry, MemoryStorage};
use super::traits::{CacheResult, Cacheable, Identified, KeyPattern, QueryKey};

/// A load shared by every reader of the same key while it is in flight.
type SharedLoad = Shared<BoxFuture<'static, std::result::Result<Value, String>>>;

/// Bookkeeping for one in-flight load.
struct InFlight {
  /// Distinguishes this load from a later one that replaced it
  id: u64,
  load: SharedLoad,
  /// An invalidation matched the key after this load started
  invalidated: bool,
}

type InFlightMap<K> = Arc<Mutex<HashMap<K, InFlight>>>;

/// Keyed query cache.
///
/// Reads go through `fetch`, which serves fresh entries directly and
/// collapses concurrent loads of one key into a single backend call.
/// Writes go through `mutate`, which invalidates the declared keys once the
/// backend call has succeeded. Invalidation only marks entries stale; the
/// reload happens on the next read.
pub struct QueryCache<K: QueryKey> {
  storage: Arc<dyn CacheStorage<K>>,
  in_flight: InFlightMap<K>,
  next_load_id: Arc<AtomicU64>,
  /// Optional age limit on top of invalidation
  stale_time: Option<Duration>,
}

impl<K: QueryKey> QueryCache<K> {
  /// Create a new cache with the given storage backend.
  pub fn new<S: CacheStorage<K> + 'static>(storage: S) -> Self {
    Self {
      storage: Arc::new(storage),
      in_flight: Arc::new(Mutex::new(HashMap::new())),
      next_load_id: Arc::new(AtomicU64::new(0)),
      stale_time: None,
    }
  }

  pub fn in_memory() -> Self {
    Self::new(MemoryStorage::new())
  }

  /// Set the stale time for cached data.
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = Some(stale_time);
    self
  }

  /// Fetch with cache-first strategy.
  ///
  /// 1. Fresh entry - return it, no backend call
  /// 2. Load already in flight for this key, not invalidated since it
  ///    started - await it
  /// 3. Otherwise start a load; on success the entry becomes fresh, on
  ///    failure the previous value is kept with the error recorded
  pub async fn fetch<T, F, Fut>(&self, key: &K, loader: F) -> Result<CacheResult<T>>
  where
    T: Cacheable,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    if let Some(entry) = self.fresh_entry(key)? {
      debug!(key = %key.description(), "cache hit");
      return Ok(CacheResult::from_cache(decode(entry.value)?, entry.cached_at));
    }

    let (load, joined) = {
      let mut in_flight = self.lock_in_flight()?;

      match in_flight.get(key) {
        Some(current) if !current.invalidated => (current.load.clone(), true),
        // Nothing loading, or the running load predates an invalidation
        _ => {
          // A load may have finished between the first check and taking the lock
          if let Some(entry) = self.fresh_entry(key)? {
            return Ok(CacheResult::from_cache(decode(entry.value)?, entry.cached_at));
          }
          let id = self.next_load_id.fetch_add(1, Ordering::Relaxed);
          let load = self.start_load(key.clone(), id, loader());
          in_flight.insert(
            key.clone(),
            InFlight {
              id,
              load: load.clone(),
              invalidated: false,
            },
          );
          (load, false)
        }
      }
    };

    if joined {
      debug!(key = %key.description(), "joining in-flight load");
    } else {
      debug!(key = %key.description(), "cache miss, loading");
    }

    let value = load.await.map_err(|e| eyre!(e))?;
    let data = decode(value)?;

    Ok(if joined {
      CacheResult::joined(data)
    } else {
      CacheResult::from_network(data)
    })
  }

  /// Run a write and, only if it succeeds, invalidate the keys it affects.
  ///
  /// The write is awaited exactly once. `invalidations` receives the
  /// backend's result so targets can depend on returned ids.
  pub async fn mutate<T, Fut, I>(&self, name: &str, call: Fut, invalidations: I) -> Result<T>
  where
    Fut: Future<Output = Result<T>>,
    I: FnOnce(&T) -> Vec<KeyPattern<K>>,
  {
    match call.await {
      Ok(data) => {
        let patterns = invalidations(&data);
        let mut stale = 0;
        for pattern in &patterns {
          stale += self.invalidate(pattern)?;
        }
        info!(
          mutation = name,
          patterns = patterns.len(),
          stale,
          "mutation succeeded"
        );
        Ok(data)
      }
      Err(e) => {
        warn!(mutation = name, error = %e, "mutation failed");
        Err(e)
      }
    }
  }

  /// Mark matching entries stale. Returns how many entries matched.
  ///
  /// Loads in flight for matching keys are flagged too: their result is
  /// stored stale and later readers start a new load instead of joining.
  pub fn invalidate(&self, pattern: &KeyPattern<K>) -> Result<usize> {
    let mut in_flight = self.lock_in_flight()?;
    let mut loading = 0;
    for (key, current) in in_flight.iter_mut() {
      if pattern.matches(key) {
        current.invalidated = true;
        loading += 1;
      }
    }
    let matched = self.storage.invalidate(pattern)?;
    drop(in_flight);

    debug!(?pattern, matched, loading, "invalidated");
    Ok(matched)
  }

  /// Drop every cached entry.
  pub fn clear(&self) -> Result<()> {
    self.storage.clear()
  }

  /// Raw entry for a key, including its state and last error.
  pub fn entry(&self, key: &K) -> Result<Option<CachedEntry>> {
    self.storage.get(key)
  }

  /// Cached value for a key regardless of freshness.
  pub fn get_query_data<T: Cacheable>(&self, key: &K) -> Result<Option<T>> {
    self
      .storage
      .get(key)?
      .map(|entry| decode(entry.value))
      .transpose()
  }

  /// Replace the value for a key, marking it fresh.
  pub fn set_query_data<T: Cacheable>(&self, key: &K, data: &T) -> Result<()> {
    let value =
      serde_json::to_value(data).map_err(|e| eyre!("Failed to serialize cached value: {}", e))?;
    self.storage.store(key, value)
  }

  /// Fetch the pages of a paged query, loading the first page if nothing
  /// fresh is cached.
  pub async fn fetch_pages<T, F, Fut>(&self, key: &K, load_page: F) -> Result<InfinitePages<T>>
  where
    T: Cacheable + Identified,
    F: FnOnce(Option<String>) -> Fut,
    Fut: Future<Output = Result<Vec<T>>> + Send + 'static,
  {
    let result = self
      .fetch(key, move || {
        let call = load_page(None);
        async move { Ok(InfinitePages::first(call.await?)) }
      })
      .await?;

    Ok(result.data)
  }

  /// Load the page after the last cached one.
  ///
  /// Returns `None` without calling the backend once the last page came
  /// back empty. A missing or stale entry restarts from the first page.
  pub async fn fetch_next_page<T, F, Fut>(
    &self,
    key: &K,
    load_page: F,
  ) -> Result<Option<InfinitePages<T>>>
  where
    T: Cacheable + Identified,
    F: FnOnce(Option<String>) -> Fut,
    Fut: Future<Output = Result<Vec<T>>> + Send + 'static,
  {
    let mut pages: InfinitePages<T> = match self.fresh_entry(key)? {
      Some(entry) => decode(entry.value)?,
      None => return self.fetch_pages(key, load_page).await.map(Some),
    };

    let cursor = match pages.next_page() {
      NextPage::Exhausted => {
        debug!(key = %key.description(), "no more pages");
        return Ok(None);
      }
      NextPage::After(cursor) => Some(cursor),
      NextPage::Start => None,
    };

    let loaded = pages.pages.len();
    let page = load_page(cursor).await?;
    debug!(key = %key.description(), items = page.len(), "loaded page");
    pages.push(page.clone());
    self.append_page(key, loaded, page)?;

    Ok(Some(pages))
  }

  /// Append a page to a cached paged query.
  ///
  /// Only applies while the cached pages are fresh and still number
  /// `loaded`, the pages the caller extended. An invalidation or a restart
  /// since then wins and the page is not cached. Returns whether the cache
  /// was updated.
  pub fn append_page<T>(&self, key: &K, loaded: usize, page: Vec<T>) -> Result<bool>
  where
    T: Cacheable + Identified,
  {
    // Held so an invalidation cannot land between the check and the write
    let _in_flight = self.lock_in_flight()?;

    let Some(entry) = self.fresh_entry(key)? else {
      debug!(key = %key.description(), "pages no longer fresh, page not cached");
      return Ok(false);
    };
    let mut pages: InfinitePages<T> = decode(entry.value)?;
    if pages.pages.len() != loaded {
      debug!(key = %key.description(), "pages changed, page not cached");
      return Ok(false);
    }

    pages.push(page);
    self.set_query_data(key, &pages)?;
    Ok(true)
  }

  fn fresh_entry(&self, key: &K) -> Result<Option<CachedEntry>> {
    Ok(
      self
        .storage
        .get(key)?
        .filter(|entry| entry.is_fresh(self.stale_time)),
    )
  }

  fn lock_in_flight(&self) -> Result<std::sync::MutexGuard<'_, HashMap<K, InFlight>>> {
    self
      .in_flight
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Build the shared load for a key. The load writes its own outcome to
  /// storage and unregisters itself, so it completes even if the reader
  /// that started it goes away.
  ///
  /// Unregistering and storing happen under the in-flight lock, the same
  /// lock `invalidate` takes, so an invalidation is never lost between the
  /// two. A load replaced by a newer one stores nothing.
  fn start_load<T, Fut>(&self, key: K, id: u64, call: Fut) -> SharedLoad
  where
    T: Cacheable,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    if let Err(e) = self.storage.mark_loading(&key) {
      warn!(key = %key.description(), error = %e, "failed to mark entry loading");
    }

    let storage = Arc::clone(&self.storage);
    let in_flight = Arc::clone(&self.in_flight);

    async move {
      let outcome = match call.await {
        Ok(data) => serde_json::to_value(&data)
          .map_err(|e| format!("Failed to serialize cached value: {}", e)),
        Err(e) => Err(format!("{:#}", e)),
      };

      let mut in_flight = match in_flight.lock() {
        Ok(guard) => guard,
        Err(e) => {
          warn!(key = %key.description(), error = %e, "in-flight table poisoned");
          return outcome;
        }
      };

      let invalidated = match in_flight.get(&key) {
        Some(current) if current.id == id => current.invalidated,
        _ => {
          debug!(key = %key.description(), "load superseded, result not stored");
          return outcome;
        }
      };
      in_flight.remove(&key);

      let written = match (&outcome, invalidated) {
        (Ok(value), false) => storage.store(&key, value.clone()),
        (Ok(value), true) => {
          debug!(key = %key.description(), "invalidated while loading, stored stale");
          storage.store_stale(&key, value.clone())
        }
        (Err(error), _) => {
          warn!(key = %key.description(), %error, "load failed");
          storage.record_error(&key, error)
        }
      };
      if let Err(e) = written {
        warn!(key = %key.description(), error = %e, "failed to update cache entry");
      }

      outcome
    }
    .boxed()
    .shared()
  }
}

impl<K: QueryKey> Clone for QueryCache<K> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      in_flight: Arc::clone(&self.in_flight),
      next_load_id: Arc::clone(&self.next_load_id),
      stale_time: self.stale_time,
    }
  }
}

fn decode<T: Cacheable>(value: Value) -> Result<T> {
  serde_json::from_value(value).map_err(|e| eyre!("Failed to deserialize cached value: {}", e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::{EntryState, NoopStorage};
  use crate::cache::test_keys::{Key, Tag};
  use crate::cache::CacheSource;
  use std::sync::atomic::AtomicUsize;
  use tokio::sync::oneshot;

  fn counted(counter: &Arc<AtomicUsize>, value: u32) -> impl Future<Output = Result<u32>> {
    let counter = Arc::clone(counter);
    async move {
      counter.fetch_add(1, Ordering::SeqCst);
      Ok(value)
    }
  }

  #[tokio::test]
  async fn test_second_read_is_served_from_cache() {
    let cache = QueryCache::in_memory();
    let calls = Arc::new(AtomicUsize::new(0));

    let first = cache.fetch(&Key::Item(1), || counted(&calls, 7)).await.unwrap();
    let second = cache.fetch(&Key::Item(1), || counted(&calls, 8)).await.unwrap();

    assert_eq!(first.source, CacheSource::Network);
    assert_eq!(second.source, CacheSource::Cache);
    assert_eq!(second.data, 7);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_concurrent_reads_share_one_load() {
    let cache = QueryCache::in_memory();
    let calls = Arc::new(AtomicUsize::new(0));

    let slow = |calls: Arc<AtomicUsize>| async move {
      calls.fetch_add(1, Ordering::SeqCst);
      tokio::time::sleep(std::time::Duration::from_millis(20)).await;
      Ok::<_, color_eyre::Report>(5u32)
    };

    let (a, b) = tokio::join!(
      cache.fetch(&Key::List, || slow(Arc::clone(&calls))),
      cache.fetch(&Key::List, || slow(Arc::clone(&calls))),
    );

    assert_eq!(a.unwrap().data, 5);
    assert_eq!(b.unwrap().data, 5);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  /// Start a load of `key` on a separate task. The load returns `value`
  /// once `release` fires; the returned receiver fires once it is registered.
  fn gated_load(
    cache: &QueryCache<Key>,
    key: Key,
    value: u32,
  ) -> (
    oneshot::Sender<()>,
    oneshot::Receiver<()>,
    tokio::task::JoinHandle<Result<CacheResult<u32>>>,
  ) {
    let (release, gate) = oneshot::channel::<()>();
    let (started_tx, started) = oneshot::channel::<()>();
    let cache = cache.clone();
    let handle = tokio::spawn(async move {
      cache
        .fetch(&key, move || {
          let _ = started_tx.send(());
          async move {
            let _ = gate.await;
            Ok::<_, color_eyre::Report>(value)
          }
        })
        .await
    });
    (release, started, handle)
  }

  async fn bump(cache: &QueryCache<Key>, key: Key) {
    cache
      .mutate("bump", async { Ok::<_, color_eyre::Report>(()) }, move |_| {
        vec![KeyPattern::Exact(key)]
      })
      .await
      .unwrap();
  }

  #[tokio::test]
  async fn test_invalidation_during_refetch_is_not_lost() {
    let cache = QueryCache::in_memory();
    cache.set_query_data(&Key::List, &0u32).unwrap();
    cache.invalidate(&KeyPattern::Exact(Key::List)).unwrap();

    let (release, started, handle) = gated_load(&cache, Key::List, 1);
    started.await.unwrap();
    bump(&cache, Key::List).await;
    release.send(()).unwrap();

    // The reader that started the load still gets its result
    assert_eq!(handle.await.unwrap().unwrap().data, 1);
    let entry = cache.entry(&Key::List).unwrap().unwrap();
    assert_eq!(entry.state, EntryState::Stale);

    let next = cache
      .fetch(&Key::List, || async { Ok::<_, color_eyre::Report>(2u32) })
      .await
      .unwrap();
    assert_eq!(next.source, CacheSource::Network);
    assert_eq!(next.data, 2);
  }

  #[tokio::test]
  async fn test_invalidation_during_first_load_is_not_lost() {
    let cache = QueryCache::in_memory();

    let (release, started, handle) = gated_load(&cache, Key::Item(1), 1);
    started.await.unwrap();
    bump(&cache, Key::Item(1)).await;
    release.send(()).unwrap();
    handle.await.unwrap().unwrap();

    let next = cache
      .fetch(&Key::Item(1), || async { Ok::<_, color_eyre::Report>(2u32) })
      .await
      .unwrap();
    assert_eq!(next.source, CacheSource::Network);
    assert_eq!(next.data, 2);
  }

  #[tokio::test]
  async fn test_read_after_invalidation_starts_new_load() {
    let cache = QueryCache::in_memory();

    let (release, started, handle) = gated_load(&cache, Key::List, 1);
    started.await.unwrap();
    bump(&cache, Key::List).await;

    // Does not join the load that started before the write
    let fresh = cache
      .fetch(&Key::List, || async { Ok::<_, color_eyre::Report>(2u32) })
      .await
      .unwrap();
    assert_eq!(fresh.source, CacheSource::Network);
    assert_eq!(fresh.data, 2);

    // The superseded load finishing later does not overwrite the newer value
    release.send(()).unwrap();
    assert_eq!(handle.await.unwrap().unwrap().data, 1);
    let cached = cache
      .fetch(&Key::List, || async { Ok::<_, color_eyre::Report>(3u32) })
      .await
      .unwrap();
    assert_eq!(cached.source, CacheSource::Cache);
    assert_eq!(cached.data, 2);
  }

  #[tokio::test]
  async fn test_invalidation_is_lazy() {
    let cache = QueryCache::in_memory();
    let calls = Arc::new(AtomicUsize::new(0));

    cache.fetch(&Key::Item(1), || counted(&calls, 1)).await.unwrap();
    cache.invalidate(&KeyPattern::Exact(Key::Item(1))).unwrap();

    // Nothing reloads until the key is read again
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
      cache.entry(&Key::Item(1)).unwrap().unwrap().state,
      EntryState::Stale
    );

    let reread = cache.fetch(&Key::Item(1), || counted(&calls, 2)).await.unwrap();
    assert_eq!(reread.source, CacheSource::Network);
    assert_eq!(reread.data, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_failed_refetch_keeps_previous_value() {
    let cache = QueryCache::in_memory();
    cache.set_query_data(&Key::Item(3), &"old".to_string()).unwrap();
    cache.invalidate(&KeyPattern::Tag(Tag::Item)).unwrap();

    let result = cache
      .fetch::<String, _, _>(&Key::Item(3), || async { Err(eyre!("backend down")) })
      .await;
    assert!(result.is_err());

    let entry = cache.entry(&Key::Item(3)).unwrap().unwrap();
    assert_eq!(entry.state, EntryState::Stale);
    assert!(entry.error.unwrap().contains("backend down"));
    assert_eq!(
      cache.get_query_data::<String>(&Key::Item(3)).unwrap(),
      Some("old".to_string())
    );
  }

  #[tokio::test]
  async fn test_failed_mutation_invalidates_nothing() {
    let cache = QueryCache::in_memory();
    cache.set_query_data(&Key::List, &vec![1u32]).unwrap();

    let result: Result<u32> = cache
      .mutate("add", async { Err(eyre!("rejected")) }, |_| {
        vec![KeyPattern::Exact(Key::List)]
      })
      .await;

    assert!(result.is_err());
    assert_eq!(
      cache.entry(&Key::List).unwrap().unwrap().state,
      EntryState::Fresh
    );
  }

  #[tokio::test]
  async fn test_successful_mutation_invalidates_from_result() {
    let cache = QueryCache::in_memory();
    cache.set_query_data(&Key::Item(4), &1u32).unwrap();
    cache.set_query_data(&Key::Item(5), &1u32).unwrap();

    let id = cache
      .mutate("update", async { Ok(4u32) }, |id| {
        vec![KeyPattern::Exact(Key::Item(*id))]
      })
      .await
      .unwrap();

    assert_eq!(id, 4);
    assert_eq!(
      cache.entry(&Key::Item(4)).unwrap().unwrap().state,
      EntryState::Stale
    );
    assert_eq!(
      cache.entry(&Key::Item(5)).unwrap().unwrap().state,
      EntryState::Fresh
    );
  }

  #[tokio::test]
  async fn test_noop_storage_always_loads() {
    let cache: QueryCache<Key> = QueryCache::new(NoopStorage);
    let calls = Arc::new(AtomicUsize::new(0));

    cache.fetch(&Key::List, || counted(&calls, 1)).await.unwrap();
    cache.fetch(&Key::List, || counted(&calls, 1)).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_stale_time_expires_entries() {
    let cache = QueryCache::in_memory().with_stale_time(Duration::zero());
    let calls = Arc::new(AtomicUsize::new(0));

    cache.fetch(&Key::List, || counted(&calls, 1)).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    cache.fetch(&Key::List, || counted(&calls, 1)).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }
}
