//! Render-facing handles over the query cache.
//!
//! A `Query<K, T>` watches one cache key and a `Mutation<I, T>` wraps one
//! write. Both run their future on the tokio runtime and hand the result
//! back through a channel, so a polling event loop never blocks on the
//! backend. A query whose cache entry was invalidated by a write loads
//! again on the next `poll`.
//!
//! # Example
//!
//! ```ignore
//! let mut stats = client.follow_stats_query(&profile_id);
//! let mut follow = client.follow_mutation();
//!
//! stats.fetch();
//! follow.mutate(Follow::new(&viewer_id, &profile_id));
//!
//! // In event loop tick
//! if stats.poll() | follow.poll() {
//!     // State changed, trigger re-render
//! }
//!
//! // In render
//! match stats.state() {
//!     QueryState::Loading => render_spinner(),
//!     QueryState::Error(e) => render_error(e, stats.data()),
//!     _ => render(stats.data()),
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::cache::{EntryState, QueryCache, QueryKey};

/// The state of a query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryState {
  /// Query has not been started
  Idle,
  /// Required input is missing; the query never fetches
  Disabled,
  /// Query is currently fetching data
  Loading,
  /// Last fetch completed successfully
  Success,
  /// Last fetch failed. Data from an earlier success is kept.
  Error(String),
}

impl QueryState {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  pub fn is_success(&self) -> bool {
    matches!(self, QueryState::Success)
  }

  pub fn is_error(&self) -> bool {
    matches!(self, QueryState::Error(_))
  }

  pub fn is_disabled(&self) -> bool {
    matches!(self, QueryState::Disabled)
  }

  pub fn error(&self) -> Option<&str> {
    match self {
      QueryState::Error(e) => Some(e),
      _ => None,
    }
  }
}

/// A boxed future that returns a Result<T, String>
type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T, String>> + Send>>;

/// A factory function that creates futures for fetching data
type FetcherFn<T> = Box<dyn Fn() -> BoxFuture<T> + Send + Sync>;

/// Handle on one cached read.
///
/// The fetcher is expected to read through `cache` under `key`, so
/// several handles on one key share the cached value and its in-flight
/// load. Without a key the query is disabled and never fetches.
pub struct Query<K: QueryKey, T> {
  cache: QueryCache<K>,
  key: Option<K>,
  state: QueryState,
  data: Option<T>,
  fetcher: FetcherFn<T>,
  receiver: Option<mpsc::UnboundedReceiver<Result<T, String>>>,
}

impl<K: QueryKey, T: Send + 'static> Query<K, T> {
  pub fn new<F, Fut>(cache: QueryCache<K>, key: Option<K>, fetcher: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, String>> + Send + 'static,
  {
    let state = if key.is_some() {
      QueryState::Idle
    } else {
      QueryState::Disabled
    };
    Self {
      cache,
      key,
      state,
      data: None,
      fetcher: Box::new(move || Box::pin(fetcher())),
      receiver: None,
    }
  }

  pub fn key(&self) -> Option<&K> {
    self.key.as_ref()
  }

  /// Get the current state of the query.
  pub fn state(&self) -> &QueryState {
    &self.state
  }

  /// Data from the last successful fetch, kept through later failures.
  pub fn data(&self) -> Option<&T> {
    self.data.as_ref()
  }

  /// Whether a fetch is in flight.
  pub fn is_pending(&self) -> bool {
    self.state.is_loading()
  }

  pub fn is_success(&self) -> bool {
    self.state.is_success()
  }

  pub fn is_error(&self) -> bool {
    self.state.is_error()
  }

  pub fn is_disabled(&self) -> bool {
    self.state.is_disabled()
  }

  pub fn error(&self) -> Option<&str> {
    self.state.error()
  }

  /// Whether a write invalidated the cache entry this query reads.
  pub fn is_stale(&self) -> bool {
    let Some(key) = &self.key else {
      return false;
    };
    match self.cache.entry(key) {
      Ok(entry) => entry.is_some_and(|e| e.state == EntryState::Stale),
      Err(e) => {
        warn!(key = %key.description(), error = %e, "failed to read cache entry");
        false
      }
    }
  }

  /// Start fetching data if not already loading.
  ///
  /// This is a no-op if the query is loading or disabled.
  pub fn fetch(&mut self) {
    if self.state.is_loading() || self.key.is_none() {
      return;
    }
    self.start_fetch();
  }

  /// Force a refetch, even if already loading or data exists.
  pub fn refetch(&mut self) {
    if self.key.is_none() {
      return;
    }
    // Cancel any pending fetch by dropping the receiver
    self.receiver = None;
    self.start_fetch();
  }

  /// Poll for results from a pending fetch.
  ///
  /// Returns `true` if the state changed. After a success, an entry
  /// invalidated since then starts a new fetch. A failed fetch is not
  /// retried until `fetch` or `refetch` is called.
  pub fn poll(&mut self) -> bool {
    let receiver = match &mut self.receiver {
      Some(rx) => rx,
      None => {
        if self.state.is_success() && self.is_stale() {
          if let Some(key) = &self.key {
            debug!(key = %key.description(), "entry invalidated, refetching");
          }
          self.start_fetch();
          return true;
        }
        return false;
      }
    };

    // Try to receive without blocking
    match receiver.try_recv() {
      Ok(Ok(data)) => {
        self.data = Some(data);
        self.state = QueryState::Success;
        self.receiver = None;
        true
      }
      Ok(Err(error)) => {
        self.state = QueryState::Error(error);
        self.receiver = None;
        true
      }
      Err(mpsc::error::TryRecvError::Empty) => false,
      Err(mpsc::error::TryRecvError::Disconnected) => {
        // Sender dropped without sending - treat as error
        self.state = QueryState::Error("Query was cancelled".to_string());
        self.receiver = None;
        true
      }
    }
  }

  /// Internal: start the fetch operation
  fn start_fetch(&mut self) {
    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);
    self.state = QueryState::Loading;

    let future = (self.fetcher)();
    tokio::spawn(async move {
      let result = future.await;
      // Ignore send errors - receiver may have been dropped
      let _ = tx.send(result);
    });
  }
}

impl<K: QueryKey, T: std::fmt::Debug> std::fmt::Debug for Query<K, T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("key", &self.key)
      .field("state", &self.state)
      .field("data", &self.data)
      .finish_non_exhaustive()
  }
}

/// The state of a mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationState {
  /// Never triggered, or reset
  Idle,
  /// At least one call is in flight
  Pending,
  /// The most recently finished call succeeded
  Success,
  /// The most recently finished call failed
  Error(String),
}

type MutatorFn<I, T> = Box<dyn Fn(I) -> BoxFuture<T> + Send + Sync>;

/// Trigger handle for a write.
///
/// Every `mutate` call runs; nothing is deduplicated. Cache invalidation is
/// the mutator's business (the social client does it on success).
pub struct Mutation<I, T> {
  state: MutationState,
  data: Option<T>,
  mutator: MutatorFn<I, T>,
  sender: mpsc::UnboundedSender<Result<T, String>>,
  receiver: mpsc::UnboundedReceiver<Result<T, String>>,
  in_flight: usize,
}

impl<I: Send + 'static, T: Send + 'static> Mutation<I, T> {
  pub fn new<F, Fut>(mutator: F) -> Self
  where
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, String>> + Send + 'static,
  {
    let (sender, receiver) = mpsc::unbounded_channel();
    Self {
      state: MutationState::Idle,
      data: None,
      mutator: Box::new(move |input| Box::pin(mutator(input))),
      sender,
      receiver,
      in_flight: 0,
    }
  }

  /// Start the write with `input`.
  pub fn mutate(&mut self, input: I) {
    self.in_flight += 1;
    self.state = MutationState::Pending;

    let future = (self.mutator)(input);
    let tx = self.sender.clone();
    tokio::spawn(async move {
      let _ = tx.send(future.await);
    });
  }

  /// Collect finished calls. Returns `true` if any finished.
  pub fn poll(&mut self) -> bool {
    let mut changed = false;
    while let Ok(result) = self.receiver.try_recv() {
      self.in_flight = self.in_flight.saturating_sub(1);
      match result {
        Ok(data) => {
          self.data = Some(data);
          self.state = MutationState::Success;
        }
        Err(error) => self.state = MutationState::Error(error),
      }
      changed = true;
    }
    if changed && self.in_flight > 0 {
      self.state = MutationState::Pending;
    }
    changed
  }

  pub fn state(&self) -> &MutationState {
    &self.state
  }

  /// Result of the last successful call.
  pub fn data(&self) -> Option<&T> {
    self.data.as_ref()
  }

  pub fn is_pending(&self) -> bool {
    self.in_flight > 0
  }

  pub fn is_error(&self) -> bool {
    matches!(self.state, MutationState::Error(_))
  }

  pub fn error(&self) -> Option<&str> {
    match &self.state {
      MutationState::Error(e) => Some(e),
      _ => None,
    }
  }

  /// Forget the last result. Calls still in flight are reported when they finish.
  pub fn reset(&mut self) {
    self.data = None;
    self.state = if self.in_flight > 0 {
      MutationState::Pending
    } else {
      MutationState::Idle
    };
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::social::memory::MemoryBackend;
  use crate::social::types::Follow;
  use crate::social::SocialClient;
  use std::time::Duration;

  fn client() -> SocialClient<MemoryBackend> {
    let client = SocialClient::with_memory_cache(MemoryBackend::new());
    client.backend().insert_user("P", "Pat").unwrap();
    client
  }

  /// Let spawned fetches finish, then poll once.
  async fn settle<K: QueryKey, T: Send + 'static>(query: &mut Query<K, T>) -> bool {
    tokio::time::sleep(Duration::from_millis(20)).await;
    query.poll()
  }

  async fn settle_mutation<I: Send + 'static, T: Send + 'static>(
    mutation: &mut Mutation<I, T>,
  ) -> bool {
    tokio::time::sleep(Duration::from_millis(20)).await;
    mutation.poll()
  }

  #[tokio::test]
  async fn test_queries_on_one_key_share_the_cache() {
    let client = client();
    let mut first = client.follow_stats_query("P");
    let mut second = client.follow_stats_query("P");
    assert_eq!(first.state(), &QueryState::Idle);

    first.fetch();
    assert!(first.is_pending());
    assert!(settle(&mut first).await);
    second.fetch();
    assert!(settle(&mut second).await);

    assert!(first.is_success());
    assert_eq!(second.data().map(|s| s.followers_count), Some(0));
    assert_eq!(client.backend().calls("get_follow_stats"), 1);
  }

  #[tokio::test]
  async fn test_query_without_id_is_disabled() {
    let client = client();
    let mut stats = client.follow_stats_query("  ");

    stats.fetch();
    stats.refetch();

    assert!(stats.is_disabled());
    assert!(stats.key().is_none());
    assert!(!settle(&mut stats).await);
    assert!(!stats.is_pending());
    assert_eq!(stats.data(), None);
    assert_eq!(client.backend().total_calls(), 0);
  }

  #[tokio::test]
  async fn test_follow_refreshes_target_stats_on_poll() {
    let client = client();
    let mut stats = client.follow_stats_query("P");
    let mut follow = client.follow_mutation();
    stats.fetch();
    settle(&mut stats).await;
    assert!(!stats.is_stale());

    follow.mutate(Follow::new("A", "P"));
    assert!(settle_mutation(&mut follow).await);
    assert!(stats.is_stale());

    // The invalidated entry starts a new load, old data stays visible
    assert!(stats.poll());
    assert!(stats.is_pending());
    assert_eq!(stats.data().map(|s| s.followers_count), Some(0));

    assert!(settle(&mut stats).await);
    assert_eq!(stats.data().map(|s| s.followers_count), Some(1));
    assert!(stats.data().is_some_and(|s| s.has_follower("A")));
    assert_eq!(client.backend().calls("get_follow_stats"), 2);
  }

  #[tokio::test]
  async fn test_follow_of_someone_else_leaves_stats_alone() {
    let client = client();
    let mut stats = client.follow_stats_query("P");
    stats.fetch();
    settle(&mut stats).await;

    client.follow_user(&Follow::new("A", "Q")).await.unwrap();

    assert!(!stats.is_stale());
    assert!(!stats.poll());
    assert_eq!(client.backend().calls("get_follow_stats"), 1);
  }

  #[tokio::test]
  async fn test_failed_refetch_keeps_data_and_waits() {
    let client = client();
    let mut stats = client.follow_stats_query("P");
    stats.fetch();
    settle(&mut stats).await;

    client.follow_user(&Follow::new("A", "P")).await.unwrap();
    client.backend().fail_next("get_follow_stats");
    assert!(stats.poll());
    assert!(settle(&mut stats).await);

    assert!(stats.is_error());
    assert_eq!(stats.data().map(|s| s.followers_count), Some(0));

    // Still stale, but an error is not retried on its own
    assert!(stats.is_stale());
    assert!(!settle(&mut stats).await);
    assert_eq!(client.backend().calls("get_follow_stats"), 2);

    stats.refetch();
    assert!(settle(&mut stats).await);
    assert_eq!(stats.data().map(|s| s.followers_count), Some(1));
  }

  #[tokio::test]
  async fn test_refetch_drops_pending_result() {
    let client = client();
    let mut stats = client.follow_stats_query("P");

    stats.fetch();
    client.follow_user(&Follow::new("A", "P")).await.unwrap();
    stats.refetch();
    assert!(settle(&mut stats).await);

    // Only the second fetch is reported
    assert!(!stats.poll());
    assert!(stats.is_success());
    assert_eq!(stats.data().map(|s| s.followers_count), Some(1));
  }

  #[tokio::test]
  async fn test_mutation_runs_every_call() {
    let client = client();
    let mut follow = client.follow_mutation();

    follow.mutate(Follow::new("A", "B"));
    follow.mutate(Follow::new("A", "B"));
    assert!(follow.is_pending());

    assert!(settle_mutation(&mut follow).await);

    assert!(!follow.is_pending());
    assert_eq!(follow.state(), &MutationState::Success);
    assert_eq!(follow.data().map(|r| r.following_id.as_str()), Some("B"));
    assert_eq!(client.backend().calls("follow_user"), 2);
  }

  #[tokio::test]
  async fn test_mutation_error_and_reset() {
    let client = client();
    client.backend().fail_next("unfollow_user");
    let mut unfollow = client.unfollow_mutation();

    unfollow.mutate(Follow::new("A", "B"));
    settle_mutation(&mut unfollow).await;

    assert!(unfollow.is_error());
    assert!(unfollow.error().is_some());

    unfollow.reset();
    assert_eq!(unfollow.state(), &MutationState::Idle);
  }
}
