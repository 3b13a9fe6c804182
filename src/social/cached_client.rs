//! Cached social client: one method per data-access operation.

use color_eyre::Result;
use futures::stream::{self, Stream};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{InfinitePages, MemoryStorage, NextPage, NoopStorage, QueryCache};
use crate::config::Config;
use crate::query::{Mutation, Query};

use super::backend::Backend;
use super::invalidation::WriteOp;
use super::keys::SocialQueryKey;
use super::types::{
  Credentials, Follow, FollowRecord, FollowStats, NewPost, NewUser, Post, SavedRecord, Session,
  UpdatePost, UpdateUser, User,
};

/// Social client with transparent caching.
///
/// Reads are cached per [`SocialQueryKey`]; writes invalidate the keys
/// listed for them in [`WriteOp::invalidates`]. Reads whose discriminator
/// is empty are disabled: they return `Ok(None)` without calling the
/// backend.
pub struct SocialClient<B: Backend> {
  backend: Arc<B>,
  cache: QueryCache<SocialQueryKey>,
}

impl<B: Backend> Clone for SocialClient<B> {
  fn clone(&self) -> Self {
    Self {
      backend: Arc::clone(&self.backend),
      cache: self.cache.clone(),
    }
  }
}

/// An empty discriminator disables the query.
fn disabled(what: &str, discriminator: &str) -> bool {
  let off = discriminator.trim().is_empty();
  if off {
    debug!(query = what, "query disabled, no discriminator");
  }
  off
}

impl<B: Backend> SocialClient<B> {
  pub fn new(backend: B, cache: QueryCache<SocialQueryKey>) -> Self {
    Self {
      backend: Arc::new(backend),
      cache,
    }
  }

  /// Client with an in-memory cache and no stale time.
  pub fn with_memory_cache(backend: B) -> Self {
    Self::new(backend, QueryCache::in_memory())
  }

  /// Client with the cache configured by the `cache` section.
  pub fn from_config(backend: B, config: &Config) -> Self {
    let cache = if config.cache.enabled {
      QueryCache::new(MemoryStorage::new())
    } else {
      QueryCache::new(NoopStorage)
    };
    let cache = match config.cache.stale_time_secs {
      Some(secs) => cache.with_stale_time(chrono::Duration::seconds(secs as i64)),
      None => cache,
    };
    Self::new(backend, cache)
  }

  pub fn backend(&self) -> &B {
    &self.backend
  }

  pub fn cache(&self) -> &QueryCache<SocialQueryKey> {
    &self.cache
  }

  // ==========================================================================
  // Account mutations
  // ==========================================================================

  pub async fn create_user_account(&self, user: &NewUser) -> Result<User> {
    self
      .cache
      .mutate(
        "create_user_account",
        self.backend.create_user_account(user),
        |_| WriteOp::CreateUserAccount.invalidates(),
      )
      .await
  }

  pub async fn sign_in(&self, credentials: &Credentials) -> Result<Session> {
    self
      .cache
      .mutate("sign_in", self.backend.sign_in(credentials), |_| {
        WriteOp::SignIn.invalidates()
      })
      .await
  }

  pub async fn sign_out(&self) -> Result<()> {
    self
      .cache
      .mutate("sign_out", self.backend.sign_out(), |_| {
        WriteOp::SignOut.invalidates()
      })
      .await
  }

  // ==========================================================================
  // Post queries
  // ==========================================================================

  /// The newest posts.
  pub async fn recent_posts(&self) -> Result<Vec<Post>> {
    let result = self
      .cache
      .fetch(&SocialQueryKey::RecentPosts, || {
        let backend = Arc::clone(&self.backend);
        async move { backend.get_recent_posts().await }
      })
      .await?;

    Ok(result.data)
  }

  /// Pages of the feed loaded so far, loading the first one if needed.
  pub async fn infinite_posts(&self) -> Result<InfinitePages<Post>> {
    self
      .cache
      .fetch_pages(&SocialQueryKey::InfinitePosts, |cursor| {
        let backend = Arc::clone(&self.backend);
        async move { backend.get_posts_page(cursor.as_deref()).await }
      })
      .await
  }

  /// Load the next feed page after the last loaded post.
  ///
  /// Returns `None` once a page came back empty.
  pub async fn fetch_next_posts_page(&self) -> Result<Option<InfinitePages<Post>>> {
    self
      .cache
      .fetch_next_page(&SocialQueryKey::InfinitePosts, |cursor| {
        let backend = Arc::clone(&self.backend);
        async move { backend.get_posts_page(cursor.as_deref()).await }
      })
      .await
  }

  /// The feed as a lazily produced sequence of non-empty pages.
  ///
  /// Starts from the cached pages when they are fresh, then requests
  /// further pages only as the stream is polled. The stream keeps its own
  /// cursor, so it pages through to the end with caching disabled or
  /// expired. New pages are added to the cache when the cached feed is
  /// still the one being extended. The stream ends at the first empty page.
  pub fn post_pages(&self) -> impl Stream<Item = Result<Vec<Post>>> + '_ {
    stream::try_unfold(
      (None, 0usize),
      move |(loaded, index): (Option<InfinitePages<Post>>, usize)| async move {
        let mut pages = match loaded {
          Some(pages) => pages,
          None => self.infinite_posts().await?,
        };

        if index == pages.pages.len() {
          let cursor = match pages.next_page() {
            NextPage::Exhausted => return Ok(None),
            NextPage::Start => None,
            NextPage::After(cursor) => Some(cursor),
          };
          let page = self.backend.get_posts_page(cursor.as_deref()).await?;
          let cached = pages.pages.len();
          pages.push(page.clone());
          if let Err(e) = self
            .cache
            .append_page(&SocialQueryKey::InfinitePosts, cached, page)
          {
            warn!(error = %e, "failed to cache feed page");
          }
        }

        Ok::<_, color_eyre::Report>(match pages.pages.get(index).cloned() {
          Some(page) if !page.is_empty() => Some((page, (Some(pages), index + 1))),
          _ => None,
        })
      },
    )
  }

  pub async fn search_posts(&self, term: &str) -> Result<Option<Vec<Post>>> {
    if disabled("search_posts", term) {
      return Ok(None);
    }

    let key = SocialQueryKey::search_posts(term);
    let result = self
      .cache
      .fetch(&key, || {
        let backend = Arc::clone(&self.backend);
        let term = term.trim().to_string();
        async move { backend.search_posts(&term).await }
      })
      .await?;

    Ok(Some(result.data))
  }

  pub async fn post_by_id(&self, post_id: &str) -> Result<Option<Post>> {
    if disabled("post_by_id", post_id) {
      return Ok(None);
    }

    let result = self
      .cache
      .fetch(&SocialQueryKey::post_by_id(post_id), || {
        let backend = Arc::clone(&self.backend);
        let post_id = post_id.to_string();
        async move { backend.get_post_by_id(&post_id).await }
      })
      .await?;

    Ok(Some(result.data))
  }

  pub async fn user_posts(&self, user_id: &str) -> Result<Option<Vec<Post>>> {
    if disabled("user_posts", user_id) {
      return Ok(None);
    }

    let result = self
      .cache
      .fetch(&SocialQueryKey::user_posts(user_id), || {
        let backend = Arc::clone(&self.backend);
        let user_id = user_id.to_string();
        async move { backend.get_user_posts(&user_id).await }
      })
      .await?;

    Ok(Some(result.data))
  }

  // ==========================================================================
  // Post mutations
  // ==========================================================================

  pub async fn create_post(&self, post: &NewPost) -> Result<Post> {
    self
      .cache
      .mutate("create_post", self.backend.create_post(post), |_| {
        WriteOp::CreatePost.invalidates()
      })
      .await
  }

  pub async fn update_post(&self, post: &UpdatePost) -> Result<Post> {
    self
      .cache
      .mutate("update_post", self.backend.update_post(post), |updated| {
        WriteOp::UpdatePost {
          post_id: &updated.id,
        }
        .invalidates()
      })
      .await
  }

  pub async fn delete_post(&self, post_id: &str, image_id: Option<&str>) -> Result<()> {
    self
      .cache
      .mutate(
        "delete_post",
        self.backend.delete_post(post_id, image_id),
        |_| WriteOp::DeletePost.invalidates(),
      )
      .await
  }

  /// Replace the set of users liking a post.
  pub async fn like_post(&self, post_id: &str, likes: &[String]) -> Result<Post> {
    self
      .cache
      .mutate("like_post", self.backend.like_post(post_id, likes), |post| {
        WriteOp::LikePost { post_id: &post.id }.invalidates()
      })
      .await
  }

  pub async fn save_post(&self, user_id: &str, post_id: &str) -> Result<SavedRecord> {
    self
      .cache
      .mutate(
        "save_post",
        self.backend.save_post(user_id, post_id),
        |_| WriteOp::SavePost.invalidates(),
      )
      .await
  }

  pub async fn delete_saved_post(&self, saved_record_id: &str) -> Result<()> {
    self
      .cache
      .mutate(
        "delete_saved_post",
        self.backend.delete_saved_post(saved_record_id),
        |_| WriteOp::DeleteSavedPost.invalidates(),
      )
      .await
  }

  // ==========================================================================
  // User queries and mutations
  // ==========================================================================

  /// Profile of the signed-in account, `None` when signed out.
  pub async fn current_user(&self) -> Result<Option<User>> {
    let result = self
      .cache
      .fetch(&SocialQueryKey::CurrentUser, || {
        let backend = Arc::clone(&self.backend);
        async move { backend.get_current_user().await }
      })
      .await?;

    Ok(result.data)
  }

  pub async fn users(&self, limit: Option<u32>) -> Result<Vec<User>> {
    let result = self
      .cache
      .fetch(&SocialQueryKey::Users { limit }, || {
        let backend = Arc::clone(&self.backend);
        async move { backend.get_users(limit).await }
      })
      .await?;

    Ok(result.data)
  }

  pub async fn user_by_id(&self, user_id: &str) -> Result<Option<User>> {
    if disabled("user_by_id", user_id) {
      return Ok(None);
    }

    let result = self
      .cache
      .fetch(&SocialQueryKey::user_by_id(user_id), || {
        let backend = Arc::clone(&self.backend);
        let user_id = user_id.to_string();
        async move { backend.get_user_by_id(&user_id).await }
      })
      .await?;

    Ok(Some(result.data))
  }

  pub async fn update_user(&self, user: &UpdateUser) -> Result<User> {
    self
      .cache
      .mutate("update_user", self.backend.update_user(user), |updated| {
        WriteOp::UpdateUser {
          user_id: &updated.id,
        }
        .invalidates()
      })
      .await
  }

  // ==========================================================================
  // Follow graph
  // ==========================================================================

  pub async fn follow_stats(&self, user_id: &str) -> Result<Option<FollowStats>> {
    if disabled("follow_stats", user_id) {
      return Ok(None);
    }

    let result = self
      .cache
      .fetch(&SocialQueryKey::follow_stats(user_id), || {
        let backend = Arc::clone(&self.backend);
        let user_id = user_id.to_string();
        async move { backend.get_follow_stats(&user_id).await }
      })
      .await?;

    Ok(Some(result.data))
  }

  /// Whether `follower_id` follows `following_id`, from a dedicated lookup.
  pub async fn is_following(&self, follower_id: &str, following_id: &str) -> Result<Option<bool>> {
    if disabled("is_following", follower_id) || disabled("is_following", following_id) {
      return Ok(None);
    }

    let key = SocialQueryKey::is_following(follower_id, following_id);
    let result = self
      .cache
      .fetch(&key, || {
        let backend = Arc::clone(&self.backend);
        let follower_id = follower_id.to_string();
        let following_id = following_id.to_string();
        async move { backend.is_following(&follower_id, &following_id).await }
      })
      .await?;

    Ok(Some(result.data))
  }

  pub async fn follow_user(&self, follow: &Follow) -> Result<FollowRecord> {
    self
      .cache
      .mutate("follow_user", self.backend.follow_user(follow), |_| {
        WriteOp::FollowUser { follow }.invalidates()
      })
      .await
  }

  pub async fn unfollow_user(&self, follow: &Follow) -> Result<()> {
    self
      .cache
      .mutate("unfollow_user", self.backend.unfollow_user(follow), |_| {
        WriteOp::UnfollowUser.invalidates()
      })
      .await
  }

  // ==========================================================================
  // Pollable handles
  // ==========================================================================

  /// Follow counts of `user_id` as a handle for a polling loop. Disabled
  /// when the id is empty.
  pub fn follow_stats_query(&self, user_id: &str) -> Query<SocialQueryKey, FollowStats> {
    let user_id = user_id.trim().to_string();
    let key = (!user_id.is_empty()).then(|| SocialQueryKey::follow_stats(&user_id));
    let client = self.clone();

    Query::new(self.cache.clone(), key, move || {
      let client = client.clone();
      let user_id = user_id.clone();
      async move {
        client
          .follow_stats(&user_id)
          .await
          .map_err(|e| format!("{:#}", e))?
          .ok_or_else(|| "No user id given".to_string())
      }
    })
  }

  pub fn follow_mutation(&self) -> Mutation<Follow, FollowRecord> {
    let client = self.clone();
    Mutation::new(move |follow: Follow| {
      let client = client.clone();
      async move { client.follow_user(&follow).await.map_err(|e| format!("{:#}", e)) }
    })
  }

  pub fn unfollow_mutation(&self) -> Mutation<Follow, ()> {
    let client = self.clone();
    Mutation::new(move |follow: Follow| {
      let client = client.clone();
      async move { client.unfollow_user(&follow).await.map_err(|e| format!("{:#}", e)) }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::EntryState;
  use crate::social::memory::MemoryBackend;
  use futures::TryStreamExt;

  fn client() -> SocialClient<MemoryBackend> {
    SocialClient::with_memory_cache(MemoryBackend::new())
  }

  fn state(client: &SocialClient<MemoryBackend>, key: &SocialQueryKey) -> Option<EntryState> {
    client.cache().entry(key).unwrap().map(|e| e.state)
  }

  #[tokio::test]
  async fn test_empty_discriminator_disables_query() {
    let client = client();

    assert_eq!(client.user_by_id("").await.unwrap(), None);
    assert_eq!(client.post_by_id("").await.unwrap(), None);
    assert_eq!(client.user_posts("  ").await.unwrap(), None);
    assert_eq!(client.search_posts("").await.unwrap(), None);
    assert_eq!(client.follow_stats("").await.unwrap(), None);
    assert_eq!(client.is_following("a", "").await.unwrap(), None);
    assert_eq!(client.is_following("", "b").await.unwrap(), None);

    assert_eq!(client.backend().total_calls(), 0);
  }

  #[tokio::test]
  async fn test_follow_marks_only_target_stats_stale() {
    let client = client();
    client.follow_stats("T").await.unwrap();
    client.follow_stats("other").await.unwrap();

    client.follow_user(&Follow::new("F", "T")).await.unwrap();

    assert_eq!(
      state(&client, &SocialQueryKey::follow_stats("T")),
      Some(EntryState::Stale)
    );
    assert_eq!(
      state(&client, &SocialQueryKey::follow_stats("other")),
      Some(EntryState::Fresh)
    );

    // The next read goes back to the backend and sees the new follower
    let stats = client.follow_stats("T").await.unwrap().unwrap();
    assert_eq!(stats.followers_count, 1);
    assert_eq!(client.backend().calls("get_follow_stats"), 3);
  }

  #[tokio::test]
  async fn test_unfollow_marks_every_follow_key_stale() {
    let client = client();
    client.follow_user(&Follow::new("A", "B")).await.unwrap();

    client.follow_stats("B").await.unwrap();
    client.follow_stats("Z").await.unwrap();
    client.is_following("A", "B").await.unwrap();
    client.is_following("Y", "Z").await.unwrap();
    client.recent_posts().await.unwrap();

    client.unfollow_user(&Follow::new("A", "B")).await.unwrap();

    for key in [
      SocialQueryKey::follow_stats("B"),
      SocialQueryKey::follow_stats("Z"),
      SocialQueryKey::is_following("A", "B"),
      SocialQueryKey::is_following("Y", "Z"),
    ] {
      assert_eq!(state(&client, &key), Some(EntryState::Stale), "{:?}", key);
    }
    assert_eq!(
      state(&client, &SocialQueryKey::RecentPosts),
      Some(EntryState::Fresh)
    );
  }

  #[tokio::test]
  async fn test_pagination_stops_at_empty_page() {
    let backend = MemoryBackend::new().with_page_size(5);
    backend.insert_user("u1", "Ann").unwrap();
    backend.insert_posts("u1", 10).unwrap();
    let client = SocialClient::with_memory_cache(backend);

    let pages = client.infinite_posts().await.unwrap();
    assert_eq!(pages.item_count(), 5);

    let pages = client.fetch_next_posts_page().await.unwrap().unwrap();
    assert_eq!(pages.item_count(), 10);

    let pages = client.fetch_next_posts_page().await.unwrap().unwrap();
    assert!(!pages.has_next_page());
    assert_eq!(pages.pages.len(), 3);
    assert_eq!(pages.item_count(), 10);

    assert!(client.fetch_next_posts_page().await.unwrap().is_none());
    assert_eq!(client.backend().calls("get_posts_page"), 3);

    // Items are distinct and ordered across pages
    let ids: Vec<&str> = pages.items().map(|p| p.id.as_str()).collect();
    let mut unique = ids.clone();
    unique.dedup();
    assert_eq!(unique.len(), 10);
  }

  #[tokio::test]
  async fn test_post_pages_stream() {
    let backend = MemoryBackend::new().with_page_size(5);
    backend.insert_user("u1", "Ann").unwrap();
    backend.insert_posts("u1", 10).unwrap();
    let client = SocialClient::with_memory_cache(backend);

    let pages: Vec<Vec<Post>> = client.post_pages().try_collect().await.unwrap();

    assert_eq!(pages.len(), 2);
    assert_eq!(pages.iter().map(Vec::len).sum::<usize>(), 10);
    assert_eq!(client.backend().calls("get_posts_page"), 3);
  }

  async fn collect_feed(client: &SocialClient<MemoryBackend>) -> Vec<Vec<Post>> {
    client.post_pages().try_collect().await.unwrap()
  }

  fn ten_posts(page_size: usize) -> MemoryBackend {
    let backend = MemoryBackend::new().with_page_size(page_size);
    backend.insert_user("u1", "Ann").unwrap();
    backend.insert_posts("u1", 10).unwrap();
    backend
  }

  #[tokio::test]
  async fn test_post_pages_with_caching_disabled() {
    let client = SocialClient::new(ten_posts(4), QueryCache::new(NoopStorage));

    let pages = collect_feed(&client).await;

    assert_eq!(pages.iter().map(Vec::len).collect::<Vec<_>>(), vec![4, 4, 2]);
    assert_eq!(client.backend().calls("get_posts_page"), 4);
  }

  #[tokio::test]
  async fn test_post_pages_with_zero_stale_time() {
    let cache = QueryCache::in_memory().with_stale_time(chrono::Duration::zero());
    let client = SocialClient::new(ten_posts(4), cache);

    let pages = collect_feed(&client).await;

    assert_eq!(pages.len(), 3);
    assert_eq!(pages.iter().map(Vec::len).sum::<usize>(), 10);
  }

  #[tokio::test]
  async fn test_post_pages_resumes_from_cached_pages() {
    let client = SocialClient::with_memory_cache(ten_posts(5));
    client.infinite_posts().await.unwrap();
    client.fetch_next_posts_page().await.unwrap();

    let pages = collect_feed(&client).await;

    assert_eq!(pages.len(), 2);
    // Two cached pages, then the empty page that ends the feed
    assert_eq!(client.backend().calls("get_posts_page"), 3);
  }

  #[tokio::test]
  async fn test_feed_invalidated_mid_stream() {
    let backend = MemoryBackend::new().with_page_size(2);
    backend.insert_user("u1", "Ann").unwrap();
    let posts = backend.insert_posts("u1", 4).unwrap();
    let client = SocialClient::with_memory_cache(backend);

    let mut feed = Box::pin(client.post_pages());
    let first = feed.try_next().await.unwrap().unwrap();
    client
      .like_post(&posts[0].id, &["u1".to_string()])
      .await
      .unwrap();
    let rest: Vec<Vec<Post>> = feed.try_collect().await.unwrap();

    // The stream carries on from its own cursor without repeating posts
    let ids: std::collections::HashSet<_> = std::iter::once(&first)
      .chain(rest.iter())
      .flatten()
      .map(|p| p.id.clone())
      .collect();
    assert_eq!(ids.len(), 4);

    // Pages loaded after the like did not make the stale feed fresh again
    assert_eq!(
      state(&client, &SocialQueryKey::InfinitePosts),
      Some(EntryState::Stale)
    );
    let reloaded = client.infinite_posts().await.unwrap();
    assert_eq!(reloaded.pages.len(), 1);
  }

  #[tokio::test]
  async fn test_invalidated_feed_restarts_from_first_page() {
    let backend = MemoryBackend::new().with_page_size(2);
    backend.insert_user("u1", "Ann").unwrap();
    let posts = backend.insert_posts("u1", 4).unwrap();
    let client = SocialClient::with_memory_cache(backend);

    client.infinite_posts().await.unwrap();
    client.fetch_next_posts_page().await.unwrap();
    client
      .like_post(&posts[0].id, &["u1".to_string()])
      .await
      .unwrap();

    let pages = client.infinite_posts().await.unwrap();
    assert_eq!(pages.pages.len(), 1);
    assert_eq!(client.backend().calls("get_posts_page"), 3);
  }

  #[tokio::test]
  async fn test_failed_mutation_leaves_cache_untouched() {
    let client = client();
    client.backend().insert_user("u1", "Ann").unwrap();
    let post = client.backend().insert_posts("u1", 1).unwrap().remove(0);

    let cached = client.post_by_id(&post.id).await.unwrap().unwrap();
    client.recent_posts().await.unwrap();

    client.backend().fail_next("like_post");
    let result = client.like_post(&post.id, &["u1".to_string()]).await;
    assert!(result.is_err());

    assert_eq!(
      state(&client, &SocialQueryKey::post_by_id(&post.id)),
      Some(EntryState::Fresh)
    );
    assert_eq!(
      state(&client, &SocialQueryKey::RecentPosts),
      Some(EntryState::Fresh)
    );
    assert_eq!(client.post_by_id(&post.id).await.unwrap(), Some(cached));
    assert_eq!(client.backend().calls("get_post_by_id"), 1);
  }

  #[tokio::test]
  async fn test_like_invalidates_declared_keys() {
    let client = client();
    client.backend().insert_user("u1", "Ann").unwrap();
    let posts = client.backend().insert_posts("u1", 2).unwrap();

    client.post_by_id(&posts[0].id).await.unwrap();
    client.post_by_id(&posts[1].id).await.unwrap();
    client.recent_posts().await.unwrap();
    client.user_posts("u1").await.unwrap();

    let liked = client
      .like_post(&posts[0].id, &["u1".to_string()])
      .await
      .unwrap();
    assert_eq!(liked.likes, vec!["u1".to_string()]);

    assert_eq!(
      state(&client, &SocialQueryKey::post_by_id(&posts[0].id)),
      Some(EntryState::Stale)
    );
    assert_eq!(
      state(&client, &SocialQueryKey::post_by_id(&posts[1].id)),
      Some(EntryState::Fresh)
    );
    assert_eq!(
      state(&client, &SocialQueryKey::RecentPosts),
      Some(EntryState::Stale)
    );
    assert_eq!(
      state(&client, &SocialQueryKey::user_posts("u1")),
      Some(EntryState::Fresh)
    );
  }

  #[tokio::test]
  async fn test_failed_refetch_keeps_last_known_value() {
    let client = client();
    client.backend().insert_user("u1", "Ann").unwrap();
    client.backend().insert_posts("u1", 2).unwrap();

    let before = client.recent_posts().await.unwrap();
    client
      .create_post(&NewPost {
        creator_id: "u1".to_string(),
        caption: "new".to_string(),
        image: None,
        location: None,
        tags: vec![],
      })
      .await
      .unwrap();

    client.backend().fail_next("get_recent_posts");
    assert!(client.recent_posts().await.is_err());

    let entry = client
      .cache()
      .entry(&SocialQueryKey::RecentPosts)
      .unwrap()
      .unwrap();
    assert!(entry.error.is_some());
    let kept: Vec<Post> = client
      .cache()
      .get_query_data(&SocialQueryKey::RecentPosts)
      .unwrap()
      .unwrap();
    assert_eq!(kept, before);

    // Recovered backend: the stale entry is reloaded
    assert_eq!(client.recent_posts().await.unwrap().len(), 3);
  }

  #[tokio::test]
  async fn test_invalidating_uncached_key_is_noop() {
    let client = client();
    client.follow_user(&Follow::new("F", "T")).await.unwrap();

    assert_eq!(client.cache().entry(&SocialQueryKey::follow_stats("T")).unwrap().is_none(), true);
    assert_eq!(client.backend().calls("get_follow_stats"), 0);
  }

  #[tokio::test]
  async fn test_concurrent_reads_hit_backend_once() {
    let client = client();
    client.backend().insert_user("u1", "Ann").unwrap();

    let (a, b) = tokio::join!(client.user_by_id("u1"), client.user_by_id("u1"));
    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(client.backend().calls("get_user_by_id"), 1);
  }

  #[tokio::test]
  async fn test_mutations_are_not_deduplicated() {
    let client = client();
    let follow = Follow::new("F", "T");

    let (a, b) = tokio::join!(client.follow_user(&follow), client.follow_user(&follow));
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(client.backend().calls("follow_user"), 2);
  }

  #[tokio::test]
  async fn test_sign_in_and_out_refresh_current_user() {
    let client = client();
    assert_eq!(client.current_user().await.unwrap(), None);

    let user = client
      .create_user_account(&NewUser {
        name: "Ann".to_string(),
        username: "ann".to_string(),
        email: "ann@example.com".to_string(),
        password: "secret123".to_string(),
      })
      .await
      .unwrap();
    client
      .sign_in(&Credentials {
        email: "ann@example.com".to_string(),
        password: "secret123".to_string(),
      })
      .await
      .unwrap();
    assert_eq!(client.current_user().await.unwrap(), Some(user));

    client.sign_out().await.unwrap();
    assert_eq!(client.current_user().await.unwrap(), None);
    assert_eq!(client.backend().calls("get_current_user"), 3);
  }

  #[tokio::test]
  async fn test_update_user_targets_updated_profile() {
    let client = client();
    client.backend().insert_user("u1", "Ann").unwrap();
    client.backend().insert_user("u2", "Bob").unwrap();
    client.user_by_id("u1").await.unwrap();
    client.user_by_id("u2").await.unwrap();

    let updated = client
      .update_user(&UpdateUser {
        user_id: "u1".to_string(),
        name: "Annie".to_string(),
        bio: Some("hello".to_string()),
        image: None,
        image_id: None,
        image_url: None,
      })
      .await
      .unwrap();
    assert_eq!(updated.name, "Annie");

    assert_eq!(
      state(&client, &SocialQueryKey::user_by_id("u1")),
      Some(EntryState::Stale)
    );
    assert_eq!(
      state(&client, &SocialQueryKey::user_by_id("u2")),
      Some(EntryState::Fresh)
    );
    assert_eq!(
      client.user_by_id("u1").await.unwrap().unwrap().name,
      "Annie"
    );
  }

  #[tokio::test]
  async fn test_save_and_unsave_refresh_current_user() {
    let client = client();
    client
      .create_user_account(&NewUser {
        name: "Ann".to_string(),
        username: "ann".to_string(),
        email: "ann@example.com".to_string(),
        password: "pw".to_string(),
      })
      .await
      .unwrap();
    client
      .sign_in(&Credentials {
        email: "ann@example.com".to_string(),
        password: "pw".to_string(),
      })
      .await
      .unwrap();
    let me = client.current_user().await.unwrap().unwrap();
    let post = client.backend().insert_posts(&me.id, 1).unwrap().remove(0);

    let record = client.save_post(&me.id, &post.id).await.unwrap();
    let me = client.current_user().await.unwrap().unwrap();
    assert_eq!(me.saves, vec![record.clone()]);

    client.delete_saved_post(&record.id).await.unwrap();
    let me = client.current_user().await.unwrap().unwrap();
    assert!(me.saves.is_empty());
  }
}
