//! In-process backend.
//!
//! Keeps every collection in memory and counts calls per operation, which
//! makes it the backend of choice for tests and offline demos. A call can
//! be made to fail once with [`MemoryBackend::fail_next`].

use async_trait::async_trait;
use chrono::{Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use super::backend::Backend;
use super::types::{
  Credentials, Follow, FollowRecord, FollowStats, NewPost, NewUser, Post, SavedRecord, Session,
  UpdatePost, UpdateUser, User,
};

const DEFAULT_PAGE_SIZE: usize = 9;
const DEFAULT_RECENT_LIMIT: usize = 20;

#[derive(Default)]
struct State {
  users: Vec<User>,
  posts: Vec<Post>,
  saves: Vec<SavedRecord>,
  follows: Vec<FollowRecord>,
  /// email -> (password, account id)
  accounts: HashMap<String, (String, String)>,
  session: Option<Session>,
  calls: HashMap<&'static str, usize>,
  failures: HashSet<&'static str>,
  next_id: u64,
}

impl State {
  fn new_id(&mut self, prefix: &str) -> String {
    self.next_id += 1;
    format!("{}{}", prefix, self.next_id)
  }

  fn user_mut(&mut self, user_id: &str) -> Result<&mut User> {
    self
      .users
      .iter_mut()
      .find(|u| u.id == user_id)
      .ok_or_else(|| eyre!("User {} not found", user_id))
  }

  fn post_mut(&mut self, post_id: &str) -> Result<&mut Post> {
    self
      .posts
      .iter_mut()
      .find(|p| p.id == post_id)
      .ok_or_else(|| eyre!("Post {} not found", post_id))
  }

  /// Posts newest first.
  fn posts_by_recency(&self) -> Vec<Post> {
    let mut posts = self.posts.clone();
    posts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
    posts
  }
}

pub struct MemoryBackend {
  state: Mutex<State>,
  page_size: usize,
  recent_limit: usize,
}

impl MemoryBackend {
  pub fn new() -> Self {
    Self {
      state: Mutex::new(State::default()),
      page_size: DEFAULT_PAGE_SIZE,
      recent_limit: DEFAULT_RECENT_LIMIT,
    }
  }

  pub fn with_page_size(mut self, page_size: usize) -> Self {
    self.page_size = page_size;
    self
  }

  /// How many times an operation was called, failed calls included.
  pub fn calls(&self, operation: &str) -> usize {
    self
      .state
      .lock()
      .map(|s| s.calls.get(operation).copied().unwrap_or(0))
      .unwrap_or(0)
  }

  /// Total number of backend calls made.
  pub fn total_calls(&self) -> usize {
    self
      .state
      .lock()
      .map(|s| s.calls.values().sum())
      .unwrap_or(0)
  }

  /// Make the next call of `operation` fail.
  pub fn fail_next(&self, operation: &'static str) {
    if let Ok(mut state) = self.state.lock() {
      state.failures.insert(operation);
    }
  }

  /// Add a user directly, without an account.
  pub fn insert_user(&self, id: &str, name: &str) -> Result<User> {
    let mut state = self.lock()?;
    let user = User {
      id: id.to_string(),
      account_id: format!("acct-{}", id),
      name: name.to_string(),
      username: name.to_lowercase().replace(' ', ""),
      email: format!("{}@example.com", id),
      image_url: None,
      image_id: None,
      bio: None,
      post_ids: Vec::new(),
      liked_post_ids: Vec::new(),
      saves: Vec::new(),
    };
    state.users.push(user.clone());
    Ok(user)
  }

  /// Add `count` posts by `creator_id`, each newer than the last.
  pub fn insert_posts(&self, creator_id: &str, count: usize) -> Result<Vec<Post>> {
    let mut state = self.lock()?;
    let base = Utc::now() - Duration::hours(1);
    let mut created = Vec::with_capacity(count);
    for i in 0..count {
      let id = state.new_id("post");
      let post = Post {
        id: id.clone(),
        creator_id: creator_id.to_string(),
        creator_name: None,
        caption: format!("post {}", i),
        image_url: None,
        image_id: None,
        location: None,
        tags: Vec::new(),
        likes: Vec::new(),
        created_at: base + Duration::seconds(i as i64),
      };
      if let Ok(user) = state.user_mut(creator_id) {
        user.post_ids.push(id);
      }
      state.posts.push(post.clone());
      created.push(post);
    }
    Ok(created)
  }

  fn lock(&self) -> Result<MutexGuard<'_, State>> {
    self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Count the call, then fail it if a failure was requested.
  fn begin(&self, operation: &'static str) -> Result<MutexGuard<'_, State>> {
    let mut state = self.lock()?;
    *state.calls.entry(operation).or_insert(0) += 1;
    if state.failures.remove(operation) {
      return Err(eyre!("Backend rejected {}", operation));
    }
    Ok(state)
  }
}

impl Default for MemoryBackend {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl Backend for MemoryBackend {
  async fn create_user_account(&self, new_user: &NewUser) -> Result<User> {
    let mut state = self.begin("create_user_account")?;
    if state.accounts.contains_key(&new_user.email) {
      return Err(eyre!("Account {} already exists", new_user.email));
    }

    let account_id = state.new_id("acct");
    let user_id = state.new_id("user");
    state.accounts.insert(
      new_user.email.clone(),
      (new_user.password.clone(), account_id.clone()),
    );

    let user = User {
      id: user_id,
      account_id,
      name: new_user.name.clone(),
      username: new_user.username.clone(),
      email: new_user.email.clone(),
      image_url: None,
      image_id: None,
      bio: None,
      post_ids: Vec::new(),
      liked_post_ids: Vec::new(),
      saves: Vec::new(),
    };
    state.users.push(user.clone());
    Ok(user)
  }

  async fn sign_in(&self, credentials: &Credentials) -> Result<Session> {
    let mut state = self.begin("sign_in")?;
    let account_id = match state.accounts.get(&credentials.email) {
      Some((password, account_id)) if *password == credentials.password => account_id.clone(),
      _ => return Err(eyre!("Invalid credentials")),
    };

    let session = Session {
      id: state.new_id("session"),
      user_id: account_id,
    };
    state.session = Some(session.clone());
    Ok(session)
  }

  async fn sign_out(&self) -> Result<()> {
    let mut state = self.begin("sign_out")?;
    state.session = None;
    Ok(())
  }

  async fn get_current_user(&self) -> Result<Option<User>> {
    let state = self.begin("get_current_user")?;
    let account_id = match &state.session {
      Some(session) => &session.user_id,
      None => return Ok(None),
    };
    Ok(state.users.iter().find(|u| &u.account_id == account_id).cloned())
  }

  async fn get_users(&self, limit: Option<u32>) -> Result<Vec<User>> {
    let state = self.begin("get_users")?;
    let mut users: Vec<User> = state.users.iter().rev().cloned().collect();
    if let Some(limit) = limit {
      users.truncate(limit as usize);
    }
    Ok(users)
  }

  async fn get_user_by_id(&self, user_id: &str) -> Result<User> {
    let mut state = self.begin("get_user_by_id")?;
    state.user_mut(user_id).map(|u| u.clone())
  }

  async fn update_user(&self, update: &UpdateUser) -> Result<User> {
    let mut state = self.begin("update_user")?;
    let user = state.user_mut(&update.user_id)?;
    user.name = update.name.clone();
    user.bio = update.bio.clone();
    if update.image.is_some() || update.image_url.is_some() {
      user.image_url = update.image_url.clone();
      user.image_id = update.image_id.clone();
    }
    Ok(user.clone())
  }

  async fn create_post(&self, new_post: &NewPost) -> Result<Post> {
    let mut state = self.begin("create_post")?;
    let id = state.new_id("post");
    let image_id = new_post.image.as_ref().map(|_| format!("file-{}", id));

    let post = Post {
      id: id.clone(),
      creator_id: new_post.creator_id.clone(),
      creator_name: None,
      caption: new_post.caption.clone(),
      image_url: image_id.as_ref().map(|f| format!("memory://{}", f)),
      image_id,
      location: new_post.location.clone(),
      tags: new_post.tags.clone(),
      likes: Vec::new(),
      created_at: Utc::now(),
    };

    if let Ok(user) = state.user_mut(&new_post.creator_id) {
      user.post_ids.push(id);
    }
    state.posts.push(post.clone());
    Ok(post)
  }

  async fn get_post_by_id(&self, post_id: &str) -> Result<Post> {
    let mut state = self.begin("get_post_by_id")?;
    state.post_mut(post_id).map(|p| p.clone())
  }

  async fn update_post(&self, update: &UpdatePost) -> Result<Post> {
    let mut state = self.begin("update_post")?;
    let post = state.post_mut(&update.post_id)?;
    post.caption = update.caption.clone();
    post.location = update.location.clone();
    post.tags = update.tags.clone();
    if update.image.is_some() {
      let file_id = format!("file-{}-v2", post.id);
      post.image_url = Some(format!("memory://{}", file_id));
      post.image_id = Some(file_id);
    }
    Ok(post.clone())
  }

  async fn delete_post(&self, post_id: &str, _image_id: Option<&str>) -> Result<()> {
    let mut state = self.begin("delete_post")?;
    let before = state.posts.len();
    state.posts.retain(|p| p.id != post_id);
    if state.posts.len() == before {
      return Err(eyre!("Post {} not found", post_id));
    }
    for user in state.users.iter_mut() {
      user.post_ids.retain(|id| id != post_id);
    }
    Ok(())
  }

  async fn get_user_posts(&self, user_id: &str) -> Result<Vec<Post>> {
    let state = self.begin("get_user_posts")?;
    Ok(
      state
        .posts_by_recency()
        .into_iter()
        .filter(|p| p.creator_id == user_id)
        .collect(),
    )
  }

  async fn get_recent_posts(&self) -> Result<Vec<Post>> {
    let state = self.begin("get_recent_posts")?;
    let mut posts = state.posts_by_recency();
    posts.truncate(self.recent_limit);
    Ok(posts)
  }

  async fn get_posts_page(&self, cursor: Option<&str>) -> Result<Vec<Post>> {
    let state = self.begin("get_posts_page")?;
    let posts = state.posts_by_recency();
    let start = match cursor {
      Some(cursor) => {
        posts
          .iter()
          .position(|p| p.id == cursor)
          .ok_or_else(|| eyre!("Unknown cursor {}", cursor))?
          + 1
      }
      None => 0,
    };
    Ok(posts.into_iter().skip(start).take(self.page_size).collect())
  }

  async fn search_posts(&self, term: &str) -> Result<Vec<Post>> {
    let state = self.begin("search_posts")?;
    let needle = term.to_lowercase();
    Ok(
      state
        .posts_by_recency()
        .into_iter()
        .filter(|p| p.caption.to_lowercase().contains(&needle))
        .collect(),
    )
  }

  async fn like_post(&self, post_id: &str, likes: &[String]) -> Result<Post> {
    let mut state = self.begin("like_post")?;
    let post = state.post_mut(post_id)?;
    post.likes = likes.to_vec();
    let post = post.clone();

    for user in state.users.iter_mut() {
      let liked = likes.contains(&user.id);
      user.liked_post_ids.retain(|id| id != post_id);
      if liked {
        user.liked_post_ids.push(post_id.to_string());
      }
    }
    Ok(post)
  }

  async fn save_post(&self, user_id: &str, post_id: &str) -> Result<SavedRecord> {
    let mut state = self.begin("save_post")?;
    let record = SavedRecord {
      id: state.new_id("save"),
      user_id: user_id.to_string(),
      post_id: post_id.to_string(),
    };
    state.saves.push(record.clone());
    if let Ok(user) = state.user_mut(user_id) {
      user.saves.push(record.clone());
    }
    Ok(record)
  }

  async fn delete_saved_post(&self, saved_record_id: &str) -> Result<()> {
    let mut state = self.begin("delete_saved_post")?;
    let before = state.saves.len();
    state.saves.retain(|s| s.id != saved_record_id);
    if state.saves.len() == before {
      return Err(eyre!("Saved record {} not found", saved_record_id));
    }
    for user in state.users.iter_mut() {
      user.saves.retain(|s| s.id != saved_record_id);
    }
    Ok(())
  }

  async fn get_follow_stats(&self, user_id: &str) -> Result<FollowStats> {
    let state = self.begin("get_follow_stats")?;
    let followers: Vec<FollowRecord> = state
      .follows
      .iter()
      .filter(|f| f.following_id == user_id)
      .cloned()
      .collect();
    let following_count = state
      .follows
      .iter()
      .filter(|f| f.follower_id == user_id)
      .count();

    Ok(FollowStats {
      followers_count: followers.len(),
      following_count,
      followers,
    })
  }

  async fn follow_user(&self, follow: &Follow) -> Result<FollowRecord> {
    let mut state = self.begin("follow_user")?;
    let record = FollowRecord {
      id: state.new_id("follow"),
      follower_id: follow.follower_id.clone(),
      following_id: follow.following_id.clone(),
    };
    state.follows.push(record.clone());
    Ok(record)
  }

  async fn unfollow_user(&self, follow: &Follow) -> Result<()> {
    let mut state = self.begin("unfollow_user")?;
    state
      .follows
      .retain(|f| !(f.follower_id == follow.follower_id && f.following_id == follow.following_id));
    Ok(())
  }

  async fn is_following(&self, follower_id: &str, following_id: &str) -> Result<bool> {
    let state = self.begin("is_following")?;
    Ok(
      state
        .follows
        .iter()
        .any(|f| f.follower_id == follower_id && f.following_id == following_id),
    )
  }
}
