//! The hosted backend as seen by the data-access layer.

use async_trait::async_trait;
use color_eyre::Result;

use super::types::{
  Credentials, Follow, FollowRecord, FollowStats, NewPost, NewUser, Post, SavedRecord, Session,
  UpdatePost, UpdateUser, User,
};

/// Account, document and file operations offered by the backend service.
///
/// Every method is one logical backend call. Implementations do not cache
/// and do not retry; both are the caller's concern.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
  // Accounts

  /// Create an auth account and its user profile document.
  async fn create_user_account(&self, user: &NewUser) -> Result<User>;

  async fn sign_in(&self, credentials: &Credentials) -> Result<Session>;

  async fn sign_out(&self) -> Result<()>;

  /// Profile of the signed-in account, `None` without a session.
  async fn get_current_user(&self) -> Result<Option<User>>;

  // Users

  /// Newest users first.
  async fn get_users(&self, limit: Option<u32>) -> Result<Vec<User>>;

  async fn get_user_by_id(&self, user_id: &str) -> Result<User>;

  async fn update_user(&self, user: &UpdateUser) -> Result<User>;

  // Posts

  async fn create_post(&self, post: &NewPost) -> Result<Post>;

  async fn get_post_by_id(&self, post_id: &str) -> Result<Post>;

  async fn update_post(&self, post: &UpdatePost) -> Result<Post>;

  /// Delete a post and its stored image.
  async fn delete_post(&self, post_id: &str, image_id: Option<&str>) -> Result<()>;

  async fn get_user_posts(&self, user_id: &str) -> Result<Vec<Post>>;

  /// The newest posts, for the home list.
  async fn get_recent_posts(&self) -> Result<Vec<Post>>;

  /// One page of the feed, newest first, starting after `cursor`.
  async fn get_posts_page(&self, cursor: Option<&str>) -> Result<Vec<Post>>;

  async fn search_posts(&self, term: &str) -> Result<Vec<Post>>;

  /// Replace the list of users who like a post.
  async fn like_post(&self, post_id: &str, likes: &[String]) -> Result<Post>;

  async fn save_post(&self, user_id: &str, post_id: &str) -> Result<SavedRecord>;

  async fn delete_saved_post(&self, saved_record_id: &str) -> Result<()>;

  // Follow graph

  async fn get_follow_stats(&self, user_id: &str) -> Result<FollowStats>;

  async fn follow_user(&self, follow: &Follow) -> Result<FollowRecord>;

  async fn unfollow_user(&self, follow: &Follow) -> Result<()>;

  async fn is_following(&self, follower_id: &str, following_id: &str) -> Result<bool>;
}
