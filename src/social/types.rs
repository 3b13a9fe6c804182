use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::Identified;

/// Application user profile (a document in the users collection)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
  pub id: String,
  /// Id of the backing auth account
  pub account_id: String,
  pub name: String,
  pub username: String,
  pub email: String,
  pub image_url: Option<String>,
  pub image_id: Option<String>,
  pub bio: Option<String>,
  /// Ids of posts created by this user
  #[serde(default)]
  pub post_ids: Vec<String>,
  /// Ids of posts this user liked
  #[serde(default)]
  pub liked_post_ids: Vec<String>,
  #[serde(default)]
  pub saves: Vec<SavedRecord>,
}

/// A post in the feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
  pub id: String,
  pub creator_id: String,
  /// Display name of the creator, when the backend expands the relation
  pub creator_name: Option<String>,
  pub caption: String,
  pub image_url: Option<String>,
  pub image_id: Option<String>,
  pub location: Option<String>,
  #[serde(default)]
  pub tags: Vec<String>,
  /// Ids of users who liked the post
  #[serde(default)]
  pub likes: Vec<String>,
  pub created_at: DateTime<Utc>,
}

impl Identified for Post {
  fn cache_key(&self) -> &str {
    &self.id
  }
}

impl Identified for User {
  fn cache_key(&self) -> &str {
    &self.id
  }
}

/// A "saved post" record linking a user to a post
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedRecord {
  pub id: String,
  pub user_id: String,
  pub post_id: String,
}

/// Image attached to a new or updated post
#[derive(Debug, Clone)]
pub struct ImageUpload {
  pub file_name: String,
  pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
  pub name: String,
  pub username: String,
  pub email: String,
  pub password: String,
}

#[derive(Debug, Clone)]
pub struct Credentials {
  pub email: String,
  pub password: String,
}

/// Payload for creating a post
#[derive(Debug, Clone)]
pub struct NewPost {
  pub creator_id: String,
  pub caption: String,
  pub image: Option<ImageUpload>,
  pub location: Option<String>,
  /// Comma separated in user input, split before sending
  pub tags: Vec<String>,
}

/// Payload for updating a post. A new image replaces the current one.
#[derive(Debug, Clone)]
pub struct UpdatePost {
  pub post_id: String,
  pub caption: String,
  pub image: Option<ImageUpload>,
  pub image_id: Option<String>,
  pub image_url: Option<String>,
  pub location: Option<String>,
  pub tags: Vec<String>,
}

/// Payload for updating a user profile. A new image replaces the current one.
#[derive(Debug, Clone)]
pub struct UpdateUser {
  pub user_id: String,
  pub name: String,
  pub bio: Option<String>,
  pub image: Option<ImageUpload>,
  pub image_id: Option<String>,
  pub image_url: Option<String>,
}

/// A follow relationship: `follower_id` follows `following_id`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Follow {
  pub follower_id: String,
  pub following_id: String,
}

impl Follow {
  pub fn new(follower_id: impl Into<String>, following_id: impl Into<String>) -> Self {
    Self {
      follower_id: follower_id.into(),
      following_id: following_id.into(),
    }
  }
}

/// A stored follow record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowRecord {
  pub id: String,
  pub follower_id: String,
  pub following_id: String,
}

/// Follower and following counts of one user, plus who follows them
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FollowStats {
  pub followers_count: usize,
  pub following_count: usize,
  pub followers: Vec<FollowRecord>,
}

impl FollowStats {
  /// Whether `viewer_id` appears among the followers.
  pub fn has_follower(&self, viewer_id: &str) -> bool {
    self.followers.iter().any(|f| f.follower_id == viewer_id)
  }
}

/// An authenticated session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
  pub id: String,
  pub user_id: String,
}
