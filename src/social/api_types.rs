//! Serde types matching the document backend's REST responses.
//!
//! These types are separate from domain types to allow clean deserialization
//! while keeping domain types focused on application needs.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use super::types::{FollowRecord, Post, SavedRecord, Session, User};

// ============================================================================
// List filters
// ============================================================================

/// Builders for the JSON-encoded query strings passed as `queries[]`.
pub struct ApiQuery;

impl ApiQuery {
  pub fn equal(attribute: &str, value: &str) -> String {
    json!({ "method": "equal", "attribute": attribute, "values": [value] }).to_string()
  }

  pub fn search(attribute: &str, term: &str) -> String {
    json!({ "method": "search", "attribute": attribute, "values": [term] }).to_string()
  }

  pub fn order_desc(attribute: &str) -> String {
    json!({ "method": "orderDesc", "attribute": attribute }).to_string()
  }

  pub fn limit(limit: u32) -> String {
    json!({ "method": "limit", "values": [limit] }).to_string()
  }

  pub fn cursor_after(document_id: &str) -> String {
    json!({ "method": "cursorAfter", "values": [document_id] }).to_string()
  }
}

// ============================================================================
// Common envelope types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiError {
  pub message: String,
  #[serde(default)]
  pub code: u16,
}

#[derive(Debug, Deserialize)]
pub struct ApiDocumentList<T> {
  #[serde(default)]
  pub total: u64,
  // Plain `default` would add a `T: Default` bound
  #[serde(default = "Vec::new")]
  pub documents: Vec<T>,
}

/// A relationship attribute: either a bare id or an expanded document.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ApiDocRef {
  Id(String),
  Document {
    #[serde(rename = "$id")]
    id: String,
    #[serde(default)]
    name: Option<String>,
  },
}

impl ApiDocRef {
  pub fn id(&self) -> &str {
    match self {
      Self::Id(id) => id,
      Self::Document { id, .. } => id,
    }
  }

  pub fn name(&self) -> Option<&str> {
    match self {
      Self::Id(_) => None,
      Self::Document { name, .. } => name.as_deref(),
    }
  }
}

fn ids(refs: Vec<ApiDocRef>) -> Vec<String> {
  refs.into_iter().map(|r| r.id().to_string()).collect()
}

// ============================================================================
// Accounts
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiAccount {
  #[serde(rename = "$id")]
  pub id: String,
  #[serde(default)]
  pub name: String,
  #[serde(default)]
  pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct ApiSession {
  #[serde(rename = "$id")]
  pub id: String,
  #[serde(rename = "userId")]
  pub user_id: String,
}

impl From<ApiSession> for Session {
  fn from(session: ApiSession) -> Self {
    Session {
      id: session.id,
      user_id: session.user_id,
    }
  }
}

#[derive(Debug, Deserialize)]
pub struct ApiFile {
  #[serde(rename = "$id")]
  pub id: String,
}

// ============================================================================
// Documents
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiSaveDocument {
  #[serde(rename = "$id")]
  pub id: String,
  pub user: Option<ApiDocRef>,
  pub post: Option<ApiDocRef>,
}

impl ApiSaveDocument {
  /// `owner` fills in the user when the record is nested under that user.
  pub fn into_record(self, owner: &str) -> SavedRecord {
    SavedRecord {
      id: self.id,
      user_id: self
        .user
        .map(|u| u.id().to_string())
        .unwrap_or_else(|| owner.to_string()),
      post_id: self.post.map(|p| p.id().to_string()).unwrap_or_default(),
    }
  }
}

#[derive(Debug, Deserialize)]
pub struct ApiUserDocument {
  #[serde(rename = "$id")]
  pub id: String,
  #[serde(rename = "accountId", default)]
  pub account_id: String,
  #[serde(default)]
  pub name: String,
  #[serde(default)]
  pub username: String,
  #[serde(default)]
  pub email: String,
  #[serde(rename = "imageUrl")]
  pub image_url: Option<String>,
  #[serde(rename = "imageId")]
  pub image_id: Option<String>,
  pub bio: Option<String>,
  #[serde(default)]
  pub posts: Vec<ApiDocRef>,
  #[serde(default)]
  pub liked: Vec<ApiDocRef>,
  #[serde(default)]
  pub save: Vec<ApiSaveDocument>,
}

impl From<ApiUserDocument> for User {
  fn from(doc: ApiUserDocument) -> Self {
    let saves = doc
      .save
      .into_iter()
      .map(|s| s.into_record(&doc.id))
      .collect();

    User {
      post_ids: ids(doc.posts),
      liked_post_ids: ids(doc.liked),
      saves,
      id: doc.id,
      account_id: doc.account_id,
      name: doc.name,
      username: doc.username,
      email: doc.email,
      image_url: doc.image_url,
      image_id: doc.image_id,
      bio: doc.bio,
    }
  }
}

#[derive(Debug, Deserialize)]
pub struct ApiPostDocument {
  #[serde(rename = "$id")]
  pub id: String,
  #[serde(rename = "$createdAt")]
  pub created_at: DateTime<Utc>,
  pub creator: Option<ApiDocRef>,
  #[serde(default)]
  pub caption: String,
  #[serde(rename = "imageUrl")]
  pub image_url: Option<String>,
  #[serde(rename = "imageId")]
  pub image_id: Option<String>,
  pub location: Option<String>,
  #[serde(default)]
  pub tags: Vec<String>,
  #[serde(default)]
  pub likes: Vec<ApiDocRef>,
}

impl From<ApiPostDocument> for Post {
  fn from(doc: ApiPostDocument) -> Self {
    let (creator_id, creator_name) = match &doc.creator {
      Some(creator) => (
        creator.id().to_string(),
        creator.name().map(String::from),
      ),
      None => (String::new(), None),
    };

    Post {
      id: doc.id,
      creator_id,
      creator_name,
      caption: doc.caption,
      image_url: doc.image_url,
      image_id: doc.image_id,
      location: doc.location,
      tags: doc.tags,
      likes: ids(doc.likes),
      created_at: doc.created_at,
    }
  }
}

#[derive(Debug, Deserialize)]
pub struct ApiFollowDocument {
  #[serde(rename = "$id")]
  pub id: String,
  #[serde(rename = "followerId")]
  pub follower_id: String,
  #[serde(rename = "followingId")]
  pub following_id: String,
}

impl From<ApiFollowDocument> for FollowRecord {
  fn from(doc: ApiFollowDocument) -> Self {
    FollowRecord {
      id: doc.id,
      follower_id: doc.follower_id,
      following_id: doc.following_id,
    }
  }
}
