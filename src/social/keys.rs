//! Cache keys for the social data-access layer.

use crate::cache::QueryKey;

/// Every query the data-access layer caches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SocialQueryKey {
  /// Profile of the signed-in account
  CurrentUser,
  /// Newest users
  Users { limit: Option<u32> },
  UserById { user_id: String },
  /// The short "home" list of newest posts
  RecentPosts,
  /// The paged explore feed
  InfinitePosts,
  PostById { post_id: String },
  UserPosts { user_id: String },
  SearchPosts { term: String },
  FollowStats { user_id: String },
  IsFollowing { follower_id: String, following_id: String },
}

/// Resource class of a key, without its discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryTag {
  CurrentUser,
  Users,
  UserById,
  RecentPosts,
  InfinitePosts,
  PostById,
  UserPosts,
  SearchPosts,
  FollowStats,
  IsFollowing,
}

impl QueryKey for SocialQueryKey {
  type Tag = QueryTag;

  fn tag(&self) -> QueryTag {
    match self {
      Self::CurrentUser => QueryTag::CurrentUser,
      Self::Users { .. } => QueryTag::Users,
      Self::UserById { .. } => QueryTag::UserById,
      Self::RecentPosts => QueryTag::RecentPosts,
      Self::InfinitePosts => QueryTag::InfinitePosts,
      Self::PostById { .. } => QueryTag::PostById,
      Self::UserPosts { .. } => QueryTag::UserPosts,
      Self::SearchPosts { .. } => QueryTag::SearchPosts,
      Self::FollowStats { .. } => QueryTag::FollowStats,
      Self::IsFollowing { .. } => QueryTag::IsFollowing,
    }
  }

  fn description(&self) -> String {
    match self {
      Self::CurrentUser => "current user".to_string(),
      Self::Users { limit } => match limit {
        Some(n) => format!("users (first {})", n),
        None => "users".to_string(),
      },
      Self::UserById { user_id } => format!("user {}", user_id),
      Self::RecentPosts => "recent posts".to_string(),
      Self::InfinitePosts => "posts feed".to_string(),
      Self::PostById { post_id } => format!("post {}", post_id),
      Self::UserPosts { user_id } => format!("posts by {}", user_id),
      Self::SearchPosts { term } => format!("posts matching '{}'", term),
      Self::FollowStats { user_id } => format!("follow stats of {}", user_id),
      Self::IsFollowing {
        follower_id,
        following_id,
      } => format!("{} follows {}", follower_id, following_id),
    }
  }
}

impl SocialQueryKey {
  pub fn user_by_id(user_id: &str) -> Self {
    Self::UserById {
      user_id: user_id.to_string(),
    }
  }

  pub fn post_by_id(post_id: &str) -> Self {
    Self::PostById {
      post_id: post_id.to_string(),
    }
  }

  pub fn user_posts(user_id: &str) -> Self {
    Self::UserPosts {
      user_id: user_id.to_string(),
    }
  }

  /// Search terms are trimmed so equivalent searches share an entry.
  pub fn search_posts(term: &str) -> Self {
    Self::SearchPosts {
      term: term.trim().to_string(),
    }
  }

  pub fn follow_stats(user_id: &str) -> Self {
    Self::FollowStats {
      user_id: user_id.to_string(),
    }
  }

  pub fn is_following(follower_id: &str, following_id: &str) -> Self {
    Self::IsFollowing {
      follower_id: follower_id.to_string(),
      following_id: following_id.to_string(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::KeyPattern;

  #[test]
  fn test_keys_compare_structurally() {
    assert_eq!(
      SocialQueryKey::follow_stats("u1"),
      SocialQueryKey::FollowStats {
        user_id: "u1".to_string()
      }
    );
    assert_ne!(
      SocialQueryKey::follow_stats("u1"),
      SocialQueryKey::follow_stats("u2")
    );
    assert_eq!(
      SocialQueryKey::search_posts("  cats "),
      SocialQueryKey::search_posts("cats")
    );
  }

  #[test]
  fn test_tag_pattern_ignores_discriminator() {
    let pattern = KeyPattern::Tag(QueryTag::FollowStats);
    assert!(pattern.matches(&SocialQueryKey::follow_stats("a")));
    assert!(pattern.matches(&SocialQueryKey::follow_stats("b")));
    assert!(!pattern.matches(&SocialQueryKey::user_by_id("a")));
  }

  #[test]
  fn test_exact_pattern() {
    let pattern = KeyPattern::Exact(SocialQueryKey::is_following("a", "b"));
    assert!(pattern.matches(&SocialQueryKey::is_following("a", "b")));
    assert!(!pattern.matches(&SocialQueryKey::is_following("b", "a")));
  }
}
