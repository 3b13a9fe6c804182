//! Which cached queries each write makes stale.

use crate::cache::KeyPattern;

use super::keys::{QueryTag, SocialQueryKey};
use super::types::Follow;

type Pattern = KeyPattern<SocialQueryKey>;

/// A successful write, carrying whatever ids its invalidations depend on.
#[derive(Debug, Clone, Copy)]
pub enum WriteOp<'a> {
  CreateUserAccount,
  SignIn,
  SignOut,
  CreatePost,
  UpdatePost { post_id: &'a str },
  DeletePost,
  LikePost { post_id: &'a str },
  SavePost,
  DeleteSavedPost,
  UpdateUser { user_id: &'a str },
  FollowUser { follow: &'a Follow },
  UnfollowUser,
}

impl WriteOp<'_> {
  /// Keys to mark stale after this write succeeded.
  pub fn invalidates(&self) -> Vec<Pattern> {
    use KeyPattern::{Exact, Tag};

    match *self {
      Self::CreateUserAccount => vec![],
      Self::SignIn => vec![Exact(SocialQueryKey::CurrentUser)],
      // Everything cached belonged to the previous session
      Self::SignOut => vec![KeyPattern::All],
      Self::CreatePost => vec![Exact(SocialQueryKey::RecentPosts)],
      Self::UpdatePost { post_id } => vec![Exact(SocialQueryKey::post_by_id(post_id))],
      Self::DeletePost => vec![Exact(SocialQueryKey::RecentPosts)],
      Self::LikePost { post_id } => vec![
        Exact(SocialQueryKey::post_by_id(post_id)),
        Exact(SocialQueryKey::RecentPosts),
        Exact(SocialQueryKey::InfinitePosts),
        Exact(SocialQueryKey::CurrentUser),
      ],
      Self::SavePost | Self::DeleteSavedPost => vec![
        Exact(SocialQueryKey::RecentPosts),
        Exact(SocialQueryKey::InfinitePosts),
        Exact(SocialQueryKey::CurrentUser),
      ],
      Self::UpdateUser { user_id } => vec![
        Exact(SocialQueryKey::CurrentUser),
        Exact(SocialQueryKey::user_by_id(user_id)),
      ],
      Self::FollowUser { follow } => vec![
        Exact(SocialQueryKey::follow_stats(&follow.following_id)),
        Exact(SocialQueryKey::is_following(
          &follow.follower_id,
          &follow.following_id,
        )),
      ],
      Self::UnfollowUser => vec![Tag(QueryTag::IsFollowing), Tag(QueryTag::FollowStats)],
    }
  }
}
