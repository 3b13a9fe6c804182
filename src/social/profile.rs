//! Profile page read model and the follow toggle.

use color_eyre::Result;
use tracing::info;

use super::backend::Backend;
use super::cached_client::SocialClient;
use super::types::{Follow, FollowStats, Post, User};

/// Everything a profile page shows about one user.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileSummary {
  pub user: User,
  pub stats: FollowStats,
  /// Whether the viewer follows this profile. `None` without a viewer or on
  /// the viewer's own profile.
  pub viewer_follows: Option<bool>,
  pub is_own_profile: bool,
}

impl ProfileSummary {
  pub fn post_count(&self) -> usize {
    self.user.post_ids.len()
  }

  /// Follow state derived from the follower list instead of the dedicated
  /// lookup. Lags behind a follow or unfollow until the stats are refetched.
  pub fn follows_by_stats(&self, viewer_id: &str) -> bool {
    self.stats.has_follower(viewer_id)
  }
}

/// What [`SocialClient::toggle_follow`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowAction {
  Followed,
  Unfollowed,
}

fn present(id: Option<&str>) -> Option<&str> {
  id.map(str::trim).filter(|id| !id.is_empty())
}

impl Post {
  /// Like list after `user_id` toggles their like.
  pub fn likes_toggled_by(&self, user_id: &str) -> Vec<String> {
    if self.likes.iter().any(|id| id == user_id) {
      self
        .likes
        .iter()
        .filter(|id| *id != user_id)
        .cloned()
        .collect()
    } else {
      let mut likes = self.likes.clone();
      likes.push(user_id.to_string());
      likes
    }
  }
}

impl<B: Backend> SocialClient<B> {
  /// Assemble the profile of `profile_id` as seen by `viewer_id`.
  ///
  /// Returns `None` when the profile id is empty.
  pub async fn profile(
    &self,
    viewer_id: Option<&str>,
    profile_id: &str,
  ) -> Result<Option<ProfileSummary>> {
    let (user, stats) = futures::try_join!(
      self.user_by_id(profile_id),
      self.follow_stats(profile_id)
    )?;
    let (Some(user), Some(stats)) = (user, stats) else {
      return Ok(None);
    };

    let viewer = present(viewer_id);
    let is_own_profile = viewer == Some(user.id.as_str());
    let viewer_follows = match viewer {
      Some(viewer) if !is_own_profile => self.is_following(viewer, &user.id).await?,
      _ => None,
    };

    Ok(Some(ProfileSummary {
      user,
      stats,
      viewer_follows,
      is_own_profile,
    }))
  }

  /// Follow `profile_id` if the viewer does not follow it yet, unfollow
  /// otherwise.
  ///
  /// No-op when either id is missing or both are the same user.
  pub async fn toggle_follow(
    &self,
    viewer_id: Option<&str>,
    profile_id: Option<&str>,
  ) -> Result<Option<FollowAction>> {
    let (Some(viewer), Some(profile)) = (present(viewer_id), present(profile_id)) else {
      return Ok(None);
    };
    if viewer == profile {
      return Ok(None);
    }

    let follow = Follow::new(viewer, profile);
    let following = self.is_following(viewer, profile).await?.unwrap_or(false);
    let action = if following {
      self.unfollow_user(&follow).await?;
      FollowAction::Unfollowed
    } else {
      self.follow_user(&follow).await?;
      FollowAction::Followed
    };

    info!(viewer, profile, ?action, "follow toggled");
    Ok(Some(action))
  }
}
