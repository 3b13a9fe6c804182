use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use futures::{StreamExt, TryStreamExt};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use socialsync::cache::KeyPattern;
use socialsync::config::Config;
use socialsync::social::types::{Follow, Post, User};
use socialsync::social::{FollowAction, HttpBackend, SocialClient};

#[derive(Parser, Debug)]
#[command(name = "socialsync")]
#[command(about = "Read and update a social feed through a caching client")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/socialsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Page through the feed, newest first
  Feed {
    /// Stop after this many pages
    #[arg(short, long, default_value_t = 1)]
    pages: usize,
  },
  /// The most recent posts
  Recent,
  /// Show one post
  Post { post_id: String },
  /// Search post captions
  Search { term: String },
  /// List users, newest first
  Users {
    #[arg(short, long)]
    limit: Option<u32>,
  },
  /// Show one user
  User { user_id: String },
  /// Profile with follow counts, as seen by the signed-in user
  Profile { user_id: String },
  /// Follow a user
  Follow { user_id: String },
  /// Stop following a user
  Unfollow { user_id: String },
  /// Toggle following a user
  ToggleFollow { user_id: String },
  /// Toggle your like on a post
  Like { post_id: String },
  /// Save a post
  Save { post_id: String },
  /// Remove a post from your saves
  Unsave { post_id: String },
  /// Print follower counts of a user whenever they change
  Watch {
    user_id: String,
    /// Seconds between refreshes
    #[arg(short, long, default_value_t = 30)]
    every: u64,
  },
  /// Show the signed-in user, signing in from the environment if needed
  Whoami,
}

type Client = SocialClient<HttpBackend>;

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Logging goes to a file; keep the guard until exit so lines are flushed
  let _log_guard = socialsync::logging::init()?;

  let config = Config::load(args.config.as_deref())?;
  let backend = HttpBackend::new(&config)?;
  let client = SocialClient::from_config(backend, &config);

  info!(command = ?args.command, "running");
  run(&client, args.command).await
}

async fn run(client: &Client, command: Command) -> Result<()> {
  match command {
    Command::Feed { pages } => {
      let pages: Vec<Vec<Post>> = client.post_pages().take(pages).try_collect().await?;
      for (index, page) in pages.iter().enumerate() {
        println!("-- page {} --", index + 1);
        page.iter().for_each(print_post);
      }
    }
    Command::Recent => client.recent_posts().await?.iter().for_each(print_post),
    Command::Post { post_id } => match client.post_by_id(&post_id).await? {
      Some(post) => print_post(&post),
      None => println!("No post id given"),
    },
    Command::Search { term } => match client.search_posts(&term).await? {
      Some(posts) if posts.is_empty() => println!("No results"),
      Some(posts) => posts.iter().for_each(print_post),
      None => println!("No search term given"),
    },
    Command::Users { limit } => client.users(limit).await?.iter().for_each(print_user),
    Command::User { user_id } => match client.user_by_id(&user_id).await? {
      Some(user) => print_user(&user),
      None => println!("No user id given"),
    },
    Command::Profile { user_id } => {
      let viewer = client.current_user().await?;
      let viewer_id = viewer.as_ref().map(|u| u.id.as_str());
      match client.profile(viewer_id, &user_id).await? {
        Some(profile) => {
          print_user(&profile.user);
          println!(
            "  {} posts, {} followers, {} following",
            profile.post_count(),
            profile.stats.followers_count,
            profile.stats.following_count
          );
          if profile.is_own_profile {
            println!("  (you)");
          } else if let Some(follows) = profile.viewer_follows {
            println!("  {}", if follows { "following" } else { "not following" });
          }
        }
        None => println!("No user id given"),
      }
    }
    Command::Follow { user_id } => {
      let me = signed_in(client).await?;
      client.follow_user(&Follow::new(&me.id, &user_id)).await?;
      println!("Following {}", user_id);
    }
    Command::Unfollow { user_id } => {
      let me = signed_in(client).await?;
      client.unfollow_user(&Follow::new(&me.id, &user_id)).await?;
      println!("Unfollowed {}", user_id);
    }
    Command::ToggleFollow { user_id } => {
      let me = signed_in(client).await?;
      match client.toggle_follow(Some(&me.id), Some(&user_id)).await? {
        Some(FollowAction::Followed) => println!("Following {}", user_id),
        Some(FollowAction::Unfollowed) => println!("Unfollowed {}", user_id),
        None => println!("Nothing to do"),
      }
    }
    Command::Like { post_id } => {
      let me = signed_in(client).await?;
      let post = client
        .post_by_id(&post_id)
        .await?
        .ok_or_else(|| eyre!("No post id given"))?;
      let liked = client
        .like_post(&post.id, &post.likes_toggled_by(&me.id))
        .await?;
      let verb = if liked.likes.contains(&me.id) { "Liked" } else { "Unliked" };
      println!("{} {} ({} likes)", verb, liked.id, liked.likes.len());
    }
    Command::Save { post_id } => {
      let me = signed_in(client).await?;
      if me.saves.iter().any(|s| s.post_id == post_id) {
        println!("Already saved");
      } else {
        let record = client.save_post(&me.id, &post_id).await?;
        println!("Saved {} ({})", record.post_id, record.id);
      }
    }
    Command::Unsave { post_id } => {
      let me = signed_in(client).await?;
      match me.saves.iter().find(|s| s.post_id == post_id) {
        Some(record) => {
          client.delete_saved_post(&record.id).await?;
          println!("Removed {} from saves", post_id);
        }
        None => println!("Not saved"),
      }
    }
    Command::Watch { user_id, every } => watch(client, &user_id, every).await?,
    Command::Whoami => print_user(&signed_in(client).await?),
  }

  Ok(())
}

/// Poll the follow stats of `user_id`, marking them stale every `every`
/// seconds so the query reloads them. Runs until interrupted. A failed
/// load is retried on the next refresh.
async fn watch(client: &Client, user_id: &str, every: u64) -> Result<()> {
  let mut stats = client.follow_stats_query(user_id);
  let Some(key) = stats.key().cloned() else {
    println!("No user id given");
    return Ok(());
  };

  let mut ticks = tokio::time::interval(Duration::from_millis(200));
  let mut refresh = tokio::time::interval(Duration::from_secs(every.max(1)));
  // The first refresh tick fires at once; the initial load covers it
  refresh.tick().await;
  stats.fetch();

  let mut shown = None;
  loop {
    tokio::select! {
      _ = refresh.tick() => {
        // Nothing to mark stale when caching is off
        let marked = client.cache().invalidate(&KeyPattern::Exact(key.clone()))?;
        if stats.is_error() || marked == 0 {
          stats.fetch();
        }
      }
      _ = ticks.tick() => {
        if !stats.poll() {
          continue;
        }
        if let Some(error) = stats.error() {
          warn!(user_id, %error, "refresh failed");
          eprintln!("Refresh failed: {}", error);
        }
        if let Some(counts) = stats.data().map(|s| (s.followers_count, s.following_count)) {
          if shown != Some(counts) {
            println!("{} followers, {} following", counts.0, counts.1);
            shown = Some(counts);
          }
        }
      }
      _ = tokio::signal::ctrl_c() => break,
    }
  }

  Ok(())
}

/// Current user, signing in from the environment first if there is no session.
async fn signed_in(client: &Client) -> Result<User> {
  if let Some(user) = client.current_user().await? {
    return Ok(user);
  }

  client.sign_in(&Config::get_credentials()?).await?;
  client
    .current_user()
    .await?
    .ok_or_else(|| eyre!("Signed in, but the account has no user profile"))
}

fn print_post(post: &Post) {
  let creator = post.creator_name.as_deref().unwrap_or(&post.creator_id);
  println!(
    "{}  {}  {}  [{} likes]",
    post.id,
    post.created_at.format("%Y-%m-%d %H:%M"),
    creator,
    post.likes.len()
  );
  if !post.caption.is_empty() {
    println!("    {}", post.caption);
  }
  if !post.tags.is_empty() {
    println!("    #{}", post.tags.join(" #"));
  }
}

fn print_user(user: &User) {
  println!("{}  {} (@{})", user.id, user.name, user.username);
  if let Some(bio) = &user.bio {
    println!("    {}", bio);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_session_commands_are_not_offered() {
    // Sessions do not outlive one invocation
    assert!(Args::try_parse_from(["socialsync", "sign-in"]).is_err());
    assert!(Args::try_parse_from(["socialsync", "sign-out"]).is_err());
  }

  #[test]
  fn test_parse_watch() {
    let args = Args::try_parse_from(["socialsync", "watch", "u1", "--every", "5"]).unwrap();
    match args.command {
      Command::Watch { user_id, every } => {
        assert_eq!(user_id, "u1");
        assert_eq!(every, 5);
      }
      other => panic!("unexpected command {:?}", other),
    }
  }
}
