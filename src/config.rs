use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::social::types::Credentials;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub backend: BackendConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub feed: FeedConfig,
}

/// Where the hosted backend lives and which collections hold what.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
  /// API root, e.g. "https://cloud.appwrite.io/v1"
  pub endpoint: String,
  pub project_id: String,
  pub database_id: String,
  /// Bucket for post and avatar images
  pub storage_id: String,
  pub collections: CollectionsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectionsConfig {
  pub users: String,
  pub posts: String,
  pub saves: String,
  pub follows: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Disable to send every read to the backend
  #[serde(default = "default_true")]
  pub enabled: bool,
  /// Treat entries older than this as stale even if never invalidated
  pub stale_time_secs: Option<u64>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      stale_time_secs: None,
    }
  }
}

fn default_true() -> bool {
  true
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
  /// Posts per page of the paged feed
  #[serde(default = "default_page_size")]
  pub page_size: u32,
  /// Posts in the recent list
  #[serde(default = "default_recent_limit")]
  pub recent_limit: u32,
}

impl Default for FeedConfig {
  fn default() -> Self {
    Self {
      page_size: default_page_size(),
      recent_limit: default_recent_limit(),
    }
  }
}

fn default_page_size() -> u32 {
  9
}

fn default_recent_limit() -> u32 {
  20
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./socialsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/socialsync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/socialsync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("socialsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("socialsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    url::Url::parse(&config.backend.endpoint)
      .map_err(|e| eyre!("Invalid backend endpoint '{}': {}", config.backend.endpoint, e))?;
    Ok(config)
  }

  /// Server API key from the environment, if one is set.
  ///
  /// Without it requests run with the signed-in session only.
  pub fn get_api_key() -> Option<String> {
    std::env::var("SOCIALSYNC_API_KEY").ok()
  }

  /// Sign-in credentials from SOCIALSYNC_EMAIL and SOCIALSYNC_PASSWORD.
  pub fn get_credentials() -> Result<Credentials> {
    let email = std::env::var("SOCIALSYNC_EMAIL")
      .map_err(|_| eyre!("Email not found. Set SOCIALSYNC_EMAIL environment variable."))?;
    let password = std::env::var("SOCIALSYNC_PASSWORD")
      .map_err(|_| eyre!("Password not found. Set SOCIALSYNC_PASSWORD environment variable."))?;
    Ok(Credentials { email, password })
  }
}
