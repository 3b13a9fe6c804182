use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::multipart::{Form, Part};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, warn};
use url::Url;

use crate::config::{CollectionsConfig, Config};

use super::api_types::{
  ApiAccount, ApiDocumentList, ApiError, ApiFile, ApiFollowDocument, ApiPostDocument, ApiQuery,
  ApiSaveDocument, ApiSession, ApiUserDocument,
};
use super::backend::Backend;
use super::types::{
  Credentials, Follow, FollowRecord, FollowStats, ImageUpload, NewPost, NewUser, Post,
  SavedRecord, Session, UpdatePost, UpdateUser, User,
};

/// Ask the server to generate a document or file id.
const UNIQUE_ID: &str = "unique()";

/// Most documents the backend returns for one list call.
const MAX_LIST_LIMIT: u32 = 100;

/// REST client for the hosted document backend
#[derive(Clone)]
pub struct HttpBackend {
  http: reqwest::Client,
  endpoint: Url,
  project_id: String,
  database_id: String,
  storage_id: String,
  collections: CollectionsConfig,
  page_size: u32,
  recent_limit: u32,
}

impl HttpBackend {
  pub fn new(config: &Config) -> Result<Self> {
    let backend = &config.backend;
    let endpoint = Url::parse(&backend.endpoint)
      .map_err(|e| eyre!("Invalid backend endpoint '{}': {}", backend.endpoint, e))?;

    let mut headers = HeaderMap::new();
    headers.insert(
      "x-appwrite-project",
      HeaderValue::from_str(&backend.project_id)
        .map_err(|e| eyre!("Invalid project id: {}", e))?,
    );
    if let Some(key) = Config::get_api_key() {
      let mut value =
        HeaderValue::from_str(&key).map_err(|e| eyre!("Invalid API key: {}", e))?;
      value.set_sensitive(true);
      headers.insert("x-appwrite-key", value);
    }

    // Sessions are carried by cookie between calls
    let http = reqwest::Client::builder()
      .default_headers(headers)
      .cookie_store(true)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      endpoint,
      project_id: backend.project_id.clone(),
      database_id: backend.database_id.clone(),
      storage_id: backend.storage_id.clone(),
      collections: backend.collections.clone(),
      page_size: config.feed.page_size,
      recent_limit: config.feed.recent_limit,
    })
  }

  /// Endpoint URL with path segments appended (each one percent-encoded).
  fn url(&self, segments: &[&str]) -> Result<Url> {
    let mut url = self.endpoint.clone();
    url
      .path_segments_mut()
      .map_err(|_| eyre!("Endpoint {} cannot carry a path", self.endpoint))?
      .pop_if_empty()
      .extend(segments);
    Ok(url)
  }

  fn documents_url(&self, collection: &str, document_id: Option<&str>) -> Result<Url> {
    let mut segments = vec![
      "databases",
      self.database_id.as_str(),
      "collections",
      collection,
      "documents",
    ];
    segments.extend(document_id);
    self.url(&segments)
  }

  fn files_url(&self, file_id: Option<&str>) -> Result<Url> {
    let mut segments = vec!["storage", "buckets", self.storage_id.as_str(), "files"];
    segments.extend(file_id);
    self.url(&segments)
  }

  /// Public preview URL for an uploaded image.
  fn file_preview_url(&self, file_id: &str) -> Result<String> {
    let mut url = self.files_url(Some(file_id))?;
    url
      .path_segments_mut()
      .map_err(|_| eyre!("Endpoint {} cannot carry a path", self.endpoint))?
      .push("preview");
    url
      .query_pairs_mut()
      .append_pair("width", "2000")
      .append_pair("height", "2000")
      .append_pair("gravity", "top")
      .append_pair("quality", "100")
      .append_pair("project", &self.project_id);
    Ok(url.to_string())
  }

  /// Generated initials avatar for a new account.
  fn avatar_url(&self, name: &str) -> Result<String> {
    let mut url = self.url(&["avatars", "initials"])?;
    url
      .query_pairs_mut()
      .append_pair("name", name)
      .append_pair("project", &self.project_id);
    Ok(url.to_string())
  }

  /// Send a request and decode a JSON body, turning error statuses into errors.
  async fn send<T: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> Result<T> {
    let response = self.send_raw(request, what).await?;
    response
      .json::<T>()
      .await
      .map_err(|e| eyre!("Failed to parse response to {}: {}", what, e))
  }

  /// Send a request whose response body is not needed.
  async fn send_empty(&self, request: RequestBuilder, what: &str) -> Result<()> {
    self.send_raw(request, what).await.map(|_| ())
  }

  async fn send_raw(&self, request: RequestBuilder, what: &str) -> Result<reqwest::Response> {
    debug!(what, "backend request");
    let response = request
      .send()
      .await
      .map_err(|e| eyre!("Failed to {}: {}", what, e))?;

    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }

    let message = match response.json::<ApiError>().await {
      Ok(error) => error.message,
      Err(_) => status.to_string(),
    };
    Err(eyre!("Failed to {}: {} ({})", what, message, status))
  }

  async fn list_documents<T: DeserializeOwned>(
    &self,
    collection: &str,
    queries: &[String],
    what: &str,
  ) -> Result<ApiDocumentList<T>> {
    let params: Vec<(&str, &str)> = queries.iter().map(|q| ("queries[]", q.as_str())).collect();
    let request = self
      .http
      .get(self.documents_url(collection, None)?)
      .query(&params);
    self.send(request, what).await
  }

  /// Every follow record pointing at `user_id`, read page by page, and the
  /// total the backend reports.
  async fn list_followers(&self, user_id: &str) -> Result<(u64, Vec<ApiFollowDocument>)> {
    let mut followers = Vec::new();
    let mut cursor: Option<String> = None;

    loop {
      let mut queries = vec![
        ApiQuery::equal("followingId", user_id),
        ApiQuery::limit(MAX_LIST_LIMIT),
      ];
      queries.extend(cursor.as_deref().map(ApiQuery::cursor_after));

      let page: ApiDocumentList<ApiFollowDocument> = self
        .list_documents(&self.collections.follows, &queries, "get followers")
        .await?;
      let total = page.total;
      let last_page = page.documents.len() < MAX_LIST_LIMIT as usize;
      cursor = page.documents.last().map(|doc| doc.id.clone());
      followers.extend(page.documents);

      if last_page || cursor.is_none() || followers.len() as u64 >= total {
        debug!(user_id, total, loaded = followers.len(), "listed followers");
        return Ok((total, followers));
      }
    }
  }

  async fn get_document<T: DeserializeOwned>(
    &self,
    collection: &str,
    document_id: &str,
    what: &str,
  ) -> Result<T> {
    let request = self
      .http
      .get(self.documents_url(collection, Some(document_id))?);
    self.send(request, what).await
  }

  async fn create_document<T: DeserializeOwned>(
    &self,
    collection: &str,
    data: Value,
    what: &str,
  ) -> Result<T> {
    let request = self
      .http
      .post(self.documents_url(collection, None)?)
      .json(&json!({ "documentId": UNIQUE_ID, "data": data }));
    self.send(request, what).await
  }

  async fn update_document<T: DeserializeOwned>(
    &self,
    collection: &str,
    document_id: &str,
    data: Value,
    what: &str,
  ) -> Result<T> {
    let request = self
      .http
      .patch(self.documents_url(collection, Some(document_id))?)
      .json(&json!({ "data": data }));
    self.send(request, what).await
  }

  async fn delete_document(&self, collection: &str, document_id: &str, what: &str) -> Result<()> {
    let request = self
      .http
      .delete(self.documents_url(collection, Some(document_id))?);
    self.send_empty(request, what).await
  }

  /// Upload an image, returning its file id and preview URL.
  async fn upload_image(&self, image: &ImageUpload) -> Result<(String, String)> {
    let part = Part::bytes(image.bytes.clone()).file_name(image.file_name.clone());
    let form = Form::new().text("fileId", UNIQUE_ID).part("file", part);
    let request = self.http.post(self.files_url(None)?).multipart(form);

    let file: ApiFile = self.send(request, "upload image").await?;
    match self.file_preview_url(&file.id) {
      Ok(url) => Ok((file.id, url)),
      Err(e) => {
        self.discard_file(&file.id).await;
        Err(e)
      }
    }
  }

  async fn delete_file(&self, file_id: &str) -> Result<()> {
    let request = self.http.delete(self.files_url(Some(file_id))?);
    self.send_empty(request, "delete image").await
  }

  /// Best-effort removal of an orphaned upload.
  async fn discard_file(&self, file_id: &str) {
    if let Err(e) = self.delete_file(file_id).await {
      warn!(file_id, error = %e, "failed to remove orphaned image");
    }
  }

  async fn account(&self) -> Result<Option<ApiAccount>> {
    let response = self
      .http
      .get(self.url(&["account"])?)
      .send()
      .await
      .map_err(|e| eyre!("Failed to get account: {}", e))?;

    // No session is not an error for callers asking "who is signed in"
    if response.status() == StatusCode::UNAUTHORIZED {
      return Ok(None);
    }
    if !response.status().is_success() {
      return Err(eyre!("Failed to get account: {}", response.status()));
    }

    let account = response
      .json::<ApiAccount>()
      .await
      .map_err(|e| eyre!("Failed to parse account: {}", e))?;
    Ok(Some(account))
  }

  /// Apply an optional new image to a document update, then clean up
  /// whichever image ends up unused.
  async fn update_with_image<T, F, Fut>(
    &self,
    image: Option<&ImageUpload>,
    current: (Option<&str>, Option<&str>),
    update: F,
  ) -> Result<T>
  where
    F: FnOnce(Option<String>, Option<String>) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
  {
    let (current_id, current_url) = current;
    let uploaded = match image {
      Some(image) => Some(self.upload_image(image).await?),
      None => None,
    };

    let (image_id, image_url) = match &uploaded {
      Some((id, url)) => (Some(id.clone()), Some(url.clone())),
      None => (current_id.map(String::from), current_url.map(String::from)),
    };

    match update(image_id, image_url).await {
      Ok(doc) => {
        // The replaced image is no longer referenced
        if uploaded.is_some() {
          if let Some(old) = current_id {
            self.discard_file(old).await;
          }
        }
        Ok(doc)
      }
      Err(e) => {
        if let Some((id, _)) = &uploaded {
          self.discard_file(id).await;
        }
        Err(e)
      }
    }
  }
}

#[async_trait]
impl Backend for HttpBackend {
  async fn create_user_account(&self, user: &NewUser) -> Result<User> {
    let request = self.http.post(self.url(&["account"])?).json(&json!({
      "userId": UNIQUE_ID,
      "email": user.email,
      "password": user.password,
      "name": user.name,
    }));
    let account: ApiAccount = self.send(request, "create account").await?;

    let doc: ApiUserDocument = self
      .create_document(
        &self.collections.users,
        json!({
          "accountId": account.id,
          "name": user.name,
          "email": user.email,
          "username": user.username,
          "imageUrl": self.avatar_url(&user.name)?,
        }),
        "save user",
      )
      .await?;
    Ok(doc.into())
  }

  async fn sign_in(&self, credentials: &Credentials) -> Result<Session> {
    let request = self
      .http
      .post(self.url(&["account", "sessions", "email"])?)
      .json(&json!({
        "email": credentials.email,
        "password": credentials.password,
      }));
    let session: ApiSession = self.send(request, "sign in").await?;
    Ok(session.into())
  }

  async fn sign_out(&self) -> Result<()> {
    let request = self
      .http
      .delete(self.url(&["account", "sessions", "current"])?);
    self.send_empty(request, "sign out").await
  }

  async fn get_current_user(&self) -> Result<Option<User>> {
    let account = match self.account().await? {
      Some(account) => account,
      None => return Ok(None),
    };

    let list: ApiDocumentList<ApiUserDocument> = self
      .list_documents(
        &self.collections.users,
        &[ApiQuery::equal("accountId", &account.id)],
        "get current user",
      )
      .await?;
    Ok(list.documents.into_iter().next().map(User::from))
  }

  async fn get_users(&self, limit: Option<u32>) -> Result<Vec<User>> {
    let mut queries = vec![ApiQuery::order_desc("$createdAt")];
    queries.extend(limit.map(ApiQuery::limit));

    let list: ApiDocumentList<ApiUserDocument> = self
      .list_documents(&self.collections.users, &queries, "get users")
      .await?;
    Ok(list.documents.into_iter().map(User::from).collect())
  }

  async fn get_user_by_id(&self, user_id: &str) -> Result<User> {
    let doc: ApiUserDocument = self
      .get_document(&self.collections.users, user_id, "get user")
      .await?;
    Ok(doc.into())
  }

  async fn update_user(&self, user: &UpdateUser) -> Result<User> {
    let doc: ApiUserDocument = self
      .update_with_image(
        user.image.as_ref(),
        (user.image_id.as_deref(), user.image_url.as_deref()),
        |image_id, image_url| {
          self.update_document(
            &self.collections.users,
            &user.user_id,
            json!({
              "name": user.name,
              "bio": user.bio,
              "imageId": image_id,
              "imageUrl": image_url,
            }),
            "update user",
          )
        },
      )
      .await?;
    Ok(doc.into())
  }

  async fn create_post(&self, post: &NewPost) -> Result<Post> {
    let doc: ApiPostDocument = self
      .update_with_image(post.image.as_ref(), (None, None), |image_id, image_url| {
        self.create_document(
          &self.collections.posts,
          json!({
            "creator": post.creator_id,
            "caption": post.caption,
            "imageId": image_id,
            "imageUrl": image_url,
            "location": post.location,
            "tags": post.tags,
          }),
          "create post",
        )
      })
      .await?;
    Ok(doc.into())
  }

  async fn get_post_by_id(&self, post_id: &str) -> Result<Post> {
    let doc: ApiPostDocument = self
      .get_document(&self.collections.posts, post_id, "get post")
      .await?;
    Ok(doc.into())
  }

  async fn update_post(&self, post: &UpdatePost) -> Result<Post> {
    let doc: ApiPostDocument = self
      .update_with_image(
        post.image.as_ref(),
        (post.image_id.as_deref(), post.image_url.as_deref()),
        |image_id, image_url| {
          self.update_document(
            &self.collections.posts,
            &post.post_id,
            json!({
              "caption": post.caption,
              "imageId": image_id,
              "imageUrl": image_url,
              "location": post.location,
              "tags": post.tags,
            }),
            "update post",
          )
        },
      )
      .await?;
    Ok(doc.into())
  }

  async fn delete_post(&self, post_id: &str, image_id: Option<&str>) -> Result<()> {
    self
      .delete_document(&self.collections.posts, post_id, "delete post")
      .await?;
    if let Some(image_id) = image_id {
      self.discard_file(image_id).await;
    }
    Ok(())
  }

  async fn get_user_posts(&self, user_id: &str) -> Result<Vec<Post>> {
    let list: ApiDocumentList<ApiPostDocument> = self
      .list_documents(
        &self.collections.posts,
        &[
          ApiQuery::equal("creator", user_id),
          ApiQuery::order_desc("$createdAt"),
        ],
        "get user posts",
      )
      .await?;
    Ok(list.documents.into_iter().map(Post::from).collect())
  }

  async fn get_recent_posts(&self) -> Result<Vec<Post>> {
    let list: ApiDocumentList<ApiPostDocument> = self
      .list_documents(
        &self.collections.posts,
        &[
          ApiQuery::order_desc("$createdAt"),
          ApiQuery::limit(self.recent_limit),
        ],
        "get recent posts",
      )
      .await?;
    Ok(list.documents.into_iter().map(Post::from).collect())
  }

  async fn get_posts_page(&self, cursor: Option<&str>) -> Result<Vec<Post>> {
    let mut queries = vec![
      ApiQuery::order_desc("$createdAt"),
      ApiQuery::limit(self.page_size),
    ];
    queries.extend(cursor.map(ApiQuery::cursor_after));

    let list: ApiDocumentList<ApiPostDocument> = self
      .list_documents(&self.collections.posts, &queries, "get posts page")
      .await?;
    Ok(list.documents.into_iter().map(Post::from).collect())
  }

  async fn search_posts(&self, term: &str) -> Result<Vec<Post>> {
    let list: ApiDocumentList<ApiPostDocument> = self
      .list_documents(
        &self.collections.posts,
        &[ApiQuery::search("caption", term)],
        "search posts",
      )
      .await?;
    Ok(list.documents.into_iter().map(Post::from).collect())
  }

  async fn like_post(&self, post_id: &str, likes: &[String]) -> Result<Post> {
    let doc: ApiPostDocument = self
      .update_document(
        &self.collections.posts,
        post_id,
        json!({ "likes": likes }),
        "like post",
      )
      .await?;
    Ok(doc.into())
  }

  async fn save_post(&self, user_id: &str, post_id: &str) -> Result<SavedRecord> {
    let doc: ApiSaveDocument = self
      .create_document(
        &self.collections.saves,
        json!({ "user": user_id, "post": post_id }),
        "save post",
      )
      .await?;
    Ok(doc.into_record(user_id))
  }

  async fn delete_saved_post(&self, saved_record_id: &str) -> Result<()> {
    self
      .delete_document(&self.collections.saves, saved_record_id, "delete saved post")
      .await
  }

  async fn get_follow_stats(&self, user_id: &str) -> Result<FollowStats> {
    let (followers_count, followers) = self.list_followers(user_id).await?;

    // Only the total is needed here
    let following: ApiDocumentList<ApiFollowDocument> = self
      .list_documents(
        &self.collections.follows,
        &[ApiQuery::equal("followerId", user_id), ApiQuery::limit(1)],
        "get following",
      )
      .await?;

    Ok(FollowStats {
      followers_count: followers_count as usize,
      following_count: following.total as usize,
      followers: followers.into_iter().map(FollowRecord::from).collect(),
    })
  }

  async fn follow_user(&self, follow: &Follow) -> Result<FollowRecord> {
    let doc: ApiFollowDocument = self
      .create_document(
        &self.collections.follows,
        json!({
          "followerId": follow.follower_id,
          "followingId": follow.following_id,
        }),
        "follow user",
      )
      .await?;
    Ok(doc.into())
  }

  async fn unfollow_user(&self, follow: &Follow) -> Result<()> {
    let list: ApiDocumentList<ApiFollowDocument> = self
      .list_documents(
        &self.collections.follows,
        &[
          ApiQuery::equal("followerId", &follow.follower_id),
          ApiQuery::equal("followingId", &follow.following_id),
        ],
        "find follow record",
      )
      .await?;

    for doc in list.documents {
      self
        .delete_document(&self.collections.follows, &doc.id, "unfollow user")
        .await?;
    }
    Ok(())
  }

  async fn is_following(&self, follower_id: &str, following_id: &str) -> Result<bool> {
    let list: ApiDocumentList<ApiFollowDocument> = self
      .list_documents(
        &self.collections.follows,
        &[
          ApiQuery::equal("followerId", follower_id),
          ApiQuery::equal("followingId", following_id),
          ApiQuery::limit(1),
        ],
        "check follow",
      )
      .await?;
    Ok(list.total > 0)
  }
}
