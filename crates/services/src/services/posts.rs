//! Post CRUD, including the photo upload, cover reorder and cleanup protocol.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use api_types::{BlogPost, CoverImagePosition, PostPage};

use super::{
    auth::AuthService,
    backend::{Backend, BackendError, Filter, Query, Returning, storage_path_from_url},
    config::ServiceSettings,
    error::{BlogError, remote},
    feed_cache::FeedCache,
    retry::{RetryPolicy, with_retry},
};

pub const POSTS_TABLE: &str = "posts";

/// A photo file on its way to blob storage.
#[derive(Clone)]
pub struct PhotoUpload {
    pub file_name: String,
    /// Guessed from the file extension when absent.
    pub content_type: Option<String>,
    pub data: Bytes,
}

impl std::fmt::Debug for PhotoUpload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhotoUpload")
            .field("file_name", &self.file_name)
            .field("content_type", &self.content_type)
            .field("len", &self.data.len())
            .finish()
    }
}

impl PhotoUpload {
    pub fn new(file_name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: None,
            data: data.into(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    fn resolved_content_type(&self) -> String {
        self.content_type.clone().unwrap_or_else(|| {
            mime_guess::from_path(&self.file_name)
                .first_or_octet_stream()
                .essence_str()
                .to_string()
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreatePost {
    pub title: String,
    /// HTML from the rich-text editor.
    pub story: String,
    pub photos: Vec<PhotoUpload>,
    /// Index into `photos` of the cover. Out-of-range values fall back to the first photo.
    pub cover_image_index: Option<usize>,
    pub cover_image_position: Option<CoverImagePosition>,
    pub category_ids: Vec<Uuid>,
}

/// Partial update. `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default)]
pub struct UpdatePost {
    pub title: Option<String>,
    pub story: Option<String>,
    /// Replaces the stored list (reorder or removal). Photos dropped here are
    /// deleted from storage once the update lands.
    pub photo_urls: Option<Vec<String>>,
    /// Uploaded and appended after the existing (or replaced) list.
    pub new_photos: Vec<PhotoUpload>,
    /// `Some(None)` clears the cover; `Some(Some(url))` must name one of the resulting photos.
    pub cover_image_url: Option<Option<String>>,
    pub cover_image_position: Option<CoverImagePosition>,
    pub category_ids: Option<Vec<Uuid>>,
}

impl UpdatePost {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.story.is_none()
            && self.photo_urls.is_none()
            && self.new_photos.is_empty()
            && self.cover_image_url.is_none()
            && self.cover_image_position.is_none()
            && self.category_ids.is_none()
    }
}

/// Moves `urls[index]` to the front, keeping the others in order.
/// Returns `false` and leaves `urls` alone when `index` is out of range.
pub fn promote_cover(urls: &mut [String], index: usize) -> bool {
    if index >= urls.len() {
        return false;
    }
    urls[..=index].rotate_right(1);
    true
}

fn storage_file_name(original: &str) -> String {
    let cleaned: String = original
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches(['-', '.']);
    if cleaned.is_empty() {
        "photo".to_string()
    } else {
        cleaned.to_string()
    }
}

fn required_text(value: &str, message: &str) -> Result<(), BlogError> {
    if value.trim().is_empty() {
        Err(BlogError::validation(message))
    } else {
        Ok(())
    }
}

fn parse_post(row: Value, context: &str) -> Result<BlogPost, BlogError> {
    serde_json::from_value(row).map_err(|e| remote(context)(BackendError::from(e)))
}

fn parse_posts(rows: Vec<Value>, context: &str) -> Result<Vec<BlogPost>, BlogError> {
    rows.into_iter().map(|row| parse_post(row, context)).collect()
}

#[derive(Clone)]
pub struct PostService {
    backend: Arc<dyn Backend>,
    auth: AuthService,
    cache: Arc<FeedCache>,
    retry: RetryPolicy,
    bucket: String,
}

impl std::fmt::Debug for PostService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostService")
            .field("bucket", &self.bucket)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl PostService {
    pub fn new(
        backend: Arc<dyn Backend>,
        auth: AuthService,
        cache: Arc<FeedCache>,
        settings: &ServiceSettings,
    ) -> Self {
        Self {
            backend,
            auth,
            cache,
            retry: settings.retry,
            bucket: settings.storage_bucket.clone(),
        }
    }

    pub fn cache(&self) -> &FeedCache {
        &self.cache
    }

    /// Every post, newest first. Served from the feed cache when warm.
    pub async fn list(&self) -> Result<Vec<BlogPost>, BlogError> {
        if let Some(hit) = self.cache.get().await {
            debug!(cached_at = %hit.cached_at, "Feed cache hit");
            return Ok(hit.posts.as_ref().clone());
        }

        let generation = self.cache.generation();
        let query = Query::new().order_desc("created_at");
        let posts = self.select(&query, "Failed to load posts").await?.0;
        if !self.cache.fill(generation, posts.clone()).await {
            debug!("Feed changed while loading, not caching");
        }
        Ok(posts)
    }

    /// One page of the feed, newest first. `page` is zero-based. Never cached.
    pub async fn list_page(&self, page: usize, page_size: usize) -> Result<PostPage, BlogError> {
        if page_size == 0 {
            return Err(BlogError::validation("Page size must be at least 1"));
        }
        let offset = page.saturating_mul(page_size);
        let query = Query::new()
            .order_desc("created_at")
            .range(offset, page_size)
            .exact_count();

        let (posts, count) = self.select(&query, "Failed to load posts").await?;
        let total = count.unwrap_or((offset + posts.len()) as u64);
        let has_more = ((offset + posts.len()) as u64) < total;
        Ok(PostPage {
            posts,
            has_more,
            total,
        })
    }

    /// Posts tagged with `category_id`, newest first. Never cached.
    pub async fn list_by_category(&self, category_id: Uuid) -> Result<Vec<BlogPost>, BlogError> {
        if category_id.is_nil() {
            return Err(BlogError::validation("Category id is required"));
        }
        let query = Query::new()
            .contains("category_ids", &[category_id])
            .order_desc("created_at");
        Ok(self
            .select(&query, "Failed to load posts for category")
            .await?
            .0)
    }

    pub async fn get(&self, id: Uuid) -> Result<BlogPost, BlogError> {
        if id.is_nil() {
            return Err(BlogError::validation("Post id is required"));
        }
        self.fetch(id, None).await
    }

    pub async fn create(&self, input: CreatePost) -> Result<BlogPost, BlogError> {
        required_text(&input.title, "Title is required")?;
        required_text(&input.story, "Story is required")?;
        if input.photos.is_empty() {
            return Err(BlogError::validation("At least one photo is required"));
        }

        let session = self.auth.require_session().await?;
        let token = session.access_token.as_str();

        let row = json!({
            "title": input.title.trim(),
            "story": input.story,
            "photo_urls": [],
            "cover_image_url": null,
            "cover_image_position": input.cover_image_position.unwrap_or_default().clamped(),
            "category_ids": input.category_ids,
        });
        let inserted = with_retry(&self.retry, "posts.insert", || {
            self.backend
                .insert(POSTS_TABLE, row.clone(), Returning::Representation, Some(token))
        })
        .await
        .map_err(remote("Failed to create post"))?;
        let post_id = parse_post(inserted, "Failed to create post")?.id;

        let (mut urls, paths) = match self.upload_photos(post_id, &input.photos, token).await {
            Ok(uploaded) => uploaded,
            Err((e, paths)) => {
                self.roll_back_create(post_id, &paths, token).await;
                return Err(e);
            }
        };

        if let Some(index) = input.cover_image_index
            && !promote_cover(&mut urls, index)
        {
            debug!(post_id = %post_id, index, "Cover index out of range, using first photo");
        }
        let patch = json!({
            "photo_urls": urls,
            "cover_image_url": urls.first(),
        });

        let post = match self.patch(post_id, patch, token, "Failed to save photos").await {
            Ok(post) => post,
            Err(e) => {
                self.roll_back_create(post_id, &paths, token).await;
                return Err(e);
            }
        };

        self.cache.invalidate().await;
        info!(post_id = %post.id, photos = post.photo_urls.len(), "Created post");
        Ok(post)
    }

    pub async fn update(&self, id: Uuid, input: UpdatePost) -> Result<BlogPost, BlogError> {
        if id.is_nil() {
            return Err(BlogError::validation("Post id is required"));
        }
        if input.is_empty() {
            return Err(BlogError::validation("Nothing to update"));
        }
        if let Some(title) = &input.title {
            required_text(title, "Title is required")?;
        }
        if let Some(story) = &input.story {
            required_text(story, "Story is required")?;
        }

        let session = self.auth.require_session().await?;
        let token = session.access_token.as_str();
        let current = self.fetch(id, Some(token)).await?;

        let photos_changed = input.photo_urls.is_some() || !input.new_photos.is_empty();
        let mut urls = input
            .photo_urls
            .clone()
            .unwrap_or_else(|| current.photo_urls.clone());
        if let Some(Some(url)) = &input.cover_image_url
            && !urls.contains(url)
            && input.new_photos.is_empty()
        {
            return Err(BlogError::validation("Cover image must be one of the post's photos"));
        }

        let new_paths = match self.upload_photos(id, &input.new_photos, token).await {
            Ok((uploaded, paths)) => {
                urls.extend(uploaded);
                paths
            }
            Err((e, paths)) => {
                self.remove_blobs(&paths, token).await;
                return Err(e);
            }
        };

        let mut patch = Map::new();
        if let Some(title) = &input.title {
            patch.insert("title".into(), json!(title.trim()));
        }
        if let Some(story) = &input.story {
            patch.insert("story".into(), json!(story));
        }
        match &input.cover_image_url {
            Some(Some(cover)) => {
                let Some(index) = urls.iter().position(|u| u == cover) else {
                    self.remove_blobs(&new_paths, token).await;
                    return Err(BlogError::validation(
                        "Cover image must be one of the post's photos",
                    ));
                };
                promote_cover(&mut urls, index);
                patch.insert("cover_image_url".into(), json!(cover));
            }
            Some(None) => {
                patch.insert("cover_image_url".into(), Value::Null);
            }
            // A replaced list brings its own first photo as cover.
            None if input.photo_urls.is_some() => {
                patch.insert("cover_image_url".into(), json!(urls.first()));
            }
            None => {}
        }
        if photos_changed || matches!(input.cover_image_url, Some(Some(_))) {
            if urls.is_empty() {
                return Err(BlogError::validation("At least one photo is required"));
            }
            patch.insert("photo_urls".into(), json!(urls));
        }
        if let Some(position) = input.cover_image_position {
            patch.insert("cover_image_position".into(), json!(position.clamped()));
        }
        if let Some(category_ids) = &input.category_ids {
            patch.insert("category_ids".into(), json!(category_ids));
        }

        let post = match self
            .patch(id, Value::Object(patch), token, "Failed to update post")
            .await
        {
            Ok(post) => post,
            Err(e) => {
                self.remove_blobs(&new_paths, token).await;
                return Err(e);
            }
        };

        let dropped: Vec<String> = current
            .photo_urls
            .iter()
            .filter(|url| !post.photo_urls.contains(url))
            .filter_map(|url| storage_path_from_url(url, &self.bucket))
            .collect();
        self.remove_blobs(&dropped, token).await;

        self.cache.invalidate().await;
        info!(post_id = %id, "Updated post");
        Ok(post)
    }

    /// Deletes the row and, best-effort, its photos. On failure the post is left as it was.
    pub async fn delete(&self, id: Uuid) -> Result<(), BlogError> {
        if id.is_nil() {
            return Err(BlogError::validation("Post id is required"));
        }
        let session = self.auth.require_session().await?;
        let token = session.access_token.as_str();

        let current = self.fetch(id, Some(token)).await?;
        let paths: Vec<String> = current
            .photo_urls
            .iter()
            .filter_map(|url| storage_path_from_url(url, &self.bucket))
            .collect();
        self.remove_blobs(&paths, token).await;

        let filters = [Filter::eq("id", id)];
        let removed = with_retry(&self.retry, "posts.delete", || {
            self.backend
                .delete(POSTS_TABLE, &filters, Returning::Representation, Some(token))
        })
        .await
        .map_err(remote("Failed to delete post"))?;
        if removed.is_empty() {
            return Err(BlogError::NotFound(format!("Post {id} not found")));
        }

        self.cache.invalidate().await;
        info!(post_id = %id, photos = paths.len(), "Deleted post");
        Ok(())
    }

    async fn select(
        &self,
        query: &Query,
        context: &str,
    ) -> Result<(Vec<BlogPost>, Option<u64>), BlogError> {
        let selection = with_retry(&self.retry, "posts.select", || {
            self.backend.select(POSTS_TABLE, query, None)
        })
        .await
        .map_err(remote(context))?;
        Ok((parse_posts(selection.rows, context)?, selection.count))
    }

    async fn fetch(&self, id: Uuid, token: Option<&str>) -> Result<BlogPost, BlogError> {
        let query = Query::new().eq("id", id).limit(1);
        let selection = with_retry(&self.retry, "posts.get", || {
            self.backend.select(POSTS_TABLE, &query, token)
        })
        .await
        .map_err(remote("Failed to load post"))?;
        let row = selection
            .rows
            .into_iter()
            .next()
            .ok_or_else(|| BlogError::NotFound(format!("Post {id} not found")))?;
        parse_post(row, "Failed to load post")
    }

    async fn patch(
        &self,
        id: Uuid,
        patch: Value,
        token: &str,
        context: &str,
    ) -> Result<BlogPost, BlogError> {
        let filters = [Filter::eq("id", id)];
        let rows = with_retry(&self.retry, "posts.update", || {
            self.backend.update(
                POSTS_TABLE,
                &filters,
                patch.clone(),
                Returning::Representation,
                Some(token),
            )
        })
        .await
        .map_err(remote(context))?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| BlogError::NotFound(format!("Post {id} not found")))?;
        parse_post(row, context)
    }

    /// Uploads sequentially so URLs keep input order. On failure returns the
    /// paths already stored so the caller can clean up.
    async fn upload_photos(
        &self,
        post_id: Uuid,
        photos: &[PhotoUpload],
        token: &str,
    ) -> Result<(Vec<String>, Vec<String>), (BlogError, Vec<String>)> {
        let mut urls = Vec::with_capacity(photos.len());
        let mut paths = Vec::with_capacity(photos.len());
        let stamp = Utc::now().timestamp_millis();
        // Separates batches uploaded to the same post within one millisecond.
        let batch = Uuid::new_v4().simple().to_string();
        let batch = &batch[..8];

        for (index, photo) in photos.iter().enumerate() {
            let path = format!(
                "{post_id}/{stamp}-{batch}-{index}-{}",
                storage_file_name(&photo.file_name)
            );
            let content_type = photo.resolved_content_type();
            let uploaded = with_retry(&self.retry, "storage.upload", || {
                self.backend.upload(
                    &self.bucket,
                    &path,
                    photo.data.clone(),
                    &content_type,
                    Some(token),
                )
            })
            .await;
            if let Err(e) = uploaded {
                return Err((remote("Failed to upload photo")(e), paths));
            }
            urls.push(self.backend.public_url(&self.bucket, &path));
            paths.push(path);
        }

        Ok((urls, paths))
    }

    async fn roll_back_create(&self, post_id: Uuid, paths: &[String], token: &str) {
        self.remove_blobs(paths, token).await;

        let filters = [Filter::eq("id", post_id)];
        if let Err(e) = with_retry(&self.retry, "posts.rollback", || {
            self.backend
                .delete(POSTS_TABLE, &filters, Returning::Minimal, Some(token))
        })
        .await
        {
            warn!(post_id = %post_id, error = %e, "Failed to roll back partially created post");
        }
    }

    async fn remove_blobs(&self, paths: &[String], token: &str) {
        if paths.is_empty() {
            return;
        }
        if let Err(e) = with_retry(&self.retry, "storage.remove", || {
            self.backend.remove(&self.bucket, paths, Some(token))
        })
        .await
        {
            warn!(count = paths.len(), error = %e, "Failed to remove photos from storage");
        }
    }
}
