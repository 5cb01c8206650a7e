use std::sync::Arc;

use serde_json::{Value, json};
use tracing::info;
use uuid::Uuid;

use api_types::{Comment, CreateCommentRequest};

use super::{
    auth::AuthService,
    backend::{Backend, BackendError, Filter, Query, Returning},
    error::{BlogError, remote},
    retry::{RetryPolicy, with_retry},
};

pub const COMMENTS_TABLE: &str = "comments";

const MAX_AUTHOR_CHARS: usize = 100;
const MAX_CONTENT_CHARS: usize = 2000;

fn parse_comment(row: Value, context: &str) -> Result<Comment, BlogError> {
    serde_json::from_value(row).map_err(|e| remote(context)(BackendError::from(e)))
}

/// Reader comments. Anyone may read, add and delete; the admin token is sent
/// along when present.
#[derive(Clone)]
pub struct CommentService {
    backend: Arc<dyn Backend>,
    auth: AuthService,
    retry: RetryPolicy,
}

impl std::fmt::Debug for CommentService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommentService").finish_non_exhaustive()
    }
}

impl CommentService {
    pub fn new(backend: Arc<dyn Backend>, auth: AuthService, retry: RetryPolicy) -> Self {
        Self {
            backend,
            auth,
            retry,
        }
    }

    /// Comments on one post, oldest first.
    pub async fn list_for_post(&self, post_id: Uuid) -> Result<Vec<Comment>, BlogError> {
        if post_id.is_nil() {
            return Err(BlogError::validation("Post id is required"));
        }
        let query = Query::new()
            .eq("post_id", post_id)
            .order_asc("created_at");
        let selection = with_retry(&self.retry, "comments.select", || {
            self.backend.select(COMMENTS_TABLE, &query, None)
        })
        .await
        .map_err(remote("Failed to load comments"))?;
        selection
            .rows
            .into_iter()
            .map(|row| parse_comment(row, "Failed to load comments"))
            .collect()
    }

    pub async fn add(&self, request: CreateCommentRequest) -> Result<Comment, BlogError> {
        if request.post_id.is_nil() {
            return Err(BlogError::validation("Post id is required"));
        }
        let author = request.author_name.trim();
        let content = request.content.trim();
        if author.is_empty() {
            return Err(BlogError::validation("Name is required"));
        }
        if content.is_empty() {
            return Err(BlogError::validation("Comment is required"));
        }
        if author.chars().count() > MAX_AUTHOR_CHARS {
            return Err(BlogError::validation(format!(
                "Name must be at most {MAX_AUTHOR_CHARS} characters"
            )));
        }
        if content.chars().count() > MAX_CONTENT_CHARS {
            return Err(BlogError::validation(format!(
                "Comment must be at most {MAX_CONTENT_CHARS} characters"
            )));
        }

        let token = self.token().await;
        let row = json!({
            "post_id": request.post_id,
            "author_name": author,
            "content": content,
        });
        let inserted = with_retry(&self.retry, "comments.insert", || {
            self.backend.insert(
                COMMENTS_TABLE,
                row.clone(),
                Returning::Representation,
                token.as_deref(),
            )
        })
        .await
        .map_err(remote("Failed to add comment"))?;

        let comment = parse_comment(inserted, "Failed to add comment")?;
        info!(comment_id = %comment.id, post_id = %comment.post_id, "Added comment");
        Ok(comment)
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), BlogError> {
        if id.is_nil() {
            return Err(BlogError::validation("Comment id is required"));
        }
        let token = self.token().await;
        let filters = [Filter::eq("id", id)];
        let removed = with_retry(&self.retry, "comments.delete", || {
            self.backend.delete(
                COMMENTS_TABLE,
                &filters,
                Returning::Representation,
                token.as_deref(),
            )
        })
        .await
        .map_err(remote("Failed to delete comment"))?;
        if removed.is_empty() {
            return Err(BlogError::NotFound(format!("Comment {id} not found")));
        }
        info!(comment_id = %id, "Deleted comment");
        Ok(())
    }

    async fn token(&self) -> Option<String> {
        self.auth
            .get_current_session()
            .await
            .map(|session| session.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::backend::{MemoryBackend, Operation};

    fn service() -> (Arc<MemoryBackend>, CommentService) {
        let backend = Arc::new(MemoryBackend::new());
        let auth = AuthService::new(backend.clone(), RetryPolicy::none());
        let comments = CommentService::new(backend.clone(), auth, RetryPolicy::none());
        (backend, comments)
    }

    fn comment(post_id: Uuid, author: &str, content: &str) -> CreateCommentRequest {
        CreateCommentRequest {
            post_id,
            author_name: author.into(),
            content: content.into(),
        }
    }

    #[tokio::test]
    async fn anonymous_readers_can_comment_in_order() {
        let (_, comments) = service();
        let post_id = Uuid::new_v4();
        let other = Uuid::new_v4();

        comments.add(comment(post_id, "Ana", "first")).await.unwrap();
        comments.add(comment(other, "Bo", "elsewhere")).await.unwrap();
        comments
            .add(comment(post_id, " Cy ", " second "))
            .await
            .unwrap();

        let listed = comments.list_for_post(post_id).await.unwrap();
        let contents: Vec<_> = listed.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents, ["first", "second"]);
        assert_eq!(listed[1].author_name, "Cy");
    }

    #[tokio::test]
    async fn blank_fields_never_reach_the_backend() {
        let (backend, comments) = service();
        let post_id = Uuid::new_v4();

        for bad in [
            comment(post_id, "", "text"),
            comment(post_id, "Ana", "   "),
            comment(Uuid::nil(), "Ana", "text"),
            comment(post_id, "Ana", &"x".repeat(MAX_CONTENT_CHARS + 1)),
        ] {
            assert!(matches!(
                comments.add(bad).await,
                Err(BlogError::Validation(_))
            ));
        }
        assert_eq!(backend.calls(Operation::Insert), 0);
    }

    #[tokio::test]
    async fn delete_removes_one_comment() {
        let (_, comments) = service();
        let post_id = Uuid::new_v4();
        let added = comments.add(comment(post_id, "Ana", "hi")).await.unwrap();

        comments.delete(added.id).await.unwrap();
        assert!(comments.list_for_post(post_id).await.unwrap().is_empty());
        assert!(matches!(
            comments.delete(added.id).await,
            Err(BlogError::NotFound(_))
        ));
    }
}
