use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{info, warn};
use uuid::Uuid;

use api_types::{NewsletterDispatch, NewsletterSubscriber, SubscribeOutcome};
use utils::{
    email::{is_valid_email, normalize_email},
    text::excerpt,
};

use super::{
    auth::AuthService,
    backend::{Backend, BackendError, Filter, Query, Returning},
    error::{BlogError, remote},
    posts::PostService,
    retry::{RetryPolicy, with_retry},
};

pub const SUBSCRIBERS_TABLE: &str = "newsletter_subscribers";
pub const SEND_NEWSLETTER_FUNCTION: &str = "send-newsletter";
pub const SEND_CONFIRMATION_FUNCTION: &str = "send-confirmation-email";

const EXCERPT_CHARS: usize = 200;

fn checked_email(email: &str) -> Result<String, BlogError> {
    if email.trim().is_empty() {
        return Err(BlogError::validation("Email is required"));
    }
    if !is_valid_email(email) {
        return Err(BlogError::validation("Please enter a valid email address"));
    }
    Ok(normalize_email(email))
}

/// Subscriber management and broadcast dispatch.
#[derive(Clone)]
pub struct NewsletterService {
    backend: Arc<dyn Backend>,
    auth: AuthService,
    posts: PostService,
    retry: RetryPolicy,
}

impl std::fmt::Debug for NewsletterService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewsletterService").finish_non_exhaustive()
    }
}

impl NewsletterService {
    pub fn new(
        backend: Arc<dyn Backend>,
        auth: AuthService,
        posts: PostService,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            auth,
            posts,
            retry,
        }
    }

    /// Adds the address, or re-activates it if it unsubscribed earlier, then
    /// asks for a confirmation email. The email is best-effort.
    pub async fn subscribe(&self, email: &str) -> Result<SubscribeOutcome, BlogError> {
        let email = checked_email(email)?;

        let row = json!({ "email": email, "is_active": true });
        let inserted = with_retry(&self.retry, "newsletter.insert", || {
            self.backend
                .insert(SUBSCRIBERS_TABLE, row.clone(), Returning::Minimal, None)
        })
        .await;

        let outcome = match inserted {
            Ok(_) => SubscribeOutcome::Subscribed,
            Err(BackendError::Conflict(_)) => {
                self.set_active(&email, true, "Failed to subscribe").await?;
                SubscribeOutcome::Resubscribed
            }
            Err(e) => return Err(remote("Failed to subscribe")(e)),
        };
        info!(?outcome, "Newsletter subscription recorded");

        let body = json!({ "email": email });
        if let Err(e) = with_retry(&self.retry, "newsletter.confirm", || {
            self.backend
                .invoke(SEND_CONFIRMATION_FUNCTION, body.clone(), None)
        })
        .await
        {
            warn!(error = %e, "Failed to send confirmation email");
        }

        Ok(outcome)
    }

    pub async fn unsubscribe(&self, email: &str) -> Result<(), BlogError> {
        let email = checked_email(email)?;
        self.set_active(&email, false, "Failed to unsubscribe").await?;
        info!("Newsletter subscription deactivated");
        Ok(())
    }

    /// Every subscriber, newest first. Admin only.
    pub async fn list_subscribers(&self) -> Result<Vec<NewsletterSubscriber>, BlogError> {
        let session = self.auth.require_session().await?;
        let token = session.access_token.as_str();

        let query = Query::new().order_desc("subscribed_at");
        let selection = with_retry(&self.retry, "newsletter.select", || {
            self.backend.select(SUBSCRIBERS_TABLE, &query, Some(token))
        })
        .await
        .map_err(remote("Failed to load subscribers"))?;
        selection
            .rows
            .into_iter()
            .map(|row| {
                serde_json::from_value(row).map_err(|e| {
                    remote("Failed to load subscribers")(BackendError::from(e))
                })
            })
            .collect()
    }

    /// Emails `post_id` to every active subscriber.
    ///
    /// Sent exactly once: a broadcast that timed out may still have gone out,
    /// so it is never retried.
    pub async fn send_newsletter(&self, post_id: Uuid) -> Result<NewsletterDispatch, BlogError> {
        if post_id.is_nil() {
            return Err(BlogError::validation("Post id is required"));
        }
        let session = self.auth.require_session().await?;
        let post = self.posts.get(post_id).await?;

        let body = json!({
            "post_id": post.id,
            "title": post.title,
            "excerpt": excerpt(&post.story, EXCERPT_CHARS),
            "cover_image_url": post.cover_image_url,
        });
        let response = with_retry(&RetryPolicy::none(), "newsletter.send", || {
            self.backend.invoke(
                SEND_NEWSLETTER_FUNCTION,
                body.clone(),
                Some(&session.access_token),
            )
        })
        .await
        .map_err(remote("Failed to send newsletter"))?;

        let dispatch = match response {
            Value::Null => NewsletterDispatch::default(),
            other => serde_json::from_value(other)
                .map_err(|e| remote("Failed to send newsletter")(BackendError::from(e)))?,
        };
        info!(post_id = %post_id, sent = dispatch.sent, "Newsletter sent");
        Ok(dispatch)
    }

    async fn set_active(&self, email: &str, active: bool, context: &str) -> Result<(), BlogError> {
        let filters = [Filter::eq("email", email)];
        let patch = json!({ "is_active": active });
        with_retry(&self.retry, "newsletter.update", || {
            self.backend.update(
                SUBSCRIBERS_TABLE,
                &filters,
                patch.clone(),
                Returning::Minimal,
                None,
            )
        })
        .await
        .map_err(remote(context))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::services::{
        backend::{MemoryBackend, Operation},
        config::ServiceSettings,
        feed_cache::FeedCache,
        posts::{CreatePost, PhotoUpload},
    };

    fn service() -> (Arc<MemoryBackend>, AuthService, NewsletterService) {
        let backend = Arc::new(MemoryBackend::new().with_admin("admin@example.com", "pw"));
        let settings = ServiceSettings {
            retry: RetryPolicy::none(),
            ..ServiceSettings::default()
        };
        let auth = AuthService::new(backend.clone(), settings.retry);
        let posts = PostService::new(
            backend.clone(),
            auth.clone(),
            Arc::new(FeedCache::default()),
            &settings,
        );
        let newsletter = NewsletterService::new(backend.clone(), auth.clone(), posts, settings.retry);
        (backend, auth, newsletter)
    }

    #[tokio::test]
    async fn rejects_malformed_addresses() {
        let (backend, _, newsletter) = service();
        for bad in ["", "reader", "reader@example", "a b@example.com"] {
            assert!(matches!(
                newsletter.subscribe(bad).await,
                Err(BlogError::Validation(_))
            ));
        }
        assert_eq!(backend.calls(Operation::Insert), 0);
    }

    #[tokio::test]
    async fn resubscribing_reactivates_the_row() {
        let (backend, auth, newsletter) = service();

        assert_eq!(
            newsletter.subscribe(" Reader@Example.com ").await.unwrap(),
            SubscribeOutcome::Subscribed
        );
        newsletter.unsubscribe("reader@example.com").await.unwrap();
        assert_eq!(
            newsletter.subscribe("reader@example.com").await.unwrap(),
            SubscribeOutcome::Resubscribed
        );

        auth.login("admin@example.com", "pw").await.unwrap();
        let subscribers = newsletter.list_subscribers().await.unwrap();
        assert_eq!(subscribers.len(), 1);
        assert_eq!(subscribers[0].email, "reader@example.com");
        assert!(subscribers[0].is_active);

        let confirmations = backend
            .invocations()
            .into_iter()
            .filter(|(name, _)| name == SEND_CONFIRMATION_FUNCTION)
            .count();
        assert_eq!(confirmations, 2);
    }

    #[tokio::test]
    async fn confirmation_failure_does_not_fail_subscribe() {
        let (backend, _, newsletter) = service();
        backend.fail_next(Operation::Invoke, BackendError::Timeout);
        assert_eq!(
            newsletter.subscribe("reader@example.com").await.unwrap(),
            SubscribeOutcome::Subscribed
        );
    }

    #[tokio::test]
    async fn subscriber_list_needs_a_session() {
        let (_, _, newsletter) = service();
        assert!(matches!(
            newsletter.list_subscribers().await,
            Err(BlogError::Auth(_))
        ));
    }

    #[tokio::test]
    async fn broadcast_is_sent_once_with_excerpt() {
        let (backend, auth, newsletter) = service();
        newsletter.subscribe("a@example.com").await.unwrap();
        newsletter.subscribe("b@example.com").await.unwrap();
        newsletter.unsubscribe("b@example.com").await.unwrap();

        auth.login("admin@example.com", "pw").await.unwrap();
        let post = newsletter
            .posts
            .create(CreatePost {
                title: "Trip".into(),
                story: "<p>Hi &amp; welcome</p>".into(),
                photos: vec![PhotoUpload::new("a.jpg", Bytes::from_static(b"jpg"))],
                ..CreatePost::default()
            })
            .await
            .unwrap();

        let dispatch = newsletter.send_newsletter(post.id).await.unwrap();
        assert_eq!(dispatch.sent, 1);

        let (_, body) = backend
            .invocations()
            .into_iter()
            .find(|(name, _)| name == SEND_NEWSLETTER_FUNCTION)
            .unwrap();
        assert_eq!(body["title"], json!("Trip"));
        assert_eq!(body["excerpt"], json!("Hi & welcome"));
        assert_eq!(body["cover_image_url"], json!(post.photo_urls[0]));

        backend.fail_next(
            Operation::Invoke,
            BackendError::Http {
                status: 502,
                message: "bad gateway".into(),
            },
        );
        backend.reset_calls();
        assert!(newsletter.send_newsletter(post.id).await.is_err());
        assert_eq!(backend.calls(Operation::Invoke), 1);
    }
}
