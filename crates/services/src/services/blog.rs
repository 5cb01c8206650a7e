use std::sync::Arc;

use super::{
    auth::AuthService,
    backend::{Backend, BackendError, HttpBackend},
    categories::CategoryService,
    comments::CommentService,
    config::{BlogConfig, ServiceSettings},
    feed_cache::FeedCache,
    newsletter::NewsletterService,
    posts::PostService,
};

/// Every blog service wired to one backend and one admin session.
#[derive(Clone)]
pub struct Blog {
    backend: Arc<dyn Backend>,
    settings: ServiceSettings,
    auth: AuthService,
    posts: PostService,
    categories: CategoryService,
    comments: CommentService,
    newsletter: NewsletterService,
}

impl std::fmt::Debug for Blog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blog")
            .field("settings", &self.settings)
            .field("posts", &self.posts)
            .finish_non_exhaustive()
    }
}

impl Blog {
    pub fn new(backend: Arc<dyn Backend>, settings: ServiceSettings) -> Self {
        let auth = AuthService::new(backend.clone(), settings.retry);
        let cache = Arc::new(FeedCache::new(settings.feed_cache_ttl));
        let posts = PostService::new(backend.clone(), auth.clone(), cache, &settings);
        let categories = CategoryService::new(backend.clone(), auth.clone(), settings.retry);
        let comments = CommentService::new(backend.clone(), auth.clone(), settings.retry);
        let newsletter =
            NewsletterService::new(backend.clone(), auth.clone(), posts.clone(), settings.retry);

        Self {
            backend,
            settings,
            auth,
            posts,
            categories,
            comments,
            newsletter,
        }
    }

    /// Talks to the hosted platform over HTTP.
    pub fn from_config(config: &BlogConfig) -> Result<Self, BackendError> {
        let backend = HttpBackend::new(
            &config.backend_url,
            config.anon_key.clone(),
            config.request_timeout,
        )?;
        Ok(Self::new(Arc::new(backend), config.settings.clone()))
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    pub fn auth(&self) -> &AuthService {
        &self.auth
    }

    pub fn posts(&self) -> &PostService {
        &self.posts
    }

    pub fn categories(&self) -> &CategoryService {
        &self.categories
    }

    pub fn comments(&self) -> &CommentService {
        &self.comments
    }

    pub fn newsletter(&self) -> &NewsletterService {
        &self.newsletter
    }
}
