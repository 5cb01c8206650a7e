//! The seam between the blog services and the hosted platform.
//!
//! Every remote capability the blog needs (tables, blob storage, auth and
//! function invocation) is a trait here. [`HttpBackend`] talks to the real
//! platform; [`MemoryBackend`] implements the same contract in-process.

mod http;
mod memory;
mod query;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use api_types::AuthUser;

pub use http::HttpBackend;
pub use memory::{MemoryBackend, Operation};
pub use query::{Filter, Order, Query, Selection};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum BackendError {
    #[error("network error: {0}")]
    Transport(String),
    #[error("timeout")]
    Timeout,
    #[error("http {status}: {message}")]
    Http { status: u16, message: String },
    #[error("{0}")]
    Unauthorized(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("json error: {0}")]
    Serde(String),
    #[error("url error: {0}")]
    Url(String),
}

impl BackendError {
    /// Returns true if the error is transient and should be retried.
    pub fn should_retry(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout => true,
            Self::Http { status, .. } => (500..=599).contains(status),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serde(e.to_string())
    }
}

/// Whether a mutation should echo the affected rows back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Returning {
    Representation,
    Minimal,
}

/// Tokens issued by the auth service for the administrator.
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionGrant {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub user: AuthUser,
}

impl std::fmt::Debug for SessionGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionGrant")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("user", &self.user)
            .finish()
    }
}

/// Table-scoped CRUD. `token` is the caller's access token, `None` for anonymous.
#[async_trait]
pub trait TableStore: Send + Sync {
    async fn select(
        &self,
        table: &str,
        query: &Query,
        token: Option<&str>,
    ) -> Result<Selection, BackendError>;

    /// Returns the inserted row, or `Value::Null` with [`Returning::Minimal`].
    async fn insert(
        &self,
        table: &str,
        row: Value,
        returning: Returning,
        token: Option<&str>,
    ) -> Result<Value, BackendError>;

    async fn update(
        &self,
        table: &str,
        filters: &[Filter],
        patch: Value,
        returning: Returning,
        token: Option<&str>,
    ) -> Result<Vec<Value>, BackendError>;

    async fn delete(
        &self,
        table: &str,
        filters: &[Filter],
        returning: Returning,
        token: Option<&str>,
    ) -> Result<Vec<Value>, BackendError>;
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        data: Bytes,
        content_type: &str,
        token: Option<&str>,
    ) -> Result<(), BackendError>;

    fn public_url(&self, bucket: &str, path: &str) -> String;

    async fn remove(
        &self,
        bucket: &str,
        paths: &[String],
        token: Option<&str>,
    ) -> Result<(), BackendError>;

    async fn download(
        &self,
        bucket: &str,
        path: &str,
        token: Option<&str>,
    ) -> Result<Bytes, BackendError>;
}

#[async_trait]
pub trait AuthApi: Send + Sync {
    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<SessionGrant, BackendError>;

    async fn refresh_session(&self, refresh_token: &str) -> Result<SessionGrant, BackendError>;

    async fn sign_out(&self, access_token: &str) -> Result<(), BackendError>;

    async fn get_user(&self, access_token: &str) -> Result<AuthUser, BackendError>;
}

#[async_trait]
pub trait FunctionApi: Send + Sync {
    async fn invoke(
        &self,
        function: &str,
        body: Value,
        token: Option<&str>,
    ) -> Result<Value, BackendError>;
}

/// Everything the blog needs from the platform.
pub trait Backend: TableStore + BlobStore + AuthApi + FunctionApi {}

impl<T> Backend for T where T: TableStore + BlobStore + AuthApi + FunctionApi {}

/// Recovers the object path from a public URL produced by [`BlobStore::public_url`].
pub fn storage_path_from_url(url: &str, bucket: &str) -> Option<String> {
    let marker = format!("/{bucket}/");
    url.split_once(&marker)
        .map(|(_, path)| path.split(['?', '#']).next().unwrap_or(path).to_string())
        .filter(|path| !path.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        assert!(BackendError::Transport("connection reset".into()).should_retry());
        assert!(BackendError::Timeout.should_retry());
        assert!(
            BackendError::Http {
                status: 503,
                message: "unavailable".into()
            }
            .should_retry()
        );
        assert!(
            !BackendError::Http {
                status: 400,
                message: "bad request".into()
            }
            .should_retry()
        );
        assert!(!BackendError::Unauthorized("denied".into()).should_retry());
        assert!(!BackendError::Conflict("duplicate".into()).should_retry());
        assert!(!BackendError::NotFound("gone".into()).should_retry());
    }

    #[test]
    fn derives_storage_path_from_public_url() {
        let url = "https://demo.example.co/storage/v1/object/public/blog-photos/abc/1700-0-a.jpg";
        assert_eq!(
            storage_path_from_url(url, "blog-photos").as_deref(),
            Some("abc/1700-0-a.jpg")
        );
        assert_eq!(
            storage_path_from_url("https://cdn.example.com/other/a.jpg", "blog-photos"),
            None
        );
        assert_eq!(
            storage_path_from_url(&format!("{url}?width=400"), "blog-photos").as_deref(),
            Some("abc/1700-0-a.jpg")
        );
    }
}
