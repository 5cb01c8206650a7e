use thiserror::Error;

use super::backend::BackendError;

/// Failure surfaced by the blog services. Every variant renders a message
/// fit to show the administrator as-is.
#[derive(Debug, Error)]
pub enum BlogError {
    /// A required field is missing or blank. Raised before any remote call.
    #[error("{0}")]
    Validation(String),

    /// Rejected credentials, a missing session, or a write denied by policy.
    #[error("{0}")]
    Auth(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{context}: {source}")]
    Remote {
        context: String,
        #[source]
        source: BackendError,
    },
}

impl BlogError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Network, timeout or 5xx failure that survived the retry envelope.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Remote { source, .. } if source.should_retry())
    }
}

/// `map_err` adapter that labels a backend failure with what was being attempted.
///
/// Policy denials become [`BlogError::Auth`] carrying the remote message verbatim.
pub fn remote(context: &str) -> impl FnOnce(BackendError) -> BlogError + '_ {
    move |source| match source {
        BackendError::Unauthorized(message) => BlogError::Auth(message),
        BackendError::NotFound(message) => BlogError::NotFound(message),
        source => BlogError::Remote {
            context: context.to_string(),
            source,
        },
    }
}
