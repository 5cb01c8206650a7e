//! Administrator session lifecycle over the platform's auth service.

use std::sync::{Arc, Weak};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::{
    sync::{Mutex, RwLock, broadcast, broadcast::error::RecvError},
    task::JoinHandle,
};
use tracing::{info, warn};

use api_types::AuthUser;

use super::{
    backend::{Backend, BackendError, SessionGrant},
    error::{BlogError, remote},
    retry::{RetryPolicy, with_retry},
};

const NOT_AUTHENTICATED: &str = "You must be signed in as the administrator";
const EVENT_BUFFER: usize = 16;

/// The administrator's live session.
#[derive(Clone)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub user: AuthUser,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("user", &self.user)
            .finish()
    }
}

impl Session {
    pub fn expires_soon(&self, leeway: ChronoDuration) -> bool {
        Utc::now() + leeway >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

impl From<SessionGrant> for Session {
    fn from(grant: SessionGrant) -> Self {
        Self {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token,
            expires_at: grant.expires_at,
            user: grant.user,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEvent {
    /// Delivered once, right after subscribing.
    InitialSession,
    SignedIn,
    SignedOut,
    TokenRefreshed,
}

#[derive(Debug, Clone)]
struct AuthStateChange {
    event: AuthEvent,
    user: Option<AuthUser>,
}

/// Handle returned by [`AuthService::on_session_change`]. Dropping it unsubscribes.
#[must_use = "dropping the subscription unsubscribes immediately"]
pub struct SessionSubscription {
    task: JoinHandle<()>,
}

impl SessionSubscription {
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for SessionSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct AuthInner {
    backend: Arc<dyn Backend>,
    retry: RetryPolicy,
    session: RwLock<Option<Session>>,
    refresh_guard: Mutex<()>,
    events: broadcast::Sender<AuthStateChange>,
}

/// Login, logout and session observation for the single administrator.
#[derive(Clone)]
pub struct AuthService {
    inner: Arc<AuthInner>,
}

impl std::fmt::Debug for AuthService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthService")
            .field("retry", &self.inner.retry)
            .finish_non_exhaustive()
    }
}

impl AuthService {
    const REFRESH_LEEWAY_SECS: i64 = 20;

    pub fn new(backend: Arc<dyn Backend>, retry: RetryPolicy) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(AuthInner {
                backend,
                retry,
                session: RwLock::new(None),
                refresh_guard: Mutex::new(()),
                events,
            }),
        }
    }

    fn leeway() -> ChronoDuration {
        ChronoDuration::seconds(Self::REFRESH_LEEWAY_SECS)
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<Session, BlogError> {
        let email = email.trim();
        if email.is_empty() {
            return Err(BlogError::validation("Email is required"));
        }
        if password.is_empty() {
            return Err(BlogError::validation("Password is required"));
        }

        let backend = &self.inner.backend;
        let grant = with_retry(&self.inner.retry, "auth.login", || {
            backend.sign_in_with_password(email, password)
        })
        .await
        .map_err(|e| match e {
            BackendError::Unauthorized(message) => BlogError::Auth(message),
            other => remote("Login failed")(other),
        })?;

        let session = Session::from(grant);
        *self.inner.session.write().await = Some(session.clone());

        utils::sentry::configure_user_scope(
            &session.user.id.to_string(),
            session.user.email.as_deref(),
        );
        info!(user_id = %session.user.id, "Administrator signed in");
        self.emit(AuthEvent::SignedIn, Some(session.user.clone()));
        Ok(session)
    }

    /// Ends the session. A token the service already considers dead counts as
    /// signed out; any other failure leaves the session in place.
    pub async fn logout(&self) -> Result<(), BlogError> {
        let current = self.inner.session.read().await.clone();

        if let Some(session) = current {
            let backend = &self.inner.backend;
            let token = session.access_token.as_str();
            match with_retry(&self.inner.retry, "auth.logout", || backend.sign_out(token)).await {
                Ok(()) => {}
                Err(BackendError::Unauthorized(message)) => {
                    warn!(error = %message, "Session already invalid at sign-out");
                }
                Err(e) => return Err(remote("Failed to sign out")(e)),
            }
        }

        self.clear_session().await;
        info!("Administrator signed out");
        Ok(())
    }

    /// The active session, refreshed if it is about to expire.
    ///
    /// Never fails: retrieval problems are logged and reported as no session.
    pub async fn get_current_session(&self) -> Option<Session> {
        match self.live_session().await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "Failed to retrieve current session");
                None
            }
        }
    }

    /// Fails with [`BlogError::Auth`] unless an administrator is signed in.
    /// Every mutating service call goes through here first.
    pub async fn require_session(&self) -> Result<Session, BlogError> {
        self.live_session()
            .await?
            .ok_or_else(|| BlogError::Auth(NOT_AUTHENTICATED.to_string()))
    }

    pub async fn is_authenticated(&self) -> bool {
        self.get_current_session().await.is_some()
    }

    /// Admin mode is on exactly when a usable session is present.
    pub async fn is_admin_mode(&self) -> bool {
        self.is_authenticated().await
    }

    /// Asks the auth service who the current token belongs to.
    pub async fn current_user(&self) -> Result<Option<AuthUser>, BlogError> {
        let Some(session) = self.live_session().await? else {
            return Ok(None);
        };
        let backend = &self.inner.backend;
        let token = session.access_token.as_str();
        let user = with_retry(&self.inner.retry, "auth.get_user", || backend.get_user(token))
            .await
            .map_err(remote("Failed to fetch user"))?;
        Ok(Some(user))
    }

    /// Exchanges the refresh token for a new session regardless of expiry.
    pub async fn refresh_session(&self) -> Result<Session, BlogError> {
        self.refresh(true).await
    }

    /// Calls `callback` on every sign-in, sign-out, token refresh and expiry,
    /// starting with the current state. Must be called inside a tokio runtime.
    pub fn on_session_change<F>(&self, callback: F) -> SessionSubscription
    where
        F: Fn(AuthEvent, Option<AuthUser>) + Send + Sync + 'static,
    {
        let mut rx = self.inner.events.subscribe();
        let inner: Weak<AuthInner> = Arc::downgrade(&self.inner);

        let task = tokio::spawn(async move {
            let initial = match inner.upgrade() {
                Some(inner) => inner.session.read().await.as_ref().map(|s| s.user.clone()),
                None => return,
            };
            callback(AuthEvent::InitialSession, initial);

            loop {
                match rx.recv().await {
                    Ok(change) => callback(change.event, change.user),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Session listener fell behind");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        SessionSubscription { task }
    }

    async fn live_session(&self) -> Result<Option<Session>, BlogError> {
        let Some(current) = self.inner.session.read().await.clone() else {
            return Ok(None);
        };
        if !current.expires_soon(Self::leeway()) {
            return Ok(Some(current));
        }

        match self.refresh(false).await {
            Ok(session) => Ok(Some(session)),
            Err(BlogError::Auth(_)) => Ok(None),
            // Still usable for a few seconds; try again on the next call.
            Err(e) if !current.is_expired() => {
                warn!(error = %e, "Session refresh failed, using current token");
                Ok(Some(current))
            }
            Err(e) => {
                warn!(error = %e, "Session expired and could not be refreshed, signing out");
                self.clear_session().await;
                Ok(None)
            }
        }
    }

    async fn refresh(&self, force: bool) -> Result<Session, BlogError> {
        let _refresh_guard = self.inner.refresh_guard.lock().await;

        let latest = self
            .inner
            .session
            .read()
            .await
            .clone()
            .ok_or_else(|| BlogError::Auth(NOT_AUTHENTICATED.to_string()))?;
        if !force && !latest.expires_soon(Self::leeway()) {
            return Ok(latest);
        }

        let backend = &self.inner.backend;
        let refresh_token = latest.refresh_token.as_str();
        match with_retry(&self.inner.retry, "auth.refresh", || {
            backend.refresh_session(refresh_token)
        })
        .await
        {
            Ok(grant) => {
                let session = Session::from(grant);
                *self.inner.session.write().await = Some(session.clone());
                self.emit(AuthEvent::TokenRefreshed, Some(session.user.clone()));
                Ok(session)
            }
            Err(BackendError::Unauthorized(message)) => {
                warn!(error = %message, "Refresh token rejected, signing out");
                self.clear_session().await;
                Err(BlogError::Auth(message))
            }
            Err(e) => Err(remote("Failed to refresh session")(e)),
        }
    }

    async fn clear_session(&self) {
        let previous = self.inner.session.write().await.take();
        if previous.is_some() {
            utils::sentry::clear_user_scope();
            self.emit(AuthEvent::SignedOut, None);
        }
    }

    fn emit(&self, event: AuthEvent, user: Option<AuthUser>) {
        // No receivers is fine.
        let _ = self.inner.events.send(AuthStateChange { event, user });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::services::backend::{MemoryBackend, Operation};

    const EMAIL: &str = "admin@example.com";
    const PASSWORD: &str = "correct horse";

    async fn next(
        rx: &mut mpsc::UnboundedReceiver<(AuthEvent, Option<String>)>,
    ) -> (AuthEvent, Option<String>) {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    fn service() -> (Arc<MemoryBackend>, AuthService) {
        let backend = Arc::new(MemoryBackend::new().with_admin(EMAIL, PASSWORD));
        let auth = AuthService::new(backend.clone(), RetryPolicy::none());
        (backend, auth)
    }

    #[tokio::test]
    async fn login_stores_session() {
        let (_, auth) = service();
        assert!(!auth.is_authenticated().await);

        let session = auth.login(EMAIL, PASSWORD).await.unwrap();
        assert_eq!(session.user.email.as_deref(), Some(EMAIL));
        assert!(auth.is_admin_mode().await);
        assert_eq!(
            auth.get_current_session().await.unwrap().access_token,
            session.access_token
        );
    }

    #[tokio::test]
    async fn rejected_credentials_carry_remote_message() {
        let (_, auth) = service();
        let err = auth.login(EMAIL, "wrong").await.unwrap_err();
        assert!(matches!(err, BlogError::Auth(ref m) if m == "Invalid login credentials"));
        assert!(auth.get_current_session().await.is_none());
    }

    #[tokio::test]
    async fn login_without_a_session_is_an_auth_error() {
        use secrecy::SecretString;
        use serde_json::json;
        use wiremock::{
            Mock, MockServer, ResponseTemplate,
            matchers::{method, path},
        };

        use crate::services::backend::HttpBackend;

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "user": null, "session": null })),
            )
            .mount(&server)
            .await;
        let backend = HttpBackend::new(
            &server.uri(),
            SecretString::new("anon-key".into()),
            Duration::from_secs(5),
        )
        .unwrap();
        let auth = AuthService::new(Arc::new(backend), RetryPolicy::none());

        let err = auth.login(EMAIL, PASSWORD).await.unwrap_err();
        assert!(matches!(err, BlogError::Auth(ref m) if m == "No session returned"));
        assert!(!auth.is_authenticated().await);
    }

    #[tokio::test]
    async fn blank_credentials_never_reach_the_backend() {
        let (backend, auth) = service();
        assert!(matches!(
            auth.login("  ", PASSWORD).await,
            Err(BlogError::Validation(_))
        ));
        assert!(matches!(
            auth.login(EMAIL, "").await,
            Err(BlogError::Validation(_))
        ));
        assert_eq!(backend.calls(Operation::SignIn), 0);
    }

    #[tokio::test]
    async fn logout_failure_keeps_session() {
        let (backend, auth) = service();
        auth.login(EMAIL, PASSWORD).await.unwrap();

        backend.fail_next(
            Operation::SignOut,
            BackendError::Http {
                status: 500,
                message: "boom".into(),
            },
        );
        assert!(auth.logout().await.is_err());
        assert!(auth.is_authenticated().await);

        auth.logout().await.unwrap();
        assert!(!auth.is_authenticated().await);
        assert!(matches!(
            auth.require_session().await,
            Err(BlogError::Auth(_))
        ));
    }

    #[tokio::test]
    async fn expiring_session_is_refreshed() {
        let backend = Arc::new(
            MemoryBackend::new()
                .with_admin(EMAIL, PASSWORD)
                .with_session_ttl(ChronoDuration::seconds(5)),
        );
        let auth = AuthService::new(backend.clone(), RetryPolicy::none());
        let first = auth.login(EMAIL, PASSWORD).await.unwrap();

        let current = auth.get_current_session().await.unwrap();
        assert_ne!(current.access_token, first.access_token);
        assert_eq!(backend.calls(Operation::Refresh), 1);
    }

    #[tokio::test]
    async fn dead_refresh_token_signs_out() {
        let (backend, auth) = service();
        auth.login(EMAIL, PASSWORD).await.unwrap();
        backend.fail_next(
            Operation::Refresh,
            BackendError::Unauthorized("Invalid Refresh Token".into()),
        );

        assert!(auth.refresh_session().await.is_err());
        assert!(auth.get_current_session().await.is_none());
    }

    #[tokio::test]
    async fn expired_session_that_cannot_refresh_signs_out() {
        let backend = Arc::new(
            MemoryBackend::new()
                .with_admin(EMAIL, PASSWORD)
                .with_session_ttl(ChronoDuration::seconds(-5)),
        );
        let auth = AuthService::new(backend.clone(), RetryPolicy::none());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _subscription = auth.on_session_change(move |event, user| {
            let _ = tx.send((event, user.and_then(|u| u.email)));
        });
        assert_eq!(next(&mut rx).await.0, AuthEvent::InitialSession);

        auth.login(EMAIL, PASSWORD).await.unwrap();
        assert_eq!(next(&mut rx).await.0, AuthEvent::SignedIn);
        backend.fail_next(Operation::Refresh, BackendError::Timeout);

        assert!(!auth.is_authenticated().await);
        assert!(!auth.is_admin_mode().await);
        assert!(auth.get_current_session().await.is_none());
        assert!(matches!(
            auth.require_session().await,
            Err(BlogError::Auth(_))
        ));
        assert_eq!(next(&mut rx).await, (AuthEvent::SignedOut, None));
    }

    #[tokio::test]
    async fn listeners_see_initial_state_and_changes() {
        let (_, auth) = service();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = auth.on_session_change(move |event, user| {
            let _ = tx.send((event, user.and_then(|u| u.email)));
        });

        assert_eq!(next(&mut rx).await, (AuthEvent::InitialSession, None));

        auth.login(EMAIL, PASSWORD).await.unwrap();
        assert_eq!(
            next(&mut rx).await,
            (AuthEvent::SignedIn, Some(EMAIL.to_string()))
        );

        auth.logout().await.unwrap();
        assert_eq!(next(&mut rx).await, (AuthEvent::SignedOut, None));

        subscription.unsubscribe();
        auth.login(EMAIL, PASSWORD).await.unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(100), rx.recv())
                .await
                .map_or(true, |msg| msg.is_none())
        );
    }
}
