use std::sync::OnceLock;

use sentry_tracing::{EventFilter, SentryLayer};
use tracing::{Level, Metadata};

static INIT_GUARD: OnceLock<sentry::ClientInitGuard> = OnceLock::new();

#[derive(Clone, Copy, Debug)]
pub enum SentrySource {
    /// The blog's data-access layer embedded in the site.
    Blog,
    SetupCheck,
}

impl SentrySource {
    fn tag(self) -> &'static str {
        match self {
            SentrySource::Blog => "blog",
            SentrySource::SetupCheck => "setup-check",
        }
    }
}

/// Reporting stays off unless `SENTRY_DSN` is set. Returns whether it is on.
pub fn init_once(source: SentrySource) -> bool {
    let Some(dsn) = std::env::var("SENTRY_DSN").ok().filter(|s| !s.is_empty()) else {
        return false;
    };
    let environment = std::env::var("BLOG_ENV")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| if cfg!(debug_assertions) { "dev" } else { "production" }.into());

    INIT_GUARD.get_or_init(|| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                environment: Some(environment.into()),
                send_default_pii: false,
                ..Default::default()
            },
        ))
    });

    sentry::configure_scope(|scope| {
        scope.set_tag("source", source.tag());
    });
    true
}

/// Attaches the signed-in administrator to subsequent events.
pub fn configure_user_scope(user_id: &str, email: Option<&str>) {
    let sentry_user = sentry::User {
        id: Some(user_id.to_string()),
        email: email.map(str::to_string),
        ..Default::default()
    };

    sentry::configure_scope(|scope| {
        scope.set_user(Some(sentry_user));
    });
}

pub fn clear_user_scope() {
    sentry::configure_scope(|scope| {
        scope.set_user(None);
    });
}

/// Errors become events; warnings and info lines ride along as breadcrumbs.
fn level_filter(level: Level) -> EventFilter {
    match level {
        Level::ERROR => EventFilter::Event,
        Level::WARN | Level::INFO => EventFilter::Breadcrumb,
        Level::DEBUG | Level::TRACE => EventFilter::Ignore,
    }
}

pub fn sentry_layer<S>() -> SentryLayer<S>
where
    S: tracing::Subscriber,
    S: for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    SentryLayer::default()
        .span_filter(|_: &Metadata<'_>| false)
        .event_filter(|meta| level_filter(*meta.level()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_errors_are_reported_as_events() {
        assert!(matches!(level_filter(Level::ERROR), EventFilter::Event));
        assert!(matches!(level_filter(Level::WARN), EventFilter::Breadcrumb));
        assert!(matches!(level_filter(Level::INFO), EventFilter::Breadcrumb));
        assert!(matches!(level_filter(Level::DEBUG), EventFilter::Ignore));
        assert!(matches!(level_filter(Level::TRACE), EventFilter::Ignore));
    }
}
