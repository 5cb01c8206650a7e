//! Verifies a fresh platform project is wired the way the blog expects:
//! tables reachable, bucket present, and anonymous writes refused.

use bytes::Bytes;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tracing::{info, warn};
use uuid::Uuid;

use super::{
    backend::{BackendError, Filter, Query, Returning},
    blog::Blog,
    categories::CATEGORIES_TABLE,
    comments::COMMENTS_TABLE,
    newsletter::SUBSCRIBERS_TABLE,
    posts::POSTS_TABLE,
    retry::with_retry,
};

const PROBE_PREFIX: &str = "setup-check";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Default)]
pub struct SetupReport {
    pub checks: Vec<CheckResult>,
}

impl SetupReport {
    pub fn all_passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|c| !c.passed)
    }

    fn record(&mut self, name: impl Into<String>, passed: bool, detail: impl Into<String>) {
        let check = CheckResult {
            name: name.into(),
            passed,
            detail: detail.into(),
        };
        if check.passed {
            info!(check = %check.name, "{}", check.detail);
        } else {
            warn!(check = %check.name, "{}", check.detail);
        }
        self.checks.push(check);
    }
}

pub struct AdminCredentials {
    pub email: String,
    pub password: SecretString,
}

/// Runs every probe and collects the outcome. Never fails; problems are
/// reported as failed checks.
pub async fn run(blog: &Blog, admin: Option<&AdminCredentials>) -> SetupReport {
    let mut report = SetupReport::default();

    for table in [POSTS_TABLE, CATEGORIES_TABLE, COMMENTS_TABLE] {
        check_public_read(blog, table, &mut report).await;
    }
    check_subscribers_hidden(blog, &mut report).await;
    check_bucket(blog, &mut report).await;
    check_anonymous_insert_denied(
        blog,
        POSTS_TABLE,
        json!({ "title": PROBE_PREFIX, "story": PROBE_PREFIX }),
        &mut report,
    )
    .await;
    check_anonymous_insert_denied(
        blog,
        CATEGORIES_TABLE,
        json!({
            "name": PROBE_PREFIX,
            "slug": format!("{PROBE_PREFIX}-{}", Uuid::new_v4().simple()),
            "color": "#000000",
        }),
        &mut report,
    )
    .await;
    check_anonymous_upload_denied(blog, &mut report).await;

    if let Some(admin) = admin {
        check_admin_login(blog, admin, &mut report).await;
    }

    report
}

async fn check_public_read(blog: &Blog, table: &str, report: &mut SetupReport) {
    let backend = blog.backend();
    let query = Query::new().limit(1);
    let name = format!("read {table}");
    match with_retry(&blog.settings().retry, "setup.read", || {
        backend.select(table, &query, None)
    })
    .await
    {
        Ok(_) => report.record(name, true, format!("{table} is publicly readable")),
        Err(e) => report.record(name, false, format!("cannot read {table}: {e}")),
    }
}

async fn check_subscribers_hidden(blog: &Blog, report: &mut SetupReport) {
    let backend = blog.backend();
    let query = Query::new().limit(1);
    let name = "subscribers private";
    match with_retry(&blog.settings().retry, "setup.read", || {
        backend.select(SUBSCRIBERS_TABLE, &query, None)
    })
    .await
    {
        Ok(selection) if selection.rows.is_empty() => {
            report.record(name, true, "subscribers are hidden from anonymous readers")
        }
        Ok(_) => report.record(
            name,
            false,
            "subscriber emails are readable without signing in",
        ),
        Err(BackendError::Unauthorized(_)) => {
            report.record(name, true, "subscribers are hidden from anonymous readers")
        }
        Err(e) => report.record(name, false, format!("cannot query subscribers: {e}")),
    }
}

async fn check_bucket(blog: &Blog, report: &mut SetupReport) {
    let backend = blog.backend();
    let bucket = &blog.settings().storage_bucket;
    let path = format!("{PROBE_PREFIX}/{}.txt", Uuid::new_v4());
    let name = "storage bucket";
    match with_retry(&blog.settings().retry, "setup.bucket", || {
        backend.download(bucket, &path, None)
    })
    .await
    {
        // A missing object in an existing bucket is the expected answer.
        Ok(_) => report.record(name, true, format!("bucket '{bucket}' is reachable")),
        Err(BackendError::NotFound(message)) if !message.to_lowercase().contains("bucket") => {
            report.record(name, true, format!("bucket '{bucket}' is reachable"))
        }
        Err(e) => report.record(name, false, format!("bucket '{bucket}' unavailable: {e}")),
    }
}

async fn check_anonymous_insert_denied(
    blog: &Blog,
    table: &str,
    row: Value,
    report: &mut SetupReport,
) {
    let backend = blog.backend();
    let name = format!("{table} write protected");
    match backend
        .insert(table, row, Returning::Representation, None)
        .await
    {
        Err(BackendError::Unauthorized(_)) => report.record(
            name,
            true,
            format!("anonymous inserts into {table} are refused"),
        ),
        Ok(inserted) => {
            if let Some(id) = inserted.get("id").cloned() {
                let filters = [Filter::eq("id", id)];
                if let Err(e) = backend
                    .delete(table, &filters, Returning::Minimal, None)
                    .await
                {
                    warn!(table, error = %e, "Failed to remove probe row");
                }
            }
            report.record(
                name,
                false,
                format!("anonymous inserts into {table} are allowed; enable row-level security"),
            );
        }
        Err(e) => report.record(name, false, format!("unexpected error probing {table}: {e}")),
    }
}

async fn check_anonymous_upload_denied(blog: &Blog, report: &mut SetupReport) {
    let backend = blog.backend();
    let bucket = &blog.settings().storage_bucket;
    let path = format!("{PROBE_PREFIX}/{}.txt", Uuid::new_v4());
    let name = "storage write protected";
    match backend
        .upload(bucket, &path, Bytes::from_static(b"probe"), "text/plain", None)
        .await
    {
        Err(BackendError::Unauthorized(_)) => {
            report.record(name, true, "anonymous uploads are refused")
        }
        Ok(()) => {
            if let Err(e) = backend.remove(bucket, &[path], None).await {
                warn!(error = %e, "Failed to remove probe object");
            }
            report.record(name, false, "anonymous uploads are allowed; restrict the bucket policy");
        }
        Err(e) => report.record(name, false, format!("unexpected error probing storage: {e}")),
    }
}

async fn check_admin_login(blog: &Blog, admin: &AdminCredentials, report: &mut SetupReport) {
    let auth = blog.auth();
    let name = "admin login";
    match auth
        .login(&admin.email, admin.password.expose_secret())
        .await
    {
        Ok(session) => {
            let detail = format!(
                "signed in as {}",
                session.user.email.as_deref().unwrap_or("administrator")
            );
            if let Err(e) = auth.logout().await {
                warn!(error = %e, "Failed to sign out after login probe");
            }
            report.record(name, true, detail);
        }
        Err(e) => report.record(name, false, format!("login failed: {e}")),
    }
}
