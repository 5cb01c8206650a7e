use std::{
    cmp::Ordering,
    collections::{HashMap, VecDeque},
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use api_types::{AuthUser, CoverImagePosition};

use super::{
    AuthApi, BackendError, BlobStore, Filter, FunctionApi, Query, Returning, Selection,
    SessionGrant, TableStore,
};

const PUBLIC_URL_BASE: &str = "memory://storage/v1/object/public";

/// Remote calls counted by [`MemoryBackend::calls`] and targeted by
/// [`MemoryBackend::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Select,
    Insert,
    Update,
    Delete,
    Upload,
    Remove,
    Download,
    SignIn,
    Refresh,
    SignOut,
    GetUser,
    Invoke,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Insert,
    Update,
    Delete,
}

type Row = Map<String, Value>;

struct Account {
    user: AuthUser,
    password: String,
}

struct LiveSession {
    user: AuthUser,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    tables: HashMap<String, Vec<Row>>,
    blobs: HashMap<(String, String), (Bytes, String)>,
    accounts: Vec<Account>,
    sessions: HashMap<String, LiveSession>,
    refresh_tokens: HashMap<String, String>,
    invocations: Vec<(String, Value)>,
    calls: HashMap<Operation, usize>,
    /// `None` entries let a call through.
    faults: HashMap<Operation, VecDeque<Option<BackendError>>>,
    last_stamp: Option<DateTime<Utc>>,
}

/// In-process stand-in for the hosted platform.
///
/// Applies the same access policy the platform enforces server-side: anyone
/// may read posts, categories and comments; writes to posts, categories and
/// storage need a live session; comments take anonymous inserts and deletes;
/// newsletter subscribers take anonymous inserts and updates but are only
/// readable with a session.
pub struct MemoryBackend {
    state: Mutex<State>,
    session_ttl: ChronoDuration,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let mut state = State::default();
        for table in ["posts", "categories", "comments", "newsletter_subscribers"] {
            state.tables.insert(table.to_string(), Vec::new());
        }
        Self {
            state: Mutex::new(state),
            session_ttl: ChronoDuration::hours(1),
        }
    }

    /// Registers the single administrator account.
    pub fn with_admin(self, email: &str, password: &str) -> Self {
        self.lock().accounts.push(Account {
            user: AuthUser {
                id: Uuid::new_v4(),
                email: Some(email.to_string()),
            },
            password: password.to_string(),
        });
        self
    }

    pub fn with_session_ttl(mut self, ttl: ChronoDuration) -> Self {
        self.session_ttl = ttl;
        self
    }

    /// Number of calls made for `op` since creation or the last [`reset_calls`](Self::reset_calls).
    pub fn calls(&self, op: Operation) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn reset_calls(&self) {
        self.lock().calls.clear();
    }

    /// Makes the next call of `op` fail with `error`.
    pub fn fail_next(&self, op: Operation, error: BackendError) {
        self.fail_times(op, error, 1);
    }

    pub fn fail_times(&self, op: Operation, error: BackendError, times: usize) {
        let mut state = self.lock();
        let queue = state.faults.entry(op).or_default();
        queue.extend(std::iter::repeat_n(Some(error), times));
    }

    /// Lets `successes` calls of `op` through, then fails the next one.
    pub fn fail_after(&self, op: Operation, successes: usize, error: BackendError) {
        let mut state = self.lock();
        let queue = state.faults.entry(op).or_default();
        queue.extend(std::iter::repeat_n(None, successes));
        queue.push_back(Some(error));
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.lock()
            .tables
            .get(table)
            .map(|rows| rows.iter().cloned().map(Value::Object).collect())
            .unwrap_or_default()
    }

    pub fn blob_exists(&self, bucket: &str, path: &str) -> bool {
        self.lock()
            .blobs
            .contains_key(&(bucket.to_string(), path.to_string()))
    }

    pub fn blob_count(&self, bucket: &str) -> usize {
        self.lock()
            .blobs
            .keys()
            .filter(|(b, _)| b == bucket)
            .count()
    }

    pub fn invocations(&self) -> Vec<(String, Value)> {
        self.lock().invocations.clone()
    }

    /// Forces every issued access token past its expiry.
    pub fn expire_sessions(&self) {
        let past = Utc::now() - ChronoDuration::seconds(1);
        for session in self.lock().sessions.values_mut() {
            session.expires_at = past;
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Counts the call and pops any injected failure.
    fn enter(&self, op: Operation) -> Result<MutexGuard<'_, State>, BackendError> {
        let mut state = self.lock();
        *state.calls.entry(op).or_default() += 1;
        if let Some(Some(error)) = state.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            return Err(error);
        }
        Ok(state)
    }

    fn issue_grant(&self, state: &mut State, user: AuthUser) -> SessionGrant {
        let access_token = Uuid::new_v4().to_string();
        let refresh_token = Uuid::new_v4().to_string();
        let expires_at = Utc::now() + self.session_ttl;
        state.sessions.insert(
            access_token.clone(),
            LiveSession {
                user: user.clone(),
                expires_at,
            },
        );
        state
            .refresh_tokens
            .insert(refresh_token.clone(), access_token.clone());
        SessionGrant {
            access_token,
            refresh_token,
            expires_at,
            user,
        }
    }
}

impl State {
    /// `Ok(true)` for a live session, `Ok(false)` for anonymous callers.
    fn authenticate(&self, token: Option<&str>) -> Result<bool, BackendError> {
        let Some(token) = token else {
            return Ok(false);
        };
        match self.sessions.get(token) {
            Some(session) if session.expires_at > Utc::now() => Ok(true),
            Some(_) => Err(BackendError::Unauthorized("JWT expired".into())),
            None => Err(BackendError::Unauthorized("invalid JWT".into())),
        }
    }

    fn table(&mut self, table: &str) -> Result<&mut Vec<Row>, BackendError> {
        self.tables.get_mut(table).ok_or_else(|| {
            BackendError::NotFound(format!("relation \"public.{table}\" does not exist"))
        })
    }

    fn next_stamp(&mut self) -> String {
        let mut now = Utc::now();
        if let Some(last) = self.last_stamp
            && now <= last
        {
            now = last + ChronoDuration::microseconds(1);
        }
        self.last_stamp = Some(now);
        now.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
    }

    fn active_subscribers(&self) -> usize {
        self.tables
            .get("newsletter_subscribers")
            .map(|rows| {
                rows.iter()
                    .filter(|r| r.get("is_active") == Some(&Value::Bool(true)))
                    .count()
            })
            .unwrap_or(0)
    }
}

fn allowed(table: &str, access: Access, authenticated: bool) -> bool {
    match (table, access) {
        ("posts" | "categories", Access::Read) => true,
        ("comments", Access::Read | Access::Insert | Access::Delete) => true,
        ("newsletter_subscribers", Access::Insert | Access::Update) => true,
        _ => authenticated,
    }
}

fn policy_violation(table: &str) -> BackendError {
    BackendError::Unauthorized(format!(
        "new row violates row-level security policy for table \"{table}\""
    ))
}

fn required_columns(table: &str) -> &'static [&'static str] {
    match table {
        "posts" => &["title", "story"],
        "categories" => &["name", "slug"],
        "comments" => &["post_id", "author_name", "content"],
        "newsletter_subscribers" => &["email"],
        _ => &[],
    }
}

fn unique_columns(table: &str) -> &'static [&'static str] {
    match table {
        "categories" => &["slug"],
        "newsletter_subscribers" => &["email"],
        _ => &[],
    }
}

fn duplicate_key(table: &str, column: &str) -> BackendError {
    BackendError::Conflict(format!(
        "duplicate key value violates unique constraint \"{table}_{column}_key\""
    ))
}

fn apply_defaults(table: &str, row: &mut Row, stamp: &str) {
    row.entry("id")
        .or_insert_with(|| Value::String(Uuid::new_v4().to_string()));
    match table {
        "posts" => {
            row.entry("photo_urls").or_insert_with(|| json!([]));
            row.entry("category_ids").or_insert_with(|| json!([]));
            row.entry("cover_image_url").or_insert(Value::Null);
            row.entry("cover_image_position")
                .or_insert_with(|| json!(CoverImagePosition::default()));
            row.insert("created_at".into(), json!(stamp));
            row.insert("updated_at".into(), json!(stamp));
        }
        "categories" | "comments" => {
            row.insert("created_at".into(), json!(stamp));
        }
        "newsletter_subscribers" => {
            row.entry("is_active").or_insert(Value::Bool(true));
            row.insert("subscribed_at".into(), json!(stamp));
        }
        _ => {}
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn matches(row: &Row, filter: &Filter) -> bool {
    match filter {
        Filter::Eq { column, value } => row
            .get(column)
            .is_some_and(|v| !v.is_null() && scalar_text(v) == scalar_text(value)),
        Filter::Contains { column, values } => match row.get(column) {
            Some(Value::Array(items)) => values.iter().all(|wanted| {
                let wanted = scalar_text(wanted);
                items.iter().any(|item| scalar_text(item) == wanted)
            }),
            _ => false,
        },
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => {
            match (x.parse::<DateTime<Utc>>(), y.parse::<DateTime<Utc>>()) {
                (Ok(x), Ok(y)) => x.cmp(&y),
                _ => x.to_lowercase().cmp(&y.to_lowercase()).then_with(|| x.cmp(y)),
            }
        }
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Greater,
        (_, None | Some(Value::Null)) => Ordering::Less,
        (Some(x), Some(y)) => scalar_text(x).cmp(&scalar_text(y)),
    }
}

fn as_object(value: Value) -> Result<Row, BackendError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(BackendError::Http {
            status: 400,
            message: format!("expected a JSON object, got {other}"),
        }),
    }
}

#[async_trait]
impl TableStore for MemoryBackend {
    async fn select(
        &self,
        table: &str,
        query: &Query,
        token: Option<&str>,
    ) -> Result<Selection, BackendError> {
        let mut state = self.enter(Operation::Select)?;
        let authenticated = state.authenticate(token)?;
        let rows = state.table(table)?;

        // Rows hidden by policy are filtered out rather than reported.
        if !allowed(table, Access::Read, authenticated) {
            return Ok(Selection {
                rows: Vec::new(),
                count: query.exact_count.then_some(0),
            });
        }

        let mut matched: Vec<Row> = rows
            .iter()
            .filter(|row| query.filters.iter().all(|f| matches(row, f)))
            .cloned()
            .collect();
        matched.sort_by(|a, b| {
            query.order.iter().fold(Ordering::Equal, |acc, order| {
                acc.then_with(|| {
                    let ord = compare_values(a.get(&order.column), b.get(&order.column));
                    if order.ascending { ord } else { ord.reverse() }
                })
            })
        });

        let total = matched.len() as u64;
        let page: Vec<Value> = match query.range {
            Some((offset, limit)) => matched
                .into_iter()
                .skip(offset)
                .take(limit)
                .map(Value::Object)
                .collect(),
            None => matched.into_iter().map(Value::Object).collect(),
        };

        Ok(Selection {
            rows: page,
            count: query.exact_count.then_some(total),
        })
    }

    async fn insert(
        &self,
        table: &str,
        row: Value,
        returning: Returning,
        token: Option<&str>,
    ) -> Result<Value, BackendError> {
        let mut state = self.enter(Operation::Insert)?;
        let authenticated = state.authenticate(token)?;
        state.table(table)?;
        if !allowed(table, Access::Insert, authenticated) {
            return Err(policy_violation(table));
        }

        let mut row = as_object(row)?;
        for column in required_columns(table) {
            if row.get(*column).is_none_or(Value::is_null) {
                return Err(BackendError::Http {
                    status: 400,
                    message: format!(
                        "null value in column \"{column}\" of relation \"{table}\" violates not-null constraint"
                    ),
                });
            }
        }

        let stamp = state.next_stamp();
        apply_defaults(table, &mut row, &stamp);

        let rows = state.table(table)?;
        for column in unique_columns(table) {
            if let Some(value) = row.get(*column)
                && rows.iter().any(|r| r.get(*column) == Some(value))
            {
                return Err(duplicate_key(table, column));
            }
        }
        rows.push(row.clone());

        Ok(match returning {
            Returning::Representation => Value::Object(row),
            Returning::Minimal => Value::Null,
        })
    }

    async fn update(
        &self,
        table: &str,
        filters: &[Filter],
        patch: Value,
        returning: Returning,
        token: Option<&str>,
    ) -> Result<Vec<Value>, BackendError> {
        let mut state = self.enter(Operation::Update)?;
        let authenticated = state.authenticate(token)?;
        state.table(table)?;
        if !allowed(table, Access::Update, authenticated) {
            return Err(policy_violation(table));
        }

        let patch = as_object(patch)?;
        let stamp = state.next_stamp();
        let rows = state.table(table)?;
        // Checked up front so a rejected patch leaves every row untouched.
        for column in unique_columns(table) {
            let Some(value) = patch.get(*column) else {
                continue;
            };
            let targeted = rows
                .iter()
                .filter(|row| filters.iter().all(|f| matches(row, f)))
                .count();
            let taken = rows.iter().any(|row| {
                row.get(*column) == Some(value) && !filters.iter().all(|f| matches(row, f))
            });
            if taken || targeted > 1 {
                return Err(duplicate_key(table, column));
            }
        }
        let mut updated = Vec::new();
        for row in rows
            .iter_mut()
            .filter(|row| filters.iter().all(|f| matches(row, f)))
        {
            for (key, value) in &patch {
                row.insert(key.clone(), value.clone());
            }
            if row.contains_key("updated_at") {
                row.insert("updated_at".into(), json!(stamp));
            }
            updated.push(Value::Object(row.clone()));
        }

        Ok(match returning {
            Returning::Representation => updated,
            Returning::Minimal => Vec::new(),
        })
    }

    async fn delete(
        &self,
        table: &str,
        filters: &[Filter],
        returning: Returning,
        token: Option<&str>,
    ) -> Result<Vec<Value>, BackendError> {
        let mut state = self.enter(Operation::Delete)?;
        let authenticated = state.authenticate(token)?;
        state.table(table)?;
        if !allowed(table, Access::Delete, authenticated) {
            return Err(policy_violation(table));
        }

        let rows = state.table(table)?;
        let (removed, kept): (Vec<Row>, Vec<Row>) = rows
            .drain(..)
            .partition(|row| filters.iter().all(|f| matches(row, f)));
        *rows = kept;

        Ok(match returning {
            Returning::Representation => removed.into_iter().map(Value::Object).collect(),
            Returning::Minimal => Vec::new(),
        })
    }
}

#[async_trait]
impl BlobStore for MemoryBackend {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        data: Bytes,
        content_type: &str,
        token: Option<&str>,
    ) -> Result<(), BackendError> {
        let mut state = self.enter(Operation::Upload)?;
        if !state.authenticate(token)? {
            return Err(policy_violation("objects"));
        }
        let key = (bucket.to_string(), path.to_string());
        if state.blobs.contains_key(&key) {
            return Err(BackendError::Conflict("The resource already exists".into()));
        }
        state.blobs.insert(key, (data, content_type.to_string()));
        Ok(())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("{PUBLIC_URL_BASE}/{bucket}/{path}")
    }

    async fn remove(
        &self,
        bucket: &str,
        paths: &[String],
        token: Option<&str>,
    ) -> Result<(), BackendError> {
        let mut state = self.enter(Operation::Remove)?;
        if !state.authenticate(token)? {
            return Err(policy_violation("objects"));
        }
        for path in paths {
            state.blobs.remove(&(bucket.to_string(), path.clone()));
        }
        Ok(())
    }

    async fn download(
        &self,
        bucket: &str,
        path: &str,
        token: Option<&str>,
    ) -> Result<Bytes, BackendError> {
        let state = self.enter(Operation::Download)?;
        state.authenticate(token)?;
        state
            .blobs
            .get(&(bucket.to_string(), path.to_string()))
            .map(|(data, _)| data.clone())
            .ok_or_else(|| BackendError::NotFound("Object not found".into()))
    }
}

#[async_trait]
impl AuthApi for MemoryBackend {
    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<SessionGrant, BackendError> {
        let mut state = self.enter(Operation::SignIn)?;
        let user = state
            .accounts
            .iter()
            .find(|a| {
                a.user
                    .email
                    .as_deref()
                    .is_some_and(|e| e.eq_ignore_ascii_case(email))
                    && a.password == password
            })
            .map(|a| a.user.clone())
            .ok_or_else(|| BackendError::Unauthorized("Invalid login credentials".into()))?;
        Ok(self.issue_grant(&mut state, user))
    }

    async fn refresh_session(&self, refresh_token: &str) -> Result<SessionGrant, BackendError> {
        let mut state = self.enter(Operation::Refresh)?;
        let access_token = state.refresh_tokens.remove(refresh_token).ok_or_else(|| {
            BackendError::Unauthorized("Invalid Refresh Token: Refresh Token Not Found".into())
        })?;
        let user = state
            .sessions
            .remove(&access_token)
            .map(|s| s.user)
            .ok_or_else(|| BackendError::Unauthorized("Session not found".into()))?;
        Ok(self.issue_grant(&mut state, user))
    }

    async fn sign_out(&self, access_token: &str) -> Result<(), BackendError> {
        let mut state = self.enter(Operation::SignOut)?;
        if state.sessions.remove(access_token).is_none() {
            return Err(BackendError::Unauthorized("invalid JWT".into()));
        }
        state.refresh_tokens.retain(|_, access| access != access_token);
        Ok(())
    }

    async fn get_user(&self, access_token: &str) -> Result<AuthUser, BackendError> {
        let state = self.enter(Operation::GetUser)?;
        state.authenticate(Some(access_token))?;
        state
            .sessions
            .get(access_token)
            .map(|s| s.user.clone())
            .ok_or_else(|| BackendError::Unauthorized("invalid JWT".into()))
    }
}

#[async_trait]
impl FunctionApi for MemoryBackend {
    async fn invoke(
        &self,
        function: &str,
        body: Value,
        token: Option<&str>,
    ) -> Result<Value, BackendError> {
        let mut state = self.enter(Operation::Invoke)?;
        let authenticated = state.authenticate(token)?;
        let response = match function {
            "send-newsletter" if !authenticated => {
                return Err(BackendError::Unauthorized("Missing authorization".into()));
            }
            "send-newsletter" => json!({ "sent": state.active_subscribers() }),
            "send-confirmation-email" => json!({ "sent": 1 }),
            other => {
                return Err(BackendError::NotFound(format!("Function {other} not found")));
            }
        };
        state.invocations.push((function.to_string(), body));
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn admin_token(backend: &MemoryBackend) -> String {
        backend
            .sign_in_with_password("admin@example.com", "hunter2")
            .await
            .unwrap()
            .access_token
    }

    fn backend() -> MemoryBackend {
        MemoryBackend::new().with_admin("admin@example.com", "hunter2")
    }

    #[tokio::test]
    async fn anonymous_post_writes_are_denied() {
        let backend = backend();
        let err = backend
            .insert(
                "posts",
                json!({ "title": "t", "story": "s" }),
                Returning::Minimal,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Unauthorized(_)));

        let token = admin_token(&backend).await;
        let row = backend
            .insert(
                "posts",
                json!({ "title": "t", "story": "s" }),
                Returning::Representation,
                Some(&token),
            )
            .await
            .unwrap();
        assert_eq!(row["photo_urls"], json!([]));
        assert!(row["id"].is_string());
    }

    #[tokio::test]
    async fn subscribers_are_hidden_from_anonymous_reads() {
        let backend = backend();
        backend
            .insert(
                "newsletter_subscribers",
                json!({ "email": "reader@example.com" }),
                Returning::Minimal,
                None,
            )
            .await
            .unwrap();

        let anonymous = backend
            .select("newsletter_subscribers", &Query::new(), None)
            .await
            .unwrap();
        assert!(anonymous.rows.is_empty());

        let token = admin_token(&backend).await;
        let admin = backend
            .select("newsletter_subscribers", &Query::new(), Some(&token))
            .await
            .unwrap();
        assert_eq!(admin.rows.len(), 1);
        assert_eq!(admin.rows[0]["is_active"], json!(true));

        let dup = backend
            .insert(
                "newsletter_subscribers",
                json!({ "email": "reader@example.com" }),
                Returning::Minimal,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(dup, BackendError::Conflict(_)));
    }

    #[tokio::test]
    async fn orders_filters_and_pages() {
        let backend = backend();
        let token = admin_token(&backend).await;
        for (name, tag) in [("b", "x"), ("a", "y"), ("c", "x")] {
            backend
                .insert(
                    "posts",
                    json!({ "title": name, "story": "s", "category_ids": [tag] }),
                    Returning::Minimal,
                    Some(&token),
                )
                .await
                .unwrap();
        }

        let newest_first = backend
            .select("posts", &Query::new().order_desc("created_at"), None)
            .await
            .unwrap();
        let titles: Vec<_> = newest_first.rows.iter().map(|r| r["title"].clone()).collect();
        assert_eq!(titles, vec![json!("c"), json!("a"), json!("b")]);

        let tagged = backend
            .select(
                "posts",
                &Query::new()
                    .contains("category_ids", &["x"])
                    .order_asc("title")
                    .range(1, 5)
                    .exact_count(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(tagged.count, Some(2));
        assert_eq!(tagged.rows.len(), 1);
        assert_eq!(tagged.rows[0]["title"], json!("c"));
    }

    #[tokio::test]
    async fn injected_faults_fire_once_and_are_counted() {
        let backend = backend();
        backend.fail_next(Operation::Select, BackendError::Timeout);

        assert_eq!(
            backend.select("posts", &Query::new(), None).await.unwrap_err(),
            BackendError::Timeout
        );
        assert!(backend.select("posts", &Query::new(), None).await.is_ok());
        assert_eq!(backend.calls(Operation::Select), 2);
    }

    #[tokio::test]
    async fn expired_tokens_are_rejected() {
        let backend = backend();
        let token = admin_token(&backend).await;
        backend.expire_sessions();

        let err = backend
            .select("posts", &Query::new(), Some(&token))
            .await
            .unwrap_err();
        assert_eq!(err, BackendError::Unauthorized("JWT expired".into()));
    }
}
