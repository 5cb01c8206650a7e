use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, header::CONTENT_TYPE};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};
use url::Url;

use api_types::AuthUser;

use super::{
    AuthApi, BackendError, BlobStore, Filter, FunctionApi, Query, Returning, Selection,
    SessionGrant, TableStore,
};

/// Client for the hosted platform's REST, storage, auth and functions endpoints.
pub struct HttpBackend {
    base: Url,
    http: Client,
    anon_key: SecretString,
}

impl std::fmt::Debug for HttpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBackend")
            .field("base", &self.base)
            .field("http", &self.http)
            .field("anon_key", &"<redacted>")
            .finish()
    }
}

impl Clone for HttpBackend {
    fn clone(&self) -> Self {
        Self {
            base: self.base.clone(),
            http: self.http.clone(),
            anon_key: self.anon_key.clone(),
        }
    }
}

#[derive(Deserialize)]
struct ApiErrorBody {
    message: Option<String>,
    msg: Option<String>,
    error_description: Option<String>,
    error: Option<String>,
    /// Storage reports the real status here and answers 400.
    #[serde(rename = "statusCode")]
    status_code: Option<Value>,
}

/// Every field is optional: the endpoint may answer 200 without a session.
#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    #[serde(default)]
    user: Option<AuthUser>,
}

impl TokenResponse {
    fn into_grant(self) -> Result<SessionGrant, BackendError> {
        let (Some(access_token), Some(refresh_token), Some(user)) =
            (self.access_token, self.refresh_token, self.user)
        else {
            return Err(BackendError::Unauthorized("No session returned".into()));
        };
        let expires_at = self
            .expires_at
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .unwrap_or_else(|| {
                Utc::now() + chrono::Duration::seconds(self.expires_in.unwrap_or(3600))
            });
        Ok(SessionGrant {
            access_token,
            refresh_token,
            expires_at,
            user,
        })
    }
}

impl HttpBackend {
    pub fn new(
        base_url: &str,
        anon_key: SecretString,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let mut base = Url::parse(base_url).map_err(|e| BackendError::Url(e.to_string()))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("blog-services/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        Ok(Self {
            base,
            http,
            anon_key,
        })
    }

    pub fn base_url(&self) -> &str {
        self.base.as_str()
    }

    fn endpoint(&self, path: &str) -> Result<Url, BackendError> {
        self.base
            .join(path)
            .map_err(|e| BackendError::Url(e.to_string()))
    }

    /// `storage/v1/object/<prefix..>/<bucket>/<path>` with each segment escaped.
    fn object_url(&self, prefix: &[&str], bucket: &str, path: &str) -> Result<Url, BackendError> {
        let mut url = self.endpoint("storage/v1/object")?;
        url.path_segments_mut()
            .map_err(|_| BackendError::Url(format!("cannot-be-a-base url: {}", self.base)))?
            .pop_if_empty()
            .extend(prefix)
            .push(bucket)
            .extend(path.split('/').filter(|s| !s.is_empty()));
        Ok(url)
    }

    fn request(&self, method: Method, url: Url, token: Option<&str>) -> RequestBuilder {
        let bearer = token.unwrap_or_else(|| self.anon_key.expose_secret());
        self.http
            .request(method, url)
            .header("apikey", self.anon_key.expose_secret())
            .header("X-Client-Info", concat!("blog-services/", env!("CARGO_PKG_VERSION")))
            .bearer_auth(bearer)
    }

    async fn execute(&self, request: RequestBuilder) -> Result<Response, BackendError> {
        let res = request.send().await.map_err(map_reqwest_error)?;
        if res.status().is_success() {
            return Ok(res);
        }

        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        Err(map_status_error(status, &body))
    }

    async fn json_rows(res: Response) -> Result<Vec<Value>, BackendError> {
        let text = res.text().await.map_err(map_reqwest_error)?;
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        match serde_json::from_str::<Value>(&text)? {
            Value::Array(rows) => Ok(rows),
            Value::Null => Ok(Vec::new()),
            other => Ok(vec![other]),
        }
    }
}

fn prefer_header(returning: Returning) -> &'static str {
    match returning {
        Returning::Representation => "return=representation",
        Returning::Minimal => "return=minimal",
    }
}

/// Renders a JSON scalar the way PostgREST expects it inside a filter.
fn filter_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn array_literal(values: &[Value]) -> String {
    let items = values
        .iter()
        .map(|v| {
            let raw = filter_scalar(v);
            if raw.contains([',', '{', '}', '"', ' ', '\\']) {
                format!("\"{}\"", raw.replace('\\', "\\\\").replace('"', "\\\""))
            } else {
                raw
            }
        })
        .collect::<Vec<_>>();
    format!("{{{}}}", items.join(","))
}

pub(super) fn filter_params(filters: &[Filter]) -> Vec<(String, String)> {
    filters
        .iter()
        .map(|filter| match filter {
            Filter::Eq { column, value } => (column.clone(), format!("eq.{}", filter_scalar(value))),
            Filter::Contains { column, values } => {
                (column.clone(), format!("cs.{}", array_literal(values)))
            }
        })
        .collect()
}

pub(super) fn query_params(query: &Query) -> Vec<(String, String)> {
    let mut params = vec![("select".to_string(), "*".to_string())];
    params.extend(filter_params(&query.filters));
    if !query.order.is_empty() {
        let order = query
            .order
            .iter()
            .map(|o| format!("{}.{}", o.column, if o.ascending { "asc" } else { "desc" }))
            .collect::<Vec<_>>()
            .join(",");
        params.push(("order".to_string(), order));
    }
    if let Some((offset, limit)) = query.range {
        params.push(("offset".to_string(), offset.to_string()));
        params.push(("limit".to_string(), limit.to_string()));
    }
    params
}

/// Total from a `Content-Range: 0-9/42` header.
fn parse_content_range_total(header: &str) -> Option<u64> {
    header.rsplit_once('/').and_then(|(_, total)| total.parse().ok())
}

fn map_status_error(status: StatusCode, body: &str) -> BackendError {
    let parsed = serde_json::from_str::<ApiErrorBody>(body).ok();
    let message = parsed
        .as_ref()
        .and_then(|b| {
            b.message
                .clone()
                .or_else(|| b.error_description.clone())
                .or_else(|| b.msg.clone())
                .or_else(|| b.error.clone())
        })
        .unwrap_or_else(|| body.to_string());

    let effective = parsed
        .as_ref()
        .and_then(|b| b.status_code.as_ref())
        .and_then(|code| match code {
            Value::String(s) => s.parse::<u16>().ok(),
            Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
            _ => None,
        })
        .unwrap_or(status.as_u16());

    match effective {
        401 | 403 => BackendError::Unauthorized(message),
        404 => BackendError::NotFound(message),
        409 => BackendError::Conflict(message),
        status => BackendError::Http { status, message },
    }
}

fn map_reqwest_error(e: reqwest::Error) -> BackendError {
    if e.is_timeout() {
        BackendError::Timeout
    } else {
        BackendError::Transport(e.to_string())
    }
}

#[async_trait]
impl TableStore for HttpBackend {
    async fn select(
        &self,
        table: &str,
        query: &Query,
        token: Option<&str>,
    ) -> Result<Selection, BackendError> {
        let url = self.endpoint(&format!("rest/v1/{table}"))?;
        let mut req = self
            .request(Method::GET, url, token)
            .query(&query_params(query));
        if query.exact_count {
            req = req.header("Prefer", "count=exact");
        }

        let res = self.execute(req).await?;
        let count = res
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total);
        let rows = Self::json_rows(res).await?;

        Ok(Selection {
            count: if query.exact_count {
                count.or(Some(rows.len() as u64))
            } else {
                None
            },
            rows,
        })
    }

    async fn insert(
        &self,
        table: &str,
        row: Value,
        returning: Returning,
        token: Option<&str>,
    ) -> Result<Value, BackendError> {
        let url = self.endpoint(&format!("rest/v1/{table}"))?;
        let req = self
            .request(Method::POST, url, token)
            .header("Prefer", prefer_header(returning))
            .json(&row);

        let res = self.execute(req).await?;
        match returning {
            Returning::Minimal => Ok(Value::Null),
            Returning::Representation => Ok(Self::json_rows(res)
                .await?
                .into_iter()
                .next()
                .unwrap_or(Value::Null)),
        }
    }

    async fn update(
        &self,
        table: &str,
        filters: &[Filter],
        patch: Value,
        returning: Returning,
        token: Option<&str>,
    ) -> Result<Vec<Value>, BackendError> {
        let url = self.endpoint(&format!("rest/v1/{table}"))?;
        let req = self
            .request(Method::PATCH, url, token)
            .query(&filter_params(filters))
            .header("Prefer", prefer_header(returning))
            .json(&patch);

        let res = self.execute(req).await?;
        match returning {
            Returning::Minimal => Ok(Vec::new()),
            Returning::Representation => Self::json_rows(res).await,
        }
    }

    async fn delete(
        &self,
        table: &str,
        filters: &[Filter],
        returning: Returning,
        token: Option<&str>,
    ) -> Result<Vec<Value>, BackendError> {
        let url = self.endpoint(&format!("rest/v1/{table}"))?;
        let req = self
            .request(Method::DELETE, url, token)
            .query(&filter_params(filters))
            .header("Prefer", prefer_header(returning));

        let res = self.execute(req).await?;
        match returning {
            Returning::Minimal => Ok(Vec::new()),
            Returning::Representation => Self::json_rows(res).await,
        }
    }
}

#[async_trait]
impl BlobStore for HttpBackend {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        data: Bytes,
        content_type: &str,
        token: Option<&str>,
    ) -> Result<(), BackendError> {
        let url = self.object_url(&[], bucket, path)?;
        let req = self
            .request(Method::POST, url, token)
            .header(CONTENT_TYPE, content_type)
            .header("cache-control", "max-age=3600")
            .header("x-upsert", "false")
            .body(data);

        self.execute(req).await?;
        Ok(())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        self.object_url(&["public"], bucket, path)
            .map(String::from)
            .unwrap_or_else(|_| {
                format!("{}storage/v1/object/public/{bucket}/{path}", self.base)
            })
    }

    async fn remove(
        &self,
        bucket: &str,
        paths: &[String],
        token: Option<&str>,
    ) -> Result<(), BackendError> {
        if paths.is_empty() {
            return Ok(());
        }
        let url = self.object_url(&[], bucket, "")?;
        let req = self
            .request(Method::DELETE, url, token)
            .json(&json!({ "prefixes": paths }));

        self.execute(req).await?;
        Ok(())
    }

    async fn download(
        &self,
        bucket: &str,
        path: &str,
        token: Option<&str>,
    ) -> Result<Bytes, BackendError> {
        let url = match token {
            Some(_) => self.object_url(&["authenticated"], bucket, path)?,
            None => self.object_url(&["public"], bucket, path)?,
        };
        let res = self.execute(self.request(Method::GET, url, token)).await?;
        res.bytes().await.map_err(map_reqwest_error)
    }
}

#[async_trait]
impl AuthApi for HttpBackend {
    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<SessionGrant, BackendError> {
        let url = self.endpoint("auth/v1/token")?;
        let req = self
            .request(Method::POST, url, None)
            .query(&[("grant_type", "password")])
            .json(&json!({ "email": email, "password": password }));

        let res = self.execute(req).await.map_err(invalid_grant_as_unauthorized)?;
        let token = res
            .json::<TokenResponse>()
            .await
            .map_err(|e| BackendError::Serde(e.to_string()))?;
        token.into_grant()
    }

    async fn refresh_session(&self, refresh_token: &str) -> Result<SessionGrant, BackendError> {
        let url = self.endpoint("auth/v1/token")?;
        let req = self
            .request(Method::POST, url, None)
            .query(&[("grant_type", "refresh_token")])
            .json(&json!({ "refresh_token": refresh_token }));

        let res = self.execute(req).await.map_err(invalid_grant_as_unauthorized)?;
        let token = res
            .json::<TokenResponse>()
            .await
            .map_err(|e| BackendError::Serde(e.to_string()))?;
        token.into_grant()
    }

    async fn sign_out(&self, access_token: &str) -> Result<(), BackendError> {
        let url = self.endpoint("auth/v1/logout")?;
        self.execute(self.request(Method::POST, url, Some(access_token)))
            .await?;
        Ok(())
    }

    async fn get_user(&self, access_token: &str) -> Result<AuthUser, BackendError> {
        let url = self.endpoint("auth/v1/user")?;
        let res = self
            .execute(self.request(Method::GET, url, Some(access_token)))
            .await?;
        res.json::<AuthUser>()
            .await
            .map_err(|e| BackendError::Serde(e.to_string()))
    }
}

/// The token endpoint answers rejected credentials with a plain 400.
fn invalid_grant_as_unauthorized(err: BackendError) -> BackendError {
    match err {
        BackendError::Http { status: 400, message } => BackendError::Unauthorized(message),
        other => other,
    }
}

#[async_trait]
impl FunctionApi for HttpBackend {
    async fn invoke(
        &self,
        function: &str,
        body: Value,
        token: Option<&str>,
    ) -> Result<Value, BackendError> {
        let url = self.endpoint(&format!("functions/v1/{function}"))?;
        let res = self
            .execute(self.request(Method::POST, url, token).json(&body))
            .await?;

        let is_json = res
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("application/json"));
        let text = res.text().await.map_err(map_reqwest_error)?;
        if text.is_empty() {
            Ok(Value::Null)
        } else if is_json {
            Ok(serde_json::from_str(&text)?)
        } else {
            Ok(Value::String(text))
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use uuid::Uuid;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_json, header, method, path, query_param},
    };

    use super::*;

    fn backend(server: &MockServer) -> HttpBackend {
        HttpBackend::new(
            &server.uri(),
            SecretString::new("anon-key".into()),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn encodes_filters_in_postgrest_syntax() {
        let id = Uuid::parse_str("6f1b7c1e-4c55-4a4e-9d0a-0d7c8d3f6a11").unwrap();
        let query = Query::new()
            .contains("category_ids", &[id])
            .eq("is_active", true)
            .order_desc("created_at")
            .range(20, 10);

        assert_eq!(
            query_params(&query),
            vec![
                ("select".to_string(), "*".to_string()),
                (
                    "category_ids".to_string(),
                    "cs.{6f1b7c1e-4c55-4a4e-9d0a-0d7c8d3f6a11}".to_string()
                ),
                ("is_active".to_string(), "eq.true".to_string()),
                ("order".to_string(), "created_at.desc".to_string()),
                ("offset".to_string(), "20".to_string()),
                ("limit".to_string(), "10".to_string()),
            ]
        );
        assert_eq!(array_literal(&[json!("a,b"), json!("c")]), "{\"a,b\",c}");
    }

    #[test]
    fn maps_error_statuses() {
        assert_eq!(
            map_status_error(StatusCode::UNAUTHORIZED, r#"{"message":"JWT expired"}"#),
            BackendError::Unauthorized("JWT expired".into())
        );
        assert_eq!(
            map_status_error(
                StatusCode::BAD_REQUEST,
                r#"{"statusCode":"403","error":"Unauthorized","message":"new row violates row-level security policy"}"#
            ),
            BackendError::Unauthorized("new row violates row-level security policy".into())
        );
        assert_eq!(
            map_status_error(StatusCode::SERVICE_UNAVAILABLE, "upstream down"),
            BackendError::Http {
                status: 503,
                message: "upstream down".into()
            }
        );
        assert!(matches!(
            map_status_error(StatusCode::CONFLICT, r#"{"message":"duplicate key"}"#),
            BackendError::Conflict(_)
        ));
        assert_eq!(parse_content_range_total("0-9/42"), Some(42));
        assert_eq!(parse_content_range_total("*/0"), Some(0));
        assert_eq!(parse_content_range_total("0-9/*"), None);
    }

    #[tokio::test]
    async fn select_sends_auth_headers_and_reads_count() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/posts"))
            .and(query_param("order", "created_at.desc"))
            .and(header("apikey", "anon-key"))
            .and(header("authorization", "Bearer anon-key"))
            .and(header("prefer", "count=exact"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("content-range", "0-0/7")
                    .set_body_json(json!([{ "id": 1 }])),
            )
            .mount(&server)
            .await;

        let selection = backend(&server)
            .select(
                "posts",
                &Query::new().order_desc("created_at").limit(1).exact_count(),
                None,
            )
            .await
            .unwrap();

        assert_eq!(selection.rows, vec![json!({ "id": 1 })]);
        assert_eq!(selection.count, Some(7));
    }

    #[tokio::test]
    async fn insert_uses_caller_token_and_returns_row() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/categories"))
            .and(header("authorization", "Bearer admin-token"))
            .and(header("prefer", "return=representation"))
            .and(body_json(json!({ "name": "Travel" })))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(json!([{ "name": "Travel", "id": 3 }])),
            )
            .mount(&server)
            .await;

        let row = backend(&server)
            .insert(
                "categories",
                json!({ "name": "Travel" }),
                Returning::Representation,
                Some("admin-token"),
            )
            .await
            .unwrap();

        assert_eq!(row["id"], 3);
    }

    #[tokio::test]
    async fn server_errors_surface_as_retryable_http_errors() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/rest/v1/posts"))
            .and(query_param("id", "eq.42"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let err = backend(&server)
            .delete(
                "posts",
                &[Filter::eq("id", 42)],
                Returning::Representation,
                Some("t"),
            )
            .await
            .unwrap_err();

        assert!(err.should_retry());
    }

    #[tokio::test]
    async fn rejected_password_is_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .and(query_param("grant_type", "password"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "invalid_grant",
                "error_description": "Invalid login credentials"
            })))
            .mount(&server)
            .await;

        let err = backend(&server)
            .sign_in_with_password("admin@example.com", "wrong")
            .await
            .unwrap_err();

        assert_eq!(
            err,
            BackendError::Unauthorized("Invalid login credentials".into())
        );
    }

    #[tokio::test]
    async fn token_response_without_session_is_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .and(query_param("grant_type", "password"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "user": null, "session": null })),
            )
            .mount(&server)
            .await;

        let err = backend(&server)
            .sign_in_with_password("admin@example.com", "pw")
            .await
            .unwrap_err();

        assert_eq!(
            err,
            BackendError::Unauthorized("No session returned".into())
        );
    }

    #[tokio::test]
    async fn builds_escaped_storage_urls() {
        let server = MockServer::start().await;
        let backend = backend(&server);

        assert_eq!(
            backend.public_url("blog-photos", "abc/1700-0-my photo.jpg"),
            format!(
                "{}/storage/v1/object/public/blog-photos/abc/1700-0-my%20photo.jpg",
                server.uri()
            )
        );

        Mock::given(method("POST"))
            .and(path("/storage/v1/object/blog-photos/abc/a.jpg"))
            .and(header("content-type", "image/jpeg"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "Key": "x" })))
            .expect(1)
            .mount(&server)
            .await;

        backend
            .upload(
                "blog-photos",
                "abc/a.jpg",
                Bytes::from_static(b"jpeg"),
                "image/jpeg",
                Some("t"),
            )
            .await
            .unwrap();
    }
}
