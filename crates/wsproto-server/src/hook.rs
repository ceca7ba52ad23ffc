//! Pre-upgrade hook: runs before the WebSocket handshake, decides whether the
//! request may upgrade and builds the request-scoped [`Context`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::Query;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;

use crate::errors::HookError;

/// Immutable key/value bag attached to a connection during the upgrade.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Context {
    values: Arc<HashMap<String, Value>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        Arc::make_mut(&mut self.values).insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// The parts of the upgrade request visible to the hook and to
/// `connection` listeners.
#[derive(Clone, Debug)]
pub struct RequestInfo {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    query: HashMap<String, String>,
}

impl RequestInfo {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap) -> Self {
        let query = Query::<HashMap<String, String>>::try_from_uri(&uri)
            .map(|Query(query)| query)
            .unwrap_or_default();
        Self {
            method,
            uri,
            headers,
            query,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Header value, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn origin(&self) -> Option<&str> {
        self.header("origin")
    }

    pub fn query(&self) -> &HashMap<String, String> {
        &self.query
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }
}

/// A deliberate rejection from the hook. The server answers with
/// `{"error": message, "data": [..]}` and the chosen status.
#[derive(Clone, Debug)]
pub struct RaiseFail {
    pub message: String,
    pub status: StatusCode,
    pub data: Vec<Value>,
}

impl RaiseFail {
    pub fn new(message: impl Into<String>, status: StatusCode) -> Self {
        Self {
            message: message.into(),
            status,
            data: Vec::new(),
        }
    }

    pub fn with_data(mut self, value: impl Into<Value>) -> Self {
        self.data.push(value.into());
        self
    }
}

impl fmt::Display for RaiseFail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl IntoResponse for RaiseFail {
    fn into_response(self) -> Response {
        error_response(self.status, self.message, self.data)
    }
}

/// Reject the upgrade: `return Err(fail("bad peer id", StatusCode::BAD_REQUEST))`.
pub fn fail(message: impl Into<String>, status: StatusCode) -> HookError {
    HookError::Fail(RaiseFail::new(message, status))
}

/// JSON error body shared by hook rejections and handshake failures.
pub fn error_response(status: StatusCode, message: impl Into<String>, data: Vec<Value>) -> Response {
    let body = serde_json::json!({
        "error": message.into(),
        "data": data,
    });
    (status, Json(body)).into_response()
}

/// Authorization and context setup run before the protocol upgrade.
///
/// Closures of the form `Fn(&RequestInfo) -> Result<Context, HookError>`
/// implement this trait; implement it directly when the hook needs to await.
#[async_trait]
pub trait BeforeUpgrade: Send + Sync + 'static {
    async fn before_upgrade(&self, request: &RequestInfo) -> Result<Context, HookError>;
}

#[async_trait]
impl<F> BeforeUpgrade for F
where
    F: Fn(&RequestInfo) -> Result<Context, HookError> + Send + Sync + 'static,
{
    async fn before_upgrade(&self, request: &RequestInfo) -> Result<Context, HookError> {
        self(request)
    }
}

/// Accepts every request with an empty context.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultBeforeUpgrade;

#[async_trait]
impl BeforeUpgrade for DefaultBeforeUpgrade {
    async fn before_upgrade(&self, _request: &RequestInfo) -> Result<Context, HookError> {
        Ok(Context::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    fn request(uri: &str) -> RequestInfo {
        let mut headers = HeaderMap::new();
        headers.insert("origin", "https://example.com".parse().unwrap());
        RequestInfo::new(Method::GET, uri.parse().unwrap(), headers)
    }

    #[test]
    fn context_is_built_once_and_read() {
        let ctx = Context::new().with("peer_id", "abc").with("room", 7);
        assert_eq!(ctx.get_str("peer_id"), Some("abc"));
        assert_eq!(ctx.get("room"), Some(&Value::from(7)));
        assert!(ctx.contains("room"));
        assert!(!ctx.contains("missing"));
        assert_eq!(ctx.len(), 2);
        assert!(Context::new().is_empty());
    }

    #[test]
    fn context_clones_share_values() {
        let ctx = Context::new().with("a", 1);
        let copy = ctx.clone();
        assert_eq!(ctx, copy);
        assert_eq!(copy.iter().count(), 1);
    }

    #[test]
    fn request_info_parses_query() {
        let info = request("/stream?peer=abc&room=main");
        assert_eq!(info.path(), "/stream");
        assert_eq!(info.query_param("peer"), Some("abc"));
        assert_eq!(info.query_param("room"), Some("main"));
        assert_eq!(info.query_param("missing"), None);
        assert_eq!(info.origin(), Some("https://example.com"));
        assert_eq!(info.method(), &Method::GET);
    }

    #[test]
    fn request_info_without_query() {
        let info = request("/stream");
        assert!(info.query().is_empty());
    }

    #[tokio::test]
    async fn raise_fail_response_body() {
        let response = RaiseFail::new("bad peer id", StatusCode::BAD_REQUEST).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value, serde_json::json!({"error": "bad peer id", "data": []}));
    }

    #[tokio::test]
    async fn raise_fail_carries_extra_data() {
        let response = RaiseFail::new("banned", StatusCode::FORBIDDEN)
            .with_data("peer abc")
            .with_data(3)
            .into_response();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value, serde_json::json!({"error": "banned", "data": ["peer abc", 3]}));
    }

    #[tokio::test]
    async fn closure_hooks_implement_trait() {
        let hook = |request: &RequestInfo| -> Result<Context, HookError> {
            match request.query_param("peer") {
                Some(peer) => Ok(Context::new().with("peer_id", peer)),
                None => Err(fail("bad peer id", StatusCode::BAD_REQUEST)),
            }
        };

        let ctx = hook.before_upgrade(&request("/stream?peer=abc")).await.unwrap();
        assert_eq!(ctx.get_str("peer_id"), Some("abc"));

        let err = hook.before_upgrade(&request("/stream")).await.unwrap_err();
        match err {
            HookError::Fail(fail) => assert_eq!(fail.status, StatusCode::BAD_REQUEST),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn default_hook_accepts_with_empty_context() {
        let ctx = DefaultBeforeUpgrade.before_upgrade(&request("/stream")).await.unwrap();
        assert!(ctx.is_empty());
    }
}
