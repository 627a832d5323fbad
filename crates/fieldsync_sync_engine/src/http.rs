//! HTTP transport implementation.
//!
//! Maps queued operations onto a conventional REST API:
//!
//! | operation / fetch | request                         |
//! |-------------------|---------------------------------|
//! | Create            | `POST   {base}/{kind}`          |
//! | Update            | `PUT    {base}/{kind}/{key}`    |
//! | Delete            | `DELETE {base}/{kind}/{key}`    |
//! | fetch one         | `GET    {base}/{kind}/{key}`    |
//! | fetch prefix      | `GET    {base}/{kind}?prefix=…` |
//! | fetch all         | `GET    {base}/{kind}`          |
//!
//! Bodies are JSON. Every submit carries the operation id as an
//! `Idempotency-Key` header. The actual HTTP client is abstracted via
//! [`HttpClient`] so any library (or an in-process loopback) can be used.

use crate::transport::{
    FetchRequest, FetchedEntity, ServerResponse, SyncTransport, TransportError, TransportResult,
};
use fieldsync_core::{Method, QueuedOperation, RefreshScope};
use parking_lot::RwLock;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use tracing::{debug, warn};

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// DELETE
    Delete,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        })
    }
}

/// An outgoing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Method.
    pub method: HttpMethod,
    /// Absolute URL.
    pub url: String,
    /// Header name/value pairs.
    pub headers: Vec<(String, String)>,
    /// Body, if any.
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    /// Value of the first header called `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A received response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Raw body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// A response with a JSON body.
    pub fn json(status: u16, body: &Value) -> Self {
        Self {
            status,
            body: serde_json::to_vec(body).unwrap_or_default(),
        }
    }

    /// A response with no body.
    pub fn empty(status: u16) -> Self {
        Self {
            status,
            body: Vec::new(),
        }
    }

    fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    fn text(&self) -> String {
        let text = String::from_utf8_lossy(&self.body);
        let text = text.trim();
        if text.is_empty() {
            format!("HTTP {}", self.status)
        } else {
            text.chars().take(200).collect()
        }
    }
}

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual HTTP transport. An `Err` means
/// the request never produced a response (DNS, refused connection, reset)
/// and is retried; non-2xx statuses are returned as `Ok`.
pub trait HttpClient: Send + Sync + 'static {
    /// Sends one request.
    fn send(&self, request: HttpRequest) -> impl Future<Output = Result<HttpResponse, String>> + Send;
}

/// REST transport over an [`HttpClient`].
pub struct HttpTransport<C: HttpClient> {
    base_url: String,
    client: C,
    key_field: String,
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a transport for the API rooted at `base_url`.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            key_field: "id".to_string(),
            last_error: RwLock::new(None),
        }
    }

    /// Sets the JSON field that carries an entity's key (default `id`).
    #[must_use]
    pub fn with_key_field(mut self, field: impl Into<String>) -> Self {
        self.key_field = field.into();
        self
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the underlying client.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    fn collection_url(&self, kind: &str) -> String {
        format!("{}/{}", self.base_url, encode_component(kind))
    }

    fn entity_url(&self, kind: &str, key: &str) -> String {
        format!("{}/{}", self.collection_url(kind), encode_component(key))
    }

    fn key_of(&self, payload: &Value) -> Option<String> {
        match payload.get(&self.key_field)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    async fn exchange(&self, request: HttpRequest) -> TransportResult<HttpResponse> {
        let method = request.method;
        let url = request.url.clone();
        let result = match self.client.send(request).await {
            Ok(response) if response.is_success() => Ok(response),
            Ok(response) => Err(TransportError::from_status(response.status, response.text())),
            Err(e) => Err(TransportError::network(e)),
        };
        match &result {
            Ok(response) => {
                debug!(%method, url = %url, status = response.status, "http exchange");
                *self.last_error.write() = None;
            }
            Err(e) => {
                debug!(%method, url = %url, status = ?e.status, error = %e, "http exchange failed");
                *self.last_error.write() = Some(e.message.clone());
            }
        }
        result
    }

    fn build_submit(&self, op: &QueuedOperation) -> TransportResult<HttpRequest> {
        let (method, url) = match (op.method, op.local_key.as_deref()) {
            (Method::Create, _) => (HttpMethod::Post, self.collection_url(&op.entity_kind)),
            (Method::Update, Some(key)) => (HttpMethod::Put, self.entity_url(&op.entity_kind, key)),
            (Method::Delete, Some(key)) => {
                (HttpMethod::Delete, self.entity_url(&op.entity_kind, key))
            }
            (method, None) => {
                return Err(TransportError::invalid(format!(
                    "{method} on {} needs an entity key",
                    op.entity_kind
                )))
            }
        };
        let body = match op.method {
            Method::Delete => None,
            Method::Create | Method::Update => Some(
                serde_json::to_vec(&op.payload).map_err(|e| {
                    TransportError::serialization(format!("payload not encodable: {e}"))
                })?,
            ),
        };
        Ok(HttpRequest {
            method,
            url,
            headers: vec![
                ("Idempotency-Key".to_string(), op.id.to_string()),
                ("Content-Type".to_string(), "application/json".to_string()),
                ("Accept".to_string(), "application/json".to_string()),
            ],
            body,
        })
    }

    fn entities_from(&self, kind: &str, body: &[u8]) -> TransportResult<Vec<FetchedEntity>> {
        let value: Value = serde_json::from_slice(body).map_err(|e| {
            TransportError::serialization(format!("{kind} listing is not JSON: {e}"))
        })?;
        let Value::Array(items) = value else {
            return Err(TransportError::serialization(format!(
                "{kind} listing is not an array"
            )));
        };
        Ok(items
            .into_iter()
            .filter_map(|item| match self.key_of(&item) {
                Some(key) => Some(FetchedEntity::new(key, item)),
                None => {
                    warn!(entity_kind = kind, key_field = %self.key_field, "skipping entity without key");
                    None
                }
            })
            .collect())
    }
}

impl<C: HttpClient> SyncTransport for HttpTransport<C> {
    async fn submit(&self, op: &QueuedOperation) -> TransportResult<ServerResponse> {
        let request = self.build_submit(op)?;
        let response = self.exchange(request).await?;

        let payload = if response.body.is_empty() {
            None
        } else {
            match serde_json::from_slice::<Value>(&response.body) {
                Ok(value) => Some(value),
                Err(e) => {
                    debug!(op_id = %op.id, error = %e, "ignoring non-JSON response body");
                    None
                }
            }
        };
        let canonical_key = payload.as_ref().and_then(|p| self.key_of(p));
        Ok(ServerResponse {
            status: response.status,
            canonical_key,
            payload,
        })
    }

    async fn fetch(&self, request: &FetchRequest) -> TransportResult<Vec<FetchedEntity>> {
        let kind = request.entity_kind.as_str();
        let url = match &request.scope {
            RefreshScope::Key(key) => self.entity_url(kind, key),
            RefreshScope::Prefix(prefix) => {
                format!("{}?prefix={}", self.collection_url(kind), encode_component(prefix))
            }
            RefreshScope::All => self.collection_url(kind),
        };
        let http = HttpRequest {
            method: HttpMethod::Get,
            url,
            headers: vec![("Accept".to_string(), "application/json".to_string())],
            body: None,
        };

        match (&request.scope, self.exchange(http).await) {
            (RefreshScope::Key(_), Err(e)) if e.status == Some(404) => Ok(Vec::new()),
            (_, Err(e)) => Err(e),
            (RefreshScope::Key(key), Ok(response)) => {
                let payload: Value = serde_json::from_slice(&response.body).map_err(|e| {
                    TransportError::serialization(format!("{kind}/{key} is not JSON: {e}"))
                })?;
                Ok(vec![FetchedEntity::new(key.clone(), payload)])
            }
            (_, Ok(response)) => self.entities_from(kind, &response.body),
        }
    }
}

impl<C: HttpClient> fmt::Debug for HttpTransport<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.base_url)
            .field("key_field", &self.key_field)
            .finish()
    }
}

/// Percent-encodes everything except RFC 3986 unreserved characters.
fn encode_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// A loopback HTTP client that routes requests directly to an in-process
/// server.
///
/// Useful for testing without actual network overhead.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
}

impl<S: LoopbackServer> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: S) -> Self {
        Self { server }
    }

    /// The server behind the client.
    pub fn server(&self) -> &S {
        &self.server
    }
}

/// Trait for servers that can handle loopback requests.
pub trait LoopbackServer: Send + Sync + 'static {
    /// Handles one request. `Err` simulates a connection failure.
    fn handle(&self, request: &HttpRequest) -> Result<HttpResponse, String>;
}

impl<S: LoopbackServer> HttpClient for LoopbackClient<S> {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, String> {
        self.server.handle(&request)
    }
}

/// [`HttpClient`] backed by `reqwest`.
#[cfg(feature = "reqwest")]
#[derive(Debug, Clone, Default)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

#[cfg(feature = "reqwest")]
impl ReqwestClient {
    /// Creates a client with reqwest's defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a configured reqwest client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[cfg(feature = "reqwest")]
impl HttpClient for ReqwestClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, String> {
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };
        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        let response = builder.send().await.map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|e| e.to_string())?;
        Ok(HttpResponse {
            status,
            body: body.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use fieldsync_core::{OperationId, OperationStatus, Timestamp};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct Scripted {
        requests: Mutex<Vec<HttpRequest>>,
        responses: Mutex<VecDeque<Result<HttpResponse, String>>>,
    }

    impl Scripted {
        fn reply(&self, response: Result<HttpResponse, String>) {
            self.responses.lock().push_back(response);
        }

        fn last(&self) -> HttpRequest {
            self.requests.lock().last().cloned().unwrap()
        }
    }

    impl LoopbackServer for Scripted {
        fn handle(&self, request: &HttpRequest) -> Result<HttpResponse, String> {
            self.requests.lock().push(request.clone());
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(HttpResponse::empty(204)))
        }
    }

    fn transport() -> HttpTransport<LoopbackClient<Scripted>> {
        HttpTransport::new("https://api.example.com/v1/", LoopbackClient::new(Scripted::default()))
    }

    fn op(method: Method, key: Option<&str>) -> QueuedOperation {
        QueuedOperation {
            id: OperationId::from("op-1"),
            sequence: 0,
            entity_kind: "appointments".into(),
            method,
            local_key: key.map(str::to_string),
            payload: json!({"date": "2024-05-01"}),
            created_at: Timestamp::default(),
            status: OperationStatus::Submitting,
            retry_count: 0,
            last_error: None,
        }
    }

    #[tokio::test]
    async fn create_posts_to_collection_with_idempotency_key() {
        let t = transport();
        t.client()
            .server()
            .reply(Ok(HttpResponse::json(201, &json!({"id": "A-17", "date": "2024-05-01"}))));

        let resp = t.submit(&op(Method::Create, Some("tmp-1"))).await.unwrap();
        assert_eq!(resp.status, 201);
        assert_eq!(resp.canonical_key.as_deref(), Some("A-17"));

        let req = t.client().server().last();
        assert_eq!(req.method, HttpMethod::Post);
        assert_eq!(req.url, "https://api.example.com/v1/appointments");
        assert_eq!(req.header("idempotency-key"), Some("op-1"));
        let body: Value = serde_json::from_slice(req.body.as_deref().unwrap()).unwrap();
        assert_eq!(body["date"], "2024-05-01");
    }

    #[tokio::test]
    async fn update_and_delete_need_a_key() {
        let t = transport();
        let err = t.submit(&op(Method::Update, None)).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(t.client().server().requests.lock().is_empty());

        t.submit(&op(Method::Delete, Some("2024/05 01"))).await.unwrap();
        let req = t.client().server().last();
        assert_eq!(req.method, HttpMethod::Delete);
        assert_eq!(req.url, "https://api.example.com/v1/appointments/2024%2F05%2001");
        assert!(req.body.is_none());
    }

    #[tokio::test]
    async fn status_mapping() {
        let t = transport();
        t.client().server().reply(Ok(HttpResponse::empty(503)));
        t.client()
            .server()
            .reply(Ok(HttpResponse::json(422, &json!({"error": "date in the past"}))));
        t.client().server().reply(Err("connection refused".into()));

        let transient = t.submit(&op(Method::Create, None)).await.unwrap_err();
        assert!(transient.is_retryable());
        assert_eq!(transient.status, Some(503));

        let rejected = t.submit(&op(Method::Create, None)).await.unwrap_err();
        assert!(!rejected.is_retryable());
        assert!(rejected.message.contains("date in the past"));
        assert_eq!(t.last_error().as_deref(), Some(rejected.message.as_str()));

        let offline = t.submit(&op(Method::Create, None)).await.unwrap_err();
        assert!(offline.is_retryable());
        assert_eq!(offline.status, None);
    }

    #[tokio::test]
    async fn fetch_prefix_reads_keys_from_listing() {
        let t = transport();
        t.client().server().reply(Ok(HttpResponse::json(
            200,
            &json!([{"id": "2024-05-01/a"}, {"id": 42}, {"name": "no key"}]),
        )));

        let entities = t
            .fetch(&FetchRequest {
                entity_kind: "appointments".into(),
                scope: RefreshScope::Prefix("2024-05".into()),
            })
            .await
            .unwrap();
        assert_eq!(entities.len(), 2);
        assert_eq!(entities[1].key, "42");
        assert_eq!(
            t.client().server().last().url,
            "https://api.example.com/v1/appointments?prefix=2024-05"
        );
    }

    #[tokio::test]
    async fn fetch_missing_key_is_empty() {
        let t = transport();
        t.client().server().reply(Ok(HttpResponse::empty(404)));

        let entities = t
            .fetch(&FetchRequest {
                entity_kind: "companies".into(),
                scope: RefreshScope::Key("c1".into()),
            })
            .await
            .unwrap();
        assert!(entities.is_empty());
    }

    #[tokio::test]
    async fn garbled_listing_is_a_serialization_failure() {
        let t = transport();
        t.client().server().reply(Ok(HttpResponse {
            status: 200,
            body: b"<html>maintenance</html>".to_vec(),
        }));
        t.client()
            .server()
            .reply(Ok(HttpResponse::json(200, &json!({"id": "c1"}))));
        let request = FetchRequest {
            entity_kind: "companies".into(),
            scope: RefreshScope::All,
        };

        let not_json = t.fetch(&request).await.unwrap_err();
        assert_eq!(not_json.kind(), FailureKind::Serialization);
        assert!(!not_json.is_retryable());

        let not_array = t.fetch(&request).await.unwrap_err();
        assert_eq!(not_array.kind(), FailureKind::Serialization);
    }

    #[test]
    fn component_encoding() {
        assert_eq!(encode_component("a-b_c.d~e"), "a-b_c.d~e");
        assert_eq!(encode_component("a b/c?d"), "a%20b%2Fc%3Fd");
        assert_eq!(encode_component("é"), "%C3%A9");
    }
}
