//! Sync API Client - HTTP communication with the sync server
//!
//! Handles the REST calls the sync engine needs:
//! - Collection download (accounts, unsubscribed)
//! - Collection upload (server assigns the next version)
//! - Token refresh on 401
//!
//! The engine talks to the server only through the `SyncRemote` trait so the
//! orchestrator and retry queue can be driven by a scripted fake in tests.

use super::models::CollectionKind;
use async_trait::async_trait;
use reqwest::{Client, Method, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Overall client timeout
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Pushes give up sooner so a dead network never stalls a sync cycle
const PUSH_TIMEOUT_SECS: u64 = 5;

/// Error text fragments that mean the account is not entitled to sync
const ENTITLEMENT_MARKERS: [&str; 5] = [
    "403",
    "forbidden",
    "subscription",
    "account limit",
    "upgrade your subscription",
];

// ============================================================================
// Remote Interface
// ============================================================================

/// A collection as stored on the server
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCollection {
    /// Raw collection payload (`null` when the server has nothing yet)
    pub payload: Value,
    pub version: i64,
}

impl RemoteCollection {
    pub fn empty() -> Self {
        Self {
            payload: Value::Null,
            version: 0,
        }
    }
}

/// Narrow push/pull interface to the remote store
#[async_trait]
pub trait SyncRemote: Send + Sync {
    /// Download the current remote collection and its version
    async fn fetch(&self, kind: CollectionKind) -> Result<RemoteCollection, SyncApiError>;

    /// Replace the remote collection; returns the version the server assigned
    async fn push(&self, kind: CollectionKind, payload: Value) -> Result<i64, SyncApiError>;
}

// ============================================================================
// HTTP Client
// ============================================================================

/// Bearer credentials for the sync server
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthTokens {
    pub token: Option<String>,
    pub refresh_token: Option<String>,
}

/// Called after a successful refresh so the new tokens can be persisted
pub type TokenRefreshHook = Arc<dyn Fn(&AuthTokens) + Send + Sync>;

/// API client for the newsletter sync server
pub struct SyncApiClient {
    client: Client,
    base_url: String,
    /// Access/refresh token pair (cached in memory)
    tokens: Arc<RwLock<AuthTokens>>,
    on_token_refresh: Option<TokenRefreshHook>,
}

impl SyncApiClient {
    /// Create new API client
    pub fn new(base_url: &str, tokens: AuthTokens) -> Result<Self, SyncApiError> {
        if base_url.trim().is_empty() {
            return Err(SyncApiError::NotConfigured);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens: Arc::new(RwLock::new(tokens)),
            on_token_refresh: None,
        })
    }

    /// Register a callback invoked with refreshed tokens
    pub fn with_token_refresh_hook(mut self, hook: TokenRefreshHook) -> Self {
        self.on_token_refresh = Some(hook);
        self
    }

    /// Get current tokens
    pub async fn tokens(&self) -> AuthTokens {
        self.tokens.read().await.clone()
    }

    /// Replace cached tokens (after login)
    pub async fn set_tokens(&self, tokens: AuthTokens) {
        let mut guard = self.tokens.write().await;
        *guard = tokens;
    }

    fn collection_url(&self, kind: CollectionKind) -> String {
        format!("{}/api/v1/sync/{}", self.base_url, kind.as_str())
    }

    /// Refresh access token
    pub async fn refresh_token(&self) -> Result<AuthTokens, SyncApiError> {
        let refresh_token = self
            .tokens
            .read()
            .await
            .refresh_token
            .clone()
            .ok_or(SyncApiError::Unauthorized)?;

        let response = self
            .client
            .post(format!("{}/api/v1/auth/refresh", self.base_url))
            .json(&RefreshRequest { refresh_token })
            .send()
            .await?;

        let auth: AuthResponse = handle_response(response).await?;

        let tokens = AuthTokens {
            token: Some(auth.token),
            refresh_token: Some(auth.refresh_token),
        };
        self.set_tokens(tokens.clone()).await;

        if let Some(hook) = &self.on_token_refresh {
            hook(&tokens);
        }

        log::info!("Sync access token refreshed");
        Ok(tokens)
    }

    async fn send_once(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        timeout: Option<Duration>,
    ) -> Result<Response, SyncApiError> {
        let mut request = self.client.request(method, url);

        if let Some(token) = self.tokens.read().await.token.clone() {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        Ok(request.send().await?)
    }

    /// Send a request, refreshing the access token once on 401
    async fn send_authorized(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        timeout: Option<Duration>,
    ) -> Result<Response, SyncApiError> {
        let response = self.send_once(method.clone(), url, body, timeout).await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        if self.tokens.read().await.refresh_token.is_none() {
            return Ok(response);
        }

        log::info!("Access token rejected, attempting refresh");
        self.refresh_token().await?;
        self.send_once(method, url, body, timeout).await
    }

    /// Download a collection
    pub async fn download(&self, kind: CollectionKind) -> Result<RemoteCollection, SyncApiError> {
        let response = self
            .send_authorized(Method::GET, &self.collection_url(kind), None, None)
            .await?;

        // Handle 404 as empty data (first sync)
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(RemoteCollection::empty());
        }

        let body: Value = handle_response(response).await?;
        parse_collection(kind, body)
    }

    /// Upload a collection
    pub async fn upload(&self, kind: CollectionKind, payload: Value) -> Result<i64, SyncApiError> {
        let mut body = serde_json::Map::new();
        body.insert(kind.as_str().to_string(), payload);
        let body = Value::Object(body);

        let response = self
            .send_authorized(
                Method::POST,
                &self.collection_url(kind),
                Some(&body),
                Some(Duration::from_secs(PUSH_TIMEOUT_SECS)),
            )
            .await?;

        let body: Value = handle_response(response).await?;
        Ok(parse_collection(kind, body)?.version)
    }
}

#[async_trait]
impl SyncRemote for SyncApiClient {
    async fn fetch(&self, kind: CollectionKind) -> Result<RemoteCollection, SyncApiError> {
        self.download(kind).await
    }

    async fn push(&self, kind: CollectionKind, payload: Value) -> Result<i64, SyncApiError> {
        self.upload(kind, payload).await
    }
}

/// Split `{"<kind>": <payload>, "version": n}` into its parts
fn parse_collection(kind: CollectionKind, mut body: Value) -> Result<RemoteCollection, SyncApiError> {
    let version = body
        .get("version")
        .and_then(Value::as_i64)
        .ok_or_else(|| SyncApiError::InvalidResponse("missing version".to_string()))?;

    let payload = body
        .get_mut(kind.as_str())
        .map(Value::take)
        .unwrap_or(Value::Null);

    Ok(RemoteCollection { payload, version })
}

// ============================================================================
// API Request/Response Types
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthResponse {
    pub token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub expires_at: i64,
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorResponse {
    error: String,
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncApiError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Unauthorized - login required")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("Invalid response from server: {0}")]
    InvalidResponse(String),

    #[error("Sync server is not configured")]
    NotConfigured,
}

impl SyncApiError {
    /// Authorization or subscription failure; never worth retrying
    pub fn is_entitlement(&self) -> bool {
        match self {
            Self::Forbidden(_) => true,
            // Transport errors carry the request URL, which may contain a marker
            Self::Request(_) => false,
            Self::Unauthorized | Self::NotConfigured | Self::RateLimitExceeded => false,
            Self::ServerError { message, .. } | Self::InvalidResponse(message) => {
                is_entitlement_message(message)
            }
        }
    }

    /// Transient failure that the retry queue should keep
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Unauthorized | Self::NotConfigured) && !self.is_entitlement()
    }
}

/// Whether an error text names an authorization or subscription problem
pub fn is_entitlement_message(text: &str) -> bool {
    let text = text.to_lowercase();
    ENTITLEMENT_MARKERS.iter().any(|marker| text.contains(marker))
}

/// Handle successful JSON response
async fn handle_response<T: serde::de::DeserializeOwned>(
    response: Response,
) -> Result<T, SyncApiError> {
    let status = response.status();

    if status.is_success() {
        response
            .json::<T>()
            .await
            .map_err(|e| SyncApiError::InvalidResponse(e.to_string()))
    } else {
        Err(handle_error(response).await)
    }
}

/// Convert error response to SyncApiError
async fn handle_error(response: Response) -> SyncApiError {
    let status = response.status();
    let text = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());

    // Prefer the server's {"error": "..."} message when present
    let message = serde_json::from_str::<ErrorResponse>(&text)
        .map(|e| e.error)
        .unwrap_or(text);

    match status {
        StatusCode::UNAUTHORIZED => SyncApiError::Unauthorized,
        StatusCode::FORBIDDEN => SyncApiError::Forbidden(message),
        StatusCode::TOO_MANY_REQUESTS => SyncApiError::RateLimitExceeded,
        _ => SyncApiError::ServerError {
            status: status.as_u16(),
            message,
        },
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use std::sync::Mutex;

    fn tokens(token: &str, refresh: Option<&str>) -> AuthTokens {
        AuthTokens {
            token: Some(token.to_string()),
            refresh_token: refresh.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_download_parses_collection() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/sync/accounts")
            .match_header("authorization", "Bearer t1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"accounts": [{"id": "a@x.com"}], "version": 7}"#)
            .create_async()
            .await;

        let client = SyncApiClient::new(&server.url(), tokens("t1", None)).unwrap();
        let remote = client.fetch(CollectionKind::Accounts).await.unwrap();

        mock.assert_async().await;
        assert_eq!(remote.version, 7);
        assert_eq!(remote.payload[0]["id"], "a@x.com");
    }

    #[tokio::test]
    async fn test_download_not_found_is_empty() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/v1/sync/unsubscribed")
            .with_status(404)
            .create_async()
            .await;

        let client = SyncApiClient::new(&server.url(), tokens("t1", None)).unwrap();
        let remote = client.fetch(CollectionKind::Unsubscribed).await.unwrap();
        assert_eq!(remote, RemoteCollection::empty());
    }

    #[tokio::test]
    async fn test_upload_wraps_payload_and_returns_version() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/sync/unsubscribed")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "unsubscribed": {"newsletters": []}
            })))
            .with_status(200)
            .with_body(r#"{"unsubscribed": {"newsletters": []}, "version": 3}"#)
            .create_async()
            .await;

        let client = SyncApiClient::new(&server.url(), tokens("t1", None)).unwrap();
        let version = client
            .push(CollectionKind::Unsubscribed, serde_json::json!({"newsletters": []}))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(version, 3);
    }

    #[tokio::test]
    async fn test_forbidden_is_entitlement() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/v1/sync/accounts")
            .with_status(403)
            .with_body(r#"{"error": "active subscription required"}"#)
            .create_async()
            .await;

        let client = SyncApiClient::new(&server.url(), tokens("t1", None)).unwrap();
        let err = client
            .push(CollectionKind::Accounts, serde_json::json!([]))
            .await
            .unwrap_err();

        assert!(matches!(err, SyncApiError::Forbidden(ref m) if m == "active subscription required"));
        assert!(err.is_entitlement());
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_server_error_is_retryable() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/v1/sync/accounts")
            .with_status(502)
            .with_body("bad gateway")
            .create_async()
            .await;

        let client = SyncApiClient::new(&server.url(), tokens("t1", None)).unwrap();
        let err = client
            .push(CollectionKind::Accounts, serde_json::json!([]))
            .await
            .unwrap_err();

        assert!(matches!(err, SyncApiError::ServerError { status: 502, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_unauthorized_refreshes_and_replays() {
        let mut server = Server::new_async().await;
        let stale = server
            .mock("GET", "/api/v1/sync/accounts")
            .match_header("authorization", "Bearer old")
            .with_status(401)
            .create_async()
            .await;
        let refresh = server
            .mock("POST", "/api/v1/auth/refresh")
            .match_body(Matcher::Json(serde_json::json!({"refresh_token": "r1"})))
            .with_status(200)
            .with_body(r#"{"token": "new", "refresh_token": "r2", "expires_at": 0}"#)
            .create_async()
            .await;
        let fresh = server
            .mock("GET", "/api/v1/sync/accounts")
            .match_header("authorization", "Bearer new")
            .with_status(200)
            .with_body(r#"{"accounts": [], "version": 1}"#)
            .create_async()
            .await;

        let saved: Arc<Mutex<Option<AuthTokens>>> = Arc::new(Mutex::new(None));
        let sink = saved.clone();
        let client = SyncApiClient::new(&server.url(), tokens("old", Some("r1")))
            .unwrap()
            .with_token_refresh_hook(Arc::new(move |t: &AuthTokens| {
                *sink.lock().unwrap() = Some(t.clone());
            }));

        let remote = client.fetch(CollectionKind::Accounts).await.unwrap();
        assert_eq!(remote.version, 1);

        stale.assert_async().await;
        refresh.assert_async().await;
        fresh.assert_async().await;

        let persisted = saved.lock().unwrap().clone().unwrap();
        assert_eq!(persisted, tokens("new", Some("r2")));
        assert_eq!(client.tokens().await, persisted);
    }

    #[tokio::test]
    async fn test_unauthorized_without_refresh_token() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/v1/sync/accounts")
            .with_status(401)
            .create_async()
            .await;

        let client = SyncApiClient::new(&server.url(), tokens("old", None)).unwrap();
        let err = client.fetch(CollectionKind::Accounts).await.unwrap_err();

        assert!(matches!(err, SyncApiError::Unauthorized));
        assert!(!err.is_retryable());
        assert!(!err.is_entitlement());
    }

    #[test]
    fn test_empty_base_url_is_not_configured() {
        assert!(matches!(
            SyncApiClient::new("  ", AuthTokens::default()),
            Err(SyncApiError::NotConfigured)
        ));
    }

    #[test]
    fn test_entitlement_markers() {
        assert!(is_entitlement_message("Account limit reached"));
        assert!(is_entitlement_message("please upgrade your subscription"));
        assert!(!is_entitlement_message("connection reset by peer"));

        let err = SyncApiError::ServerError {
            status: 500,
            message: "subscription expired".to_string(),
        };
        assert!(!err.is_retryable());

        assert!(SyncApiError::RateLimitExceeded.is_retryable());
        assert!(SyncApiError::InvalidResponse("eof".to_string()).is_retryable());
    }
}
