//! Request Client: bearer credentials with one transparent refresh.
//!
//! Every call goes out with the stored access token. A `401` whose body
//! carries `"expired": true` triggers exactly one refresh followed by one
//! retry of the original request. Any other outcome of that recovery (no
//! refresh token, refresh rejected, retry expired again) clears the stored
//! session, announces [`SessionEvent::LoginRequired`] and fails the call with
//! [`AppError::SessionExpired`] carrying the refresh failure.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use noticeboard_common::config::ApiConfig;
use noticeboard_common::{AppError, AppResult, Config, IdGenerator};
use noticeboard_model::{Credentials, LoginRequest, LoginResponse, Role, TokenPair};
use reqwest::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};
use validator::Validate;

use crate::credentials::{CredentialStore, FileCredentialStore};

/// Login endpoint.
pub const LOGIN_PATH: &str = "/auth/login";

/// Token refresh endpoint.
pub const REFRESH_PATH: &str = "/auth/refresh";

/// HTTP method subset used by the dashboard API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        })
    }
}

/// One API call, independent of credentials.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Post, path).with_body(body)
    }

    pub fn put(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Put, path).with_body(body)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    #[must_use]
    pub fn with_query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    /// Query parameter value, if set.
    #[must_use]
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Raw response: status plus decoded JSON body (`Null` when empty).
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub const fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub const fn ok(body: Value) -> Self {
        Self::new(200, body)
    }

    /// The `401 {"expired": true}` signal.
    pub fn expired() -> Self {
        Self::new(401, json!({ "expired": true, "message": "Token expired" }))
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// Whether the server flagged the access token as expired.
    ///
    /// A plain `401` is an ordinary authorization failure.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.status == 401 && self.body.get("expired").and_then(Value::as_bool) == Some(true)
    }

    /// Body on success, mapped error otherwise.
    pub fn into_result(self) -> AppResult<Value> {
        if self.is_success() {
            Ok(self.body)
        } else {
            Err(AppError::from_response(self.status, &self.body))
        }
    }
}

/// Executes a single request with an optional bearer token.
#[async_trait]
pub trait HttpExecutor: Send + Sync {
    async fn execute(&self, request: &ApiRequest, bearer: Option<&str>) -> AppResult<ApiResponse>;
}

/// [`HttpExecutor`] over `reqwest`.
#[derive(Clone)]
pub struct ReqwestExecutor {
    client: Client,
    base_url: String,
    ids: IdGenerator,
}

impl ReqwestExecutor {
    /// Create an executor for the configured API.
    pub fn new(config: &ApiConfig) -> AppResult<Self> {
        url::Url::parse(&config.base_url)?;

        let client = Client::builder()
            .timeout(config.timeout())
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| AppError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            ids: IdGenerator::new(),
        })
    }
}

#[async_trait]
impl HttpExecutor for ReqwestExecutor {
    async fn execute(&self, request: &ApiRequest, bearer: Option<&str>) -> AppResult<ApiResponse> {
        let url = format!("{}{}", self.base_url, request.path);
        let request_id = self.ids.request_id();

        let mut builder = match request.method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
            Method::Put => self.client.put(&url),
            Method::Delete => self.client.delete(&url),
        }
        .header("X-Request-Id", &request_id)
        .header("Accept", "application/json");

        if let Some(token) = bearer {
            builder = builder.bearer_auth(token);
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        debug!(method = %request.method, url = %url, request_id = %request_id, "Sending request");

        let response = builder
            .send()
            .await
            .map_err(|e| AppError::Network(e.to_string()))?;
        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| AppError::Network(e.to_string()))?;

        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };

        debug!(status, request_id = %request_id, "Received response");
        Ok(ApiResponse { status, body })
    }
}

/// Session lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    LoggedIn { role: Role },
    TokensRefreshed,
    LoggedOut,
    /// The session could not be recovered; the shell must show login.
    LoginRequired { reason: String },
}

struct Inner {
    executor: Arc<dyn HttpExecutor>,
    credentials: Arc<dyn CredentialStore>,
    events: broadcast::Sender<SessionEvent>,
    refresh_lock: Mutex<()>,
}

/// Authenticated API client.
#[derive(Clone)]
pub struct RequestClient {
    inner: Arc<Inner>,
}

impl RequestClient {
    pub fn new(executor: Arc<dyn HttpExecutor>, credentials: Arc<dyn CredentialStore>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(Inner {
                executor,
                credentials,
                events,
                refresh_lock: Mutex::new(()),
            }),
        }
    }

    /// Production client: `reqwest` plus the configured credential file.
    pub fn from_config(config: &Config) -> AppResult<Self> {
        let executor = ReqwestExecutor::new(&config.api)?;
        let store = FileCredentialStore::new(config.session.credentials_path.clone());
        Ok(Self::new(Arc::new(executor), Arc::new(store)))
    }

    /// Subscribe to session lifecycle events.
    #[must_use]
    pub fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Stored session, if any.
    pub async fn credentials(&self) -> AppResult<Option<Credentials>> {
        self.inner.credentials.load().await
    }

    /// Current access token, if logged in.
    pub async fn access_token(&self) -> AppResult<Option<String>> {
        Ok(self.credentials().await?.map(|c| c.access_token))
    }

    /// Log in and persist the session.
    pub async fn login(&self, request: &LoginRequest) -> AppResult<LoginResponse> {
        request.validate()?;

        let body = serde_json::to_value(request)?;
        let response = self
            .inner
            .executor
            .execute(&ApiRequest::post(LOGIN_PATH, body), None)
            .await?
            .into_result()?;
        let login: LoginResponse = serde_json::from_value(response)?;

        self.inner
            .credentials
            .store(&Credentials::from_login(&login))
            .await?;
        info!(user_id = login.user.user_id, role = %login.user.role, "Logged in");
        let _ = self.inner.events.send(SessionEvent::LoggedIn {
            role: login.user.role,
        });
        Ok(login)
    }

    /// Clear the stored session.
    pub async fn logout(&self) -> AppResult<()> {
        self.inner.credentials.clear().await?;
        info!("Logged out");
        let _ = self.inner.events.send(SessionEvent::LoggedOut);
        Ok(())
    }

    /// Send a request, refreshing the credential at most once.
    pub async fn send(&self, request: &ApiRequest) -> AppResult<Value> {
        let stale = self.access_token().await?;
        let response = self
            .inner
            .executor
            .execute(request, stale.as_deref())
            .await?;
        if !response.is_expired() {
            return response.into_result();
        }

        debug!(method = %request.method, path = %request.path, "Access token expired");
        let refreshed = match self.refresh(stale.as_deref()).await {
            Ok(credentials) => credentials,
            Err(AppError::SessionExpired(reason)) => return Err(self.require_login(reason).await),
            Err(e) => return Err(self.require_login(e.to_string()).await),
        };

        let retried = self
            .inner
            .executor
            .execute(request, Some(&refreshed.access_token))
            .await?;
        if retried.is_expired() {
            return Err(self
                .require_login("access token expired again after refresh".to_string())
                .await);
        }
        retried.into_result()
    }

    /// Rotate the token pair.
    ///
    /// Concurrent callers that all saw the same expired token share one
    /// refresh: whoever comes second finds the rotated pair already stored.
    async fn refresh(&self, stale_access: Option<&str>) -> AppResult<Credentials> {
        let _guard = self.inner.refresh_lock.lock().await;

        let current = self
            .inner
            .credentials
            .load()
            .await?
            .filter(|c| !c.refresh_token.is_empty())
            .ok_or_else(|| AppError::SessionExpired("no refresh token stored".to_string()))?;
        if stale_access.is_some_and(|stale| stale != current.access_token) {
            return Ok(current);
        }

        let body = json!({ "refreshToken": current.refresh_token });
        let response = self
            .inner
            .executor
            .execute(&ApiRequest::post(REFRESH_PATH, body), None)
            .await?
            .into_result()?;
        let pair: TokenPair = serde_json::from_value(response)?;

        let next = current.rotated(pair);
        self.inner.credentials.store(&next).await?;
        info!("Access token refreshed");
        let _ = self.inner.events.send(SessionEvent::TokensRefreshed);
        Ok(next)
    }

    async fn require_login(&self, reason: String) -> AppError {
        warn!(reason = %reason, "Session could not be recovered");
        if let Err(e) = self.inner.credentials.clear().await {
            warn!(error = %e, "Failed to clear credentials");
        }
        let _ = self.inner.events.send(SessionEvent::LoginRequired {
            reason: reason.clone(),
        });
        AppError::SessionExpired(reason)
    }

    /// Send a prepared request and decode the response.
    pub async fn get<T: DeserializeOwned>(&self, request: ApiRequest) -> AppResult<T> {
        decode(self.send(&request).await?)
    }

    /// `POST` a body and decode the response.
    pub async fn post<B, T>(&self, path: &str, body: &B) -> AppResult<T>
    where
        B: Serialize + Sync + ?Sized,
        T: DeserializeOwned,
    {
        let request = ApiRequest::post(path, serde_json::to_value(body)?);
        decode(self.send(&request).await?)
    }

    /// `PUT` a body and decode the response.
    pub async fn put<B, T>(&self, path: &str, body: &B) -> AppResult<T>
    where
        B: Serialize + Sync + ?Sized,
        T: DeserializeOwned,
    {
        let request = ApiRequest::put(path, serde_json::to_value(body)?);
        decode(self.send(&request).await?)
    }

    /// `DELETE`, discarding the response body.
    pub async fn delete(&self, path: &str) -> AppResult<()> {
        self.send(&ApiRequest::delete(path)).await.map(|_| ())
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> AppResult<T> {
    serde_json::from_value(value).map_err(AppError::from)
}
