//! REST client for the backend's `/api` surface. Every request asks the locator for the
//! current base URL; a connection-level failure invalidates it so the next call re-resolves.

use crate::error::ApiError;
use locator::Locator;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use signance_core::endpoint::join_path;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SetupStatus {
    pub setup_required: bool,
    #[serde(default)]
    pub user_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Token {
    pub access_token: String,
    #[serde(default)]
    pub token_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub role: String,
}

#[derive(Clone)]
pub struct ApiClient {
    locator: Locator,
    http: Client,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(locator: Locator) -> Result<Self, ApiError> {
        ApiClient::with_timeout(locator, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(locator: Locator, timeout: Duration) -> Result<Self, ApiError> {
        let http = Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()
            .map_err(|e| ApiError::Client(e.to_string()))?;
        Ok(ApiClient { locator, http, token: None })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn set_token(&mut self, token: Option<String>) {
        self.token = token;
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    /// `{base}/api{path}` on the currently resolved backend.
    pub async fn url(&self, path: &str) -> Result<String, ApiError> {
        let base = self.locator.base_url().await?;
        Ok(join_path(&join_path(&base, "/api"), path))
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let rb = self.request(Method::GET, path).await?;
        self.execute(rb).await
    }

    pub async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let rb = self.request(Method::POST, path).await?.json(body);
        self.execute(rb).await
    }

    pub async fn put<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let rb = self.request(Method::PUT, path).await?.json(body);
        self.execute(rb).await
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        let rb = self.request(Method::DELETE, path).await?;
        let _: serde_json::Value = self.execute(rb).await?;
        Ok(())
    }

    pub async fn check_setup(&self) -> Result<SetupStatus, ApiError> {
        self.get("/auth/check-setup").await
    }

    /// Form-encoded login. On success the token is kept for subsequent calls.
    pub async fn login(&mut self, username: &str, password: &str) -> Result<Token, ApiError> {
        let form = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("username", username)
            .append_pair("password", password)
            .finish();
        let rb = self
            .request(Method::POST, "/auth/login")
            .await?
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(form);
        let token: Token = self.execute(rb).await?;
        self.token = Some(token.access_token.clone());
        Ok(token)
    }

    pub async fn logout(&mut self) -> Result<(), ApiError> {
        let rb = self.request(Method::POST, "/auth/logout").await?;
        let result: Result<serde_json::Value, ApiError> = self.execute(rb).await;
        self.token = None;
        result.map(|_| ())
    }

    pub async fn current_user(&self) -> Result<User, ApiError> {
        self.get("/auth/me").await
    }

    async fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, ApiError> {
        let url = self.url(path).await?;
        debug!(%method, %url, "api request");
        let mut rb = self.http.request(method, url).header(ACCEPT, "application/json");
        if let Some(t) = &self.token {
            rb = rb.bearer_auth(t);
        }
        Ok(rb)
    }

    async fn execute<T: DeserializeOwned>(&self, rb: RequestBuilder) -> Result<T, ApiError> {
        let resp = match rb.send().await {
            Ok(r) => r,
            Err(e) => {
                if e.is_connect() || e.is_timeout() {
                    warn!(error = %e, "backend unreachable; dropping resolved endpoint");
                    self.locator.invalidate();
                }
                return Err(ApiError::Transport(e.to_string()));
            }
        };
        let status = resp.status();
        let body = resp.bytes().await.map_err(|e| ApiError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(ApiError::from_status(status.as_u16(), &body));
        }
        let body: &[u8] = if body.is_empty() { b"null" } else { &body };
        serde_json::from_slice(body).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixed_locator, http_response, serve_capture};
    use locator::LocatorState;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn get_builds_api_url_and_sends_token() {
        let (port, mut requests) = serve_capture(http_response("200 OK", r#"{"id":1,"username":"admin","role":"admin"}"#)).await;
        let api = ApiClient::new(fixed_locator(port)).unwrap().with_token("t0k");

        let user = api.current_user().await.unwrap();
        assert_eq!(user, User { id: 1, username: "admin".into(), role: "admin".into() });

        let req = requests.recv().await.unwrap();
        assert!(req.starts_with("GET /api/auth/me HTTP/1.1"), "{req}");
        assert!(req.to_ascii_lowercase().contains("authorization: bearer t0k"), "{req}");
    }

    #[tokio::test]
    async fn login_is_form_encoded_and_stores_token() {
        let (port, mut requests) =
            serve_capture(http_response("200 OK", r#"{"access_token":"abc","token_type":"bearer"}"#)).await;
        let mut api = ApiClient::new(fixed_locator(port)).unwrap();

        let token = api.login("admin", "p@ss word").await.unwrap();
        assert_eq!(token.access_token, "abc");
        assert_eq!(api.token(), Some("abc"));

        let req = requests.recv().await.unwrap();
        assert!(req.starts_with("POST /api/auth/login"), "{req}");
        assert!(req.contains("application/x-www-form-urlencoded"), "{req}");
        assert!(req.ends_with("username=admin&password=p%40ss+word"), "{req}");
    }

    #[tokio::test]
    async fn error_status_carries_detail() {
        let (port, _requests) = serve_capture(http_response("404 Not Found", r#"{"detail":"Playlist not found"}"#)).await;
        let api = ApiClient::new(fixed_locator(port)).unwrap();

        match api.get::<serde_json::Value>("/playlists/9").await {
            Err(ApiError::NotFound(d)) => assert_eq!(d, "Playlist not found"),
            other => panic!("{other:?}"),
        }
        // an HTTP error is not a connectivity problem
        assert_eq!(api.locator().state(), LocatorState::Resolved);
    }

    #[tokio::test]
    async fn unauthorized_maps_to_variant() {
        let (port, _requests) = serve_capture(http_response("401 Unauthorized", r#"{"detail":"Not authenticated"}"#)).await;
        let api = ApiClient::new(fixed_locator(port)).unwrap();
        assert!(matches!(api.check_setup().await, Err(ApiError::Unauthorized)));
    }

    #[tokio::test]
    async fn empty_body_decodes_as_unit() {
        let (port, _requests) = serve_capture(http_response("200 OK", "")).await;
        let api = ApiClient::new(fixed_locator(port)).unwrap();
        api.delete("/media/3").await.unwrap();
    }

    #[tokio::test]
    async fn connection_failure_invalidates_locator() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let locator = fixed_locator(port);
        let api = ApiClient::new(locator.clone()).unwrap();

        let err = api.check_setup().await.unwrap_err();
        assert!(err.is_transport(), "{err:?}");
        assert_eq!(locator.state(), LocatorState::Unresolved);
        assert_eq!(locator.discovery_runs(), 1);
    }
}
