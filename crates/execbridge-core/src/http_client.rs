//! HTTP client for execbridge companion services.
//!
//! Wraps reqwest with API-key injection and the client-id / CSRF token
//! handshake used by token-guarded REST endpoints: without an API key, the
//! client first fetches its id from a response header and a CSRF token from a
//! `CSRF-Token-<id prefix>` cookie, then echoes both on every request.

use std::sync::{Mutex, PoisonError};

use reqwest::header::SET_COOKIE;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

/// HTTP client errors.
#[derive(Debug, Error)]
pub enum HttpClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid endpoint or API call")]
    InvalidEndpoint,

    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("Invalid CSRF token")]
    InvalidCsrfToken,

    #[error("Invalid API key")]
    InvalidApiKey,

    #[error("HTTP status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to get client ID")]
    MissingClientId,

    #[error("Failed to get CSRF token")]
    MissingCsrfToken,

    #[error("Invalid response body: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Configuration for [`HttpClient`].
#[derive(Debug, Clone, Default)]
pub struct HttpClientConfig {
    /// Prefix inserted between the endpoint and every request path (e.g. `/api/v1`).
    pub url_prefix: String,
    /// Header carrying the API key.
    pub header_api_key_name: String,
    /// API key. When empty, the client-id / CSRF handshake is used instead.
    pub api_key: String,
    /// Header carrying (and returning) the client id.
    pub header_client_key_name: String,
    /// Skip the CSRF token requirement during the handshake.
    pub csrf_disable: bool,
}

#[derive(Debug, Default)]
struct AuthState {
    client_id: String,
    csrf: String,
}

impl AuthState {
    /// First five characters of the client id, used to name CSRF cookies/headers.
    fn id_prefix(&self) -> &str {
        self.client_id.get(..5).unwrap_or(&self.client_id)
    }
}

/// REST client with API-key and CSRF token handling.
#[derive(Debug)]
pub struct HttpClient {
    http: reqwest::Client,
    endpoint: String,
    config: HttpClientConfig,
    auth: Mutex<AuthState>,
}

impl HttpClient {
    /// Create a client for `base_url`.
    ///
    /// Without an API key this performs the client-id / CSRF handshake and
    /// fails if the server does not provide them.
    pub async fn connect(base_url: &str, config: HttpClientConfig) -> Result<Self, HttpClientError> {
        // reqwest is built with rustls-no-provider; `Err` means a provider is
        // already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let client = Self {
            http: reqwest::Client::builder().build()?,
            endpoint: base_url.to_string(),
            config,
            auth: Mutex::new(AuthState::default()),
        };

        if client.config.api_key.is_empty() {
            client.fetch_client_id_and_csrf().await?;
        }
        Ok(client)
    }

    /// Client id assigned by the server (empty when using an API key).
    pub fn client_id(&self) -> String {
        self.auth().client_id.clone()
    }

    /// Build the full URL for `path` from the endpoint and the configured prefix.
    pub fn format_url(&self, path: &str) -> String {
        let mut url = self.endpoint.clone();
        if !url.ends_with('/') {
            url.push('/');
        }
        url.push_str(self.config.url_prefix.trim_start_matches('/'));
        if !url.ends_with('/') {
            url.push('/');
        }
        url.push_str(path.trim_start_matches('/'));
        url
    }

    /// GET `path` and return the response body.
    pub async fn get(&self, path: &str) -> Result<Vec<u8>, HttpClientError> {
        let resp = self.handle_request(self.http.get(self.format_url(path))).await?;
        Ok(resp.bytes().await?.to_vec())
    }

    /// GET `path` and decode the JSON response body.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, HttpClientError> {
        let body = self.get(path).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// POST `body` to `path` and return the response body.
    pub async fn post(&self, path: &str, body: String) -> Result<Vec<u8>, HttpClientError> {
        let resp = self
            .handle_request(self.http.post(self.format_url(path)).body(body))
            .await?;
        Ok(resp.bytes().await?.to_vec())
    }

    fn auth(&self) -> std::sync::MutexGuard<'_, AuthState> {
        self.auth.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn fetch_client_id_and_csrf(&self) -> Result<(), HttpClientError> {
        self.handle_request(self.http.get(&self.endpoint)).await?;
        let auth = self.auth();
        if auth.client_id.is_empty() {
            return Err(HttpClientError::MissingClientId);
        }
        if !self.config.csrf_disable && auth.csrf.is_empty() {
            return Err(HttpClientError::MissingCsrfToken);
        }
        Ok(())
    }

    /// Attach auth headers, send, and absorb client-id / CSRF changes.
    async fn send(&self, mut builder: RequestBuilder) -> Result<Response, HttpClientError> {
        if !self.config.header_api_key_name.is_empty() && !self.config.api_key.is_empty() {
            builder = builder.header(
                self.config.header_api_key_name.as_str(),
                self.config.api_key.as_str(),
            );
        }
        {
            let auth = self.auth();
            if !self.config.header_client_key_name.is_empty() && !auth.client_id.is_empty() {
                builder = builder.header(
                    self.config.header_client_key_name.as_str(),
                    auth.client_id.as_str(),
                );
            }
            if !auth.csrf.is_empty() {
                builder = builder.header(
                    format!("X-CSRF-Token-{}", auth.id_prefix()),
                    auth.csrf.as_str(),
                );
            }
        }

        let resp = builder.send().await?;
        debug!(status = %resp.status(), url = %resp.url(), "HTTP response");
        self.absorb_auth(&resp);
        Ok(resp)
    }

    fn absorb_auth(&self, resp: &Response) {
        let mut auth = self.auth();
        if !self.config.header_client_key_name.is_empty()
            && let Some(cid) = resp
                .headers()
                .get(self.config.header_client_key_name.as_str())
                .and_then(|v| v.to_str().ok())
            && !cid.is_empty()
            && auth.client_id != cid
        {
            auth.client_id = cid.to_string();
        }

        if auth.client_id.is_empty() {
            return;
        }
        let cookie_name = format!("CSRF-Token-{}", auth.id_prefix());
        let token = resp
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|c| c.split(';').next()?.split_once('='))
            .find(|(name, _)| name.trim() == cookie_name)
            .map(|(_, value)| value.trim().to_string());
        if let Some(token) = token {
            auth.csrf = token;
        }
    }

    async fn handle_request(&self, builder: RequestBuilder) -> Result<Response, HttpClientError> {
        let resp = self.send(builder).await?;
        match resp.status() {
            StatusCode::OK => Ok(resp),
            StatusCode::NOT_FOUND => Err(HttpClientError::InvalidEndpoint),
            StatusCode::UNAUTHORIZED => Err(HttpClientError::InvalidCredentials),
            StatusCode::FORBIDDEN if self.config.api_key.is_empty() => {
                // Pick up a fresh token for the next request.
                if let Err(e) = self.send(self.http.get(&self.endpoint)).await {
                    debug!(error = %e, "CSRF token refresh failed");
                }
                Err(HttpClientError::InvalidCsrfToken)
            }
            StatusCode::FORBIDDEN => Err(HttpClientError::InvalidApiKey),
            status => Err(HttpClientError::Status {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            }),
        }
    }
}
