//! API client for the compliance platform REST backend.
//!
//! Every request reads the bearer token from the shared `CredentialStore`
//! at send time, so token refreshes done by the session manager apply to
//! requests issued by any clone of the client.

use std::time::Duration;

use reqwest::{header, Client};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::auth::CredentialStore;
use crate::jobs::{OperationId, RunStarted, RunStatusResponse};

use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
/// 30s allows for slow API responses while failing fast enough for good UX.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Prefix of the agent endpoints
const AGENTS_PATH: &str = "/api/v1/agents";

/// API client for the compliance backend.
/// Clone is cheap - reqwest::Client and CredentialStore share state via Arc.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    credentials: CredentialStore,
}

impl ApiClient {
    /// Create a new API client reading tokens from `credentials`
    pub fn new(base_url: &str, credentials: CredentialStore) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Authorization header for the token in force right now.
    /// Without a token (dev mode, logged out) the header is omitted.
    fn auth_headers(&self) -> Result<header::HeaderMap, ApiError> {
        let mut headers = header::HeaderMap::new();
        if let Some(token) = self.credentials.token() {
            let mut value = header::HeaderValue::from_str(&format!("Bearer {}", token.secret()))
                .map_err(|_| ApiError::RequestFailed("Bearer token is not a valid header value".to_string()))?;
            value.set_sensitive(true);
            headers.insert(header::AUTHORIZATION, value);
        }
        Ok(headers)
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    async fn parse<T: DeserializeOwned>(response: reqwest::Response, url: &str) -> Result<T, ApiError> {
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| {
            ApiError::InvalidResponse(format!("Failed to parse JSON response from {}: {}", url, e))
        })
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let url = self.url(path);
        debug!(url = %url, "GET");
        let response = self
            .client
            .get(&url)
            .headers(self.auth_headers()?)
            .send()
            .await?;

        let response = Self::check_response(response).await?;
        Self::parse(response, &url).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let url = self.url(path);
        debug!(url = %url, "POST");
        let response = self
            .client
            .post(&url)
            .headers(self.auth_headers()?)
            .json(body)
            .send()
            .await?;

        let response = Self::check_response(response).await?;
        Self::parse(response, &url).await
    }

    // ========================================================================
    // Agent runs
    // ========================================================================

    /// Start an agent run, returning the id to poll
    pub async fn trigger_run(
        &self,
        agent: &str,
        input: &serde_json::Value,
    ) -> Result<RunStarted, ApiError> {
        let path = format!("{}/{}/trigger", AGENTS_PATH, agent);
        let started: RunStarted = self.post(&path, input).await?;
        debug!(operation = %started.id, agent = agent, "Agent run triggered");
        Ok(started)
    }

    /// Sample the status of an agent run
    pub async fn fetch_run(&self, id: &OperationId) -> Result<RunStatusResponse, ApiError> {
        let path = format!("{}/runs/{}", AGENTS_PATH, id);
        self.get(&path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Token;

    #[test]
    fn test_url_joining() {
        let api = ApiClient::new("https://api.example.com/", CredentialStore::new())
            .expect("client should build");
        assert_eq!(api.url("/api/v1/agents/runs/1"), "https://api.example.com/api/v1/agents/runs/1");
        assert_eq!(api.url("health"), "https://api.example.com/health");
    }

    #[test]
    fn test_auth_header_tracks_credential_store() {
        let credentials = CredentialStore::new();
        let api = ApiClient::new("https://api.example.com", credentials.clone())
            .expect("client should build");

        // No token: no header at all.
        let headers = api.auth_headers().expect("headers");
        assert!(headers.get(header::AUTHORIZATION).is_none());

        credentials.set(Some(Token::new("first", None)));
        let headers = api.auth_headers().expect("headers");
        assert_eq!(
            headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()),
            Some("Bearer first")
        );

        // A clone made before the refresh still sees the new token.
        let cloned = api.clone();
        credentials.set(Some(Token::new("second", None)));
        let headers = cloned.auth_headers().expect("headers");
        assert_eq!(
            headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()),
            Some("Bearer second")
        );
        assert!(headers.get(header::AUTHORIZATION).is_some_and(|v| v.is_sensitive()));
    }

    #[test]
    fn test_invalid_token_is_rejected() {
        let credentials = CredentialStore::new();
        credentials.set(Some(Token::new("bad\ntoken", None)));
        let api = ApiClient::new("https://api.example.com", credentials).expect("client should build");
        assert!(matches!(api.auth_headers(), Err(ApiError::RequestFailed(_))));
    }
}
