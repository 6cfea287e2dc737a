//! OpenID Connect identity provider for a Keycloak realm.
//!
//! Uses the realm token endpoint for the password and refresh-token grants
//! and decodes identity claims from the access-token payload. The refresh
//! token stays inside the provider (and optionally the OS keychain); the
//! session manager only ever sees access tokens.

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use futures::future::{BoxFuture, FutureExt};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::credentials::Token;
use super::identity::Claims;
use super::keychain::Keychain;
use super::provider::{
    IdentityProvider, InitSession, LoginRequest, ProviderError, Refresh, TokenGrant,
};

/// HTTP request timeout for provider calls.
/// Shorter than the API timeout: an unresponsive provider should fall
/// through to the dev-mode decision quickly.
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Scope requested on login
const LOGIN_SCOPE: &str = "openid profile email";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<i64>,
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OidcErrorResponse {
    error: String,
    error_description: Option<String>,
}

/// Provider-side session state
struct ProviderSession {
    access: Token,
    refresh_token: Option<String>,
}

pub struct KeycloakProvider {
    client: Client,
    issuer_url: String,
    client_id: String,
    keychain: Option<Keychain>,
    session: Mutex<Option<ProviderSession>>,
}

impl KeycloakProvider {
    /// Create a provider for the realm at `issuer_url`
    /// (e.g. `https://id.example.com/realms/acme`).
    pub fn new(issuer_url: &str, client_id: &str) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        Ok(Self {
            client,
            issuer_url: issuer_url.trim_end_matches('/').to_string(),
            client_id: client_id.to_string(),
            keychain: None,
            session: Mutex::new(None),
        })
    }

    /// Persist refresh tokens in the given keychain entry
    pub fn with_keychain(mut self, keychain: Keychain) -> Self {
        self.keychain = Some(keychain);
        self
    }

    fn discovery_url(&self) -> String {
        format!("{}/.well-known/openid-configuration", self.issuer_url)
    }

    fn token_url(&self) -> String {
        format!("{}/protocol/openid-connect/token", self.issuer_url)
    }

    fn logout_url(&self) -> String {
        format!("{}/protocol/openid-connect/logout", self.issuer_url)
    }

    /// Check that the realm answers at all
    async fn probe(&self) -> Result<(), ProviderError> {
        let response = self.client.get(self.discovery_url()).send().await?;
        let status = response.status();
        if status.is_server_error() {
            return Err(ProviderError::Unreachable(format!("Discovery returned {}", status)));
        }
        Ok(())
    }

    async fn token_request(
        &self,
        form: &[(&str, &str)],
    ) -> Result<(TokenGrant, Option<String>), ProviderError> {
        let response = self.client.post(self.token_url()).form(form).send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify(status, &body));
        }

        let tokens: TokenResponse = response.json().await?;
        let claims = decode_claims(&tokens.access_token)?;
        let expires_at = tokens
            .expires_in
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs))
            .or_else(|| claims.exp.and_then(timestamp));

        let grant = TokenGrant {
            token: Token::new(tokens.access_token, expires_at),
            claims,
        };
        Ok((grant, tokens.refresh_token))
    }

    async fn refresh_grant(
        &self,
        refresh_token: &str,
    ) -> Result<(TokenGrant, Option<String>), ProviderError> {
        self.token_request(&[
            ("grant_type", "refresh_token"),
            ("client_id", self.client_id.as_str()),
            ("refresh_token", refresh_token),
        ])
        .await
    }

    fn persist(&self, refresh_token: Option<&str>) {
        let (Some(keychain), Some(token)) = (&self.keychain, refresh_token) else {
            return;
        };
        if let Err(e) = keychain.store(token) {
            warn!(error = %e, "Failed to persist refresh token");
        }
    }

    fn forget(&self) {
        if let Some(keychain) = &self.keychain {
            if let Err(e) = keychain.delete() {
                warn!(error = %e, "Failed to delete stored refresh token");
            }
        }
    }

    async fn do_init(&self) -> Result<InitSession, ProviderError> {
        self.probe().await?;

        let stored = match &self.keychain {
            Some(keychain) => keychain.load().unwrap_or_else(|e| {
                warn!(error = %e, "Could not read stored refresh token");
                None
            }),
            None => None,
        };

        let Some(stored) = stored else {
            debug!("No stored refresh token");
            return Ok(InitSession::unauthenticated());
        };

        match self.refresh_grant(&stored).await {
            Ok((grant, refresh_token)) => {
                let refresh_token = refresh_token.or(Some(stored));
                self.persist(refresh_token.as_deref());
                *self.session.lock().await = Some(ProviderSession {
                    access: grant.token.clone(),
                    refresh_token,
                });
                info!("Resumed session from stored refresh token");
                Ok(InitSession::authenticated(grant))
            }
            Err(ProviderError::Rejected(reason)) => {
                info!(reason = %reason, "Stored refresh token rejected");
                self.forget();
                Ok(InitSession::unauthenticated())
            }
            Err(e) => Err(e),
        }
    }

    async fn do_refresh(&self, min_validity: Duration) -> Result<Refresh, ProviderError> {
        let mut guard = self.session.lock().await;
        let session = guard
            .as_mut()
            .ok_or_else(|| ProviderError::Rejected("No active session".to_string()))?;

        if let Some(expires_at) = session.access.expires_at() {
            let remaining = expires_at - Utc::now();
            if remaining.to_std().map(|r| r > min_validity).unwrap_or(false) {
                return Ok(Refresh::StillValid);
            }
        }

        let refresh_token = session
            .refresh_token
            .clone()
            .ok_or_else(|| ProviderError::Rejected("No refresh token issued".to_string()))?;

        let (grant, rotated) = self.refresh_grant(&refresh_token).await?;
        if rotated.is_some() {
            self.persist(rotated.as_deref());
            session.refresh_token = rotated;
        }
        session.access = grant.token.clone();
        Ok(Refresh::Refreshed(grant))
    }

    async fn do_login(&self, request: &LoginRequest) -> Result<TokenGrant, ProviderError> {
        let (grant, refresh_token) = self
            .token_request(&[
                ("grant_type", "password"),
                ("client_id", self.client_id.as_str()),
                ("username", request.username.as_str()),
                ("password", request.password.as_str()),
                ("scope", LOGIN_SCOPE),
            ])
            .await?;

        self.persist(refresh_token.as_deref());
        *self.session.lock().await = Some(ProviderSession {
            access: grant.token.clone(),
            refresh_token,
        });
        Ok(grant)
    }

    async fn do_logout(&self) -> Result<(), ProviderError> {
        let session = self.session.lock().await.take();
        self.forget();

        let Some(refresh_token) = session.and_then(|s| s.refresh_token) else {
            return Ok(());
        };

        let response = self
            .client
            .post(self.logout_url())
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("refresh_token", refresh_token.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProviderError::Rejected(format!(
                "Logout returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

impl IdentityProvider for KeycloakProvider {
    fn init_session(&self) -> BoxFuture<'_, Result<InitSession, ProviderError>> {
        self.do_init().boxed()
    }

    fn refresh_token(&self, min_validity: Duration) -> BoxFuture<'_, Result<Refresh, ProviderError>> {
        self.do_refresh(min_validity).boxed()
    }

    fn login<'a>(
        &'a self,
        request: &'a LoginRequest,
    ) -> BoxFuture<'a, Result<TokenGrant, ProviderError>> {
        self.do_login(request).boxed()
    }

    fn logout(&self) -> BoxFuture<'_, Result<(), ProviderError>> {
        self.do_logout().boxed()
    }
}

/// Map a failed token endpoint response to a provider error.
/// A 5xx means the realm is down and counts as unreachable; any other
/// status is a refusal.
fn classify(status: StatusCode, body: &str) -> ProviderError {
    let message = match serde_json::from_str::<OidcErrorResponse>(body) {
        Ok(err) => err.error_description.unwrap_or(err.error),
        Err(_) => status.to_string(),
    };
    if status.is_server_error() {
        ProviderError::Unreachable(message)
    } else {
        ProviderError::Rejected(message)
    }
}

fn timestamp(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

/// Decode the claims segment of a JWT without verifying the signature.
/// The token came straight from the token endpoint over TLS.
pub(crate) fn decode_claims(jwt: &str) -> Result<Claims, ProviderError> {
    let payload = jwt
        .split('.')
        .nth(1)
        .ok_or_else(|| ProviderError::InvalidResponse("Access token is not a JWT".to_string()))?;

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| ProviderError::InvalidResponse(format!("Bad token payload: {}", e)))?;

    serde_json::from_slice(&bytes)
        .map_err(|e| ProviderError::InvalidResponse(format!("Bad token claims: {}", e)))
}
