use std::fmt;
use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;

use super::credentials::Token;
use super::identity::Claims;

/// Token plus the claims it carries
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub token: Token,
    pub claims: Claims,
}

/// Answer to the initial session probe.
/// `grant` is present whenever `authenticated` is true.
#[derive(Debug, Clone)]
pub struct InitSession {
    pub authenticated: bool,
    pub grant: Option<TokenGrant>,
}

impl InitSession {
    pub fn authenticated(grant: TokenGrant) -> Self {
        Self {
            authenticated: true,
            grant: Some(grant),
        }
    }

    pub fn unauthenticated() -> Self {
        Self {
            authenticated: false,
            grant: None,
        }
    }
}

/// Outcome of a token refresh request
#[derive(Debug, Clone)]
pub enum Refresh {
    /// The provider issued a new token
    Refreshed(TokenGrant),
    /// The current token has more than the requested validity left
    StillValid,
}

#[derive(Clone)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginRequest")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Error, Debug)]
pub enum ProviderError {
    /// The provider could not be contacted at all
    #[error("Identity provider unreachable: {0}")]
    Unreachable(String),

    /// The provider answered and refused the request
    #[error("Identity provider rejected the request: {0}")]
    Rejected(String),

    #[error("Invalid response from identity provider: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    pub fn is_unreachable(&self) -> bool {
        matches!(self, ProviderError::Unreachable(_))
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() || err.is_request() {
            ProviderError::Unreachable(err.to_string())
        } else if err.is_decode() {
            ProviderError::InvalidResponse(err.to_string())
        } else {
            ProviderError::Rejected(err.to_string())
        }
    }
}

/// Contract with the identity provider.
///
/// Implementations keep whatever provider-side state they need (refresh
/// tokens, SSO cookies); the session manager only ever sees access tokens.
pub trait IdentityProvider: Send + Sync + 'static {
    /// Probe for an existing session without prompting the user
    fn init_session(&self) -> BoxFuture<'_, Result<InitSession, ProviderError>>;

    /// Extend the token if it expires within `min_validity`
    fn refresh_token(&self, min_validity: Duration) -> BoxFuture<'_, Result<Refresh, ProviderError>>;

    fn login<'a>(&'a self, request: &'a LoginRequest)
        -> BoxFuture<'a, Result<TokenGrant, ProviderError>>;

    fn logout(&self) -> BoxFuture<'_, Result<(), ProviderError>>;
}

impl<T: IdentityProvider + ?Sized> IdentityProvider for std::sync::Arc<T> {
    fn init_session(&self) -> BoxFuture<'_, Result<InitSession, ProviderError>> {
        (**self).init_session()
    }

    fn refresh_token(&self, min_validity: Duration) -> BoxFuture<'_, Result<Refresh, ProviderError>> {
        (**self).refresh_token(min_validity)
    }

    fn login<'a>(&'a self, request: &'a LoginRequest)
        -> BoxFuture<'a, Result<TokenGrant, ProviderError>> {
        (**self).login(request)
    }

    fn logout(&self) -> BoxFuture<'_, Result<(), ProviderError>> {
        (**self).logout()
    }
}
