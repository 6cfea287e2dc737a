//! Authentication module for managing the user session.
//!
//! This module provides:
//! - `SessionManager`: Session lifecycle with timer-driven token refresh
//! - `CredentialStore`: The bearer token shared with the API gateway
//! - `IdentityProvider`: Contract with the identity provider, implemented
//!   for Keycloak realms by `KeycloakProvider`
//! - `Keychain`: OS keychain storage for the provider refresh token
//!
//! Tokens are refreshed every 60 seconds when they have 30 seconds or less
//! of validity left. When the provider cannot be reached at startup a
//! dev-mode session without a token is used instead.

pub mod credentials;
pub mod identity;
pub mod keychain;
pub mod keycloak;
pub mod provider;
pub mod session;

pub use credentials::{CredentialStore, Token};
pub use identity::{Claims, Identity, OrgId, RealmAccess, Role};
pub use keychain::Keychain;
pub use keycloak::KeycloakProvider;
pub use provider::{IdentityProvider, InitSession, LoginRequest, ProviderError, Refresh, TokenGrant};
pub use session::{
    RefreshOutcome, Session, SessionConfig, SessionError, SessionManager, SessionSnapshot,
    SessionStatus,
};
