//! Core library for trustdesk.
//!
//! Client-side session and long-running-operation management for the
//! compliance platform: the authentication session manager, the REST
//! gateway, and the agent run poller. Front ends construct one
//! `SessionManager` per process and hand its `CredentialStore` to the
//! `ApiClient`.

pub mod api;
pub mod auth;
pub mod config;
pub mod jobs;

pub use api::{ApiClient, ApiError};
pub use auth::{
    CredentialStore, Identity, IdentityProvider, KeycloakProvider, Keychain, LoginRequest, Role,
    SessionConfig, SessionManager, SessionSnapshot,
};
pub use config::Config;
pub use jobs::{JobPoller, JobStatus, OperationId, PollSnapshot, PollerConfig, StartOutcome};
