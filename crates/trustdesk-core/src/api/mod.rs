//! REST API client module for the compliance platform backend.
//!
//! This module provides the `ApiClient` for issuing authenticated requests
//! and `ApiError`, the uniform error shape for transport and HTTP failures.
//!
//! The API uses bearer token authentication; the token is read from the
//! session's `CredentialStore` on every request.

pub mod client;
pub mod error;

pub use client::ApiClient;
pub use error::ApiError;
