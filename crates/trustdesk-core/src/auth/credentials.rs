use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};

/// Opaque bearer credential issued by the identity provider.
///
/// The core never inspects the secret; `expires_at` is only used for
/// refresh timing and display.
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    secret: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Token {
    pub fn new(secret: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            secret: secret.into(),
            expires_at,
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }
}

// Never print the secret, tracing fields use Debug.
impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("secret", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Holds the bearer token currently in force.
///
/// Clone is cheap and every clone observes the same slot. The session manager
/// is the only writer; the API gateway reads it on every request so a refreshed
/// token is picked up without rebuilding the client.
#[derive(Clone, Default)]
pub struct CredentialStore {
    slot: Arc<RwLock<Option<Token>>>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current token, if any
    pub fn token(&self) -> Option<Token> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the current token
    pub fn set(&self, token: Option<Token>) {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = token;
    }

    pub fn clear(&self) {
        self.set(None);
    }

    pub fn has_token(&self) -> bool {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("has_token", &self.has_token())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_slot() {
        let store = CredentialStore::new();
        let reader = store.clone();
        assert!(reader.token().is_none());

        store.set(Some(Token::new("abc", None)));
        assert_eq!(reader.token().map(|t| t.secret().to_string()), Some("abc".to_string()));

        store.set(Some(Token::new("def", None)));
        assert_eq!(reader.token().map(|t| t.secret().to_string()), Some("def".to_string()));

        store.clear();
        assert!(!reader.has_token());
    }

    #[test]
    fn test_token_debug_is_redacted() {
        let token = Token::new("super-secret", None);
        let printed = format!("{:?}", token);
        assert!(!printed.contains("super-secret"));
        assert!(printed.contains("redacted"));
    }
}
