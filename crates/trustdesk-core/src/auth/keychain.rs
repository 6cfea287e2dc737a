use anyhow::{Context, Result};
use keyring::Entry;

const SERVICE_NAME: &str = "trustdesk";

/// Persists the provider refresh token in the OS keychain so a later
/// process can resume the session without prompting for a password.
#[derive(Debug, Clone)]
pub struct Keychain {
    account: String,
}

impl Keychain {
    /// One keychain entry per realm and client
    pub fn for_client(issuer_url: &str, client_id: &str) -> Self {
        Self {
            account: format!("{}#{}", issuer_url.trim_end_matches('/'), client_id),
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    fn entry(&self) -> Result<Entry> {
        Entry::new(SERVICE_NAME, &self.account).context("Failed to create keyring entry")
    }

    /// Store the refresh token
    pub fn store(&self, refresh_token: &str) -> Result<()> {
        self.entry()?
            .set_password(refresh_token)
            .context("Failed to store refresh token in keychain")
    }

    /// Load the refresh token, `None` if nothing is stored
    pub fn load(&self) -> Result<Option<String>> {
        match self.entry()?.get_password() {
            Ok(token) => Ok(Some(token)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve refresh token from keychain"),
        }
    }

    /// Delete the stored refresh token. Missing entries are not an error.
    pub fn delete(&self) -> Result<()> {
        match self.entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete refresh token from keychain"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_normalizes_trailing_slash() {
        let a = Keychain::for_client("https://id.example.com/realms/acme/", "dashboard");
        let b = Keychain::for_client("https://id.example.com/realms/acme", "dashboard");
        assert_eq!(a.account(), b.account());
        assert_eq!(a.account(), "https://id.example.com/realms/acme#dashboard");
    }
}
