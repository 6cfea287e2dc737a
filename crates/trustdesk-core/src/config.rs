//! Application configuration management.
//!
//! This module handles loading and saving the application configuration:
//! backend and identity provider endpoints, session and polling timings,
//! and the last used username.
//!
//! Configuration is stored at `~/.config/trustdesk/config.json`. Values can
//! be overridden from the environment (`TRUSTDESK_API_URL`,
//! `TRUSTDESK_ISSUER_URL`, `TRUSTDESK_CLIENT_ID`, `TRUSTDESK_DEV_FALLBACK`).

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::auth::session::{
    DEFAULT_FALLBACK_ORG_ID, DEFAULT_MIN_VALIDITY_SECS, DEFAULT_REFRESH_INTERVAL_SECS,
};
use crate::auth::{OrgId, SessionConfig};
use crate::jobs::poller::DEFAULT_POLL_INTERVAL_SECS;
use crate::jobs::PollerConfig;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "trustdesk";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const DEFAULT_API_BASE_URL: &str = "http://localhost:8000";
const DEFAULT_ISSUER_URL: &str = "http://localhost:8080/realms/trustdesk";
const DEFAULT_CLIENT_ID: &str = "trustdesk-dashboard";

const ENV_API_URL: &str = "TRUSTDESK_API_URL";
const ENV_ISSUER_URL: &str = "TRUSTDESK_ISSUER_URL";
const ENV_CLIENT_ID: &str = "TRUSTDESK_CLIENT_ID";
const ENV_DEV_FALLBACK: &str = "TRUSTDESK_DEV_FALLBACK";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentitySettings {
    pub issuer_url: String,
    pub client_id: String,
}

impl Default for IdentitySettings {
    fn default() -> Self {
        Self {
            issuer_url: DEFAULT_ISSUER_URL.to_string(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub refresh_interval_secs: u64,
    pub min_validity_secs: u64,
    pub dev_fallback: bool,
    pub fallback_org_id: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            refresh_interval_secs: DEFAULT_REFRESH_INTERVAL_SECS,
            min_validity_secs: DEFAULT_MIN_VALIDITY_SECS,
            dev_fallback: true,
            fallback_org_id: DEFAULT_FALLBACK_ORG_ID.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollSettings {
    pub interval_secs: u64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_POLL_INTERVAL_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub identity: IdentitySettings,
    pub session: SessionSettings,
    pub poll: PollSettings,
    pub last_username: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            identity: IdentitySettings::default(),
            session: SessionSettings::default(),
            poll: PollSettings::default(),
            last_username: None,
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply `TRUSTDESK_*` environment overrides
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_API_URL) {
            self.api_base_url = url;
        }
        if let Some(url) = lookup(ENV_ISSUER_URL) {
            self.identity.issuer_url = url;
        }
        if let Some(id) = lookup(ENV_CLIENT_ID) {
            self.identity.client_id = id;
        }
        if let Some(value) = lookup(ENV_DEV_FALLBACK) {
            match parse_bool(&value) {
                Some(enabled) => self.session.dev_fallback = enabled,
                None => warn!(value = %value, "Ignoring invalid {}", ENV_DEV_FALLBACK),
            }
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            refresh_interval: Duration::from_secs(self.session.refresh_interval_secs.max(1)),
            min_validity: Duration::from_secs(self.session.min_validity_secs),
            dev_fallback: self.session.dev_fallback,
            fallback_org_id: OrgId(self.session.fallback_org_id.clone()),
        }
    }

    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            interval: Duration::from_secs(self.poll.interval_secs.max(1)),
        }
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }
}
