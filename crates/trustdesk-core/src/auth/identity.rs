use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Display name used for the synthetic dev-mode identity
const DEV_DISPLAY_NAME: &str = "Development User";

/// Email used for the synthetic dev-mode identity
const DEV_EMAIL: &str = "dev@localhost";

/// Platform roles, ordered from least to most privileged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Viewer,
    Auditor,
    ComplianceManager,
    Admin,
}

impl Role {
    /// The highest-privilege role
    pub const HIGHEST: Role = Role::Admin;

    /// Map a realm role name to a platform role.
    /// Provider-internal roles like `offline_access` have no mapping.
    pub fn from_realm_role(name: &str) -> Option<Self> {
        match name {
            "viewer" => Some(Role::Viewer),
            "auditor" => Some(Role::Auditor),
            "compliance_manager" => Some(Role::ComplianceManager),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Auditor => "auditor",
            Role::ComplianceManager => "compliance_manager",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Organization identifier as issued by the platform
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
#[serde(transparent)]
pub struct OrgId(pub String);

impl fmt::Display for OrgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RealmAccess {
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Claims carried by the access token
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Claims {
    pub name: Option<String>,
    pub email: Option<String>,
    pub preferred_username: Option<String>,
    #[serde(default)]
    pub realm_access: RealmAccess,
    pub org_id: Option<String>,
    /// Expiry as seconds since the epoch
    pub exp: Option<i64>,
}

/// Who the session belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub struct Identity {
    pub display_name: String,
    pub email: Option<String>,
    pub roles: BTreeSet<Role>,
    pub org_id: Option<OrgId>,
}

impl Identity {
    pub fn from_claims(claims: &Claims) -> Self {
        let roles = claims
            .realm_access
            .roles
            .iter()
            .filter_map(|name| {
                let role = Role::from_realm_role(name);
                if role.is_none() {
                    debug!(role = %name, "Ignoring unmapped realm role");
                }
                role
            })
            .collect();

        let display_name = claims
            .name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .or_else(|| claims.preferred_username.clone())
            .or_else(|| claims.email.clone())
            .unwrap_or_else(|| "Unknown".to_string());

        Self {
            display_name,
            email: claims.email.clone(),
            roles,
            org_id: claims.org_id.clone().map(OrgId),
        }
    }

    /// Synthetic identity used when the identity provider cannot be reached
    pub fn dev_mode(org_id: OrgId) -> Self {
        Self {
            display_name: DEV_DISPLAY_NAME.to_string(),
            email: Some(DEV_EMAIL.to_string()),
            roles: BTreeSet::from([Role::HIGHEST]),
            org_id: Some(org_id),
        }
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    /// Most privileged role held, if any
    pub fn highest_role(&self) -> Option<Role> {
        self.roles.iter().next_back().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_ordering() {
        assert!(Role::Viewer < Role::Auditor);
        assert!(Role::Auditor < Role::ComplianceManager);
        assert!(Role::ComplianceManager < Role::Admin);
        assert_eq!(Role::HIGHEST, Role::Admin);
    }

    #[test]
    fn test_identity_from_claims() {
        let claims: Claims = serde_json::from_str(
            r#"{
                "name": "Ada Lovelace",
                "email": "ada@example.com",
                "preferred_username": "ada",
                "realm_access": {"roles": ["offline_access", "auditor", "viewer"]},
                "org_id": "org-42"
            }"#,
        )
        .expect("Failed to parse claims test JSON");

        let identity = Identity::from_claims(&claims);
        assert_eq!(identity.display_name, "Ada Lovelace");
        assert_eq!(identity.email.as_deref(), Some("ada@example.com"));
        assert_eq!(identity.roles, BTreeSet::from([Role::Viewer, Role::Auditor]));
        assert_eq!(identity.org_id, Some(OrgId("org-42".to_string())));
        assert_eq!(identity.highest_role(), Some(Role::Auditor));
    }

    #[test]
    fn test_display_name_fallbacks() {
        let claims = Claims {
            name: Some("  ".to_string()),
            preferred_username: Some("ada".to_string()),
            ..Default::default()
        };
        assert_eq!(Identity::from_claims(&claims).display_name, "ada");

        let empty = Identity::from_claims(&Claims::default());
        assert_eq!(empty.display_name, "Unknown");
        assert!(empty.roles.is_empty());
        assert!(empty.org_id.is_none());
    }

    #[test]
    fn test_dev_mode_identity_is_admin() {
        let identity = Identity::dev_mode(OrgId("fallback".to_string()));
        assert!(identity.has_role(Role::Admin));
        assert_eq!(identity.org_id, Some(OrgId("fallback".to_string())));
    }
}
