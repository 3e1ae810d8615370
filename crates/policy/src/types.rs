use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Identifier of the tenant that owns users, roles and entities.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub const DEFAULT: &'static str = "default";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self(Self::DEFAULT.to_string())
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionAction {
    Create,
    Read,
    Update,
    Delete,
    Manage,
}

impl PermissionAction {
    pub fn as_str(self) -> &'static str {
        match self {
            PermissionAction::Create => "create",
            PermissionAction::Read => "read",
            PermissionAction::Update => "update",
            PermissionAction::Delete => "delete",
            PermissionAction::Manage => "manage",
        }
    }
}

impl fmt::Display for PermissionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextType {
    System,
    Collection,
    Widget,
    User,
    Token,
    Configuration,
}

/// A catalog entry describing one guarded action on one context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    pub name: String,
    pub action: PermissionAction,
    pub context_id: String,
    pub context_type: ContextType,
    #[serde(default)]
    pub description: String,
    /// Role expected to hold this permission. Informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_role: Option<String>,
    #[serde(default, rename = "requires2FA")]
    pub requires_2fa: bool,
}

impl Permission {
    pub fn new(
        name: impl Into<String>,
        action: PermissionAction,
        context_id: impl Into<String>,
        context_type: ContextType,
    ) -> Self {
        Self {
            name: name.into(),
            action,
            context_id: context_id.into(),
            context_type,
            description: String::new(),
            required_role: None,
            requires_2fa: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_required_role(mut self, role: impl Into<String>) -> Self {
        self.required_role = Some(role.into());
        self
    }

    pub fn requiring_2fa(mut self) -> Self {
        self.requires_2fa = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub permissions: BTreeSet<String>,
}

impl Role {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            is_admin: false,
            permissions: BTreeSet::new(),
        }
    }

    pub fn admin(mut self) -> Self {
        self.is_admin = true;
        self
    }

    pub fn with_permissions<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions.extend(names.into_iter().map(Into::into));
        self
    }
}

/// A per-user override of the role's answer for one permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionOverride {
    Grant,
    Revoke,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: String,
    pub role: String,
    #[serde(default)]
    pub tenant_id: TenantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explicit_permissions: Option<BTreeMap<String, PermissionOverride>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub two_factor_verified_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn new(id: impl Into<String>, email: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            role: role.into(),
            tenant_id: TenantId::default(),
            explicit_permissions: None,
            two_factor_verified_at: None,
        }
    }

    pub fn in_tenant(mut self, tenant_id: impl Into<TenantId>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    pub fn with_override(mut self, permission: impl Into<String>, value: PermissionOverride) -> Self {
        self.explicit_permissions
            .get_or_insert_with(BTreeMap::new)
            .insert(permission.into(), value);
        self
    }

    pub fn verified_2fa_at(mut self, at: DateTime<Utc>) -> Self {
        self.two_factor_verified_at = Some(at);
        self
    }

    pub fn explicit_override(&self, permission: &str) -> Option<PermissionOverride> {
        self.explicit_permissions
            .as_ref()
            .and_then(|overrides| overrides.get(permission).copied())
    }
}

/// Describes what a call site is attempting, independent of who attempts it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionConfig {
    pub context_id: String,
    pub action: PermissionAction,
    pub context_type: ContextType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_role: Option<String>,
}

impl PermissionConfig {
    pub fn new(context_id: impl Into<String>, action: PermissionAction, context_type: ContextType) -> Self {
        Self {
            context_id: context_id.into(),
            action,
            context_type,
            required_role: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    AdminBypass,
    ExplicitGrant,
    RoleGrant,
    Unauthenticated,
    MissingConfig,
    UnknownRole,
    #[serde(rename = "NEEDS_2FA")]
    Needs2fa,
    Forbidden,
}

impl ReasonCode {
    pub fn is_grant(self) -> bool {
        matches!(
            self,
            ReasonCode::AdminBypass | ReasonCode::ExplicitGrant | ReasonCode::RoleGrant
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReasonCode::AdminBypass => "ADMIN_BYPASS",
            ReasonCode::ExplicitGrant => "EXPLICIT_GRANT",
            ReasonCode::RoleGrant => "ROLE_GRANT",
            ReasonCode::Unauthenticated => "UNAUTHENTICATED",
            ReasonCode::MissingConfig => "MISSING_CONFIG",
            ReasonCode::UnknownRole => "UNKNOWN_ROLE",
            ReasonCode::Needs2fa => "NEEDS_2FA",
            ReasonCode::Forbidden => "FORBIDDEN",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub has_permission: bool,
    pub is_rate_limited: bool,
    pub reason_code: ReasonCode,
}

impl Decision {
    pub fn grant(reason_code: ReasonCode) -> Self {
        Self {
            has_permission: true,
            is_rate_limited: false,
            reason_code,
        }
    }

    pub fn deny(reason_code: ReasonCode) -> Self {
        Self {
            has_permission: false,
            is_rate_limited: false,
            reason_code,
        }
    }

    /// Rate limiting vetoes a grant.
    pub fn is_actionable(&self) -> bool {
        self.has_permission && !self.is_rate_limited
    }

    /// Taxonomy code a caller reports for this decision.
    pub fn code(&self) -> &'static str {
        if self.is_rate_limited {
            "RATE_LIMITED"
        } else {
            self.reason_code.as_str()
        }
    }

    pub fn http_status(&self) -> u16 {
        if self.is_actionable() {
            200
        } else if self.is_rate_limited {
            429
        } else if self.reason_code == ReasonCode::Unauthenticated {
            401
        } else {
            403
        }
    }
}

/// Kinds of entity a batch mutation can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Token,
    User,
    Entry,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Token => "token",
            EntityKind::User => "user",
            EntityKind::Entry => "entry",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
