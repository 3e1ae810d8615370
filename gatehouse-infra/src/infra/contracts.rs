use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

/// `previousHash` of the first entry in every chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub email: String,
    pub ip: String,
}

impl Actor {
    pub fn new(id: impl Into<String>, email: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            ip: ip.into(),
        }
    }

    pub fn system() -> Self {
        Self::new("system", "", "127.0.0.1")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
}

impl ResourceRef {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditAction {
    TokenCreated,
    TokenDeleted,
    TokenBlocked,
    TokenUnblocked,
    UserCreated,
    UserDeleted,
    UserBlocked,
    UserUnblocked,
    RoleCreated,
    RoleUpdated,
    RoleDeleted,
    PermissionsSynced,
    LoginSuccess,
    LoginFailure,
    AccessDenied,
    TenantIsolationViolation,
    LoggingDegraded,
    Custom(String),
}

impl AuditAction {
    /// Actions surfaced as security incidents.
    pub fn is_incident(action: &str) -> bool {
        matches!(
            action,
            "access_denied" | "tenant_isolation_violation" | "login_failure" | "logging_degraded"
        )
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditAction::TokenCreated => write!(f, "token_created"),
            AuditAction::TokenDeleted => write!(f, "token_deleted"),
            AuditAction::TokenBlocked => write!(f, "token_blocked"),
            AuditAction::TokenUnblocked => write!(f, "token_unblocked"),
            AuditAction::UserCreated => write!(f, "user_created"),
            AuditAction::UserDeleted => write!(f, "user_deleted"),
            AuditAction::UserBlocked => write!(f, "user_blocked"),
            AuditAction::UserUnblocked => write!(f, "user_unblocked"),
            AuditAction::RoleCreated => write!(f, "role_created"),
            AuditAction::RoleUpdated => write!(f, "role_updated"),
            AuditAction::RoleDeleted => write!(f, "role_deleted"),
            AuditAction::PermissionsSynced => write!(f, "permissions_synced"),
            AuditAction::LoginSuccess => write!(f, "login_success"),
            AuditAction::LoginFailure => write!(f, "login_failure"),
            AuditAction::AccessDenied => write!(f, "access_denied"),
            AuditAction::TenantIsolationViolation => write!(f, "tenant_isolation_violation"),
            AuditAction::LoggingDegraded => write!(f, "logging_degraded"),
            AuditAction::Custom(s) => write!(f, "custom:{}", s),
        }
    }
}

/// One link of the audit chain, in its wire/storage shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    pub id: Uuid,
    /// ISO-8601 UTC with millisecond precision.
    pub timestamp: String,
    pub action: String,
    pub actor: Actor,
    pub resource: ResourceRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub previous_hash: String,
    pub hash: String,
}

impl AuditLogEntry {
    /// Digest of every field except `hash`.
    pub fn compute_hash(&self) -> Result<String, serde_json::Error> {
        let canonical = serde_json::to_string(&serde_json::json!({
            "id": self.id,
            "timestamp": self.timestamp,
            "action": self.action,
            "actor": self.actor,
            "resource": self.resource,
            "details": self.details,
            "previousHash": self.previous_hash,
        }))?;
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        Ok(format!("{:x}", hasher.finalize()))
    }

    pub fn is_incident(&self) -> bool {
        AuditAction::is_incident(&self.action)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainVerification {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broken_at_index: Option<usize>,
    pub entries_checked: usize,
}
