use crate::types::{EntityKind, Permission, Role, TenantId, User};
use async_trait::async_trait;
use thiserror::Error;

/// Failure reported by a data-access collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
    #[error("Duplicate record: {0}")]
    Duplicate(String),
}

/// Persisted permission records.
#[async_trait]
pub trait PermissionStore: Send + Sync {
    async fn get_all_permissions(&self) -> Result<Vec<Permission>, StoreError>;

    async fn get_permission_by_name(&self, name: &str) -> Result<Option<Permission>, StoreError>;

    /// Insert a record; a record with the same name must not already exist.
    async fn insert_permission(&self, permission: &Permission) -> Result<(), StoreError>;
}

/// Tenant-scoped role records.
#[async_trait]
pub trait RoleSource: Send + Sync {
    async fn get_all_roles(&self, tenant: &TenantId) -> Result<Vec<Role>, StoreError>;

    async fn get_role_by_id(&self, tenant: &TenantId, role_id: &str) -> Result<Option<Role>, StoreError>;
}

#[async_trait]
pub trait UserSource: Send + Sync {
    async fn get_user_by_id(&self, user_id: &str) -> Result<Option<User>, StoreError>;
}

/// Batch lookup used by the tenant isolation guard.
#[async_trait]
pub trait EntityFetcher: Send + Sync {
    /// Returns the subset of `ids` that exist and belong to `tenant`.
    async fn fetch_owned(
        &self,
        kind: EntityKind,
        ids: &[String],
        tenant: &TenantId,
    ) -> Result<Vec<String>, StoreError>;
}

/// External rate-limit state, read without consuming quota.
pub trait RateLimitSignal: Send + Sync {
    fn is_rate_limited(&self, user_id: &str, context_id: &str) -> bool;
}
