use crate::cache::{CacheCategory, InvalidationListener, InvalidationScope, TenantSnapshots};
use crate::traits::{RoleSource, StoreError};
use crate::types::{Role, TenantId};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RoleStoreError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Immutable set of one tenant's roles.
#[derive(Debug, Clone, Default)]
pub struct RoleSnapshot {
    roles: Vec<Role>,
}

impl RoleSnapshot {
    pub fn new(roles: Vec<Role>) -> Self {
        Self { roles }
    }

    pub fn get(&self, role_id: &str) -> Option<&Role> {
        self.roles.iter().find(|r| r.id == role_id)
    }

    pub fn roles(&self) -> &[Role] {
        &self.roles
    }
}

/// Role -> permission mapping cached per tenant.
pub struct RoleStore {
    source: Arc<dyn RoleSource>,
    snapshots: TenantSnapshots<RoleSnapshot>,
}

impl RoleStore {
    pub fn new(source: Arc<dyn RoleSource>) -> Self {
        Self {
            source,
            snapshots: TenantSnapshots::new(),
        }
    }

    /// Returns the tenant's snapshot, loading it on first use. A load that
    /// overlaps an invalidation for the same tenant is discarded and redone.
    pub async fn roles_for(&self, tenant: &TenantId) -> Result<Arc<RoleSnapshot>, RoleStoreError> {
        loop {
            if let Some(snapshot) = self.snapshots.get(tenant) {
                return Ok(snapshot);
            }

            let generation = self.snapshots.generation(tenant);
            let roles = self.source.get_all_roles(tenant).await?;
            let count = roles.len();
            match self.snapshots.put(tenant, RoleSnapshot::new(roles), generation) {
                Some(snapshot) => {
                    debug!("Loaded {} roles for tenant {}", count, tenant);
                    return Ok(snapshot);
                }
                None => debug!("Roles for tenant {} changed during load; reloading", tenant),
            }
        }
    }

    /// Reads one role straight from the source, bypassing the snapshot.
    pub async fn role_by_id(&self, tenant: &TenantId, role_id: &str) -> Result<Option<Role>, RoleStoreError> {
        Ok(self.source.get_role_by_id(tenant, role_id).await?)
    }

    pub fn is_cached(&self, tenant: &TenantId) -> bool {
        self.snapshots.contains(tenant)
    }

    pub fn evict(&self, scope: &InvalidationScope) {
        self.snapshots.evict(scope);
    }
}

#[async_trait]
impl InvalidationListener for RoleStore {
    async fn on_invalidate(&self, category: CacheCategory, scope: &InvalidationScope) {
        if matches!(category, CacheCategory::Roles | CacheCategory::Users) {
            self.evict(scope);
        }
    }
}
