//! In-process implementations of the data-access traits.

use crate::traits::{EntityFetcher, PermissionStore, RoleSource, StoreError, UserSource};
use crate::types::{EntityKind, Permission, Role, TenantId, User};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

#[derive(Default)]
pub struct InMemoryPermissionStore {
    records: RwLock<BTreeMap<String, Permission>>,
}

impl InMemoryPermissionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PermissionStore for InMemoryPermissionStore {
    async fn get_all_permissions(&self) -> Result<Vec<Permission>, StoreError> {
        Ok(self.records.read().values().cloned().collect())
    }

    async fn get_permission_by_name(&self, name: &str) -> Result<Option<Permission>, StoreError> {
        Ok(self.records.read().get(name).cloned())
    }

    async fn insert_permission(&self, permission: &Permission) -> Result<(), StoreError> {
        let mut records = self.records.write();
        if records.contains_key(&permission.name) {
            return Err(StoreError::Duplicate(permission.name.clone()));
        }
        records.insert(permission.name.clone(), permission.clone());
        Ok(())
    }
}

/// Roles and users grouped by tenant.
#[derive(Default)]
pub struct InMemoryDirectory {
    roles: RwLock<HashMap<TenantId, Vec<Role>>>,
    users: RwLock<HashMap<String, User>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a role in a tenant.
    pub fn put_role(&self, tenant: &TenantId, role: Role) {
        let mut roles = self.roles.write();
        let tenant_roles = roles.entry(tenant.clone()).or_default();
        tenant_roles.retain(|r| r.id != role.id);
        tenant_roles.push(role);
    }

    pub fn remove_role(&self, tenant: &TenantId, role_id: &str) -> bool {
        let mut roles = self.roles.write();
        match roles.get_mut(tenant) {
            Some(tenant_roles) => {
                let before = tenant_roles.len();
                tenant_roles.retain(|r| r.id != role_id);
                tenant_roles.len() != before
            }
            None => false,
        }
    }

    pub fn put_user(&self, user: User) {
        self.users.write().insert(user.id.clone(), user);
    }
}

#[async_trait]
impl RoleSource for InMemoryDirectory {
    async fn get_all_roles(&self, tenant: &TenantId) -> Result<Vec<Role>, StoreError> {
        Ok(self.roles.read().get(tenant).cloned().unwrap_or_default())
    }

    async fn get_role_by_id(&self, tenant: &TenantId, role_id: &str) -> Result<Option<Role>, StoreError> {
        Ok(self
            .roles
            .read()
            .get(tenant)
            .and_then(|roles| roles.iter().find(|r| r.id == role_id).cloned()))
    }
}

#[async_trait]
impl UserSource for InMemoryDirectory {
    async fn get_user_by_id(&self, user_id: &str) -> Result<Option<User>, StoreError> {
        Ok(self.users.read().get(user_id).cloned())
    }
}

/// Entity ownership table: (kind, id) -> tenant.
#[derive(Default)]
pub struct InMemoryEntities {
    owners: RwLock<HashMap<(EntityKind, String), TenantId>>,
}

impl InMemoryEntities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, kind: EntityKind, id: impl Into<String>, tenant: &TenantId) {
        self.owners.write().insert((kind, id.into()), tenant.clone());
    }
}

#[async_trait]
impl EntityFetcher for InMemoryEntities {
    async fn fetch_owned(
        &self,
        kind: EntityKind,
        ids: &[String],
        tenant: &TenantId,
    ) -> Result<Vec<String>, StoreError> {
        let owners = self.owners.read();
        Ok(ids
            .iter()
            .filter(|id| owners.get(&(kind, (*id).clone())) == Some(tenant))
            .cloned()
            .collect())
    }
}
