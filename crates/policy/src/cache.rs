use crate::types::TenantId;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheCategory {
    Roles,
    Users,
    Tokens,
    Permissions,
}

impl fmt::Display for CacheCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CacheCategory::Roles => "roles",
            CacheCategory::Users => "users",
            CacheCategory::Tokens => "tokens",
            CacheCategory::Permissions => "permissions",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationScope {
    Global,
    Tenant(TenantId),
}

impl fmt::Display for InvalidationScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidationScope::Global => f.write_str("*"),
            InvalidationScope::Tenant(tenant) => write!(f, "{}", tenant),
        }
    }
}

#[async_trait]
pub trait InvalidationListener: Send + Sync {
    async fn on_invalidate(&self, category: CacheCategory, scope: &InvalidationScope);
}

/// Fans invalidation events out to every registered cache.
#[derive(Default)]
pub struct CacheInvalidationBus {
    listeners: RwLock<Vec<Arc<dyn InvalidationListener>>>,
}

impl CacheInvalidationBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Arc<dyn InvalidationListener>) {
        self.listeners.write().push(listener);
    }

    pub async fn invalidate(&self, category: CacheCategory, scope: InvalidationScope) {
        let listeners: Vec<_> = self.listeners.read().iter().cloned().collect();
        debug!(
            "Invalidating {} for {} ({} listeners)",
            category,
            scope,
            listeners.len()
        );
        for listener in listeners {
            listener.on_invalidate(category, &scope).await;
        }
    }

    pub async fn invalidate_tenant(&self, category: CacheCategory, tenant: &TenantId) {
        self.invalidate(category, InvalidationScope::Tenant(tenant.clone()))
            .await;
    }
}

/// Eviction count observed before a load; a snapshot is only installed if no
/// eviction for its tenant happened since.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation {
    epoch: u64,
    tenant: u64,
}

struct SnapshotTable<T> {
    entries: HashMap<TenantId, Arc<T>>,
    generations: HashMap<TenantId, u64>,
    /// Bumped by global evictions.
    epoch: u64,
}

/// Per-tenant immutable snapshots, replaced or evicted wholesale.
pub struct TenantSnapshots<T> {
    table: RwLock<SnapshotTable<T>>,
}

impl<T> Default for TenantSnapshots<T> {
    fn default() -> Self {
        Self {
            table: RwLock::new(SnapshotTable {
                entries: HashMap::new(),
                generations: HashMap::new(),
                epoch: 0,
            }),
        }
    }
}

impl<T> TenantSnapshots<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tenant: &TenantId) -> Option<Arc<T>> {
        self.table.read().entries.get(tenant).cloned()
    }

    /// Take this before reading the source a snapshot is built from.
    pub fn generation(&self, tenant: &TenantId) -> Generation {
        let table = self.table.read();
        Generation {
            epoch: table.epoch,
            tenant: table.generations.get(tenant).copied().unwrap_or(0),
        }
    }

    /// Installs `value` unless the tenant was evicted after `loaded_at`.
    /// Returns `None` when the value is stale and was dropped.
    pub fn put(&self, tenant: &TenantId, value: T, loaded_at: Generation) -> Option<Arc<T>> {
        let mut table = self.table.write();
        let current = Generation {
            epoch: table.epoch,
            tenant: table.generations.get(tenant).copied().unwrap_or(0),
        };
        if current != loaded_at {
            return None;
        }
        let value = Arc::new(value);
        table.entries.insert(tenant.clone(), Arc::clone(&value));
        Some(value)
    }

    pub fn evict(&self, scope: &InvalidationScope) {
        let mut table = self.table.write();
        match scope {
            InvalidationScope::Global => {
                table.entries.clear();
                table.epoch += 1;
            }
            InvalidationScope::Tenant(tenant) => {
                table.entries.remove(tenant);
                *table.generations.entry(tenant.clone()).or_insert(0) += 1;
            }
        }
    }

    pub fn contains(&self, tenant: &TenantId) -> bool {
        self.table.read().entries.contains_key(tenant)
    }
}
