use crate::cache::{CacheCategory, InvalidationListener, InvalidationScope};
use crate::traits::{PermissionStore, StoreError};
use crate::types::{Permission, PermissionAction};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Duplicate permission name in catalog: {0}")]
    DuplicateName(String),
    #[error("Duplicate context/action in catalog: {0}:{1}")]
    DuplicateContext(String, PermissionAction),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Immutable view of every known permission.
#[derive(Debug, Default)]
pub struct PermissionSnapshot {
    by_name: HashMap<String, Arc<Permission>>,
    by_context: HashMap<(String, PermissionAction), Arc<Permission>>,
}

impl PermissionSnapshot {
    pub fn from_permissions(permissions: Vec<Permission>) -> Self {
        let mut snapshot = Self::default();
        for permission in permissions {
            let permission = Arc::new(permission);
            let key = (permission.context_id.clone(), permission.action);
            if snapshot.by_context.contains_key(&key) {
                warn!(
                    "Ignoring permission {} sharing {}:{} with another record",
                    permission.name, key.0, key.1
                );
                continue;
            }
            snapshot.by_context.insert(key, Arc::clone(&permission));
            snapshot.by_name.insert(permission.name.clone(), permission);
        }
        snapshot
    }

    pub fn get(&self, name: &str) -> Option<&Permission> {
        self.by_name.get(name).map(|p| p.as_ref())
    }

    pub fn find(&self, context_id: &str, action: PermissionAction) -> Option<&Permission> {
        self.by_context
            .get(&(context_id.to_string(), action))
            .map(|p| p.as_ref())
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Permissions sorted by name.
    pub fn all(&self) -> Vec<Permission> {
        let mut all: Vec<Permission> = self.by_name.values().map(|p| (**p).clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub inserted: usize,
    pub unchanged: usize,
    pub conflicts: Vec<String>,
}

/// Canonical permission catalog backed by a persistent store.
pub struct PermissionRegistry {
    store: Arc<dyn PermissionStore>,
    snapshot: RwLock<Arc<PermissionSnapshot>>,
    /// Held across read-and-swap so the last reload to start is the last to land.
    reload: tokio::sync::Mutex<()>,
}

impl PermissionRegistry {
    pub fn new(store: Arc<dyn PermissionStore>) -> Self {
        Self {
            store,
            snapshot: RwLock::new(Arc::new(PermissionSnapshot::default())),
            reload: tokio::sync::Mutex::new(()),
        }
    }

    /// Current snapshot. Callers keep the returned `Arc` for the whole decision.
    pub fn snapshot(&self) -> Arc<PermissionSnapshot> {
        self.snapshot.read().clone()
    }

    pub fn all_permissions(&self) -> Vec<Permission> {
        self.snapshot().all()
    }

    pub fn permission_by_name(&self, name: &str) -> Option<Permission> {
        self.snapshot().get(name).cloned()
    }

    pub fn permission_for(&self, context_id: &str, action: PermissionAction) -> Option<Permission> {
        self.snapshot().find(context_id, action).cloned()
    }

    /// Upserts the catalog by name. Persisted records are never rewritten.
    pub async fn sync_permissions(&self, catalog: &[Permission]) -> Result<SyncReport, RegistryError> {
        validate_catalog(catalog)?;

        let existing: HashMap<String, Permission> = self
            .store
            .get_all_permissions()
            .await?
            .into_iter()
            .map(|p| (p.name.clone(), p))
            .collect();

        let mut report = SyncReport::default();
        for permission in catalog {
            match existing.get(&permission.name) {
                None => match self.store.insert_permission(permission).await {
                    Ok(()) => report.inserted += 1,
                    Err(StoreError::Duplicate(_)) => {
                        // Inserted by another instance since the listing above.
                        match self.store.get_permission_by_name(&permission.name).await? {
                            Some(stored) if &stored == permission => report.unchanged += 1,
                            _ => {
                                warn!(
                                    "Permission {} was persisted concurrently with different fields",
                                    permission.name
                                );
                                report.conflicts.push(permission.name.clone());
                            }
                        }
                    }
                    Err(e) => return Err(e.into()),
                },
                Some(stored) if stored == permission => report.unchanged += 1,
                Some(_) => {
                    warn!(
                        "Persisted permission {} differs from catalog; keeping stored record",
                        permission.name
                    );
                    report.conflicts.push(permission.name.clone());
                }
            }
        }

        self.refresh().await?;
        info!(
            "Permission sync complete: {} inserted, {} unchanged, {} conflicts",
            report.inserted,
            report.unchanged,
            report.conflicts.len()
        );
        Ok(report)
    }

    /// Rebuilds the snapshot from the store and swaps it in.
    pub async fn refresh(&self) -> Result<(), RegistryError> {
        let _reload = self.reload.lock().await;
        let permissions = self.store.get_all_permissions().await?;
        let snapshot = Arc::new(PermissionSnapshot::from_permissions(permissions));
        debug!("Permission snapshot rebuilt with {} entries", snapshot.len());
        *self.snapshot.write() = snapshot;
        Ok(())
    }
}

#[async_trait]
impl InvalidationListener for PermissionRegistry {
    async fn on_invalidate(&self, category: CacheCategory, _scope: &InvalidationScope) {
        if category != CacheCategory::Permissions {
            return;
        }
        // Keep serving the previous snapshot if the reload fails.
        if let Err(e) = self.refresh().await {
            warn!("Permission snapshot reload failed: {}", e);
        }
    }
}

/// Reads a YAML list of permissions.
pub async fn load_catalog<P: AsRef<Path>>(path: P) -> Result<Vec<Permission>, RegistryError> {
    let content = tokio::fs::read_to_string(&path).await?;
    let catalog: Vec<Permission> = serde_yaml::from_str(&content)?;
    Ok(catalog)
}

fn validate_catalog(catalog: &[Permission]) -> Result<(), RegistryError> {
    let mut names = HashSet::new();
    let mut contexts = HashSet::new();
    for permission in catalog {
        if !names.insert(permission.name.as_str()) {
            return Err(RegistryError::DuplicateName(permission.name.clone()));
        }
        if !contexts.insert((permission.context_id.as_str(), permission.action)) {
            return Err(RegistryError::DuplicateContext(
                permission.context_id.clone(),
                permission.action,
            ));
        }
    }
    Ok(())
}
