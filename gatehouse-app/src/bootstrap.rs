use crate::catalog::build_catalog;
use crate::config::{AuditBackend, AuditSettings, Config};
use crate::service::SecurityCore;
use anyhow::{Context, Result};
use gatehouse_infra::{AuditLog, AuditStore, JsonlAuditStore, RateLimiter, SqliteAuditStore, SqliteEntityStore};
use gatehouse_policy::{load_catalog, Permission, PermissionRegistry, PermissionStore, RoleSource, RoleStore, UserSource};
use std::sync::Arc;
use tracing::info;

pub fn open_audit_store(settings: &AuditSettings) -> Result<Arc<dyn AuditStore>> {
    let store: Arc<dyn AuditStore> = match settings.backend {
        AuditBackend::Jsonl => Arc::new(
            JsonlAuditStore::new(&settings.path, settings.segment_max_entries)
                .with_context(|| format!("Failed to open audit directory {}", settings.path.display()))?,
        ),
        AuditBackend::Sqlite => Arc::new(
            SqliteAuditStore::new(&settings.path)
                .with_context(|| format!("Failed to open audit database {}", settings.path.display()))?,
        ),
    };
    Ok(store)
}

/// Opens the store for inspection. A JSONL directory is not repaired, since a
/// live writer may be mid-append.
pub fn open_audit_store_read_only(settings: &AuditSettings) -> Result<Arc<dyn AuditStore>> {
    match settings.backend {
        AuditBackend::Jsonl => {
            let store = JsonlAuditStore::open_read_only(&settings.path)
                .with_context(|| format!("Failed to read audit directory {}", settings.path.display()))?;
            Ok(Arc::new(store))
        }
        AuditBackend::Sqlite => open_audit_store(settings),
    }
}

pub fn open_audit_reader(settings: &AuditSettings) -> Result<AuditLog> {
    let store = open_audit_store_read_only(settings)?;
    AuditLog::open(store, settings.options()).context("Failed to open audit log")
}

pub fn open_audit_log(settings: &AuditSettings) -> Result<AuditLog> {
    let store = open_audit_store(settings)?;
    AuditLog::open(store, settings.options()).context("Failed to open audit log")
}

/// Built-in catalog, configured collections, then the optional catalog file.
pub async fn load_full_catalog(config: &Config) -> Result<Vec<Permission>> {
    let extra = match &config.catalog_path {
        Some(path) => load_catalog(path)
            .await
            .with_context(|| format!("Failed to load catalog {}", path.display()))?,
        None => Vec::new(),
    };
    Ok(build_catalog(&config.collections, extra))
}

/// Opens every store named by `config` and syncs the catalog.
pub async fn build_core(
    config: &Config,
    permissions: Arc<dyn PermissionStore>,
    roles: Arc<dyn RoleSource>,
    users: Arc<dyn UserSource>,
) -> Result<SecurityCore> {
    let audit = Arc::new(open_audit_log(&config.audit)?);
    let entities = SqliteEntityStore::new(&config.entities_db)
        .with_context(|| format!("Failed to open {}", config.entities_db.display()))?;
    let rate_limiter = Arc::new(RateLimiter::new(
        config.rate_limit.per_context.clone(),
        config.rate_limit.global.clone(),
    ));

    let core = SecurityCore::new(
        Arc::new(PermissionRegistry::new(permissions)),
        Arc::new(RoleStore::new(roles)),
        users,
        entities,
        audit,
        rate_limiter,
        config.engine.clone(),
    );

    let catalog = load_full_catalog(config).await?;
    let report = core.sync_catalog(&catalog).await.context("Permission sync failed")?;
    info!(
        "Permission catalog synced: {} inserted, {} unchanged, {} conflicts",
        report.inserted,
        report.unchanged,
        report.conflicts.len()
    );

    Ok(core)
}
