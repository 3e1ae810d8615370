use crate::bootstrap::load_full_catalog;
use crate::config::Config;
use anyhow::{Context, Result};
use gatehouse_policy::memory::InMemoryPermissionStore;
use gatehouse_policy::PermissionRegistry;
use std::sync::Arc;

/// Validates the effective catalog and prints it as YAML.
pub async fn run(config: &Config) -> Result<()> {
    let catalog = load_full_catalog(config).await?;

    let registry = PermissionRegistry::new(Arc::new(InMemoryPermissionStore::new()));
    registry
        .sync_permissions(&catalog)
        .await
        .context("Catalog is invalid")?;

    print!("{}", serde_yaml::to_string(&registry.all_permissions())?);
    eprintln!("{} permissions", registry.all_permissions().len());
    Ok(())
}
