use crate::bootstrap::{load_full_catalog, open_audit_store_read_only};
use crate::config::Config;
use anyhow::Result;
use gatehouse_infra::IntegrityValidator;

pub async fn run(config: &Config) -> Result<()> {
    println!("Health Check\n");

    let mut healthy = true;

    print!("Configuration... ");
    match config.validate() {
        Ok(()) => println!("✓"),
        Err(e) => {
            println!("✗ ({})", e);
            healthy = false;
        }
    }

    print!("Audit store... ");
    match open_audit_store_read_only(&config.audit) {
        Ok(store) => {
            println!("✓ ({})", config.audit.path.display());

            print!("Audit chain and databases... ");
            let databases = config.sqlite_databases();
            match IntegrityValidator::validate_all(store.as_ref(), &databases) {
                Ok(report) => println!(
                    "✓ ({} entries, {} databases)",
                    report.audit.entries_checked, report.databases_checked
                ),
                Err(e) => {
                    println!("✗ ({})", e);
                    healthy = false;
                }
            }
        }
        Err(e) => {
            println!("✗ ({:#})", e);
            healthy = false;
        }
    }

    print!("Permission catalog... ");
    match load_full_catalog(config).await {
        Ok(catalog) => println!("✓ ({} permissions)", catalog.len()),
        Err(e) => {
            println!("✗ ({:#})", e);
            healthy = false;
        }
    }

    println!();
    if healthy {
        println!("All checks passed");
        Ok(())
    } else {
        anyhow::bail!("Health check failed");
    }
}
