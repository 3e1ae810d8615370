use rusqlite::Connection;
use serde::Serialize;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

use crate::infra::audit_log::verify_records;
use crate::infra::audit_store::AuditStore;
use crate::infra::contracts::ChainVerification;

#[derive(Error, Debug)]
pub enum IntegrityError {
    #[error("Audit chain corrupted: {0}")]
    AuditChain(String),

    #[error("Database corrupted: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    pub audit: ChainVerification,
    pub databases_checked: usize,
}

pub struct IntegrityValidator;

impl IntegrityValidator {
    /// Startup check: the audit chain must verify and every existing database
    /// must pass SQLite's `integrity_check`.
    pub fn validate_all(
        audit: &dyn AuditStore,
        databases: &[&Path],
    ) -> Result<IntegrityReport, IntegrityError> {
        let verification = Self::verify_audit_chain(audit)?;

        let mut databases_checked = 0;
        for db_path in databases {
            if Self::verify_database(db_path)? {
                databases_checked += 1;
            }
        }

        info!(
            "Integrity check passed: {} audit entries, {} databases",
            verification.entries_checked, databases_checked
        );
        Ok(IntegrityReport {
            audit: verification,
            databases_checked,
        })
    }

    pub fn verify_audit_chain(audit: &dyn AuditStore) -> Result<ChainVerification, IntegrityError> {
        let records = audit
            .read_all()
            .map_err(|e| IntegrityError::AuditChain(e.to_string()))?;
        let verification = verify_records(&records);

        match verification.broken_at_index {
            Some(index) => {
                warn!("Audit chain broken at index {}", index);
                Err(IntegrityError::AuditChain(format!("broken at index {}", index)))
            }
            None => Ok(verification),
        }
    }

    /// Returns `false` when there is no database yet.
    pub fn verify_database(db_path: &Path) -> Result<bool, IntegrityError> {
        if !db_path.exists() {
            return Ok(false);
        }

        let conn = Connection::open(db_path).map_err(|e| IntegrityError::Database(e.to_string()))?;

        let result: String = conn
            .pragma_query_value(None, "integrity_check", |row| row.get(0))
            .map_err(|e| IntegrityError::Database(e.to_string()))?;

        if result != "ok" {
            return Err(IntegrityError::Database(format!(
                "{}: integrity check failed: {}",
                db_path.display(),
                result
            )));
        }

        Ok(true)
    }
}
