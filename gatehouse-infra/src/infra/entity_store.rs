use async_trait::async_trait;
use gatehouse_policy::{EntityFetcher, EntityKind, StoreError, TenantId};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum EntityStoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Forbidden: batch contains entities outside the caller's tenant")]
    Forbidden { requested: usize, matched: usize },

    #[error("Batch contains no ids")]
    EmptyBatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchAction {
    Delete,
    Block,
    Unblock,
}

impl BatchAction {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchAction::Delete => "delete",
            BatchAction::Block => "block",
            BatchAction::Unblock => "unblock",
        }
    }
}

impl fmt::Display for BatchAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tenant-owned tokens, users and entries in SQLite.
#[derive(Clone)]
pub struct SqliteEntityStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteEntityStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, EntityStoreError> {
        if let Some(parent) = db_path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self, EntityStoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, EntityStoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS entities (
                kind TEXT NOT NULL,
                id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                blocked INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (kind, id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_entities_tenant ON entities(tenant_id, kind)",
            [],
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn insert(&self, kind: EntityKind, id: &str, tenant: &TenantId) -> Result<(), EntityStoreError> {
        self.conn.lock().execute(
            "INSERT INTO entities (kind, id, tenant_id) VALUES (?1, ?2, ?3)",
            params![kind.as_str(), id, tenant.as_str()],
        )?;
        Ok(())
    }

    /// `None` when the entity does not exist.
    pub fn is_blocked(&self, kind: EntityKind, id: &str) -> Result<Option<bool>, EntityStoreError> {
        let blocked: Option<i64> = self
            .conn
            .lock()
            .query_row(
                "SELECT blocked FROM entities WHERE kind = ?1 AND id = ?2",
                params![kind.as_str(), id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(blocked.map(|b| b != 0))
    }

    pub fn exists(&self, kind: EntityKind, id: &str) -> Result<bool, EntityStoreError> {
        Ok(self.is_blocked(kind, id)?.is_some())
    }

    pub fn owned_ids(
        &self,
        kind: EntityKind,
        ids: &[String],
        tenant: &TenantId,
    ) -> Result<Vec<String>, EntityStoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT id FROM entities WHERE kind = ? AND tenant_id = ? AND id IN ({})",
            placeholders(ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(bind(kind, tenant, ids)), |row| {
            row.get::<_, String>(0)
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Applies `action` to every id, or to none of them.
    ///
    /// Ownership is counted and the mutation runs inside one transaction, and
    /// the mutation itself is filtered by tenant, so an entity moved between
    /// the check and the write is never touched.
    pub fn apply_batch(
        &self,
        kind: EntityKind,
        ids: &[String],
        tenant: &TenantId,
        action: BatchAction,
    ) -> Result<usize, EntityStoreError> {
        let unique: Vec<String> = ids
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if unique.is_empty() {
            return Err(EntityStoreError::EmptyBatch);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let count_sql = format!(
            "SELECT COUNT(*) FROM entities WHERE kind = ? AND tenant_id = ? AND id IN ({})",
            placeholders(unique.len())
        );
        let owned: i64 = tx.query_row(&count_sql, params_from_iter(bind(kind, tenant, &unique)), |row| {
            row.get(0)
        })?;
        if owned as usize != unique.len() {
            warn!(
                "Rejected {} {} batch for tenant {}: {} of {} ids owned",
                action,
                kind,
                tenant,
                owned,
                unique.len()
            );
            return Err(EntityStoreError::Forbidden {
                requested: unique.len(),
                matched: owned as usize,
            });
        }

        let filter = format!(
            "WHERE kind = ? AND tenant_id = ? AND id IN ({})",
            placeholders(unique.len())
        );
        let sql = match action {
            BatchAction::Delete => format!("DELETE FROM entities {}", filter),
            BatchAction::Block => format!("UPDATE entities SET blocked = 1 {}", filter),
            BatchAction::Unblock => format!("UPDATE entities SET blocked = 0 {}", filter),
        };
        let affected = tx.execute(&sql, params_from_iter(bind(kind, tenant, &unique)))?;
        if affected != unique.len() {
            warn!(
                "Rolled back {} {} batch for tenant {}: {} of {} rows affected",
                action,
                kind,
                tenant,
                affected,
                unique.len()
            );
            return Err(EntityStoreError::Forbidden {
                requested: unique.len(),
                matched: affected,
            });
        }

        tx.commit()?;
        info!("Applied {} to {} {} ids in tenant {}", action, affected, kind, tenant);
        Ok(affected)
    }
}

#[async_trait]
impl EntityFetcher for SqliteEntityStore {
    async fn fetch_owned(
        &self,
        kind: EntityKind,
        ids: &[String],
        tenant: &TenantId,
    ) -> Result<Vec<String>, StoreError> {
        let store = self.clone();
        let ids = ids.to_vec();
        let tenant = tenant.clone();

        tokio::task::spawn_blocking(move || {
            store
                .owned_ids(kind, &ids, &tenant)
                .map_err(|e| StoreError::Unavailable(e.to_string()))
        })
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?
        .map(|owned| {
            debug!("Fetched {} owned {} ids", owned.len(), kind);
            owned
        })
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn bind(kind: EntityKind, tenant: &TenantId, ids: &[String]) -> Vec<String> {
    let mut values = Vec::with_capacity(ids.len() + 2);
    values.push(kind.as_str().to_string());
    values.push(tenant.as_str().to_string());
    values.extend(ids.iter().cloned());
    values
}
