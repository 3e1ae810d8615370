use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::infra::contracts::{Actor, AuditLogEntry, ResourceRef, GENESIS_HASH};

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Append conflict: chain head has moved")]
    Conflict,

    #[error("Audit storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Audit chain broken at index {0}")]
    ChainBroken(usize),
}

impl AuditError {
    pub fn code(&self) -> &'static str {
        match self {
            AuditError::ChainBroken(_) => "CHAIN_BROKEN",
            _ => "STORAGE_UNAVAILABLE",
        }
    }
}

/// A stored record as read back, in insertion order.
#[derive(Debug, Clone)]
pub enum StoredRecord {
    Entry(AuditLogEntry),
    Corrupt { position: usize, reason: String },
}

/// Append-only persistence for the audit chain.
pub trait AuditStore: Send + Sync {
    fn append(&self, entry: &AuditLogEntry) -> Result<(), AuditError>;

    /// Every record, oldest first.
    fn read_all(&self) -> Result<Vec<StoredRecord>, AuditError>;

    /// Up to `limit` decodable entries, newest first.
    fn read_recent(&self, limit: usize) -> Result<Vec<AuditLogEntry>, AuditError>;

    fn last_entry(&self) -> Result<Option<AuditLogEntry>, AuditError>;
}

const SEGMENT_PREFIX: &str = "audit-";
const SEGMENT_EXTENSION: &str = "jsonl";

struct Segment {
    index: u32,
    /// `None` when the store was opened read-only.
    file: Option<File>,
    entries: usize,
}

/// JSON-lines segments in a directory; one entry per line, never rewritten.
pub struct JsonlAuditStore {
    dir: PathBuf,
    segment_max_entries: usize,
    current: Mutex<Segment>,
}

impl JsonlAuditStore {
    pub fn new<P: AsRef<Path>>(dir: P, segment_max_entries: usize) -> Result<Self, AuditError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let segments = list_segments(&dir)?;
        let index = segments.last().map(|(i, _)| *i).unwrap_or(1);
        let path = segment_path(&dir, index);
        discard_torn_tail(&path)?;
        let entries = count_lines(&path)?;

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!("Opened audit segment {:?} with {} entries", path, entries);

        Ok(Self {
            dir,
            segment_max_entries: segment_max_entries.max(1),
            current: Mutex::new(Segment {
                index,
                file: Some(file),
                entries,
            }),
        })
    }

    /// Opens an existing directory for reading only. Nothing on disk is
    /// repaired, so a line still being written by another process is left alone.
    pub fn open_read_only<P: AsRef<Path>>(dir: P) -> Result<Self, AuditError> {
        let dir = dir.as_ref().to_path_buf();
        let segments = list_segments(&dir)?;
        let index = segments.last().map(|(i, _)| *i).unwrap_or(1);
        Ok(Self {
            dir,
            segment_max_entries: usize::MAX,
            current: Mutex::new(Segment {
                index,
                file: None,
                entries: 0,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn segment_paths(&self) -> Result<Vec<PathBuf>, AuditError> {
        Ok(list_segments(&self.dir)?
            .into_iter()
            .map(|(_, path)| path)
            .collect())
    }

    /// Decoded lines of one segment. A final line without its newline is an
    /// append in progress (or torn) and is not returned.
    fn read_segment(path: &Path) -> Result<Vec<Result<AuditLogEntry, String>>, AuditError> {
        let content = fs::read_to_string(path)?;
        let complete = match content.rfind('\n') {
            Some(end) => &content[..=end],
            None => "",
        };
        Ok(complete
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(|e| e.to_string()))
            .collect())
    }
}

impl AuditStore for JsonlAuditStore {
    fn append(&self, entry: &AuditLogEntry) -> Result<(), AuditError> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut guard = self.current.lock();
        let segment = &mut *guard;

        if segment.entries >= self.segment_max_entries {
            let next = segment.index + 1;
            let path = segment_path(&self.dir, next);
            let file = OpenOptions::new().create_new(true).append(true).open(&path)?;
            info!("Rotated audit log to segment {:?}", path);
            *segment = Segment {
                index: next,
                file: Some(file),
                entries: 0,
            };
        }

        let Some(file) = segment.file.as_mut() else {
            return Err(AuditError::StorageUnavailable(
                "audit store opened read-only".to_string(),
            ));
        };
        let start = file.metadata()?.len();
        if let Err(e) = file.write_all(line.as_bytes()).and_then(|_| file.sync_all()) {
            // Nothing of this entry may remain once the error is returned.
            if let Err(rollback) = file.set_len(start).and_then(|_| file.sync_all()) {
                error!(
                    "Could not roll back failed audit append in segment {}: {}",
                    segment.index, rollback
                );
            }
            return Err(e.into());
        }
        segment.entries += 1;
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<StoredRecord>, AuditError> {
        let _guard = self.current.lock();
        let mut records = Vec::new();
        for path in self.segment_paths()? {
            for parsed in Self::read_segment(&path)? {
                let position = records.len();
                records.push(match parsed {
                    Ok(entry) => StoredRecord::Entry(entry),
                    Err(reason) => StoredRecord::Corrupt { position, reason },
                });
            }
        }
        Ok(records)
    }

    fn read_recent(&self, limit: usize) -> Result<Vec<AuditLogEntry>, AuditError> {
        let _guard = self.current.lock();
        let mut out = Vec::with_capacity(limit);
        for path in self.segment_paths()?.into_iter().rev() {
            if out.len() >= limit {
                break;
            }
            for parsed in Self::read_segment(&path)?.into_iter().rev() {
                if out.len() >= limit {
                    break;
                }
                match parsed {
                    Ok(entry) => out.push(entry),
                    Err(reason) => warn!("Skipping undecodable audit line in {:?}: {}", path, reason),
                }
            }
        }
        Ok(out)
    }

    fn last_entry(&self) -> Result<Option<AuditLogEntry>, AuditError> {
        Ok(self.read_recent(1)?.into_iter().next())
    }
}

fn segment_path(dir: &Path, index: u32) -> PathBuf {
    dir.join(format!("{}{:06}.{}", SEGMENT_PREFIX, index, SEGMENT_EXTENSION))
}

fn list_segments(dir: &Path) -> Result<Vec<(u32, PathBuf)>, AuditError> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|s| s.to_str()) != Some(SEGMENT_EXTENSION) {
            continue;
        }
        let index = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.strip_prefix(SEGMENT_PREFIX))
            .and_then(|s| s.parse::<u32>().ok());
        if let Some(index) = index {
            segments.push((index, path));
        }
    }
    segments.sort_by_key(|(index, _)| *index);
    Ok(segments)
}

fn count_lines(path: &Path) -> Result<usize, AuditError> {
    if !path.exists() {
        return Ok(0);
    }
    let reader = BufReader::new(File::open(path)?);
    let mut count = 0;
    for line in reader.lines() {
        if !line?.trim().is_empty() {
            count += 1;
        }
    }
    Ok(count)
}

/// Drops a final line left without its newline by an interrupted write.
fn discard_torn_tail(path: &Path) -> Result<(), AuditError> {
    if !path.exists() {
        return Ok(());
    }
    let content = fs::read(path)?;
    if content.is_empty() || content.ends_with(b"\n") {
        return Ok(());
    }
    let keep = content
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|i| i + 1)
        .unwrap_or(0);
    warn!(
        "Discarding {} bytes of incomplete audit entry at end of {:?}",
        content.len() - keep,
        path
    );
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(keep as u64)?;
    file.sync_all()?;
    Ok(())
}

/// SQLite table with an autoincrement sequence; appends are conditional on the chain head.
pub struct SqliteAuditStore {
    conn: Mutex<Connection>,
}

const SELECT_COLUMNS: &str = "id, timestamp, action, actor_id, actor_email, actor_ip, \
     resource_type, resource_id, details, previous_hash, hash";

impl SqliteAuditStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, AuditError> {
        if let Some(parent) = db_path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self, AuditError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, AuditError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS audit_log (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                timestamp TEXT NOT NULL,
                action TEXT NOT NULL,
                actor_id TEXT NOT NULL,
                actor_email TEXT NOT NULL,
                actor_ip TEXT NOT NULL,
                resource_type TEXT NOT NULL,
                resource_id TEXT NOT NULL,
                details TEXT,
                previous_hash TEXT NOT NULL UNIQUE,
                hash TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_audit_action ON audit_log(action)",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn query(&self, sql: &str, limit: Option<usize>) -> Result<Vec<Result<AuditLogEntry, String>>, AuditError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let mut rows = match limit {
            Some(limit) => stmt.query(params![limit as i64])?,
            None => stmt.query([])?,
        };
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(entry_from_row(row)?);
        }
        Ok(out)
    }
}

impl AuditStore for SqliteAuditStore {
    fn append(&self, entry: &AuditLogEntry) -> Result<(), AuditError> {
        let details = entry
            .details
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let head: Option<String> = tx
            .query_row(
                "SELECT hash FROM audit_log ORDER BY seq DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let head = head.unwrap_or_else(|| GENESIS_HASH.to_string());
        if head != entry.previous_hash {
            return Err(AuditError::Conflict);
        }

        let inserted = tx.execute(
            "INSERT INTO audit_log (id, timestamp, action, actor_id, actor_email, actor_ip,
                resource_type, resource_id, details, previous_hash, hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                entry.id.to_string(),
                entry.timestamp,
                entry.action,
                entry.actor.id,
                entry.actor.email,
                entry.actor.ip,
                entry.resource.kind,
                entry.resource.id,
                details,
                entry.previous_hash,
                entry.hash,
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                return Err(AuditError::Conflict);
            }
            Err(e) => return Err(e.into()),
        }

        tx.commit()?;
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<StoredRecord>, AuditError> {
        let sql = format!("SELECT {} FROM audit_log ORDER BY seq ASC", SELECT_COLUMNS);
        Ok(self
            .query(&sql, None)?
            .into_iter()
            .enumerate()
            .map(|(position, parsed)| match parsed {
                Ok(entry) => StoredRecord::Entry(entry),
                Err(reason) => StoredRecord::Corrupt { position, reason },
            })
            .collect())
    }

    fn read_recent(&self, limit: usize) -> Result<Vec<AuditLogEntry>, AuditError> {
        let sql = format!(
            "SELECT {} FROM audit_log ORDER BY seq DESC LIMIT ?1",
            SELECT_COLUMNS
        );
        let mut out = Vec::new();
        for parsed in self.query(&sql, Some(limit))? {
            match parsed {
                Ok(entry) => out.push(entry),
                Err(reason) => warn!("Skipping undecodable audit row: {}", reason),
            }
        }
        Ok(out)
    }

    fn last_entry(&self) -> Result<Option<AuditLogEntry>, AuditError> {
        Ok(self.read_recent(1)?.into_iter().next())
    }
}

fn entry_from_row(row: &Row<'_>) -> Result<Result<AuditLogEntry, String>, rusqlite::Error> {
    let id: String = row.get(0)?;
    let details: Option<String> = row.get(8)?;

    let id = match Uuid::parse_str(&id) {
        Ok(id) => id,
        Err(e) => return Ok(Err(format!("invalid id {}: {}", id, e))),
    };
    let details = match details.map(|d| serde_json::from_str(&d)).transpose() {
        Ok(details) => details,
        Err(e) => return Ok(Err(format!("invalid details: {}", e))),
    };

    Ok(Ok(AuditLogEntry {
        id,
        timestamp: row.get(1)?,
        action: row.get(2)?,
        actor: Actor {
            id: row.get(3)?,
            email: row.get(4)?,
            ip: row.get(5)?,
        },
        resource: ResourceRef {
            kind: row.get(6)?,
            id: row.get(7)?,
        },
        details,
        previous_hash: row.get(9)?,
        hash: row.get(10)?,
    }))
}
