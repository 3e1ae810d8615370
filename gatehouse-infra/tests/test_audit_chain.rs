use gatehouse_infra::infra::audit_log::{AuditLog, AuditLogOptions, RetryPolicy};
use gatehouse_infra::infra::audit_store::{AuditError, AuditStore, JsonlAuditStore, SqliteAuditStore, StoredRecord};
use gatehouse_infra::infra::contracts::{Actor, AuditAction, AuditLogEntry, ResourceRef, GENESIS_HASH};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn open(dir: &Path) -> AuditLog {
    let store = Arc::new(JsonlAuditStore::new(dir, 1000).unwrap());
    AuditLog::open(store, AuditLogOptions::default()).unwrap()
}

fn append(log: &AuditLog, token: &str) -> AuditLogEntry {
    log.append(
        AuditAction::TokenDeleted,
        Actor::new("admin", "admin@example.com", "10.0.0.1"),
        ResourceRef::new("token", token),
        Some(serde_json::json!({"tenant": "t1"})),
    )
    .unwrap()
}

fn segment(dir: &Path) -> std::path::PathBuf {
    dir.join("audit-000001.jsonl")
}

#[test]
fn test_valid_chain_verification() {
    let dir = tempdir().unwrap();
    let log = open(dir.path());

    for i in 0..5 {
        append(&log, &format!("tok_{}", i));
    }

    let verification = log.verify_chain().unwrap();
    assert!(verification.ok);
    assert_eq!(verification.entries_checked, 5);
    assert_eq!(verification.broken_at_index, None);
}

#[test]
fn test_tampered_entry_detection() {
    let dir = tempdir().unwrap();
    let log = open(dir.path());
    for i in 0..5 {
        append(&log, &format!("tok_{}", i));
    }

    let content = std::fs::read_to_string(segment(dir.path())).unwrap();
    std::fs::write(segment(dir.path()), content.replace("tok_2", "tok_X")).unwrap();

    let verification = log.verify_chain().unwrap();
    assert!(!verification.ok);
    assert_eq!(verification.broken_at_index, Some(2));
}

#[test]
fn test_deleted_entry_detection() {
    let dir = tempdir().unwrap();
    let log = open(dir.path());
    for i in 0..5 {
        append(&log, &format!("tok_{}", i));
    }

    let content = std::fs::read_to_string(segment(dir.path())).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    let modified = format!("{}\n{}\n{}\n{}\n", lines[0], lines[1], lines[2], lines[4]);
    std::fs::write(segment(dir.path()), modified).unwrap();

    assert_eq!(log.verify_chain().unwrap().broken_at_index, Some(3));
}

#[test]
fn test_deleted_first_entry_detection() {
    let dir = tempdir().unwrap();
    let log = open(dir.path());
    for i in 0..3 {
        append(&log, &format!("tok_{}", i));
    }

    let content = std::fs::read_to_string(segment(dir.path())).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    std::fs::write(segment(dir.path()), format!("{}\n{}\n", lines[1], lines[2])).unwrap();

    assert_eq!(log.verify_chain().unwrap().broken_at_index, Some(0));
}

#[test]
fn test_reordered_entry_detection() {
    let dir = tempdir().unwrap();
    let log = open(dir.path());
    for i in 0..4 {
        append(&log, &format!("tok_{}", i));
    }

    let content = std::fs::read_to_string(segment(dir.path())).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    let modified = format!("{}\n{}\n{}\n{}\n", lines[0], lines[2], lines[1], lines[3]);
    std::fs::write(segment(dir.path()), modified).unwrap();

    assert_eq!(log.verify_chain().unwrap().broken_at_index, Some(1));
}

#[test]
fn test_rehashed_entry_still_breaks_link() {
    let dir = tempdir().unwrap();
    let log = open(dir.path());
    for i in 0..3 {
        append(&log, &format!("tok_{}", i));
    }

    // Rewrite entry 1 with a self-consistent hash; entry 2 no longer links.
    let content = std::fs::read_to_string(segment(dir.path())).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    let mut forged: AuditLogEntry = serde_json::from_str(lines[1]).unwrap();
    forged.resource.id = "tok_forged".to_string();
    forged.hash = forged.compute_hash().unwrap();
    let modified = format!(
        "{}\n{}\n{}\n",
        lines[0],
        serde_json::to_string(&forged).unwrap(),
        lines[2]
    );
    std::fs::write(segment(dir.path()), modified).unwrap();

    assert_eq!(log.verify_chain().unwrap().broken_at_index, Some(2));
}

#[test]
fn test_recent_logs_are_chained() {
    let dir = tempdir().unwrap();
    let log = open(dir.path());
    let a = append(&log, "a");
    let b = append(&log, "b");
    let c = append(&log, "c");

    let logs = log.get_logs(3).unwrap();
    assert_eq!(logs, vec![c.clone(), b.clone(), a.clone()]);
    assert_eq!(a.previous_hash, GENESIS_HASH);
    assert_eq!(b.previous_hash, a.hash);
    assert_eq!(c.previous_hash, b.hash);
}

#[test]
fn test_startup_verification_failure() {
    let dir = tempdir().unwrap();
    {
        let log = open(dir.path());
        for i in 0..3 {
            append(&log, &format!("tok_{}", i));
        }
    }

    let content = std::fs::read_to_string(segment(dir.path())).unwrap();
    std::fs::write(segment(dir.path()), content.replace("tok_1", "tok_X")).unwrap();

    let store = Arc::new(JsonlAuditStore::new(dir.path(), 1000).unwrap());
    let options = AuditLogOptions {
        verify_on_open: true,
        ..AuditLogOptions::default()
    };
    let result = AuditLog::open(store, options);
    assert!(matches!(result, Err(AuditError::ChainBroken(1))));
}

#[test]
fn test_chain_continuity() {
    let dir = tempdir().unwrap();
    let last = {
        let log = open(dir.path());
        (0..3).map(|i| append(&log, &format!("tok_{}", i))).last().unwrap()
    };

    {
        let log = open(dir.path());
        assert_eq!(log.health().last_hash, last.hash);
        let next = append(&log, "tok_3");
        assert_eq!(next.previous_hash, last.hash);
    }

    let log = open(dir.path());
    let verification = log.verify_chain().unwrap();
    assert!(verification.ok);
    assert_eq!(verification.entries_checked, 4);
}

#[test]
fn test_chain_spans_segments() {
    let dir = tempdir().unwrap();
    let store = Arc::new(JsonlAuditStore::new(dir.path(), 2).unwrap());
    let log = AuditLog::open(store.clone(), AuditLogOptions::default()).unwrap();
    for i in 0..7 {
        append(&log, &format!("tok_{}", i));
    }

    assert_eq!(store.segment_paths().unwrap().len(), 4);
    assert!(log.verify_chain().unwrap().ok);
    assert_eq!(log.get_logs(3).unwrap()[0].resource.id, "tok_6");
}

#[test]
fn test_sqlite_writers_relink_on_conflict() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("audit.db");

    let first = AuditLog::open(
        Arc::new(SqliteAuditStore::new(&db).unwrap()),
        AuditLogOptions::default(),
    )
    .unwrap();
    let second = AuditLog::open(
        Arc::new(SqliteAuditStore::new(&db).unwrap()),
        AuditLogOptions::default(),
    )
    .unwrap();

    let a = append(&first, "a");
    // `second` still believes the chain is empty.
    let b = append(&second, "b");
    assert_eq!(b.previous_hash, a.hash);

    let c = append(&first, "c");
    assert_eq!(c.previous_hash, b.hash);
    assert!(first.verify_chain().unwrap().ok);
    assert_eq!(second.get_logs(10).unwrap().len(), 3);
}

#[test]
fn test_sqlite_tamper_detection() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("audit.db");
    let log = AuditLog::open(
        Arc::new(SqliteAuditStore::new(&db).unwrap()),
        AuditLogOptions::default(),
    )
    .unwrap();
    for i in 0..4 {
        append(&log, &format!("tok_{}", i));
    }

    let conn = rusqlite::Connection::open(&db).unwrap();
    conn.execute("UPDATE audit_log SET actor_ip = '6.6.6.6' WHERE resource_id = 'tok_2'", [])
        .unwrap();
    assert_eq!(log.verify_chain().unwrap().broken_at_index, Some(2));

    conn.execute("DELETE FROM audit_log WHERE resource_id = 'tok_1'", []).unwrap();
    assert_eq!(log.verify_chain().unwrap().broken_at_index, Some(1));
}

/// Store whose appends fail while `failing` is set.
struct FlakyStore {
    inner: SqliteAuditStore,
    failing: AtomicBool,
}

impl AuditStore for FlakyStore {
    fn append(&self, entry: &AuditLogEntry) -> Result<(), AuditError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AuditError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )));
        }
        self.inner.append(entry)
    }

    fn read_all(&self) -> Result<Vec<StoredRecord>, AuditError> {
        self.inner.read_all()
    }

    fn read_recent(&self, limit: usize) -> Result<Vec<AuditLogEntry>, AuditError> {
        self.inner.read_recent(limit)
    }

    fn last_entry(&self) -> Result<Option<AuditLogEntry>, AuditError> {
        self.inner.last_entry()
    }
}

#[test]
fn test_degraded_marker_after_recovery() {
    let store = Arc::new(FlakyStore {
        inner: SqliteAuditStore::in_memory().unwrap(),
        failing: AtomicBool::new(false),
    });
    let options = AuditLogOptions {
        retry: RetryPolicy {
            max_attempts: 2,
            backoff: Duration::from_millis(1),
        },
        verify_on_open: false,
    };
    let log = AuditLog::open(store.clone(), options).unwrap();

    append(&log, "before");

    store.failing.store(true, Ordering::SeqCst);
    for token in ["lost_1", "lost_2"] {
        let result = log.append(
            AuditAction::TokenDeleted,
            Actor::system(),
            ResourceRef::new("token", token),
            None,
        );
        assert!(matches!(result, Err(AuditError::StorageUnavailable(_))));
    }
    let degraded = log.health().degraded.unwrap();
    assert_eq!(degraded.failed_appends, 2);
    assert!(degraded.last_error.contains("disk full"));

    store.failing.store(false, Ordering::SeqCst);
    append(&log, "after");
    assert!(!log.is_degraded());

    let logs = log.get_logs(10).unwrap();
    let actions: Vec<_> = logs.iter().map(|e| e.action.as_str()).collect();
    assert_eq!(actions, vec!["token_deleted", "logging_degraded", "token_deleted"]);
    assert_eq!(logs[1].details.as_ref().unwrap()["failedAppends"], 2);
    assert!(logs[1].is_incident());
    assert!(log.verify_chain().unwrap().ok);
}

/// Persists the entry, then reports a sync failure once.
struct LandsThenFails {
    inner: JsonlAuditStore,
    fail_once: AtomicBool,
}

impl AuditStore for LandsThenFails {
    fn append(&self, entry: &AuditLogEntry) -> Result<(), AuditError> {
        self.inner.append(entry)?;
        if self.fail_once.swap(false, Ordering::SeqCst) {
            return Err(AuditError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "fsync failed",
            )));
        }
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<StoredRecord>, AuditError> {
        self.inner.read_all()
    }

    fn read_recent(&self, limit: usize) -> Result<Vec<AuditLogEntry>, AuditError> {
        self.inner.read_recent(limit)
    }

    fn last_entry(&self) -> Result<Option<AuditLogEntry>, AuditError> {
        self.inner.last_entry()
    }
}

#[test]
fn test_landed_write_reported_as_failure_is_not_duplicated() {
    let dir = tempdir().unwrap();
    let store = Arc::new(LandsThenFails {
        inner: JsonlAuditStore::new(dir.path(), 1000).unwrap(),
        fail_once: AtomicBool::new(true),
    });
    let log = AuditLog::open(store, AuditLogOptions::default()).unwrap();

    let first = append(&log, "a");
    let second = append(&log, "b");

    assert_eq!(second.previous_hash, first.hash);
    assert!(!log.is_degraded());
    let verification = log.verify_chain().unwrap();
    assert!(verification.ok);
    assert_eq!(verification.entries_checked, 2);
}
