use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::infra::audit_store::{AuditError, AuditStore, StoredRecord};
use crate::infra::contracts::{
    Actor, AuditAction, AuditLogEntry, ChainVerification, ResourceRef, GENESIS_HASH,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "duration_millis")]
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuditLogOptions {
    pub retry: RetryPolicy,
    /// Refuse to open a store whose chain does not verify.
    pub verify_on_open: bool,
}

/// Set while appends are failing; cleared once a `logging_degraded` marker lands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DegradedState {
    pub since: String,
    pub failed_appends: u64,
    pub last_error: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditHealth {
    pub last_hash: String,
    pub degraded: Option<DegradedState>,
}

struct ChainHead {
    last_hash: String,
    degraded: Option<DegradedState>,
}

/// Hash-chained, append-only audit log over an [`AuditStore`].
///
/// Appends are serialized through a single writer so each entry links to the
/// one persisted immediately before it.
pub struct AuditLog {
    store: Arc<dyn AuditStore>,
    head: Mutex<ChainHead>,
    options: AuditLogOptions,
}

impl AuditLog {
    pub fn open(store: Arc<dyn AuditStore>, options: AuditLogOptions) -> Result<Self, AuditError> {
        if options.verify_on_open {
            let verification = verify_records(&store.read_all()?);
            if let Some(index) = verification.broken_at_index {
                error!("Audit chain broken at index {}", index);
                return Err(AuditError::ChainBroken(index));
            }
        }

        let last_hash = store
            .last_entry()?
            .map(|entry| entry.hash)
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        debug!("Audit log opened at head {}", last_hash);

        Ok(Self {
            store,
            head: Mutex::new(ChainHead {
                last_hash,
                degraded: None,
            }),
            options,
        })
    }

    /// Persists one entry. On failure no entry is written; the log enters the
    /// degraded state and the next successful append is preceded by a marker.
    pub fn append(
        &self,
        action: AuditAction,
        actor: Actor,
        resource: ResourceRef,
        details: Option<Value>,
    ) -> Result<AuditLogEntry, AuditError> {
        let mut head = self.head.lock();

        if let Some(state) = head.degraded.clone() {
            let marker = json!({
                "since": state.since,
                "failedAppends": state.failed_appends,
                "lastError": state.last_error,
            });
            match self.write_linked(
                &mut head,
                AuditAction::LoggingDegraded.to_string(),
                Actor::system(),
                ResourceRef::new("audit_log", "chain"),
                Some(marker),
            ) {
                Ok(entry) => {
                    head.degraded = None;
                    info!(
                        "Audit logging recovered after {} failed appends (marker {})",
                        state.failed_appends, entry.id
                    );
                }
                Err(e) => {
                    let message = e.to_string();
                    self.mark_degraded(&mut head, &message);
                    return Err(AuditError::StorageUnavailable(message));
                }
            }
        }

        match self.write_linked(&mut head, action.to_string(), actor, resource, details) {
            Ok(entry) => Ok(entry),
            Err(e) => {
                let message = e.to_string();
                self.mark_degraded(&mut head, &message);
                Err(AuditError::StorageUnavailable(message))
            }
        }
    }

    fn write_linked(
        &self,
        head: &mut ChainHead,
        action: String,
        actor: Actor,
        resource: ResourceRef,
        details: Option<Value>,
    ) -> Result<AuditLogEntry, AuditError> {
        let id = Uuid::new_v4();
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let max_attempts = self.options.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let mut entry = AuditLogEntry {
                id,
                timestamp: timestamp.clone(),
                action: action.clone(),
                actor: actor.clone(),
                resource: resource.clone(),
                details: details.clone(),
                previous_hash: head.last_hash.clone(),
                hash: String::new(),
            };
            entry.hash = entry.compute_hash()?;

            let failure = match self.store.append(&entry) {
                Ok(()) => {
                    head.last_hash = entry.hash.clone();
                    debug!("Audit entry {} appended: {}", entry.id, entry.action);
                    return Ok(entry);
                }
                Err(e) => e,
            };

            // A failed write may still have landed; never link the same entry twice.
            if let Some(stored) = self.persisted(id) {
                warn!(
                    "Audit entry {} was persisted despite error: {}",
                    stored.id, failure
                );
                head.last_hash = stored.hash.clone();
                return Ok(stored);
            }

            match failure {
                AuditError::Conflict if attempt < max_attempts => {
                    head.last_hash = self
                        .store
                        .last_entry()?
                        .map(|e| e.hash)
                        .unwrap_or_else(|| GENESIS_HASH.to_string());
                    debug!("Audit head moved; relinking to {}", head.last_hash);
                }
                e if attempt < max_attempts => {
                    warn!(
                        "Audit append attempt {}/{} failed: {}",
                        attempt, max_attempts, e
                    );
                    thread::sleep(self.options.retry.backoff * attempt);
                }
                e => return Err(e),
            }
        }
    }

    /// The store's tail entry, if it is the one with `id`.
    fn persisted(&self, id: Uuid) -> Option<AuditLogEntry> {
        match self.store.last_entry() {
            Ok(Some(last)) if last.id == id => Some(last),
            _ => None,
        }
    }

    fn mark_degraded(&self, head: &mut ChainHead, message: &str) {
        let state = head.degraded.get_or_insert_with(|| DegradedState {
            since: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            failed_appends: 0,
            last_error: String::new(),
        });
        state.failed_appends += 1;
        state.last_error = message.to_string();
        error!(
            "Audit append failed, logging degraded ({} entries lost): {}",
            state.failed_appends, message
        );
    }

    /// Most recent first.
    pub fn get_logs(&self, limit: usize) -> Result<Vec<AuditLogEntry>, AuditError> {
        self.store.read_recent(limit)
    }

    /// Most recent incident entries first, scanning at most `window` entries.
    pub fn incidents(&self, limit: usize, window: usize) -> Result<Vec<AuditLogEntry>, AuditError> {
        Ok(self
            .store
            .read_recent(window)?
            .into_iter()
            .filter(AuditLogEntry::is_incident)
            .take(limit)
            .collect())
    }

    pub fn verify_chain(&self) -> Result<ChainVerification, AuditError> {
        let verification = verify_records(&self.store.read_all()?);
        match verification.broken_at_index {
            Some(index) => warn!("Audit chain verification failed at index {}", index),
            None => debug!(
                "Audit chain verified ({} entries)",
                verification.entries_checked
            ),
        }
        Ok(verification)
    }

    pub fn health(&self) -> AuditHealth {
        let head = self.head.lock();
        AuditHealth {
            last_hash: head.last_hash.clone(),
            degraded: head.degraded.clone(),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.head.lock().degraded.is_some()
    }
}

/// Walks records oldest first; the first record that fails to decode, link,
/// or hash is the break point.
pub fn verify_records(records: &[StoredRecord]) -> ChainVerification {
    let mut expected_previous = GENESIS_HASH.to_string();

    for (index, record) in records.iter().enumerate() {
        let entry = match record {
            StoredRecord::Entry(entry) => entry,
            StoredRecord::Corrupt { .. } => return broken(index),
        };
        if entry.previous_hash != expected_previous {
            return broken(index);
        }
        match entry.compute_hash() {
            Ok(hash) if hash == entry.hash => {}
            _ => return broken(index),
        }
        expected_previous = entry.hash.clone();
    }

    ChainVerification {
        ok: true,
        broken_at_index: None,
        entries_checked: records.len(),
    }
}

fn broken(index: usize) -> ChainVerification {
    ChainVerification {
        ok: false,
        broken_at_index: Some(index),
        entries_checked: index,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::audit_store::SqliteAuditStore;

    fn log() -> AuditLog {
        let store = Arc::new(SqliteAuditStore::in_memory().unwrap());
        AuditLog::open(store, AuditLogOptions::default()).unwrap()
    }

    fn append(log: &AuditLog, id: &str) -> AuditLogEntry {
        log.append(
            AuditAction::TokenDeleted,
            Actor::new("u1", "u1@example.com", "10.0.0.1"),
            ResourceRef::new("token", id),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_entries_link() {
        let log = log();
        let a = append(&log, "a");
        let b = append(&log, "b");

        assert_eq!(a.previous_hash, GENESIS_HASH);
        assert_eq!(b.previous_hash, a.hash);
        assert_eq!(log.health().last_hash, b.hash);
        assert!(log.verify_chain().unwrap().ok);
    }

    #[test]
    fn test_get_logs_most_recent_first() {
        let log = log();
        for id in ["a", "b", "c"] {
            append(&log, id);
        }
        let ids: Vec<_> = log
            .get_logs(10)
            .unwrap()
            .into_iter()
            .map(|e| e.resource.id)
            .collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[test]
    fn test_incidents_filtered() {
        let log = log();
        append(&log, "a");
        log.append(
            AuditAction::AccessDenied,
            Actor::new("u2", "u2@example.com", "10.0.0.2"),
            ResourceRef::new("collection", "posts"),
            None,
        )
        .unwrap();
        append(&log, "b");

        let incidents = log.incidents(10, 100).unwrap();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].action, "access_denied");
    }

    #[test]
    fn test_verify_empty_chain() {
        let verification = verify_records(&[]);
        assert!(verification.ok);
        assert_eq!(verification.entries_checked, 0);
    }

    #[test]
    fn test_corrupt_record_breaks_chain() {
        let log = log();
        let a = append(&log, "a");
        let records = vec![
            StoredRecord::Entry(a),
            StoredRecord::Corrupt {
                position: 1,
                reason: "bad".into(),
            },
        ];
        assert_eq!(verify_records(&records).broken_at_index, Some(1));
    }
}
