//! Storage-backed pieces of the gatehouse: the hash-chained audit log, the
//! tenant entity store, the rate limiter and startup integrity checks.

pub mod infra;

pub use infra::audit_log::{AuditHealth, AuditLog, AuditLogOptions, DegradedState, RetryPolicy};
pub use infra::audit_store::{AuditError, AuditStore, JsonlAuditStore, SqliteAuditStore, StoredRecord};
pub use infra::contracts::{Actor, AuditAction, AuditLogEntry, ChainVerification, ResourceRef, GENESIS_HASH};
pub use infra::entity_store::{BatchAction, EntityStoreError, SqliteEntityStore};
pub use infra::integrity::{IntegrityError, IntegrityReport, IntegrityValidator};
pub use infra::rate_limiter::{RateLimitConfig, RateLimitError, RateLimiter};
