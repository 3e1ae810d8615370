pub mod audit_log;
pub mod audit_store;
pub mod contracts;
pub mod entity_store;
pub mod integrity;
pub mod rate_limiter;
