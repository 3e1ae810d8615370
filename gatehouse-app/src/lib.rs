//! Configuration, permission catalog and the privileged request pipeline.

pub mod bootstrap;
pub mod catalog;
pub mod commands;
pub mod config;
pub mod service;

pub use config::Config;
pub use service::{AuditRecord, BatchOutcome, CoreError, RequestContext, RoleChange, SecurityCore};
