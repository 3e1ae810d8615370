//! Role/permission decisions, tenant isolation and cache invalidation.

pub mod cache;
pub mod engine;
pub mod memory;
pub mod registry;
pub mod roles;
pub mod tenant;
pub mod traits;
pub mod types;

pub use cache::{
    CacheCategory, CacheInvalidationBus, Generation, InvalidationListener, InvalidationScope, TenantSnapshots,
};
pub use engine::{AuthorizationEngine, EngineConfig, Resolution};
pub use registry::{load_catalog, PermissionRegistry, PermissionSnapshot, RegistryError, SyncReport};
pub use roles::{RoleSnapshot, RoleStore, RoleStoreError};
pub use tenant::{IsolationError, TenantIsolationGuard};
pub use traits::{EntityFetcher, PermissionStore, RateLimitSignal, RoleSource, StoreError, UserSource};
pub use types::*;
