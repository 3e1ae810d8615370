//! The privileged request pipeline: permission check, tenant isolation,
//! mutation, audit append and cache invalidation, in that order.

use gatehouse_infra::{
    Actor, AuditAction, AuditError, AuditLog, AuditLogEntry, BatchAction, ChainVerification,
    EntityStoreError, RateLimiter, ResourceRef, SqliteEntityStore,
};
use gatehouse_policy::{
    AuthorizationEngine, CacheCategory, CacheInvalidationBus, Decision, EngineConfig, EntityKind,
    IsolationError, Permission, PermissionAction, PermissionConfig, PermissionRegistry, ReasonCode,
    RegistryError, RoleStore, RoleStoreError, StoreError, SyncReport, TenantIsolationGuard, User,
    UserSource, ContextType,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::catalog::{
    batch_permission_action, entity_context, entity_context_type, AUDIT_CONTEXT, INCIDENTS_CONTEXT,
};

pub const MAX_AUDIT_PAGE: usize = 1000;
/// Newest entries scanned when collecting incidents.
pub const INCIDENT_SCAN_WINDOW: usize = 5000;
const ROLES_CONTEXT: &str = "system/roles";

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Permission denied: {}", .0.code())]
    Denied(Decision),

    #[error("Forbidden: batch contains entities outside the caller's tenant")]
    Forbidden,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Role store error: {0}")]
    Roles(#[from] RoleStoreError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Audit error: {0}")]
    Audit(#[from] AuditError),

    #[error("Storage unavailable: {0}")]
    Storage(String),
}

impl CoreError {
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Denied(decision) => decision.code(),
            CoreError::Forbidden => "FORBIDDEN",
            CoreError::InvalidRequest(_) => "INVALID_REQUEST",
            CoreError::Audit(e) => e.code(),
            CoreError::Roles(_) | CoreError::Registry(_) | CoreError::Storage(_) => {
                "STORAGE_UNAVAILABLE"
            }
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            CoreError::Denied(decision) => decision.http_status(),
            CoreError::Forbidden => 403,
            CoreError::InvalidRequest(_) => 400,
            _ => 503,
        }
    }
}

impl From<EntityStoreError> for CoreError {
    fn from(e: EntityStoreError) -> Self {
        match e {
            EntityStoreError::Forbidden { .. } => CoreError::Forbidden,
            EntityStoreError::EmptyBatch => CoreError::InvalidRequest("empty batch".to_string()),
            other => CoreError::Storage(other.to_string()),
        }
    }
}

/// Who is calling and from where.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub user: Option<User>,
    pub ip: String,
}

impl RequestContext {
    pub fn new(user: User, ip: impl Into<String>) -> Self {
        Self {
            user: Some(user),
            ip: ip.into(),
        }
    }

    pub fn anonymous(ip: impl Into<String>) -> Self {
        Self {
            user: None,
            ip: ip.into(),
        }
    }

    fn actor(&self) -> Actor {
        match &self.user {
            Some(user) => Actor::new(user.id.as_str(), user.email.as_str(), self.ip.as_str()),
            None => Actor::new("anonymous", "", self.ip.as_str()),
        }
    }
}

/// Whether the audit entry for a completed mutation was persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "id", rename_all = "lowercase")]
pub enum AuditRecord {
    Recorded(String),
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub affected: usize,
    pub audit: AuditRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleChange {
    Created,
    Updated,
    Deleted,
}

impl RoleChange {
    fn audit_action(self) -> AuditAction {
        match self {
            RoleChange::Created => AuditAction::RoleCreated,
            RoleChange::Updated => AuditAction::RoleUpdated,
            RoleChange::Deleted => AuditAction::RoleDeleted,
        }
    }
}

pub struct SecurityCore {
    engine: AuthorizationEngine,
    registry: Arc<PermissionRegistry>,
    roles: Arc<RoleStore>,
    guard: TenantIsolationGuard,
    entities: SqliteEntityStore,
    audit: Arc<AuditLog>,
    rate_limiter: Arc<RateLimiter>,
    users: Arc<dyn UserSource>,
    bus: Arc<CacheInvalidationBus>,
}

impl SecurityCore {
    pub fn new(
        registry: Arc<PermissionRegistry>,
        roles: Arc<RoleStore>,
        users: Arc<dyn UserSource>,
        entities: SqliteEntityStore,
        audit: Arc<AuditLog>,
        rate_limiter: Arc<RateLimiter>,
        engine_config: EngineConfig,
    ) -> Self {
        let engine = AuthorizationEngine::new(registry.clone())
            .with_rate_limit(rate_limiter.clone())
            .with_config(engine_config);

        let bus = Arc::new(CacheInvalidationBus::new());
        bus.subscribe(registry.clone());
        bus.subscribe(roles.clone());

        Self {
            engine,
            registry,
            roles,
            guard: TenantIsolationGuard::new(),
            entities,
            audit,
            rate_limiter,
            users,
            bus,
        }
    }

    /// Builds the request context for an authenticated session. An id that no
    /// longer resolves to a user is treated as anonymous.
    pub async fn resolve_context(
        &self,
        user_id: Option<&str>,
        ip: impl Into<String>,
    ) -> Result<RequestContext, CoreError> {
        let Some(user_id) = user_id else {
            return Ok(RequestContext::anonymous(ip));
        };
        match self
            .users
            .get_user_by_id(user_id)
            .await
            .map_err(|e| CoreError::Storage(e.to_string()))?
        {
            Some(user) => Ok(RequestContext::new(user, ip)),
            None => {
                warn!("Session user {} not found; continuing as anonymous", user_id);
                Ok(RequestContext::anonymous(ip))
            }
        }
    }

    pub fn bus(&self) -> &Arc<CacheInvalidationBus> {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<PermissionRegistry> {
        &self.registry
    }

    pub fn audit_log(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// Counts the request against the rate limiter and decides it against the
    /// caller's tenant roles. Anything not actionable is `CoreError::Denied`.
    pub async fn authorize(&self, user: Option<&User>, cfg: &PermissionConfig) -> Result<Decision, CoreError> {
        let Some(user) = user else {
            return Err(CoreError::Denied(Decision::deny(ReasonCode::Unauthenticated)));
        };

        if let Err(e) = self.rate_limiter.record(&user.id, &cfg.context_id) {
            debug!("Request from {} over limit: {}", user.id, e);
        }

        let snapshot = self.roles.roles_for(&user.tenant_id).await?;
        let decision = self.engine.decide(Some(user), Some(cfg), snapshot.roles());

        if decision.is_actionable() {
            Ok(decision)
        } else {
            Err(CoreError::Denied(decision))
        }
    }

    /// `authorize`, plus an `access_denied` audit entry on denial.
    async fn authorize_privileged<'a>(
        &self,
        ctx: &'a RequestContext,
        cfg: &PermissionConfig,
        resource: ResourceRef,
    ) -> Result<&'a User, CoreError> {
        match self.authorize(ctx.user.as_ref(), cfg).await {
            Ok(_) => ctx
                .user
                .as_ref()
                .ok_or(CoreError::Denied(Decision::deny(ReasonCode::Unauthenticated))),
            Err(CoreError::Denied(decision)) => {
                warn!(
                    "Denied {} on {} for {}: {}",
                    cfg.action,
                    cfg.context_id,
                    ctx.actor().id,
                    decision.code()
                );
                self.record(
                    AuditAction::AccessDenied,
                    ctx.actor(),
                    resource,
                    json!({
                        "contextId": cfg.context_id,
                        "action": cfg.action,
                        "reasonCode": decision.code(),
                    }),
                )
                .await;
                Err(CoreError::Denied(decision))
            }
            Err(e) => Err(e),
        }
    }

    /// `POST /token/batch`
    pub async fn batch_tokens(
        &self,
        ctx: &RequestContext,
        ids: &[String],
        action: BatchAction,
    ) -> Result<BatchOutcome, CoreError> {
        self.batch(EntityKind::Token, ctx, ids, action).await
    }

    /// `POST /user/batch`
    pub async fn batch_users(
        &self,
        ctx: &RequestContext,
        ids: &[String],
        action: BatchAction,
    ) -> Result<BatchOutcome, CoreError> {
        self.batch(EntityKind::User, ctx, ids, action).await
    }

    async fn batch(
        &self,
        kind: EntityKind,
        ctx: &RequestContext,
        ids: &[String],
        action: BatchAction,
    ) -> Result<BatchOutcome, CoreError> {
        let cfg = PermissionConfig::new(
            entity_context(kind),
            batch_permission_action(action),
            entity_context_type(kind),
        );
        let resource = ResourceRef::new(kind.as_str(), "batch");
        let user = self.authorize_privileged(ctx, &cfg, resource.clone()).await?;
        let tenant = user.tenant_id.clone();

        match self.guard.verify(kind, ids, &tenant, &self.entities).await {
            Ok(()) => {}
            Err(IsolationError::Forbidden { requested, matched }) => {
                self.record_isolation_violation(ctx, kind, action, requested, matched)
                    .await;
                return Err(CoreError::Forbidden);
            }
            Err(IsolationError::EmptyBatch) => {
                return Err(CoreError::InvalidRequest("empty batch".to_string()));
            }
            Err(IsolationError::Storage(e)) => return Err(CoreError::Storage(e.to_string())),
        }

        let entities = self.entities.clone();
        let batch_ids = ids.to_vec();
        let batch_tenant = tenant.clone();
        let applied = tokio::task::spawn_blocking(move || {
            entities.apply_batch(kind, &batch_ids, &batch_tenant, action)
        })
        .await
        .map_err(|e| CoreError::Storage(e.to_string()))?;

        let affected = match applied {
            Ok(affected) => affected,
            Err(EntityStoreError::Forbidden { requested, matched }) => {
                // Ownership changed between the guard and the write.
                self.record_isolation_violation(ctx, kind, action, requested, matched)
                    .await;
                return Err(CoreError::Forbidden);
            }
            Err(e) => return Err(e.into()),
        };

        let audit = self
            .record(
                batch_audit_action(kind, action),
                ctx.actor(),
                resource,
                json!({
                    "tenantId": tenant.as_str(),
                    "ids": ids,
                    "affected": affected,
                }),
            )
            .await;

        if let Some(category) = cache_category(kind) {
            self.bus.invalidate_tenant(category, &tenant).await;
        }

        info!(
            "{} {} {} ids in tenant {} for {}",
            action, affected, kind, tenant, user.id
        );
        Ok(BatchOutcome { affected, audit })
    }

    /// Runs an externally applied role mutation through the pipeline.
    pub async fn apply_role_change<F, Fut>(
        &self,
        ctx: &RequestContext,
        role_id: &str,
        change: RoleChange,
        mutate: F,
    ) -> Result<AuditRecord, CoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), StoreError>>,
    {
        let cfg = PermissionConfig::new(ROLES_CONTEXT, PermissionAction::Manage, ContextType::System);
        let resource = ResourceRef::new("role", role_id);
        let user = self.authorize_privileged(ctx, &cfg, resource.clone()).await?;
        let tenant = user.tenant_id.clone();

        let existing = self.roles.role_by_id(&tenant, role_id).await?;
        match (change, existing.is_some()) {
            (RoleChange::Created, true) => {
                return Err(CoreError::InvalidRequest(format!("role {} already exists", role_id)));
            }
            (RoleChange::Updated | RoleChange::Deleted, false) => {
                return Err(CoreError::InvalidRequest(format!("unknown role {}", role_id)));
            }
            _ => {}
        }

        mutate().await.map_err(|e| CoreError::Storage(e.to_string()))?;

        let audit = self
            .record(
                change.audit_action(),
                ctx.actor(),
                resource,
                json!({ "tenantId": tenant.as_str() }),
            )
            .await;
        self.bus.invalidate_tenant(CacheCategory::Roles, &tenant).await;
        Ok(audit)
    }

    /// `GET /audit?limit=N`, newest first.
    pub async fn audit_logs(&self, ctx: &RequestContext, limit: usize) -> Result<Vec<AuditLogEntry>, CoreError> {
        let cfg = PermissionConfig::new(AUDIT_CONTEXT, PermissionAction::Read, ContextType::System);
        self.authorize_privileged(ctx, &cfg, ResourceRef::new("audit_log", "entries"))
            .await?;

        let limit = limit.clamp(1, MAX_AUDIT_PAGE);
        let audit = self.audit.clone();
        let logs = tokio::task::spawn_blocking(move || audit.get_logs(limit))
            .await
            .map_err(|e| CoreError::Storage(e.to_string()))??;
        Ok(logs)
    }

    /// `GET /security/incidents`, newest first.
    pub async fn security_incidents(
        &self,
        ctx: &RequestContext,
        limit: usize,
    ) -> Result<Vec<AuditLogEntry>, CoreError> {
        let cfg = PermissionConfig::new(INCIDENTS_CONTEXT, PermissionAction::Read, ContextType::System);
        self.authorize_privileged(ctx, &cfg, ResourceRef::new("audit_log", "incidents"))
            .await?;

        let limit = limit.clamp(1, MAX_AUDIT_PAGE);
        let audit = self.audit.clone();
        let incidents = tokio::task::spawn_blocking(move || audit.incidents(limit, INCIDENT_SCAN_WINDOW))
            .await
            .map_err(|e| CoreError::Storage(e.to_string()))??;
        Ok(incidents)
    }

    pub async fn verify_chain(&self) -> Result<ChainVerification, CoreError> {
        let audit = self.audit.clone();
        let verification = tokio::task::spawn_blocking(move || audit.verify_chain())
            .await
            .map_err(|e| CoreError::Storage(e.to_string()))??;
        Ok(verification)
    }

    /// Reconciles the catalog with the permission store and records the sync.
    pub async fn sync_catalog(&self, catalog: &[Permission]) -> Result<SyncReport, CoreError> {
        let report = self.registry.sync_permissions(catalog).await?;
        if report.inserted > 0 || !report.conflicts.is_empty() {
            self.record(
                AuditAction::PermissionsSynced,
                Actor::system(),
                ResourceRef::new("permission", "catalog"),
                json!({
                    "inserted": report.inserted,
                    "unchanged": report.unchanged,
                    "conflicts": report.conflicts,
                }),
            )
            .await;
        }
        Ok(report)
    }

    async fn record_isolation_violation(
        &self,
        ctx: &RequestContext,
        kind: EntityKind,
        action: BatchAction,
        requested: usize,
        matched: usize,
    ) {
        let tenant = ctx.user.as_ref().map(|u| u.tenant_id.as_str().to_string());
        self.record(
            AuditAction::TenantIsolationViolation,
            ctx.actor(),
            ResourceRef::new(kind.as_str(), "batch"),
            json!({
                "tenantId": tenant,
                "action": action,
                "requested": requested,
                "matched": matched,
            }),
        )
        .await;
    }

    /// Appends off the async runtime; a cancelled caller cannot interrupt it.
    async fn record(&self, action: AuditAction, actor: Actor, resource: ResourceRef, details: Value) -> AuditRecord {
        let audit = self.audit.clone();
        let label = action.to_string();
        let result =
            tokio::task::spawn_blocking(move || audit.append(action, actor, resource, Some(details))).await;

        match result {
            Ok(Ok(entry)) => AuditRecord::Recorded(entry.id.to_string()),
            Ok(Err(e)) => {
                error!("Audit entry {} not recorded: {}", label, e);
                AuditRecord::Degraded
            }
            Err(e) => {
                error!("Audit task for {} failed: {}", label, e);
                AuditRecord::Degraded
            }
        }
    }
}

fn batch_audit_action(kind: EntityKind, action: BatchAction) -> AuditAction {
    match (kind, action) {
        (EntityKind::Token, BatchAction::Delete) => AuditAction::TokenDeleted,
        (EntityKind::Token, BatchAction::Block) => AuditAction::TokenBlocked,
        (EntityKind::Token, BatchAction::Unblock) => AuditAction::TokenUnblocked,
        (EntityKind::User, BatchAction::Delete) => AuditAction::UserDeleted,
        (EntityKind::User, BatchAction::Block) => AuditAction::UserBlocked,
        (EntityKind::User, BatchAction::Unblock) => AuditAction::UserUnblocked,
        (EntityKind::Entry, action) => AuditAction::Custom(format!("entry_{}", action)),
    }
}

fn cache_category(kind: EntityKind) -> Option<CacheCategory> {
    match kind {
        EntityKind::Token => Some(CacheCategory::Tokens),
        EntityKind::User => Some(CacheCategory::Users),
        EntityKind::Entry => None,
    }
}
