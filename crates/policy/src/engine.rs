use crate::registry::PermissionRegistry;
use crate::traits::RateLimitSignal;
use crate::types::{Decision, PermissionConfig, PermissionOverride, ReasonCode, Role, User};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_TWO_FACTOR_FRESHNESS: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How long a completed 2FA challenge satisfies `requires2FA` permissions.
    #[serde(with = "duration_secs")]
    pub two_factor_freshness: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            two_factor_freshness: DEFAULT_TWO_FACTOR_FRESHNESS,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

/// Outcome of the non-admin permission check, in precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    ExplicitRevoke,
    ExplicitGrant,
    RoleGrant,
    DefaultDeny,
}

impl Resolution {
    pub fn resolve(explicit: Option<PermissionOverride>, role_grants: bool) -> Self {
        match (explicit, role_grants) {
            (Some(PermissionOverride::Revoke), _) => Resolution::ExplicitRevoke,
            (Some(PermissionOverride::Grant), _) => Resolution::ExplicitGrant,
            (None, true) => Resolution::RoleGrant,
            (None, false) => Resolution::DefaultDeny,
        }
    }

    pub fn is_grant(self) -> bool {
        matches!(self, Resolution::ExplicitGrant | Resolution::RoleGrant)
    }

    pub fn reason(self) -> ReasonCode {
        match self {
            Resolution::ExplicitGrant => ReasonCode::ExplicitGrant,
            Resolution::RoleGrant => ReasonCode::RoleGrant,
            Resolution::ExplicitRevoke | Resolution::DefaultDeny => ReasonCode::Forbidden,
        }
    }
}

/// Pure role/permission decision function over immutable snapshots.
pub struct AuthorizationEngine {
    registry: Arc<PermissionRegistry>,
    rate_limit: Option<Arc<dyn RateLimitSignal>>,
    config: EngineConfig,
}

impl AuthorizationEngine {
    pub fn new(registry: Arc<PermissionRegistry>) -> Self {
        Self {
            registry,
            rate_limit: None,
            config: EngineConfig::default(),
        }
    }

    pub fn with_rate_limit(mut self, signal: Arc<dyn RateLimitSignal>) -> Self {
        self.rate_limit = Some(signal);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn decide(&self, user: Option<&User>, cfg: Option<&PermissionConfig>, roles: &[Role]) -> Decision {
        self.decide_at(user, cfg, roles, Utc::now())
    }

    pub fn decide_at(
        &self,
        user: Option<&User>,
        cfg: Option<&PermissionConfig>,
        roles: &[Role],
        now: DateTime<Utc>,
    ) -> Decision {
        let mut decision = self.evaluate(user, cfg, roles, now);

        if let (Some(user), Some(cfg), Some(signal)) = (user, cfg, self.rate_limit.as_ref()) {
            if signal.is_rate_limited(&user.id, &cfg.context_id) {
                debug!("Rate limit active for {} on {}", user.id, cfg.context_id);
                decision.is_rate_limited = true;
            }
        }

        decision
    }

    fn evaluate(
        &self,
        user: Option<&User>,
        cfg: Option<&PermissionConfig>,
        roles: &[Role],
        now: DateTime<Utc>,
    ) -> Decision {
        let Some(user) = user else {
            return Decision::deny(ReasonCode::Unauthenticated);
        };

        let Some(cfg) = cfg else {
            warn!("Permission check for user {} called without a permission config", user.id);
            return Decision::deny(ReasonCode::MissingConfig);
        };

        let Some(role) = roles.iter().find(|r| r.id == user.role) else {
            debug!("User {} references unknown role {}", user.id, user.role);
            return Decision::deny(ReasonCode::UnknownRole);
        };

        let snapshot = self.registry.snapshot();
        let permission = snapshot.find(&cfg.context_id, cfg.action);

        if role.is_admin {
            let needs_2fa = permission.map(|p| p.requires_2fa).unwrap_or(false);
            if needs_2fa && !self.two_factor_fresh(user, now) {
                return Decision::deny(ReasonCode::Needs2fa);
            }
            return Decision::grant(ReasonCode::AdminBypass);
        }

        let Some(permission) = permission else {
            warn!(
                "No permission registered for {}:{}; denying",
                cfg.context_id, cfg.action
            );
            return Decision::deny(ReasonCode::MissingConfig);
        };

        let resolution = Resolution::resolve(
            user.explicit_override(&permission.name),
            role.permissions.contains(&permission.name),
        );

        if resolution.is_grant() && permission.requires_2fa && !self.two_factor_fresh(user, now) {
            return Decision::deny(ReasonCode::Needs2fa);
        }

        Decision {
            has_permission: resolution.is_grant(),
            is_rate_limited: false,
            reason_code: resolution.reason(),
        }
    }

    fn two_factor_fresh(&self, user: &User, now: DateTime<Utc>) -> bool {
        let Some(verified_at) = user.two_factor_verified_at else {
            return false;
        };
        // A verification time in the future does not count.
        match (now - verified_at).to_std() {
            Ok(age) => age <= self.config.two_factor_freshness,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryPermissionStore;
    use crate::types::{ContextType, Permission, PermissionAction};

    struct AlwaysLimited;

    impl RateLimitSignal for AlwaysLimited {
        fn is_rate_limited(&self, _user_id: &str, _context_id: &str) -> bool {
            true
        }
    }

    async fn engine() -> AuthorizationEngine {
        let registry = Arc::new(PermissionRegistry::new(Arc::new(InMemoryPermissionStore::new())));
        registry
            .sync_permissions(&[
                Permission::new("collection:posts:read", PermissionAction::Read, "posts", ContextType::Collection),
                Permission::new("collection:posts:delete", PermissionAction::Delete, "posts", ContextType::Collection),
                Permission::new("config:settings", PermissionAction::Manage, "config/settings", ContextType::Configuration)
                    .requiring_2fa(),
            ])
            .await
            .unwrap();
        AuthorizationEngine::new(registry)
    }

    fn roles() -> Vec<Role> {
        vec![
            Role::new("admin", "Administrator").admin(),
            Role::new("editor", "Editor").with_permissions(["collection:posts:read", "config:settings"]),
        ]
    }

    fn read_posts() -> PermissionConfig {
        PermissionConfig::new("posts", PermissionAction::Read, ContextType::Collection)
    }

    fn manage_settings() -> PermissionConfig {
        PermissionConfig::new("config/settings", PermissionAction::Manage, ContextType::Configuration)
    }

    #[tokio::test]
    async fn test_missing_user_is_unauthenticated() {
        let engine = engine().await;
        let decision = engine.decide(None, Some(&read_posts()), &roles());
        assert_eq!(decision, Decision::deny(ReasonCode::Unauthenticated));
    }

    #[tokio::test]
    async fn test_missing_config_fails_closed() {
        let engine = engine().await;
        let admin = User::new("a", "a@example.com", "admin");
        let decision = engine.decide(Some(&admin), None, &roles());
        assert_eq!(decision, Decision::deny(ReasonCode::MissingConfig));
    }

    #[tokio::test]
    async fn test_unknown_role() {
        let engine = engine().await;
        let user = User::new("u", "u@example.com", "ghost");
        let decision = engine.decide(Some(&user), Some(&read_posts()), &roles());
        assert_eq!(decision.reason_code, ReasonCode::UnknownRole);
        assert!(!decision.has_permission);
    }

    #[tokio::test]
    async fn test_admin_bypass_without_registry_entry() {
        let engine = engine().await;
        let admin = User::new("a", "a@example.com", "admin");
        let cfg = PermissionConfig::new("widgets/map", PermissionAction::Update, ContextType::Widget);
        let decision = engine.decide(Some(&admin), Some(&cfg), &roles());
        assert_eq!(decision, Decision::grant(ReasonCode::AdminBypass));
    }

    #[tokio::test]
    async fn test_admin_needs_fresh_2fa() {
        let engine = engine().await;
        let now = Utc::now();

        let stale = User::new("a", "a@example.com", "admin")
            .verified_2fa_at(now - chrono::Duration::hours(2));
        let decision = engine.decide_at(Some(&stale), Some(&manage_settings()), &roles(), now);
        assert_eq!(decision.reason_code, ReasonCode::Needs2fa);

        let fresh = User::new("a", "a@example.com", "admin")
            .verified_2fa_at(now - chrono::Duration::minutes(1));
        let decision = engine.decide_at(Some(&fresh), Some(&manage_settings()), &roles(), now);
        assert!(decision.has_permission);
    }

    #[tokio::test]
    async fn test_role_grant_requires_2fa_too() {
        let engine = engine().await;
        let editor = User::new("e", "e@example.com", "editor");
        let decision = engine.decide(Some(&editor), Some(&manage_settings()), &roles());
        assert_eq!(decision.reason_code, ReasonCode::Needs2fa);
    }

    #[tokio::test]
    async fn test_non_admin_unregistered_config() {
        let engine = engine().await;
        let editor = User::new("e", "e@example.com", "editor");
        let cfg = PermissionConfig::new("posts", PermissionAction::Update, ContextType::Collection);
        let decision = engine.decide(Some(&editor), Some(&cfg), &roles());
        assert_eq!(decision, Decision::deny(ReasonCode::MissingConfig));
    }

    #[tokio::test]
    async fn test_role_membership() {
        let engine = engine().await;
        let editor = User::new("e", "e@example.com", "editor");
        let delete = PermissionConfig::new("posts", PermissionAction::Delete, ContextType::Collection);

        assert_eq!(
            engine.decide(Some(&editor), Some(&read_posts()), &roles()),
            Decision::grant(ReasonCode::RoleGrant)
        );
        assert_eq!(
            engine.decide(Some(&editor), Some(&delete), &roles()),
            Decision::deny(ReasonCode::Forbidden)
        );
    }

    #[tokio::test]
    async fn test_explicit_overrides_both_directions() {
        let engine = engine().await;
        let delete = PermissionConfig::new("posts", PermissionAction::Delete, ContextType::Collection);

        let revoked = User::new("e", "e@example.com", "editor")
            .with_override("collection:posts:read", PermissionOverride::Revoke);
        assert_eq!(
            engine.decide(Some(&revoked), Some(&read_posts()), &roles()),
            Decision::deny(ReasonCode::Forbidden)
        );

        let granted = User::new("e", "e@example.com", "editor")
            .with_override("collection:posts:delete", PermissionOverride::Grant);
        assert_eq!(
            engine.decide(Some(&granted), Some(&delete), &roles()),
            Decision::grant(ReasonCode::ExplicitGrant)
        );
    }

    #[tokio::test]
    async fn test_rate_limit_vetoes_grant() {
        let engine = engine().await.with_rate_limit(Arc::new(AlwaysLimited));
        let admin = User::new("a", "a@example.com", "admin");
        let decision = engine.decide(Some(&admin), Some(&read_posts()), &roles());
        assert!(decision.has_permission);
        assert!(decision.is_rate_limited);
        assert!(!decision.is_actionable());
    }

    #[test]
    fn test_resolution_precedence() {
        assert_eq!(
            Resolution::resolve(Some(PermissionOverride::Revoke), true),
            Resolution::ExplicitRevoke
        );
        assert_eq!(
            Resolution::resolve(Some(PermissionOverride::Grant), false),
            Resolution::ExplicitGrant
        );
        assert_eq!(Resolution::resolve(None, true), Resolution::RoleGrant);
        assert_eq!(Resolution::resolve(None, false), Resolution::DefaultDeny);
        assert!(!Resolution::DefaultDeny.is_grant());
    }

    #[test]
    fn test_engine_config_yaml() {
        let config: EngineConfig = serde_yaml::from_str("two_factor_freshness: 300").unwrap();
        assert_eq!(config.two_factor_freshness, Duration::from_secs(300));
    }
}
