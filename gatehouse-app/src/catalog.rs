//! Built-in permission catalog.

use gatehouse_infra::BatchAction;
use gatehouse_policy::{ContextType, EntityKind, Permission, PermissionAction};

pub const AUDIT_CONTEXT: &str = "system/audit";
pub const INCIDENTS_CONTEXT: &str = "system/incidents";

/// Context id guarding batch mutations of `kind`.
pub fn entity_context(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Token => "token",
        EntityKind::User => "user",
        EntityKind::Entry => "entry",
    }
}

pub fn entity_context_type(kind: EntityKind) -> ContextType {
    match kind {
        EntityKind::Token => ContextType::Token,
        EntityKind::User => ContextType::User,
        EntityKind::Entry => ContextType::Collection,
    }
}

/// Deleting needs `delete`; blocking and unblocking are updates.
pub fn batch_permission_action(action: BatchAction) -> PermissionAction {
    match action {
        BatchAction::Delete => PermissionAction::Delete,
        BatchAction::Block | BatchAction::Unblock => PermissionAction::Update,
    }
}

pub fn default_catalog() -> Vec<Permission> {
    let mut catalog = vec![
        Permission::new("system:audit", PermissionAction::Read, AUDIT_CONTEXT, ContextType::System)
            .with_description("Read the audit log")
            .with_required_role("admin"),
        Permission::new(
            "system:incidents",
            PermissionAction::Read,
            INCIDENTS_CONTEXT,
            ContextType::System,
        )
        .with_description("Read security incidents")
        .with_required_role("admin"),
        Permission::new("system:roles", PermissionAction::Manage, "system/roles", ContextType::System)
            .with_description("Create, edit and delete roles")
            .with_required_role("admin")
            .requiring_2fa(),
        Permission::new(
            "config:settings",
            PermissionAction::Manage,
            "config/settings",
            ContextType::Configuration,
        )
        .with_description("Change site configuration")
        .with_required_role("admin")
        .requiring_2fa(),
    ];

    for kind in [EntityKind::Token, EntityKind::User] {
        let context = entity_context(kind);
        let context_type = entity_context_type(kind);
        for action in [
            PermissionAction::Create,
            PermissionAction::Read,
            PermissionAction::Update,
            PermissionAction::Delete,
        ] {
            catalog.push(
                Permission::new(format!("{}:{}", context, action), action, context, context_type)
                    .with_description(format!("{} {}s", action, context)),
            );
        }
    }

    catalog
}

/// Create/read/update/delete permissions for one content collection.
pub fn collection_permissions(collection: &str) -> Vec<Permission> {
    let context = format!("collections/{}", collection);
    [
        PermissionAction::Create,
        PermissionAction::Read,
        PermissionAction::Update,
        PermissionAction::Delete,
    ]
    .into_iter()
    .map(|action| {
        Permission::new(
            format!("collections:{}:{}", collection, action),
            action,
            context.clone(),
            ContextType::Collection,
        )
        .with_description(format!("{} entries in {}", action, collection))
    })
    .collect()
}

/// Built-in catalog plus the configured collections and any extra entries.
pub fn build_catalog(collections: &[String], extra: Vec<Permission>) -> Vec<Permission> {
    let mut catalog = default_catalog();
    for collection in collections {
        catalog.extend(collection_permissions(collection));
    }
    catalog.extend(extra);
    catalog
}
