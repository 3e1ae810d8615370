use gatehouse_infra::infra::*;
use gatehouse_policy::{EntityKind, RateLimitSignal, TenantId};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn ids(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_full_hardened_workflow() {
    let dir = tempdir().unwrap();
    let tenant = TenantId::new("t1");

    let rate_limiter = rate_limiter::RateLimiter::new(
        rate_limiter::RateLimitConfig::new(10, Duration::from_secs(60)),
        rate_limiter::RateLimitConfig::new(100, Duration::from_secs(60)),
    );
    let entities = entity_store::SqliteEntityStore::new(dir.path().join("entities.db")).unwrap();
    let audit = audit_log::AuditLog::open(
        Arc::new(audit_store::JsonlAuditStore::new(dir.path().join("audit"), 100).unwrap()),
        audit_log::AuditLogOptions::default(),
    )
    .unwrap();

    entities.insert(EntityKind::Token, "tok1", &tenant).unwrap();
    entities.insert(EntityKind::Token, "tok2", &tenant).unwrap();

    // 1. Count the request
    rate_limiter.record("admin", "token").unwrap();
    assert!(!rate_limiter.is_rate_limited("admin", "token"));

    // 2. Mutate
    let affected = entities
        .apply_batch(
            EntityKind::Token,
            &ids(&["tok1", "tok2"]),
            &tenant,
            entity_store::BatchAction::Block,
        )
        .unwrap();
    assert_eq!(affected, 2);

    // 3. Audit
    audit
        .append(
            contracts::AuditAction::TokenBlocked,
            contracts::Actor::new("admin", "admin@example.com", "10.0.0.1"),
            contracts::ResourceRef::new("token", "batch"),
            Some(serde_json::json!({"ids": ["tok1", "tok2"], "tenantId": "t1"})),
        )
        .unwrap();

    // 4. Everything on disk checks out
    let store = audit_store::JsonlAuditStore::new(dir.path().join("audit"), 100).unwrap();
    let report = integrity::IntegrityValidator::validate_all(
        &store,
        &[dir.path().join("entities.db").as_path()],
    )
    .unwrap();
    assert_eq!(report.audit.entries_checked, 1);
    assert_eq!(report.databases_checked, 1);
}

#[test]
fn test_hardened_concurrent_appends() {
    use std::thread;

    let dir = tempdir().unwrap();
    let audit = Arc::new(
        audit_log::AuditLog::open(
            Arc::new(audit_store::JsonlAuditStore::new(dir.path(), 7).unwrap()),
            audit_log::AuditLogOptions::default(),
        )
        .unwrap(),
    );

    let mut handles = vec![];
    for i in 0..10 {
        let log = Arc::clone(&audit);
        handles.push(thread::spawn(move || {
            for j in 0..5 {
                log.append(
                    contracts::AuditAction::LoginSuccess,
                    contracts::Actor::new(format!("user_{}", i), "", "10.0.0.1"),
                    contracts::ResourceRef::new("session", format!("{}-{}", i, j)),
                    None,
                )
                .unwrap();
            }
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }

    let verification = audit.verify_chain().unwrap();
    assert!(verification.ok);
    assert_eq!(verification.entries_checked, 50);
}

#[test]
fn test_hardened_tenant_batch_is_atomic() {
    let dir = tempdir().unwrap();
    let entities = entity_store::SqliteEntityStore::new(dir.path().join("entities.db")).unwrap();
    let mine = TenantId::new("mine");
    let theirs = TenantId::new("theirs");

    for id in ["a", "b", "c"] {
        entities.insert(EntityKind::User, id, &mine).unwrap();
    }
    entities.insert(EntityKind::User, "z", &theirs).unwrap();

    let result = entities.apply_batch(
        EntityKind::User,
        &ids(&["a", "b", "c", "z"]),
        &mine,
        entity_store::BatchAction::Delete,
    );
    assert!(matches!(
        result,
        Err(entity_store::EntityStoreError::Forbidden { requested: 4, matched: 3 })
    ));
    for id in ["a", "b", "c", "z"] {
        assert!(entities.exists(EntityKind::User, id).unwrap());
    }
}

#[test]
fn test_hardened_rate_limit_enforcement() {
    let rate_limiter = rate_limiter::RateLimiter::new(
        rate_limiter::RateLimitConfig::new(3, Duration::from_secs(60)),
        rate_limiter::RateLimitConfig::new(1000, Duration::from_secs(60)),
    );

    for _ in 0..3 {
        assert!(rate_limiter.record("limited", "posts").is_ok());
        assert!(!rate_limiter.is_rate_limited("limited", "posts"));
    }

    assert!(rate_limiter.record("limited", "posts").is_err());
    assert!(rate_limiter.is_rate_limited("limited", "posts"));
}
