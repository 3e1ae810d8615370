use crate::traits::{EntityFetcher, StoreError};
use crate::types::{EntityKind, TenantId};
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum IsolationError {
    /// The message intentionally omits which ids failed.
    #[error("Forbidden: batch contains entities outside the caller's tenant")]
    Forbidden { requested: usize, matched: usize },
    #[error("Batch contains no ids")]
    EmptyBatch,
    #[error("Store error: {0}")]
    Storage(#[from] StoreError),
}

impl IsolationError {
    pub fn is_forbidden(&self) -> bool {
        matches!(self, IsolationError::Forbidden { .. })
    }
}

/// Rejects any batch that is not wholly owned by the caller's tenant.
#[derive(Debug, Default, Clone, Copy)]
pub struct TenantIsolationGuard;

impl TenantIsolationGuard {
    pub fn new() -> Self {
        Self
    }

    pub async fn verify(
        &self,
        kind: EntityKind,
        ids: &[String],
        tenant: &TenantId,
        fetcher: &dyn EntityFetcher,
    ) -> Result<(), IsolationError> {
        let requested: BTreeSet<&str> = ids.iter().map(String::as_str).collect();
        if requested.is_empty() {
            return Err(IsolationError::EmptyBatch);
        }

        let unique: Vec<String> = requested.iter().map(|id| id.to_string()).collect();
        let fetched = fetcher.fetch_owned(kind, &unique, tenant).await?;
        let matched: BTreeSet<&str> = fetched.iter().map(String::as_str).collect();

        if matched != requested {
            warn!(
                "Tenant isolation check failed for {} batch in tenant {}: {} requested, {} owned",
                kind,
                tenant,
                requested.len(),
                matched.intersection(&requested).count()
            );
            return Err(IsolationError::Forbidden {
                requested: requested.len(),
                matched: matched.intersection(&requested).count(),
            });
        }

        debug!("Verified {} {} ids for tenant {}", requested.len(), kind, tenant);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryEntities;
    use async_trait::async_trait;

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    fn entities() -> InMemoryEntities {
        let entities = InMemoryEntities::new();
        let t1 = TenantId::new("t1");
        let t2 = TenantId::new("t2");
        entities.insert(EntityKind::Token, "a", &t1);
        entities.insert(EntityKind::Token, "b", &t1);
        entities.insert(EntityKind::Token, "c", &t2);
        entities.insert(EntityKind::User, "u1", &t1);
        entities
    }

    #[tokio::test]
    async fn test_all_owned_passes() {
        let guard = TenantIsolationGuard::new();
        let result = guard
            .verify(EntityKind::Token, &ids(&["a", "b"]), &TenantId::new("t1"), &entities())
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_foreign_id_rejects_whole_batch() {
        let guard = TenantIsolationGuard::new();
        let result = guard
            .verify(EntityKind::Token, &ids(&["a", "b", "c"]), &TenantId::new("t1"), &entities())
            .await;
        assert!(matches!(
            result,
            Err(IsolationError::Forbidden { requested: 3, matched: 2 })
        ));
    }

    #[tokio::test]
    async fn test_unknown_id_rejected() {
        let guard = TenantIsolationGuard::new();
        let result = guard
            .verify(EntityKind::Token, &ids(&["a", "zzz"]), &TenantId::new("t1"), &entities())
            .await;
        assert!(result.unwrap_err().is_forbidden());
    }

    #[tokio::test]
    async fn test_kind_is_part_of_ownership() {
        let guard = TenantIsolationGuard::new();
        let result = guard
            .verify(EntityKind::User, &ids(&["a"]), &TenantId::new("t1"), &entities())
            .await;
        assert!(result.unwrap_err().is_forbidden());
    }

    #[tokio::test]
    async fn test_duplicates_and_empty() {
        let guard = TenantIsolationGuard::new();
        let t1 = TenantId::new("t1");
        assert!(guard
            .verify(EntityKind::Token, &ids(&["a", "a", "b"]), &t1, &entities())
            .await
            .is_ok());
        assert!(matches!(
            guard.verify(EntityKind::Token, &[], &t1, &entities()).await,
            Err(IsolationError::EmptyBatch)
        ));
    }

    struct OverReporting;

    #[async_trait]
    impl EntityFetcher for OverReporting {
        async fn fetch_owned(
            &self,
            _kind: EntityKind,
            ids: &[String],
            _tenant: &TenantId,
        ) -> Result<Vec<String>, StoreError> {
            let mut out = ids.to_vec();
            out.push("extra".to_string());
            Ok(out)
        }
    }

    #[tokio::test]
    async fn test_fetcher_returning_extra_ids_rejected() {
        let guard = TenantIsolationGuard::new();
        let result = guard
            .verify(EntityKind::Token, &ids(&["a"]), &TenantId::new("t1"), &OverReporting)
            .await;
        assert!(result.unwrap_err().is_forbidden());
    }

    struct Down;

    #[async_trait]
    impl EntityFetcher for Down {
        async fn fetch_owned(
            &self,
            _kind: EntityKind,
            _ids: &[String],
            _tenant: &TenantId,
        ) -> Result<Vec<String>, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_storage_failure_propagates() {
        let guard = TenantIsolationGuard::new();
        let result = guard
            .verify(EntityKind::Token, &ids(&["a"]), &TenantId::new("t1"), &Down)
            .await;
        assert!(matches!(result, Err(IsolationError::Storage(_))));
    }
}
