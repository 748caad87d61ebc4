//! In-memory deployment store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{ControlError, ControlResult};
use crate::types::{DeploymentId, DeploymentRecord, DeploymentStatus};

use super::{DeploymentFilter, DeploymentStore};

/// In-memory deployment store.
///
/// Data is lost when the process exits. Writes can be made to fail with
/// [`MemoryStore::set_unavailable`] to exercise persistence failures.
#[derive(Debug, Default)]
pub struct MemoryStore {
    deployments: RwLock<HashMap<String, DeploymentRecord>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make writes fail as if the database were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of stored records.
    pub fn len(&self) -> ControlResult<usize> {
        Ok(self
            .deployments
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))?
            .len())
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> ControlResult<bool> {
        Ok(self.len()? == 0)
    }

    fn check_available(&self) -> ControlResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ControlError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

#[async_trait]
impl DeploymentStore for MemoryStore {
    async fn create(&self, record: &DeploymentRecord) -> ControlResult<()> {
        self.check_available()?;
        let mut deployments = self
            .deployments
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        let key = record.id.as_str().to_owned();
        let mut replacement = record.clone();
        if let Some(existing) = deployments.get(&key) {
            if existing.status.is_live() {
                return Err(ControlError::Conflict(format!(
                    "deployment {key} is already {}",
                    existing.status
                )));
            }
            replacement.analytics = existing.analytics;
            replacement.created_at = existing.created_at;
        }

        deployments.insert(key, replacement);
        Ok(())
    }

    async fn get(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentRecord>> {
        let deployments = self
            .deployments
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        Ok(deployments.get(id.as_str()).cloned())
    }

    async fn list(&self, filter: &DeploymentFilter) -> ControlResult<Vec<DeploymentRecord>> {
        let deployments = self
            .deployments
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        let mut results: Vec<_> = deployments
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();

        results.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let offset = usize::try_from(filter.offset.unwrap_or(0)).unwrap_or(usize::MAX);
        let limit = filter
            .limit
            .map_or(usize::MAX, |l| usize::try_from(l).unwrap_or(usize::MAX));

        Ok(results.into_iter().skip(offset).take(limit).collect())
    }

    async fn compare_and_set_status(
        &self,
        id: &DeploymentId,
        expected: DeploymentStatus,
        next: DeploymentStatus,
        error: Option<&str>,
    ) -> ControlResult<()> {
        self.check_available()?;
        let mut deployments = self
            .deployments
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        let record = deployments
            .get_mut(id.as_str())
            .ok_or_else(|| ControlError::NotFound(id.to_string()))?;

        if record.status != expected {
            return Err(ControlError::StaleStatus {
                id: id.to_string(),
                expected: expected.as_str(),
                actual: record.status.as_str(),
            });
        }

        record.status = next;
        record.error = error.map(ToOwned::to_owned);
        record.updated_at = chrono::Utc::now();

        Ok(())
    }

    async fn record_call(
        &self,
        id: &DeploymentId,
        response_ms: u64,
        success: bool,
    ) -> ControlResult<()> {
        self.check_available()?;
        let mut deployments = self
            .deployments
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        let record = deployments
            .get_mut(id.as_str())
            .ok_or_else(|| ControlError::NotFound(id.to_string()))?;

        record.analytics.call_count = record.analytics.call_count.saturating_add(1);
        if !success {
            record.analytics.error_count = record.analytics.error_count.saturating_add(1);
        }
        record.analytics.last_response_ms = Some(response_ms);
        record.updated_at = chrono::Utc::now();

        Ok(())
    }

    async fn delete(&self, id: &DeploymentId) -> ControlResult<()> {
        self.check_available()?;
        let mut deployments = self
            .deployments
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))?;

        if deployments.remove(id.as_str()).is_none() {
            return Err(ControlError::NotFound(id.to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::{Duration, Utc};
    use foundry_intent::Category;

    use super::*;
    use crate::types::{Analytics, ContainerHandle};

    fn record(id: &str, status: DeploymentStatus) -> DeploymentRecord {
        let now = Utc::now();
        DeploymentRecord {
            id: DeploymentId::new(id),
            name: "Test Service".to_owned(),
            category: Category::Logs,
            port: 8001,
            endpoint: "http://localhost:8001".to_owned(),
            container: ContainerHandle::new("c1"),
            instance: "i1".to_owned(),
            status,
            created_at: now,
            updated_at: now,
            analytics: Analytics::default(),
            error: None,
        }
    }

    #[tokio::test]
    async fn create_and_get() {
        let store = MemoryStore::new();
        store
            .create(&record("svc-a", DeploymentStatus::RunningUnverified))
            .await
            .expect("create failed");

        let retrieved = store
            .get(&DeploymentId::new("svc-a"))
            .await
            .expect("get failed")
            .expect("deployment not found");
        assert_eq!(retrieved.status, DeploymentStatus::RunningUnverified);
        assert_eq!(retrieved.category, Category::Logs);
    }

    #[tokio::test]
    async fn create_over_live_record_conflicts() {
        let store = MemoryStore::new();
        store
            .create(&record("svc-a", DeploymentStatus::Healthy))
            .await
            .unwrap();
        let err = store
            .create(&record("svc-a", DeploymentStatus::RunningUnverified))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Conflict(_)));
    }

    #[tokio::test]
    async fn create_replaces_terminal_record() {
        let store = MemoryStore::new();
        store
            .create(&record("svc-a", DeploymentStatus::Stopped))
            .await
            .unwrap();
        store
            .create(&record("svc-a", DeploymentStatus::RunningUnverified))
            .await
            .unwrap();
        assert_eq!(store.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn replacing_keeps_counters_and_creation_time() {
        let store = MemoryStore::new();
        let id = DeploymentId::new("svc-a");
        let first = record("svc-a", DeploymentStatus::Stopped);
        store.create(&first).await.unwrap();
        store.record_call(&id, 40, true).await.unwrap();
        store.record_call(&id, 90, false).await.unwrap();

        let mut second = record("svc-a", DeploymentStatus::RunningUnverified);
        second.created_at = first.created_at + chrono::Duration::seconds(60);
        store.create(&second).await.unwrap();

        let stored = store.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeploymentStatus::RunningUnverified);
        assert_eq!(stored.analytics.call_count, 2);
        assert_eq!(stored.analytics.error_count, 1);
        assert_eq!(stored.analytics.last_response_ms, Some(90));
        assert_eq!(stored.created_at, first.created_at);
    }

    #[tokio::test]
    async fn compare_and_set() {
        let store = MemoryStore::new();
        let id = DeploymentId::new("svc-a");
        store
            .create(&record("svc-a", DeploymentStatus::RunningUnverified))
            .await
            .unwrap();

        store
            .compare_and_set_status(
                &id,
                DeploymentStatus::RunningUnverified,
                DeploymentStatus::Unhealthy,
                Some("timed out"),
            )
            .await
            .unwrap();

        let err = store
            .compare_and_set_status(
                &id,
                DeploymentStatus::RunningUnverified,
                DeploymentStatus::Healthy,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ControlError::StaleStatus {
                actual: "unhealthy",
                ..
            }
        ));

        let stored = store.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeploymentStatus::Unhealthy);
        assert_eq!(stored.error.as_deref(), Some("timed out"));
    }

    #[tokio::test]
    async fn list_is_newest_first_and_filtered() {
        let store = MemoryStore::new();
        let mut old = record("svc-old", DeploymentStatus::Stopped);
        old.created_at = Utc::now() - Duration::minutes(5);
        store.create(&old).await.unwrap();
        store
            .create(&record("svc-new", DeploymentStatus::Healthy))
            .await
            .unwrap();

        let all = store.list(&DeploymentFilter::new()).await.unwrap();
        let ids: Vec<_> = all.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["svc-new", "svc-old"]);

        let live = store.list(&DeploymentFilter::new().live()).await.unwrap();
        assert_eq!(live.len(), 1);

        let page = store
            .list(&DeploymentFilter::new().with_offset(1).with_limit(5))
            .await
            .unwrap();
        assert_eq!(page[0].id.as_str(), "svc-old");
    }

    #[tokio::test]
    async fn counters_only_increase() {
        let store = MemoryStore::new();
        let id = DeploymentId::new("svc-a");
        store
            .create(&record("svc-a", DeploymentStatus::Healthy))
            .await
            .unwrap();

        store.record_call(&id, 120, true).await.unwrap();
        store.record_call(&id, 80, false).await.unwrap();

        let analytics = store.get(&id).await.unwrap().unwrap().analytics;
        assert_eq!(analytics.call_count, 2);
        assert_eq!(analytics.error_count, 1);
        assert_eq!(analytics.last_response_ms, Some(80));
    }

    #[tokio::test]
    async fn unavailable_store_rejects_writes() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let err = store
            .create(&record("svc-a", DeploymentStatus::RunningUnverified))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Database(_)));
        assert!(store.is_empty().unwrap());
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let store = MemoryStore::new();
        let err = store.delete(&DeploymentId::new("svc-x")).await.unwrap_err();
        assert!(matches!(err, ControlError::NotFound(_)));
    }
}
