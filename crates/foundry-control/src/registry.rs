//! Deployment registry.
//!
//! Thin policy layer over a [`DeploymentStore`]: status changes must follow
//! the lifecycle graph and happen by compare-and-set, counters only grow,
//! and a record cannot be deleted while its container may still be running.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use crate::error::{ControlError, ControlResult};
use crate::store::{DeploymentFilter, DeploymentStore};
use crate::types::{DeploymentId, DeploymentRecord, DeploymentStatus};

/// Something that can stop a deployment's container and release its port.
#[async_trait]
pub trait Teardown: Send + Sync {
    /// Tear down the deployment, leaving its record `Stopped`.
    async fn teardown(&self, id: &DeploymentId) -> ControlResult<()>;

    /// Whether a container is still held for `id` whatever its record says.
    fn holds(&self, _id: &DeploymentId) -> bool {
        false
    }
}

/// Registry of deployment records.
#[derive(Clone)]
pub struct DeploymentRegistry {
    store: Arc<dyn DeploymentStore>,
}

impl DeploymentRegistry {
    /// Create a registry over a store.
    #[must_use]
    pub fn new(store: Arc<dyn DeploymentStore>) -> Self {
        Self { store }
    }

    /// Record a newly started deployment.
    pub async fn create(&self, record: &DeploymentRecord) -> ControlResult<()> {
        self.store.create(record).await?;
        debug!(deployment_id = %record.id, status = %record.status, "deployment recorded");
        Ok(())
    }

    /// Get a record by id.
    pub async fn get(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentRecord>> {
        self.store.get(id).await
    }

    /// Get a record by id, failing with `NotFound` if absent.
    pub async fn require(&self, id: &DeploymentId) -> ControlResult<DeploymentRecord> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| ControlError::NotFound(id.to_string()))
    }

    /// List records, newest first.
    pub async fn list(&self, filter: &DeploymentFilter) -> ControlResult<Vec<DeploymentRecord>> {
        self.store.list(filter).await
    }

    /// Move a record from `expected` to `next`.
    ///
    /// Rejects transitions outside the lifecycle graph before touching the
    /// store.
    pub async fn transition(
        &self,
        id: &DeploymentId,
        expected: DeploymentStatus,
        next: DeploymentStatus,
        error: Option<&str>,
    ) -> ControlResult<()> {
        if !expected.can_transition_to(next) {
            return Err(ControlError::InvalidStateTransition {
                from: expected.as_str(),
                to: next.as_str(),
            });
        }
        self.store
            .compare_and_set_status(id, expected, next, error)
            .await?;
        debug!(deployment_id = %id, from = %expected, to = %next, "status changed");
        Ok(())
    }

    /// Count one call against a deployment.
    pub async fn record_call(
        &self,
        id: &DeploymentId,
        response_ms: u64,
        success: bool,
    ) -> ControlResult<()> {
        self.store.record_call(id, response_ms, success).await
    }

    /// Delete a record, tearing the deployment down first if it is live or
    /// its container has not been removed yet.
    #[instrument(skip(self, teardown), fields(deployment_id = %id))]
    pub async fn delete(&self, id: &DeploymentId, teardown: &dyn Teardown) -> ControlResult<()> {
        let record = self.require(id).await?;
        if record.status.is_live()
            || record.status == DeploymentStatus::Unhealthy
            || teardown.holds(id)
        {
            teardown.teardown(id).await?;
        }
        self.store.delete(id).await?;
        info!("deployment removed");
        Ok(())
    }
}

impl std::fmt::Debug for DeploymentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentRegistry").finish_non_exhaustive()
    }
}
