//! Deployment record storage backends.
//!
//! PostgreSQL is used when a database URL is configured; otherwise records
//! live in memory for the lifetime of the process.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;

use crate::error::ControlResult;
use crate::types::{DeploymentId, DeploymentRecord, DeploymentStatus};

/// Filter criteria for listing deployments.
#[derive(Debug, Clone, Default)]
pub struct DeploymentFilter {
    /// Filter by status.
    pub status: Option<DeploymentStatus>,
    /// Only records holding a container and port.
    pub live_only: bool,
    /// Maximum number of results.
    pub limit: Option<u32>,
    /// Offset for pagination.
    pub offset: Option<u32>,
}

impl DeploymentFilter {
    /// Create an empty filter.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            status: None,
            live_only: false,
            limit: None,
            offset: None,
        }
    }

    /// Filter by status.
    #[must_use]
    pub const fn with_status(mut self, status: DeploymentStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Only live records.
    #[must_use]
    pub const fn live(mut self) -> Self {
        self.live_only = true;
        self
    }

    /// Set maximum results.
    #[must_use]
    pub const fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set pagination offset.
    #[must_use]
    pub const fn with_offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Whether `record` passes the status criteria.
    #[must_use]
    pub fn matches(&self, record: &DeploymentRecord) -> bool {
        self.status.map_or(true, |s| record.status == s)
            && (!self.live_only || record.status.is_live())
    }
}

/// Backend for storing deployment records.
///
/// Status changes only happen through [`compare_and_set_status`], and
/// counters only ever increase.
///
/// [`compare_and_set_status`]: DeploymentStore::compare_and_set_status
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    /// Insert a record, replacing an existing record only if it is not live.
    /// A replaced record's call counters and creation time carry over.
    ///
    /// Fails with [`ControlError::Conflict`](crate::ControlError::Conflict)
    /// if a live record exists under the same id.
    async fn create(&self, record: &DeploymentRecord) -> ControlResult<()>;

    /// Get a record by id.
    async fn get(&self, id: &DeploymentId) -> ControlResult<Option<DeploymentRecord>>;

    /// List records, newest first.
    async fn list(&self, filter: &DeploymentFilter) -> ControlResult<Vec<DeploymentRecord>>;

    /// Move a record from `expected` to `next`.
    ///
    /// Fails with `StaleStatus` if the stored status is not `expected` and
    /// with `NotFound` if there is no record. `error` replaces the stored
    /// failure reason.
    async fn compare_and_set_status(
        &self,
        id: &DeploymentId,
        expected: DeploymentStatus,
        next: DeploymentStatus,
        error: Option<&str>,
    ) -> ControlResult<()>;

    /// Count one call and remember its response time.
    async fn record_call(
        &self,
        id: &DeploymentId,
        response_ms: u64,
        success: bool,
    ) -> ControlResult<()>;

    /// Delete a record.
    async fn delete(&self, id: &DeploymentId) -> ControlResult<()>;
}
