//! Core types for foundry-control.

use std::fmt;

use chrono::{DateTime, Utc};
use foundry_intent::Category;
use serde::{Deserialize, Serialize};

/// Unique identifier for a deployment.
///
/// Doubles as the namespace for the artifact directory, image tag and
/// container name, so generated ids are lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeploymentId(String);

impl DeploymentId {
    /// Create a deployment ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new unique deployment ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("svc-{}", ulid::Ulid::new().to_string().to_lowercase()))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DeploymentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identifier of one pipeline invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Create a task ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new unique task ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("task-{}", ulid::Ulid::new().to_string().to_lowercase()))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Runtime handle of a started container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerHandle(String);

impl ContainerHandle {
    /// Wrap a runtime container identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the handle as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Persisted deployment status.
///
/// ```text
/// Pending ──▶ Building ──▶ RunningUnverified ──▶ Healthy ──▶ Stopped
///                │  │            │   │                          ▲
///                │  ▼            │   ▼                          │
///                │ RunFailed     │  Unhealthy ──────────────────┤
///                ▼               └──────────────────────────────┘
///           BuildFailed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    /// Created, nothing started yet.
    Pending,
    /// Image build in progress.
    Building,
    /// Image build failed.
    BuildFailed,
    /// Container failed to start.
    RunFailed,
    /// Container started, liveness not yet confirmed.
    RunningUnverified,
    /// Container answered its liveness check.
    Healthy,
    /// Liveness was never confirmed. Not retried automatically.
    Unhealthy,
    /// Explicitly torn down.
    Stopped,
}

impl DeploymentStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [Self; 8] = [
        Self::Pending,
        Self::Building,
        Self::BuildFailed,
        Self::RunFailed,
        Self::RunningUnverified,
        Self::Healthy,
        Self::Unhealthy,
        Self::Stopped,
    ];

    /// Get the status name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Building => "building",
            Self::BuildFailed => "build_failed",
            Self::RunFailed => "run_failed",
            Self::RunningUnverified => "running_unverified",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Stopped => "stopped",
        }
    }

    /// Whether the deployment holds a container and a port lease.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(self, Self::RunningUnverified | Self::Healthy)
    }

    /// Whether no further automatic transition will happen.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::BuildFailed | Self::RunFailed | Self::Unhealthy | Self::Stopped
        )
    }

    /// Whether `self -> next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Building)
                | (Self::Building, Self::BuildFailed)
                | (Self::Building, Self::RunFailed)
                | (Self::Building, Self::RunningUnverified)
                | (Self::RunningUnverified, Self::Healthy)
                | (Self::RunningUnverified, Self::Unhealthy)
                | (Self::RunningUnverified, Self::Stopped)
                | (Self::Healthy, Self::Stopped)
                | (Self::Unhealthy, Self::Stopped)
        )
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown deployment status: {s}"))
    }
}

/// A named stage of the generation pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Accepted, not started.
    Queued,
    /// Classifying the request.
    Classify,
    /// Rendering the artifact.
    Render,
    /// Building the image.
    Build,
    /// Starting the container.
    Run,
    /// Writing the deployment record.
    Register,
    /// Polling the liveness endpoint.
    Verify,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
}

impl Phase {
    /// Get the phase name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Classify => "classify",
            Self::Render => "render",
            Self::Build => "build",
            Self::Run => "run",
            Self::Register => "register",
            Self::Verify => "verify",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Rough completion percentage when the phase starts.
    #[must_use]
    pub const fn progress(&self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Classify => 10,
            Self::Render => 25,
            Self::Build => 40,
            Self::Run => 60,
            Self::Register => 70,
            Self::Verify => 80,
            Self::Completed | Self::Failed => 100,
        }
    }

    /// Whether the task has finished.
    #[must_use]
    pub const fn is_final(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Call statistics reported by a running service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Analytics {
    /// Total calls.
    pub call_count: u64,
    /// Calls that failed.
    pub error_count: u64,
    /// Response time of the most recent call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_response_ms: Option<u64>,
}

/// A deployment record as stored in the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    /// Deployment identifier.
    pub id: DeploymentId,
    /// Service display name.
    pub name: String,
    /// Category the service was generated for.
    pub category: Category,
    /// Host port the service is published on.
    pub port: u16,
    /// Externally reachable base URL.
    pub endpoint: String,
    /// Runtime container handle.
    pub container: ContainerHandle,
    /// Token identifying the deploy attempt that owns the container and lease.
    pub instance: String,
    /// Current status.
    pub status: DeploymentStatus,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last updated.
    pub updated_at: DateTime<Utc>,
    /// Call statistics.
    #[serde(default)]
    pub analytics: Analytics,
    /// Reason for the last failure, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeploymentRecord {
    /// Holder token used for this deployment's port lease.
    #[must_use]
    pub fn lease_holder(&self) -> String {
        lease_holder(&self.id, &self.instance)
    }
}

pub(crate) fn lease_holder(id: &DeploymentId, instance: &str) -> String {
    format!("{id}/{instance}")
}

/// Listing view of a deployment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeploymentSummary {
    /// Deployment identifier.
    pub id: DeploymentId,
    /// Service display name.
    pub name: String,
    /// Category.
    pub category: Category,
    /// Externally reachable base URL.
    pub endpoint: String,
    /// Current status.
    pub status: DeploymentStatus,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
}

impl From<&DeploymentRecord> for DeploymentSummary {
    fn from(record: &DeploymentRecord) -> Self {
        Self {
            id: record.id.clone(),
            name: record.name.clone(),
            category: record.category,
            endpoint: record.endpoint.clone(),
            status: record.status,
            created_at: record.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in DeploymentStatus::ALL {
            assert_eq!(status.as_str().parse::<DeploymentStatus>(), Ok(status));
        }
        assert!("active".parse::<DeploymentStatus>().is_err());
    }

    #[test]
    fn unhealthy_is_only_left_by_teardown() {
        for next in DeploymentStatus::ALL {
            assert_eq!(
                DeploymentStatus::Unhealthy.can_transition_to(next),
                next == DeploymentStatus::Stopped,
                "{next}"
            );
        }
    }

    #[test]
    fn terminal_failures_have_no_exit() {
        for status in [DeploymentStatus::BuildFailed, DeploymentStatus::RunFailed, DeploymentStatus::Stopped] {
            assert!(DeploymentStatus::ALL
                .into_iter()
                .all(|next| !status.can_transition_to(next)));
        }
    }

    #[test]
    fn generated_ids_are_lowercase_and_prefixed() {
        let id = DeploymentId::generate();
        assert!(id.as_str().starts_with("svc-"));
        assert_eq!(id.as_str(), id.as_str().to_lowercase());
        assert_ne!(id, DeploymentId::generate());
    }

    #[test]
    fn status_serialises_snake_case() {
        let json = serde_json::to_string(&DeploymentStatus::RunningUnverified).unwrap();
        assert_eq!(json, "\"running_unverified\"");
    }
}
