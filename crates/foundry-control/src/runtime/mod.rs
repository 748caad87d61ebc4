//! Container runtimes.
//!
//! The deployer only talks to a [`ContainerRuntime`]. The Docker
//! implementation shells out to the CLI; the mock keeps containers in memory
//! and is what the test suite runs against.

mod docker;
mod mock;

pub use docker::DockerRuntime;
pub use mock::MockRuntime;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{RuntimeConfig, RuntimeKind};
use crate::error::ControlResult;
use crate::types::ContainerHandle;

/// What to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSpec {
    /// Image tag.
    pub image: String,
    /// Container name.
    pub name: String,
    /// Host port to publish on.
    pub host_port: u16,
    /// Port the service listens on inside the container.
    pub container_port: u16,
    /// Environment passed to the service.
    pub env: Vec<(String, String)>,
    /// Labels attached to the container.
    pub labels: Vec<(String, String)>,
}

/// Observed container state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    /// Running.
    Running,
    /// Exists but is not running.
    Exited,
    /// Does not exist.
    Missing,
}

/// A container runtime.
///
/// `stop` and `remove` succeed for containers that no longer exist, so
/// cleanup can run more than once.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + fmt::Debug {
    /// Build an image from a directory.
    ///
    /// Fails with [`ControlError::BuildFailed`](crate::ControlError::BuildFailed).
    async fn build(&self, context: &Path, tag: &str) -> ControlResult<()>;

    /// Start a container.
    ///
    /// Fails with [`ControlError::RunFailed`](crate::ControlError::RunFailed).
    async fn run(&self, spec: &RunSpec) -> ControlResult<ContainerHandle>;

    /// Stop a container.
    async fn stop(&self, handle: &ContainerHandle) -> ControlResult<()>;

    /// Remove a container.
    async fn remove(&self, handle: &ContainerHandle) -> ControlResult<()>;

    /// Inspect a container.
    async fn inspect(&self, handle: &ContainerHandle) -> ControlResult<ContainerStatus>;
}

/// Create a runtime from configuration.
pub fn create_runtime(config: &RuntimeConfig) -> Arc<dyn ContainerRuntime> {
    match config.kind {
        RuntimeKind::Docker => Arc::new(DockerRuntime::new(&config.binary)),
        RuntimeKind::Mock => Arc::new(MockRuntime::default()),
    }
}
