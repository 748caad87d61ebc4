//! In-memory runtime for tests.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{ContainerRuntime, ContainerStatus, RunSpec};
use crate::error::{ControlError, ControlResult};
use crate::types::ContainerHandle;

/// A container known to the mock.
#[derive(Debug, Clone)]
pub struct MockContainer {
    /// Handle returned by `run`.
    pub handle: ContainerHandle,
    /// What it was started with.
    pub spec: RunSpec,
    /// Whether it is running.
    pub running: bool,
}

impl MockContainer {
    /// Value of an environment variable passed at start.
    #[must_use]
    pub fn env(&self, key: &str) -> Option<&str> {
        self.spec
            .env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Default)]
struct MockState {
    images: HashSet<String>,
    containers: HashMap<ContainerHandle, MockContainer>,
    started: u64,
}

/// Container runtime that never leaves the process.
///
/// Builds and runs succeed unless told to fail. Containers can be killed
/// behind the deployer's back with [`MockRuntime::vanish`].
#[derive(Debug, Default)]
pub struct MockRuntime {
    state: Mutex<MockState>,
    fail_builds: AtomicBool,
    fail_runs: AtomicBool,
    fail_teardowns: AtomicBool,
}

impl MockRuntime {
    /// Create a mock runtime.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent builds fail.
    pub fn fail_builds(&self, fail: bool) {
        self.fail_builds.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent runs fail.
    pub fn fail_runs(&self, fail: bool) {
        self.fail_runs.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent stops and removals fail, leaving containers running.
    pub fn fail_teardowns(&self, fail: bool) {
        self.fail_teardowns.store(fail, Ordering::SeqCst);
    }

    fn teardown_fault(&self, handle: &ContainerHandle) -> ControlResult<()> {
        if self.fail_teardowns.load(Ordering::SeqCst) {
            return Err(ControlError::runtime(format!(
                "simulated daemon failure for {handle}"
            )));
        }
        Ok(())
    }

    /// Remove a container as if someone else deleted it.
    pub fn vanish(&self, handle: &ContainerHandle) -> bool {
        self.state.lock().containers.remove(handle).is_some()
    }

    /// Every container that still exists.
    #[must_use]
    pub fn containers(&self) -> Vec<MockContainer> {
        self.state.lock().containers.values().cloned().collect()
    }

    /// Running containers started with `SERVICE_ID` set to `id`.
    #[must_use]
    pub fn running_for(&self, id: &str) -> Vec<MockContainer> {
        self.state
            .lock()
            .containers
            .values()
            .filter(|c| c.running && c.env("SERVICE_ID") == Some(id))
            .cloned()
            .collect()
    }

    /// Number of running containers.
    #[must_use]
    pub fn running(&self) -> usize {
        self.state
            .lock()
            .containers
            .values()
            .filter(|c| c.running)
            .count()
    }

    /// Containers started over the mock's lifetime.
    #[must_use]
    pub fn started(&self) -> u64 {
        self.state.lock().started
    }

    /// Whether an image with `tag` was built.
    #[must_use]
    pub fn has_image(&self, tag: &str) -> bool {
        self.state.lock().images.contains(tag)
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn build(&self, context: &Path, tag: &str) -> ControlResult<()> {
        if self.fail_builds.load(Ordering::SeqCst) {
            return Err(ControlError::BuildFailed(format!(
                "simulated build failure for {tag}"
            )));
        }
        if !context.join("Dockerfile").exists() {
            return Err(ControlError::BuildFailed(format!(
                "no Dockerfile in {}",
                context.display()
            )));
        }
        self.state.lock().images.insert(tag.to_owned());
        Ok(())
    }

    async fn run(&self, spec: &RunSpec) -> ControlResult<ContainerHandle> {
        if self.fail_runs.load(Ordering::SeqCst) {
            return Err(ControlError::RunFailed(format!(
                "simulated run failure for {}",
                spec.name
            )));
        }
        let mut state = self.state.lock();
        if !state.images.contains(&spec.image) {
            return Err(ControlError::RunFailed(format!(
                "image {} not found",
                spec.image
            )));
        }
        if state
            .containers
            .values()
            .any(|c| c.running && c.spec.host_port == spec.host_port)
        {
            return Err(ControlError::RunFailed(format!(
                "port {} is already allocated",
                spec.host_port
            )));
        }
        if state.containers.values().any(|c| c.spec.name == spec.name) {
            return Err(ControlError::RunFailed(format!(
                "container name {} is already in use",
                spec.name
            )));
        }

        state.started += 1;
        let handle = ContainerHandle::new(format!("mock-{:012x}", state.started));
        state.containers.insert(
            handle.clone(),
            MockContainer {
                handle: handle.clone(),
                spec: spec.clone(),
                running: true,
            },
        );
        Ok(handle)
    }

    async fn stop(&self, handle: &ContainerHandle) -> ControlResult<()> {
        self.teardown_fault(handle)?;
        if let Some(container) = self.state.lock().containers.get_mut(handle) {
            container.running = false;
        }
        Ok(())
    }

    async fn remove(&self, handle: &ContainerHandle) -> ControlResult<()> {
        self.teardown_fault(handle)?;
        self.state.lock().containers.remove(handle);
        Ok(())
    }

    async fn inspect(&self, handle: &ContainerHandle) -> ControlResult<ContainerStatus> {
        Ok(match self.state.lock().containers.get(handle) {
            Some(c) if c.running => ContainerStatus::Running,
            Some(_) => ContainerStatus::Exited,
            None => ContainerStatus::Missing,
        })
    }
}
