//! Common test utilities for control-plane integration tests.

#![allow(dead_code)]

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use foundry_control::config::DeploymentConfig;
use foundry_control::ports::{BindProbe, ProbeOutcome};
use foundry_control::{
    ContainerDeployer, DeploymentId, DeploymentRegistry, DeploymentStatus, MemoryStore,
    MockProbe, MockRuntime, Phase, Pipeline, PortAllocator, ProgressReporter, TaskId,
};
use foundry_template::{TemplateEngine, TemplateLibrary};
use tempfile::TempDir;

/// Every port is free; the reservation table alone decides.
#[derive(Debug)]
pub struct AlwaysFree;

impl BindProbe for AlwaysFree {
    fn probe(&self, _host: IpAddr, _port: u16) -> ProbeOutcome {
        ProbeOutcome::Free
    }
}

/// Complete test pipeline with every collaborator mocked and reachable.
pub struct TestPipeline {
    pub pipeline: Arc<Pipeline>,
    pub runtime: Arc<MockRuntime>,
    pub probe: Arc<MockProbe>,
    pub store: Arc<MemoryStore>,
    pub ports: Arc<PortAllocator>,
    pub registry: Arc<DeploymentRegistry>,
    pub deployer: Arc<ContainerDeployer>,
    pub work_dir: TempDir,
}

impl TestPipeline {
    /// Healthy services, ten ports, fast verification.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> TestPipelineBuilder {
        TestPipelineBuilder::default()
    }

    /// Poll `check` until it holds or `timeout` passes.
    pub async fn eventually(&self, timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    /// Wait until `task` has entered `phase`.
    pub async fn wait_for_phase(&self, task: &TaskId, phase: Phase) {
        let reached = self
            .eventually(Duration::from_secs(5), || {
                self.pipeline
                    .status(task)
                    .map(|s| s.phase == phase)
                    .unwrap_or(false)
            })
            .await;
        assert!(reached, "task {task} never reached {phase}");
    }

    /// Status of the stored record, if any.
    pub async fn status_of(&self, id: &DeploymentId) -> Option<DeploymentStatus> {
        self.registry
            .get(id)
            .await
            .expect("registry read failed")
            .map(|r| r.status)
    }

    /// Entries left in the artifact work directory.
    pub fn artifacts(&self) -> Vec<std::path::PathBuf> {
        match std::fs::read_dir(self.work_dir.path()) {
            Ok(entries) => entries.filter_map(|e| e.ok().map(|e| e.path())).collect(),
            Err(_) => Vec::new(),
        }
    }
}

impl Default for TestPipeline {
    fn default() -> Self {
        Self::new()
    }
}

pub struct TestPipelineBuilder {
    probe: MockProbe,
    ports: (u16, u16),
    retries: u32,
    delay_ms: u64,
    library: TemplateLibrary,
    retain: usize,
}

impl Default for TestPipelineBuilder {
    fn default() -> Self {
        Self {
            probe: MockProbe::healthy(),
            ports: (48_000, 48_009),
            retries: 5,
            delay_ms: 5,
            library: TemplateLibrary::builtin(),
            retain: foundry_control::pipeline::DEFAULT_RETAIN_FINISHED,
        }
    }
}

impl TestPipelineBuilder {
    pub fn probe(mut self, probe: MockProbe) -> Self {
        self.probe = probe;
        self
    }

    pub fn ports(mut self, start: u16, end: u16) -> Self {
        self.ports = (start, end);
        self
    }

    /// Verification that keeps polling far longer than any test runs.
    pub fn slow_verification(mut self) -> Self {
        self.retries = 100_000;
        self.delay_ms = 10;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn library(mut self, library: TemplateLibrary) -> Self {
        self.library = library;
        self
    }

    pub fn retain(mut self, finished: usize) -> Self {
        self.retain = finished;
        self
    }

    pub fn build(self) -> TestPipeline {
        let work_dir = tempfile::tempdir().expect("failed to create work dir");
        let runtime = Arc::new(MockRuntime::new());
        let probe = Arc::new(self.probe);
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(DeploymentRegistry::new(store.clone()));
        let ports = Arc::new(
            PortAllocator::new(self.ports.0, self.ports.1, [127, 0, 0, 1].into())
                .expect("invalid port range")
                .with_probe(Arc::new(AlwaysFree)),
        );

        let config = DeploymentConfig {
            health_retries: self.retries,
            health_delay_ms: self.delay_ms,
            ..DeploymentConfig::default()
        };

        let deployer = Arc::new(ContainerDeployer::new(
            runtime.clone(),
            probe.clone(),
            ports.clone(),
            registry.clone(),
            config,
        ));
        let engine = TemplateEngine::new(self.library, work_dir.path());
        let pipeline = Arc::new(Pipeline::new(
            engine,
            deployer.clone(),
            ProgressReporter::new(64),
        )
        .with_retention(self.retain));

        TestPipeline {
            pipeline,
            runtime,
            probe,
            store,
            ports,
            registry,
            deployer,
            work_dir,
        }
    }
}
