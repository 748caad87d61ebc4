//! Core deployment orchestration logic.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use foundry_intent::Category;
use foundry_template::GeneratedArtifact;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::guard::Provision;
use crate::config::DeploymentConfig;
use crate::error::{ControlError, ControlResult, PhaseExt, PhasedError};
use crate::health::{HealthProbe, HealthStatus};
use crate::ports::PortAllocator;
use crate::progress::TaskProgress;
use crate::registry::{DeploymentRegistry, Teardown};
use crate::runtime::{ContainerRuntime, ContainerStatus, RunSpec};
use crate::state::{Deployment, DeploymentData, Pending, Placement};
use crate::types::{lease_holder, DeploymentId, DeploymentRecord, DeploymentStatus, Phase};

/// Label attached to every container started by the deployer.
const DEPLOYMENT_LABEL: &str = "foundry.deployment";

/// Attempts at a teardown compare-and-set before giving up.
const TEARDOWN_ATTEMPTS: usize = 3;

/// Request to deploy a rendered artifact.
#[derive(Debug)]
pub struct DeployRequest {
    /// Deployment identifier.
    pub id: DeploymentId,
    /// Service display name.
    pub name: String,
    /// Category the artifact was rendered for.
    pub category: Category,
    /// The rendered artifact. Deleted once the image is built.
    pub artifact: GeneratedArtifact,
}

/// Outcome of [`ContainerDeployer::reconcile`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Deployments whose record has now been written.
    pub recorded: Vec<DeploymentId>,
    /// Deployments whose container had gone; their port was released.
    pub dropped: Vec<DeploymentId>,
    /// Deployments still waiting for a record or a container removal.
    pub pending: Vec<DeploymentId>,
}

/// Builds, runs and verifies containers, and tears them down again.
pub struct ContainerDeployer {
    runtime: Arc<dyn ContainerRuntime>,
    probe: Arc<dyn HealthProbe>,
    ports: Arc<PortAllocator>,
    registry: Arc<DeploymentRegistry>,
    config: DeploymentConfig,
    locks: DashMap<DeploymentId, Arc<Mutex<()>>>,
    unrecorded: DashMap<DeploymentId, DeploymentRecord>,
    stranded: DashMap<DeploymentId, DeploymentRecord>,
}

impl ContainerDeployer {
    /// Create a new deployer.
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        probe: Arc<dyn HealthProbe>,
        ports: Arc<PortAllocator>,
        registry: Arc<DeploymentRegistry>,
        config: DeploymentConfig,
    ) -> Self {
        Self {
            runtime,
            probe,
            ports,
            registry,
            config,
            locks: DashMap::new(),
            unrecorded: DashMap::new(),
            stranded: DashMap::new(),
        }
    }

    /// The port allocator.
    #[must_use]
    pub const fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    /// The registry records are written to.
    #[must_use]
    pub const fn registry(&self) -> &Arc<DeploymentRegistry> {
        &self.registry
    }

    /// Running deployments whose record could not be written.
    #[must_use]
    pub fn unrecorded(&self) -> Vec<DeploymentRecord> {
        self.unrecorded.iter().map(|e| e.value().clone()).collect()
    }

    /// Stopped deployments whose container could not be removed yet.
    #[must_use]
    pub fn stranded(&self) -> Vec<DeploymentRecord> {
        self.stranded.iter().map(|e| e.value().clone()).collect()
    }

    /// Whether `id` has a container the deployer still has to remove.
    #[must_use]
    pub fn holds(&self, id: &DeploymentId) -> bool {
        self.unrecorded.contains_key(id) || self.stranded.contains_key(id)
    }

    fn lock_for(&self, id: &DeploymentId) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(id.clone()).or_default().value())
    }

    /// Deploy an artifact.
    ///
    /// This drives one attempt through its lifecycle:
    /// 1. Tear down any live deployment under the same id
    /// 2. Build the image (the artifact is kept if this fails)
    /// 3. Lease a port and start the container
    /// 4. Record the deployment as running but unverified
    /// 5. Poll the liveness endpoint until it answers or retries run out
    ///
    /// Any failure in steps 3 to 5 removes the container and releases the
    /// port before returning, except a failed record write: the container is
    /// kept and the record is retried by [`reconcile`](Self::reconcile).
    /// Dropping the returned future performs the same rollback.
    pub async fn deploy(
        &self,
        request: DeployRequest,
        progress: &TaskProgress,
    ) -> Result<DeploymentRecord, PhasedError> {
        let lock = self.lock_for(&request.id);
        let _serialised = lock.lock().await;

        let DeployRequest {
            id,
            name,
            category,
            artifact,
        } = request;

        info!(deployment_id = %id, category = %category, "starting deployment");

        self.retire(&id).await.in_phase(Phase::Build)?;

        let building =
            Deployment::<Pending>::create(DeploymentData::new(id.clone(), name.clone(), category))
                .start_build();
        let tag = self.config.image_tag(&id);

        progress.phase(Phase::Build, format!("building image {tag}"));
        if let Err(e) = self.runtime.build(artifact.dir(), &tag).await {
            let failed = building.build_failed(e.to_string());
            error!(
                deployment_id = %id,
                status = %failed.status(),
                artifact = %artifact.dir().display(),
                error = %e,
                "image build failed, artifact kept for inspection"
            );
            return Err(PhasedError::new(Phase::Build, e));
        }
        if let Err(e) = artifact.discard() {
            warn!(deployment_id = %id, error = %e, "failed to delete artifact");
        }

        progress.phase(Phase::Run, "starting container");
        let holder = lease_holder(&id, &building.data().instance);
        let lease = self.ports.lease(holder).in_phase(Phase::Run)?;
        let port = lease.port();
        let mut provision = Provision::new(
            Arc::clone(&self.runtime),
            Arc::clone(&self.registry),
            id.clone(),
            building.data().instance.clone(),
            lease,
        );

        let spec = RunSpec {
            image: tag,
            name: self
                .config
                .container_name(&id, &building.data().instance),
            host_port: port,
            container_port: self.config.internal_port,
            env: vec![
                ("SERVICE_ID".to_owned(), id.to_string()),
                ("SERVICE_NAME".to_owned(), name),
                ("PORT".to_owned(), self.config.internal_port.to_string()),
            ],
            labels: vec![(DEPLOYMENT_LABEL.to_owned(), id.to_string())],
        };

        let started = match self.runtime.run(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                let failed = building.run_failed(e.to_string());
                error!(deployment_id = %id, status = %failed.status(), port, error = %e, "container failed to start");
                provision
                    .abandon(DeploymentStatus::RunFailed, &e.to_string())
                    .await;
                return Err(PhasedError::new(Phase::Run, e));
            }
        };
        provision.attach(started.clone());
        if let Err(e) = provision.confirm_lease() {
            provision
                .abandon(DeploymentStatus::RunFailed, &e.to_string())
                .await;
            return Err(PhasedError::new(Phase::Run, e));
        }

        let running = building.started();
        let placement = Placement {
            port,
            endpoint: self.config.endpoint(port),
            container: started,
        };
        info!(deployment_id = %id, port, container = %placement.container, "container started");

        progress.phase(Phase::Register, "recording deployment");
        let record = running.record(&placement);
        match self.registry.create(&record).await {
            Ok(()) => provision.mark_recorded(),
            Err(e @ ControlError::Conflict(_)) => {
                error!(deployment_id = %id, error = %e, "live record appeared under the same id");
                provision
                    .abandon(DeploymentStatus::RunFailed, &e.to_string())
                    .await;
                return Err(PhasedError::new(Phase::Register, e));
            }
            Err(e) => {
                warn!(
                    deployment_id = %id,
                    port,
                    error = %e,
                    "failed to record deployment, container kept for reconciliation"
                );
                self.unrecorded.insert(id, record);
                provision.commit();
                return Err(PhasedError::new(Phase::Register, e));
            }
        }

        progress.phase(Phase::Verify, format!("waiting for {}", placement.endpoint));
        let verified = match self.verify(&id, &placement).await {
            Ok(attempts) => self
                .registry
                .transition(
                    &id,
                    DeploymentStatus::RunningUnverified,
                    DeploymentStatus::Healthy,
                    None,
                )
                .await
                .map(|()| attempts),
            Err(e) => Err(e),
        };

        match verified {
            Ok(attempts) => {
                provision.commit();
                let healthy = running.verified();
                info!(deployment_id = %id, port, attempts, "deployment healthy");
                Ok(healthy.record(&placement))
            }
            Err(e) => {
                let unhealthy = running.unhealthy(e.to_string());
                error!(deployment_id = %id, status = %unhealthy.status(), error = %e, "deployment failed verification");
                provision
                    .abandon(DeploymentStatus::Unhealthy, &e.to_string())
                    .await;
                Err(PhasedError::new(Phase::Verify, e))
            }
        }
    }

    /// Poll until the service answers. Returns the number of probes made.
    async fn verify(&self, id: &DeploymentId, placement: &Placement) -> ControlResult<u32> {
        let retries = self.config.health_retries;

        for attempt in 1..=retries {
            match self.runtime.inspect(&placement.container).await {
                Ok(ContainerStatus::Running) => {}
                Ok(ContainerStatus::Exited) => {
                    return Err(ControlError::RunFailed(format!(
                        "container {} exited",
                        placement.container
                    )));
                }
                Ok(ContainerStatus::Missing) => {
                    return Err(ControlError::ContainerGone(placement.container.to_string()));
                }
                Err(e) => {
                    warn!(deployment_id = %id, error = %e, "failed to inspect container");
                }
            }

            match self.probe.check(&placement.endpoint).await {
                HealthStatus::Healthy => return Ok(attempt),
                HealthStatus::Unhealthy(reason) => {
                    debug!(deployment_id = %id, attempt, retries, reason = %reason, "not ready");
                }
            }

            if attempt < retries {
                tokio::time::sleep(self.config.health_delay()).await;
            }
        }

        Err(ControlError::HealthCheckTimeout { attempts: retries })
    }

    /// Tear down whatever is live under `id` before a new attempt starts.
    async fn retire(&self, id: &DeploymentId) -> ControlResult<()> {
        if self.holds(id) {
            info!(deployment_id = %id, "replacing unrecorded deployment");
            return self.teardown(id).await;
        }
        match self.registry.get(id).await? {
            Some(record) if record.status.is_live() => {
                info!(deployment_id = %id, port = record.port, "replacing live deployment");
                self.teardown(id).await
            }
            _ => Ok(()),
        }
    }

    /// Stop a deployment's container and release its port.
    ///
    /// The record moves to `Stopped` before anything is released. If the
    /// container cannot be removed after that, the deployment is kept as
    /// stranded and the next teardown (or [`reconcile`](Self::reconcile))
    /// retries the removal. Tearing down a stopped deployment with nothing
    /// left to remove succeeds without doing anything; an unknown id fails
    /// with `NotFound` and changes nothing.
    pub async fn teardown(&self, id: &DeploymentId) -> ControlResult<()> {
        if let Some((_, record)) = self.unrecorded.remove(id) {
            if let Err(e) = self.dismantle(&record).await {
                self.unrecorded.insert(id.clone(), record);
                return Err(e);
            }
            info!(deployment_id = %id, "unrecorded deployment torn down");
            return Ok(());
        }
        if let Some((_, record)) = self.stranded.remove(id) {
            if let Err(e) = self.dismantle(&record).await {
                self.stranded.insert(id.clone(), record);
                return Err(e);
            }
            info!(deployment_id = %id, port = record.port, "stranded container removed");
            return Ok(());
        }

        for _ in 0..TEARDOWN_ATTEMPTS {
            let record = self.registry.require(id).await?;
            match record.status {
                DeploymentStatus::Stopped => return Ok(()),
                status if status.is_live() || status == DeploymentStatus::Unhealthy => {
                    match self
                        .registry
                        .transition(id, status, DeploymentStatus::Stopped, None)
                        .await
                    {
                        Ok(()) => {
                            if let Err(e) = self.dismantle(&record).await {
                                error!(
                                    deployment_id = %id,
                                    container = %record.container,
                                    error = %e,
                                    "container not removed, kept for retry"
                                );
                                self.stranded.insert(id.clone(), record);
                                return Err(e);
                            }
                            info!(deployment_id = %id, port = record.port, "deployment torn down");
                            return Ok(());
                        }
                        Err(ControlError::StaleStatus { .. }) => continue,
                        Err(e) => return Err(e),
                    }
                }
                status => {
                    return Err(ControlError::InvalidStateTransition {
                        from: status.as_str(),
                        to: DeploymentStatus::Stopped.as_str(),
                    });
                }
            }
        }

        Err(ControlError::Conflict(format!(
            "deployment {id} kept changing status during teardown"
        )))
    }

    /// Remove the container, then release its port.
    async fn dismantle(&self, record: &DeploymentRecord) -> ControlResult<()> {
        if let Err(e) = self.runtime.stop(&record.container).await {
            warn!(deployment_id = %record.id, error = %e, "failed to stop container");
        }
        self.runtime.remove(&record.container).await?;
        self.ports.release(record.port, &record.lease_holder());
        Ok(())
    }

    /// Retry record writes for deployments that are running unrecorded, and
    /// container removals that failed during teardown.
    pub async fn reconcile(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let stranded: Vec<_> = self.stranded.iter().map(|e| e.key().clone()).collect();
        for id in stranded {
            let lock = self.lock_for(&id);
            let _serialised = lock.lock().await;
            let Some((_, record)) = self.stranded.remove(&id) else {
                continue;
            };
            match self.dismantle(&record).await {
                Ok(()) => report.dropped.push(id),
                Err(e) => {
                    warn!(deployment_id = %id, error = %e, "stranded container still not removed");
                    self.stranded.insert(id.clone(), record);
                    report.pending.push(id);
                }
            }
        }
        let ids: Vec<_> = self.unrecorded.iter().map(|e| e.key().clone()).collect();

        for id in ids {
            let lock = self.lock_for(&id);
            let _serialised = lock.lock().await;

            let Some(record) = self.unrecorded.get(&id).map(|e| e.value().clone()) else {
                continue;
            };

            match self.runtime.inspect(&record.container).await {
                Ok(ContainerStatus::Running) => {}
                Ok(status) => {
                    debug!(deployment_id = %id, ?status, "unrecorded container is gone");
                    if let Err(e) = self.dismantle(&record).await {
                        warn!(deployment_id = %id, error = %e, "failed to clean up container");
                        report.pending.push(id);
                        continue;
                    }
                    self.unrecorded.remove(&id);
                    report.dropped.push(id);
                    continue;
                }
                Err(e) => {
                    warn!(deployment_id = %id, error = %e, "failed to inspect container");
                    report.pending.push(id);
                    continue;
                }
            }

            match self.registry.create(&record).await {
                Ok(()) => {
                    info!(deployment_id = %id, port = record.port, "deployment recorded");
                    self.unrecorded.remove(&id);
                    report.recorded.push(id);
                }
                Err(ControlError::Conflict(_)) => {
                    warn!(deployment_id = %id, "newer deployment recorded, removing container");
                    if self.dismantle(&record).await.is_ok() {
                        self.unrecorded.remove(&id);
                        report.dropped.push(id);
                    } else {
                        report.pending.push(id);
                    }
                }
                Err(e) => {
                    warn!(deployment_id = %id, error = %e, "record write still failing");
                    report.pending.push(id);
                }
            }
        }

        report
    }
}

#[async_trait]
impl Teardown for ContainerDeployer {
    async fn teardown(&self, id: &DeploymentId) -> ControlResult<()> {
        ContainerDeployer::teardown(self, id).await
    }

    fn holds(&self, id: &DeploymentId) -> bool {
        ContainerDeployer::holds(self, id)
    }
}

impl std::fmt::Debug for ContainerDeployer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerDeployer")
            .field("runtime", &self.runtime)
            .field("ports", &self.ports)
            .field("unrecorded", &self.unrecorded.len())
            .field("stranded", &self.stranded.len())
            .finish_non_exhaustive()
    }
}
