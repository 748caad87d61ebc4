//! Scoped ownership of what one deploy attempt has acquired.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{ControlError, ControlResult};
use crate::ports::PortLease;
use crate::registry::DeploymentRegistry;
use crate::runtime::ContainerRuntime;
use crate::types::{ContainerHandle, DeploymentId, DeploymentStatus};

/// Port lease, container and record of an attempt that has not finished.
///
/// Exactly one of three things happens to a provision: [`commit`] hands the
/// resources over to the deployment record, [`abandon`] rolls them back,
/// or it is dropped (the deploy future was cancelled) and the rollback runs
/// on a spawned task.
///
/// [`commit`]: Provision::commit
/// [`abandon`]: Provision::abandon
pub(crate) struct Provision {
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<DeploymentRegistry>,
    id: DeploymentId,
    instance: String,
    lease: Option<PortLease>,
    container: Option<ContainerHandle>,
    recorded: bool,
}

struct Resources {
    instance: String,
    lease: Option<PortLease>,
    container: Option<ContainerHandle>,
    recorded: bool,
}

impl Provision {
    pub(crate) fn new(
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<DeploymentRegistry>,
        id: DeploymentId,
        instance: String,
        lease: PortLease,
    ) -> Self {
        Self {
            runtime,
            registry,
            id,
            instance,
            lease: Some(lease),
            container: None,
            recorded: false,
        }
    }

    pub(crate) fn attach(&mut self, container: ContainerHandle) {
        self.container = Some(container);
    }

    pub(crate) fn confirm_lease(&mut self) -> ControlResult<()> {
        self.lease
            .as_mut()
            .ok_or_else(|| ControlError::internal("lease already handed over"))?
            .confirm()
    }

    pub(crate) fn mark_recorded(&mut self) {
        self.recorded = true;
    }

    /// Keep everything. The record (or the unrecorded table) now owns the
    /// container and the port.
    pub(crate) fn commit(mut self) {
        if let Some(lease) = self.lease.take() {
            let port = lease.detach();
            debug!(deployment_id = %self.id, port, "lease handed over");
        }
        self.container = None;
        self.recorded = false;
    }

    /// Roll back: mark the record `status`, remove the container, release
    /// the port. In that order, so the record never points at a port that is
    /// free again.
    pub(crate) async fn abandon(mut self, status: DeploymentStatus, reason: &str) {
        let resources = self.take();
        cleanup(
            Arc::clone(&self.runtime),
            Arc::clone(&self.registry),
            self.id.clone(),
            resources,
            status,
            reason.to_owned(),
        )
        .await;
    }

    fn take(&mut self) -> Resources {
        Resources {
            instance: self.instance.clone(),
            lease: self.lease.take(),
            container: self.container.take(),
            recorded: std::mem::take(&mut self.recorded),
        }
    }
}

impl Drop for Provision {
    fn drop(&mut self) {
        let resources = self.take();
        if resources.lease.is_none() && resources.container.is_none() && !resources.recorded {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(deployment_id = %self.id, "deploy abandoned, cleaning up");
                handle.spawn(cleanup(
                    Arc::clone(&self.runtime),
                    Arc::clone(&self.registry),
                    self.id.clone(),
                    resources,
                    DeploymentStatus::Stopped,
                    "deployment cancelled".to_owned(),
                ));
            }
            Err(_) => {
                if let Some(container) = &resources.container {
                    warn!(
                        deployment_id = %self.id,
                        container = %container,
                        "no async runtime to stop container; it is left running"
                    );
                }
                // The lease releases itself on drop.
            }
        }
    }
}

async fn cleanup(
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<DeploymentRegistry>,
    id: DeploymentId,
    resources: Resources,
    status: DeploymentStatus,
    reason: String,
) {
    if resources.recorded {
        match registry
            .transition(&id, DeploymentStatus::RunningUnverified, status, Some(&reason))
            .await
        {
            Ok(()) => {}
            Err(ControlError::StaleStatus { actual, .. }) => {
                settle(&registry, &id, &resources.instance, status, &reason).await;
                debug!(deployment_id = %id, actual, "record already moved on");
            }
            Err(e) => {
                warn!(deployment_id = %id, error = %e, "failed to mark deployment {status}");
            }
        }
    }

    if let Some(container) = resources.container {
        if let Err(e) = runtime.stop(&container).await {
            warn!(deployment_id = %id, container = %container, error = %e, "failed to stop container");
        }
        if let Err(e) = runtime.remove(&container).await {
            warn!(deployment_id = %id, container = %container, error = %e, "failed to remove container");
        }
    }

    if let Some(lease) = resources.lease {
        let port = lease.port();
        lease.release();
        debug!(deployment_id = %id, port, "lease released");
    }
}

/// The record left `RunningUnverified` without us. Usually a teardown did
/// that and there is nothing to do, but if this attempt's own move to
/// `Healthy` committed before the deploy was dropped, the record would
/// outlive the container about to be removed.
async fn settle(
    registry: &DeploymentRegistry,
    id: &DeploymentId,
    instance: &str,
    status: DeploymentStatus,
    reason: &str,
) {
    let record = match registry.get(id).await {
        Ok(Some(record)) => record,
        Ok(None) => return,
        Err(e) => {
            warn!(deployment_id = %id, error = %e, "failed to read deployment");
            return;
        }
    };
    if record.instance != instance || !record.status.is_live() {
        return;
    }

    let next = if record.status.can_transition_to(status) {
        status
    } else {
        DeploymentStatus::Stopped
    };
    if let Err(e) = registry
        .transition(id, record.status, next, Some(reason))
        .await
    {
        warn!(deployment_id = %id, error = %e, "failed to mark deployment {next}");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    use chrono::Utc;
    use foundry_intent::Category;

    use super::*;
    use crate::ports::{BindProbe, PortAllocator, ProbeOutcome};
    use crate::runtime::{MockRuntime, RunSpec};
    use crate::store::MemoryStore;
    use crate::types::{Analytics, DeploymentRecord};

    const IMAGE: &str = "foundry-svc-a:latest";

    #[derive(Debug)]
    struct Free;

    impl BindProbe for Free {
        fn probe(&self, _host: IpAddr, _port: u16) -> ProbeOutcome {
            ProbeOutcome::Free
        }
    }

    struct Fixture {
        runtime: Arc<MockRuntime>,
        registry: Arc<DeploymentRegistry>,
        ports: Arc<PortAllocator>,
        _context: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let context = tempfile::tempdir().unwrap();
        std::fs::write(context.path().join("Dockerfile"), "FROM scratch\n").unwrap();
        let runtime = Arc::new(MockRuntime::new());
        runtime.build(context.path(), IMAGE).await.unwrap();
        Fixture {
            runtime,
            registry: Arc::new(DeploymentRegistry::new(Arc::new(MemoryStore::new()))),
            ports: Arc::new(
                PortAllocator::new(48_400, 48_409, IpAddr::V4(Ipv4Addr::LOCALHOST))
                    .unwrap()
                    .with_probe(Arc::new(Free)),
            ),
            _context: context,
        }
    }

    fn record(instance: &str, port: u16, container: ContainerHandle) -> DeploymentRecord {
        let now = Utc::now();
        DeploymentRecord {
            id: DeploymentId::new("svc-a"),
            name: "Api Monitor Service".to_owned(),
            category: Category::Api,
            port,
            endpoint: format!("http://localhost:{port}"),
            container,
            instance: instance.to_owned(),
            status: DeploymentStatus::RunningUnverified,
            created_at: now,
            updated_at: now,
            analytics: Analytics::default(),
            error: None,
        }
    }

    /// A recorded attempt whose move to `Healthy` has already committed.
    async fn committed_healthy(f: &Fixture) -> (Provision, u16) {
        let id = DeploymentId::new("svc-a");
        let lease = f.ports.lease("svc-a/one").unwrap();
        let port = lease.port();
        let runtime: Arc<dyn ContainerRuntime> = f.runtime.clone();
        let mut provision = Provision::new(
            runtime,
            Arc::clone(&f.registry),
            id.clone(),
            "one".to_owned(),
            lease,
        );
        let container = f
            .runtime
            .run(&RunSpec {
                image: IMAGE.to_owned(),
                name: "foundry-svc-a-one".to_owned(),
                host_port: port,
                container_port: 8000,
                env: Vec::new(),
                labels: Vec::new(),
            })
            .await
            .unwrap();
        provision.attach(container.clone());
        provision.confirm_lease().unwrap();
        f.registry
            .create(&record("one", port, container))
            .await
            .unwrap();
        provision.mark_recorded();
        f.registry
            .transition(
                &id,
                DeploymentStatus::RunningUnverified,
                DeploymentStatus::Healthy,
                None,
            )
            .await
            .unwrap();
        (provision, port)
    }

    async fn status(f: &Fixture) -> DeploymentStatus {
        f.registry
            .require(&DeploymentId::new("svc-a"))
            .await
            .unwrap()
            .status
    }

    #[tokio::test]
    async fn abandon_after_committed_verification_stops_the_record() {
        let f = fixture().await;
        let (provision, port) = committed_healthy(&f).await;

        provision
            .abandon(DeploymentStatus::Unhealthy, "verification lost")
            .await;

        assert_eq!(status(&f).await, DeploymentStatus::Stopped);
        assert!(f.runtime.containers().is_empty());
        assert!(f.ports.lease_on(port).is_none());
    }

    #[tokio::test]
    async fn dropped_provision_never_leaves_a_healthy_record_behind() {
        let f = fixture().await;
        let (provision, port) = committed_healthy(&f).await;

        drop(provision);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !f.runtime.containers().is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(f.runtime.containers().is_empty());
        assert!(f.ports.lease_on(port).is_none());
        assert_eq!(status(&f).await, DeploymentStatus::Stopped);
    }

    #[tokio::test]
    async fn newer_attempt_record_is_left_alone() {
        let f = fixture().await;
        let (provision, _) = committed_healthy(&f).await;

        // A later attempt has replaced the record.
        f.registry
            .transition(
                &DeploymentId::new("svc-a"),
                DeploymentStatus::Healthy,
                DeploymentStatus::Stopped,
                None,
            )
            .await
            .unwrap();
        let mut newer = record("two", 48_409, ContainerHandle::new("mock-newer"));
        newer.status = DeploymentStatus::Healthy;
        f.registry.create(&newer).await.unwrap();

        provision
            .abandon(DeploymentStatus::Unhealthy, "verification lost")
            .await;

        assert_eq!(status(&f).await, DeploymentStatus::Healthy);
        let stored = f
            .registry
            .require(&DeploymentId::new("svc-a"))
            .await
            .unwrap();
        assert_eq!(stored.instance, "two");
    }
}
