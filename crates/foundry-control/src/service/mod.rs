//! Service lifecycle management.
//!
//! Wires the pipeline together from configuration and provides signal
//! handling for graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use foundry_template::{TemplateEngine, TemplateLibrary};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::ControlConfig;
use crate::deployment::ContainerDeployer;
use crate::error::ControlResult;
use crate::health::{HealthProbe, HttpHealthProbe};
use crate::pipeline::Pipeline;
use crate::ports::PortAllocator;
use crate::progress::ProgressReporter;
use crate::registry::DeploymentRegistry;
use crate::runtime::{create_runtime, ContainerRuntime};
use crate::store::{DeploymentStore, MemoryStore, PostgresStore};

/// The control service.
///
/// Manages the lifecycle of the control plane, including:
/// - Record storage (PostgreSQL, or in memory as fallback)
/// - Container runtime and liveness probe
/// - Port allocation
/// - Signal handling and graceful shutdown
pub struct ControlService {
    config: ControlConfig,
    cancel: CancellationToken,
}

impl ControlService {
    /// Create a new control service with the given configuration.
    #[must_use]
    pub fn new(config: ControlConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// The configuration the service was created with.
    #[must_use]
    pub const fn config(&self) -> &ControlConfig {
        &self.config
    }

    /// Build the pipeline.
    ///
    /// This will:
    /// 1. Connect to the database (or use the in-memory store)
    /// 2. Create the container runtime and liveness probe
    /// 3. Create the port allocator and deployer
    /// 4. Create the template engine
    pub async fn start(&self) -> ControlResult<Arc<Pipeline>> {
        let store = self.create_store().await;
        let registry = Arc::new(DeploymentRegistry::new(store));

        let runtime = self.create_runtime();
        let probe: Arc<dyn HealthProbe> = Arc::new(HttpHealthProbe::new(
            self.config.deployment.health_path.clone(),
            self.config.deployment.health_timeout(),
        )?);

        let ports = Arc::new(PortAllocator::from_config(&self.config.ports)?);
        info!(
            start = self.config.ports.start,
            end = self.config.ports.end,
            "port allocator configured"
        );

        let deployer = Arc::new(ContainerDeployer::new(
            runtime,
            probe,
            ports,
            registry,
            self.config.deployment.clone(),
        ));

        let engine = TemplateEngine::new(
            TemplateLibrary::builtin(),
            self.config.artifacts.work_dir.clone(),
        )
        .with_internal_port(self.config.deployment.internal_port);

        let pipeline = Arc::new(Pipeline::new(
            engine,
            deployer,
            ProgressReporter::new(self.config.progress.channel_capacity),
        )
        .with_retention(self.config.progress.retain_finished));
        info!("pipeline initialised");

        let shutdown = Arc::clone(&pipeline);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            shutdown.shutdown();
        });

        Ok(pipeline)
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Wait for Ctrl+C, SIGTERM or [`shutdown`](Self::shutdown), then cancel
    /// every running task.
    pub async fn wait_for_shutdown(&self) {
        shutdown_signal(self.cancel.clone()).await;
        self.cancel.cancel();
    }

    async fn create_store(&self) -> Arc<dyn DeploymentStore> {
        let Some(url) = &self.config.database.url else {
            info!("no database configured, using in-memory store");
            return Arc::new(MemoryStore::new());
        };

        let pool = PgPoolOptions::new()
            .max_connections(self.config.database.max_connections)
            .acquire_timeout(Duration::from_secs(
                self.config.database.connect_timeout_secs,
            ))
            .connect(url)
            .await;

        let store = match pool {
            Ok(pool) => PostgresStore::from_pool(pool).await,
            Err(e) => Err(e.into()),
        };

        match store {
            Ok(store) => {
                info!("connected to PostgreSQL");
                Arc::new(store)
            }
            Err(e) => {
                error!(
                    error = %e,
                    "failed to connect to PostgreSQL, using in-memory store"
                );
                Arc::new(MemoryStore::new())
            }
        }
    }

    fn create_runtime(&self) -> Arc<dyn ContainerRuntime> {
        let runtime = create_runtime(&self.config.runtime);
        info!(
            runtime = ?self.config.runtime.kind,
            binary = %self.config.runtime.binary.display(),
            "container runtime configured"
        );
        runtime
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            info!("received SIGTERM, initiating shutdown");
        }
        () = cancel.cancelled() => {
            info!("shutdown requested");
        }
    }
}
