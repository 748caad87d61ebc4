//! The generation pipeline: text in, running service out.
//!
//! Each invocation is a task with its own id, artifact directory, port lease
//! and container. Tasks report progress through the [`ProgressReporter`] and
//! finish with a [`GenerateOutcome`] that always names the phase a failure
//! happened in.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use foundry_intent::{Category, ClassifiedIntent, IntentClassifier};
use foundry_template::{CatalogueEntry, RenderParams, TemplateEngine};
use serde::Serialize;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::deployment::{ContainerDeployer, DeployRequest, ReconcileReport};
use crate::error::{ControlError, ControlResult, ErrorCode, PhaseExt, PhasedError};
use crate::progress::{ProgressReporter, Subscription, TaskProgress};
use crate::registry::DeploymentRegistry;
use crate::store::DeploymentFilter;
use crate::types::{DeploymentId, DeploymentRecord, DeploymentSummary, Phase, TaskId};

/// Result of one generation task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GenerateOutcome {
    /// The service is running and answered its liveness check.
    Success {
        /// Deployment identifier.
        id: DeploymentId,
        /// Service display name.
        name: String,
        /// Base URL.
        endpoint: String,
        /// Host port.
        port: u16,
        /// Category.
        category: Category,
    },
    /// The task stopped at `phase`.
    Failed {
        /// Deployment identifier the task was working on.
        id: DeploymentId,
        /// Phase the failure happened in.
        phase: Phase,
        /// Boundary error code.
        code: ErrorCode,
        /// Error message.
        error: String,
    },
}

impl GenerateOutcome {
    /// Whether the task succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Deployment the task was about.
    #[must_use]
    pub const fn id(&self) -> &DeploymentId {
        match self {
            Self::Success { id, .. } | Self::Failed { id, .. } => id,
        }
    }

    fn from_result(id: DeploymentId, result: Result<DeploymentRecord, PhasedError>) -> Self {
        match result {
            Ok(record) => Self::Success {
                id: record.id,
                name: record.name,
                endpoint: record.endpoint,
                port: record.port,
                category: record.category,
            },
            Err(e) => Self::Failed {
                id,
                phase: e.phase,
                code: e.code(),
                error: e.error.to_string(),
            },
        }
    }
}

/// Current phase of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskStatus {
    /// Phase the task is in.
    pub phase: Phase,
    /// Latest message.
    pub message: String,
    /// Rough completion percentage.
    pub progress: u8,
}

/// Result of a teardown request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TeardownOutcome {
    /// Whether the deployment is now stopped.
    pub success: bool,
    /// Boundary error code on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    /// Error message on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Counters describing the control plane right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    /// Deployment records, whatever their status.
    pub deployments: usize,
    /// Deployments whose container is running.
    pub active: usize,
    /// Open progress subscriptions.
    pub subscribers: usize,
    /// Generation tasks still running.
    pub running_tasks: usize,
    /// When the counters were taken.
    pub at: DateTime<Utc>,
}

/// Finished tasks kept for lookup unless configured otherwise.
pub const DEFAULT_RETAIN_FINISHED: usize = 1024;

/// Transport-agnostic entry points of the control plane.
pub struct Pipeline {
    classifier: IntentClassifier,
    engine: TemplateEngine,
    deployer: Arc<ContainerDeployer>,
    registry: Arc<DeploymentRegistry>,
    progress: ProgressReporter,
    shutdown: CancellationToken,
    tasks: DashMap<TaskId, CancellationToken>,
    outcomes: DashMap<TaskId, GenerateOutcome>,
    finished: Mutex<VecDeque<TaskId>>,
    retain_finished: usize,
}

impl Pipeline {
    /// Assemble a pipeline.
    pub fn new(
        engine: TemplateEngine,
        deployer: Arc<ContainerDeployer>,
        progress: ProgressReporter,
    ) -> Self {
        let registry = Arc::clone(deployer.registry());
        Self {
            classifier: IntentClassifier::new(),
            engine,
            deployer,
            registry,
            progress,
            shutdown: CancellationToken::new(),
            tasks: DashMap::new(),
            outcomes: DashMap::new(),
            finished: Mutex::new(VecDeque::new()),
            retain_finished: DEFAULT_RETAIN_FINISHED,
        }
    }

    /// Keep the outcome and last event of at most `count` finished tasks.
    /// Older ones are forgotten and look unknown afterwards.
    #[must_use]
    pub fn with_retention(mut self, count: usize) -> Self {
        self.retain_finished = count.max(1);
        self
    }

    /// The deployer.
    #[must_use]
    pub const fn deployer(&self) -> &Arc<ContainerDeployer> {
        &self.deployer
    }

    /// The progress reporter.
    #[must_use]
    pub const fn progress(&self) -> &ProgressReporter {
        &self.progress
    }

    /// Generate and deploy a new service, waiting for the result.
    pub async fn generate(&self, description: &str) -> GenerateOutcome {
        let task = TaskId::generate();
        let cancel = self.begin(&task);
        let outcome = self.execute(&task, None, description, &cancel).await;
        self.tasks.remove(&task);
        outcome
    }

    /// Regenerate an existing deployment in place.
    ///
    /// The previous container is torn down once the new image has been
    /// requested. Nothing is redeployed automatically; this is the only way
    /// out of `unhealthy` short of removal.
    pub async fn redeploy(&self, id: &DeploymentId, description: &str) -> GenerateOutcome {
        let task = TaskId::generate();
        let cancel = self.begin(&task);
        let outcome = self
            .execute(&task, Some(id.clone()), description, &cancel)
            .await;
        self.tasks.remove(&task);
        outcome
    }

    /// Start a generation in the background.
    pub fn submit(self: &Arc<Self>, description: impl Into<String>) -> TaskId {
        self.spawn(None, description.into())
    }

    /// Start a redeploy in the background.
    pub fn submit_redeploy(
        self: &Arc<Self>,
        id: DeploymentId,
        description: impl Into<String>,
    ) -> TaskId {
        self.spawn(Some(id), description.into())
    }

    fn spawn(self: &Arc<Self>, target: Option<DeploymentId>, description: String) -> TaskId {
        let task = TaskId::generate();
        let cancel = self.begin(&task);
        let pipeline = Arc::clone(self);
        let spawned = task.clone();

        tokio::spawn(async move {
            pipeline
                .execute(&spawned, target, &description, &cancel)
                .await;
            pipeline.tasks.remove(&spawned);
        });

        task
    }

    fn begin(&self, task: &TaskId) -> CancellationToken {
        let cancel = self.shutdown.child_token();
        self.tasks.insert(task.clone(), cancel.clone());
        self.progress.emit(task, Phase::Queued, "queued");
        cancel
    }

    /// Cancel a running task.
    ///
    /// Returns `false` if the task has already finished. Whatever the task
    /// had acquired is released.
    pub fn cancel(&self, task: &TaskId) -> ControlResult<bool> {
        if let Some(token) = self.tasks.get(task) {
            info!(task_id = %task, "cancelling task");
            token.cancel();
            return Ok(true);
        }
        if self.outcomes.contains_key(task) {
            return Ok(false);
        }
        Err(ControlError::TaskNotFound(task.to_string()))
    }

    /// Current phase of a task.
    pub fn status(&self, task: &TaskId) -> ControlResult<TaskStatus> {
        self.progress
            .status(task)
            .map(|event| TaskStatus {
                phase: event.phase,
                message: event.message,
                progress: event.progress,
            })
            .ok_or_else(|| ControlError::TaskNotFound(task.to_string()))
    }

    /// Follow a task's progress.
    pub fn subscribe(&self, task: &TaskId) -> ControlResult<Subscription> {
        if self.tasks.contains_key(task) || self.outcomes.contains_key(task) {
            Ok(self.progress.subscribe(task))
        } else {
            Err(ControlError::TaskNotFound(task.to_string()))
        }
    }

    /// Outcome of a finished task.
    #[must_use]
    pub fn outcome(&self, task: &TaskId) -> Option<GenerateOutcome> {
        self.outcomes.get(task).map(|o| o.value().clone())
    }

    /// Wait for a task to finish.
    pub async fn wait(&self, task: &TaskId) -> ControlResult<GenerateOutcome> {
        let mut subscription = self.progress.subscribe(task);
        loop {
            if let Some(outcome) = self.outcome(task) {
                return Ok(outcome);
            }
            if !self.tasks.contains_key(task) {
                return Err(ControlError::TaskNotFound(task.to_string()));
            }
            if subscription.next().await.is_none() {
                return self
                    .outcome(task)
                    .ok_or_else(|| ControlError::TaskNotFound(task.to_string()));
            }
        }
    }

    async fn execute(
        &self,
        task: &TaskId,
        target: Option<DeploymentId>,
        description: &str,
        cancel: &CancellationToken,
    ) -> GenerateOutcome {
        let progress = self.progress.task(task.clone());
        let redeploy = target.is_some();
        let id = target.unwrap_or_else(DeploymentId::generate);

        info!(task_id = %task, deployment_id = %id, redeploy, "generation started");

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                let phase = progress.current().unwrap_or(Phase::Queued);
                warn!(task_id = %task, deployment_id = %id, phase = %phase, "generation cancelled");
                Err(PhasedError::new(phase, ControlError::Cancelled))
            }
            result = self.run(task, &id, redeploy, description, &progress) => result,
        };

        let outcome = GenerateOutcome::from_result(id, result);
        self.outcomes.insert(task.clone(), outcome.clone());

        match &outcome {
            GenerateOutcome::Success { id, endpoint, .. } => {
                info!(task_id = %task, deployment_id = %id, endpoint = %endpoint, "generation completed");
                progress.phase(Phase::Completed, format!("{id} is running at {endpoint}"));
            }
            GenerateOutcome::Failed {
                id, phase, error, ..
            } => {
                error!(task_id = %task, deployment_id = %id, phase = %phase, error = %error, "generation failed");
                progress.phase(Phase::Failed, format!("{phase} failed: {error}"));
            }
        }
        self.retire(task);

        outcome
    }

    /// Remember `task` as finished and forget the oldest beyond the bound.
    fn retire(&self, task: &TaskId) {
        let evicted: Vec<TaskId> = {
            let mut finished = self.finished.lock();
            finished.push_back(task.clone());
            let excess = finished.len().saturating_sub(self.retain_finished);
            finished.drain(..excess).collect()
        };
        for old in evicted {
            self.outcomes.remove(&old);
            self.progress.forget(&old);
            debug!(task_id = %old, "finished task forgotten");
        }
    }

    async fn run(
        &self,
        task: &TaskId,
        id: &DeploymentId,
        redeploy: bool,
        description: &str,
        progress: &TaskProgress,
    ) -> Result<DeploymentRecord, PhasedError> {
        // A deployment whose record write failed is only known to the deployer.
        if redeploy && !self.deployer.holds(id) {
            self.registry.require(id).await.in_phase(Phase::Queued)?;
        }

        progress.phase(Phase::Classify, "classifying request");
        let intent = self.classifier.classify(description);
        info!(
            task_id = %task,
            category = %intent.category,
            confidence = intent.confidence,
            name = %intent.name,
            "request classified"
        );

        progress.phase(
            Phase::Render,
            format!("rendering {} template", intent.template_name()),
        );
        let params = RenderParams::for_service(
            id.as_str(),
            &intent.name,
            &intent.description,
            &intent.requirements,
        );
        let artifact = self
            .engine
            .render(task.as_str(), intent.category, intent.features, &params)
            .in_phase(Phase::Render)?;

        self.deployer
            .deploy(
                DeployRequest {
                    id: id.clone(),
                    name: intent.name,
                    category: intent.category,
                    artifact,
                },
                progress,
            )
            .await
    }

    /// Tear down a deployment.
    pub async fn teardown(&self, id: &DeploymentId) -> TeardownOutcome {
        match self.deployer.teardown(id).await {
            Ok(()) => TeardownOutcome {
                success: true,
                code: None,
                error: None,
            },
            Err(e) => {
                warn!(deployment_id = %id, error = %e, "teardown failed");
                TeardownOutcome {
                    success: false,
                    code: Some(e.code()),
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Tear down a deployment if needed and delete its record.
    pub async fn remove(&self, id: &DeploymentId) -> ControlResult<()> {
        self.registry.delete(id, self.deployer.as_ref()).await
    }

    /// All deployments, newest first.
    pub async fn list(&self) -> ControlResult<Vec<DeploymentSummary>> {
        let records = self.registry.list(&DeploymentFilter::new()).await?;
        Ok(records.iter().map(DeploymentSummary::from).collect())
    }

    /// One deployment.
    pub async fn get(&self, id: &DeploymentId) -> ControlResult<DeploymentRecord> {
        self.registry.require(id).await
    }

    /// Count a call made to a deployed service.
    pub async fn record_call(
        &self,
        id: &DeploymentId,
        response_ms: u64,
        success: bool,
    ) -> ControlResult<()> {
        self.registry.record_call(id, response_ms, success).await
    }

    /// Retry record writes for deployments running without a record.
    pub async fn reconcile(&self) -> ReconcileReport {
        self.deployer.reconcile().await
    }

    /// Counts of deployments, subscribers and running tasks.
    pub async fn stats(&self) -> ControlResult<PipelineStats> {
        let records = self.registry.list(&DeploymentFilter::new()).await?;
        Ok(PipelineStats {
            deployments: records.len(),
            active: records.iter().filter(|r| r.status.is_live()).count(),
            subscribers: self.progress.subscribers(),
            running_tasks: self.tasks.len(),
            at: Utc::now(),
        })
    }

    /// Classify without generating anything.
    #[must_use]
    pub fn classify(&self, text: &str) -> ClassifiedIntent {
        self.classifier.classify(text)
    }

    /// Available templates.
    #[must_use]
    pub fn templates(&self) -> Vec<CatalogueEntry> {
        self.engine.library().catalogue()
    }

    /// Cancel every running task.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("deployer", &self.deployer)
            .field("tasks", &self.tasks.len())
            .field("finished", &self.outcomes.len())
            .finish_non_exhaustive()
    }
}
