//! Foundry Control Plane
//!
//! This crate turns a free-text request into a running, independently
//! addressable service and keeps track of what it started.
//!
//! # Architecture
//!
//! A [`Pipeline`] invocation runs these stages in order, aborting and
//! rolling back on the first failure:
//!
//! - **Classify**: [`foundry_intent::IntentClassifier`] picks a category,
//!   requirements, feature flags and a name
//! - **Render**: [`foundry_template::TemplateEngine`] writes a
//!   self-contained source tree
//! - **Build / Run / Verify**: [`ContainerDeployer`] builds an image,
//!   starts a container on a port leased from the [`PortAllocator`] and
//!   polls its liveness endpoint
//! - **Register**: the [`DeploymentRegistry`] records the deployment
//!
//! Progress is fanned out through a [`ProgressReporter`] that never waits
//! for slow subscribers.
//!
//! # State Machine
//!
//! ```text
//! Pending ──▶ Building ──▶ RunningUnverified ──▶ Healthy ──▶ Stopped
//!                │  │            │                             ▲
//!                │  ▼            ▼                             │
//!                │ RunFailed   Unhealthy ──────────────────────┘
//!                ▼
//!           BuildFailed
//! ```
//!
//! An attempt in flight is a typestate [`Deployment`], so illegal
//! transitions do not compile. Stored records are checked at runtime and
//! only change status by compare-and-set.
//!
//! # Example
//!
//! ```ignore
//! use foundry_control::{ControlConfig, ControlService};
//!
//! let service = ControlService::new(ControlConfig::load()?);
//! let pipeline = service.start().await?;
//!
//! let outcome = pipeline.generate("analyse slow postgres queries").await;
//! println!("{}", serde_json::to_string_pretty(&outcome)?);
//! ```

#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

pub mod config;
pub mod deployment;
pub mod error;
pub mod health;
pub mod pipeline;
pub mod ports;
pub mod progress;
pub mod registry;
pub mod runtime;
pub mod service;
pub mod state;
pub mod store;
pub mod types;

// Re-export commonly used types at the crate root
pub use config::ControlConfig;
pub use deployment::{ContainerDeployer, DeployRequest, ReconcileReport};
pub use error::{ControlError, ControlResult, ErrorCode, PhasedError};
pub use health::{HealthProbe, HealthStatus, HttpHealthProbe, MockProbe};
pub use pipeline::{GenerateOutcome, Pipeline, PipelineStats, TaskStatus, TeardownOutcome};
pub use ports::{LeaseState, PortAllocator, PortLease};
pub use progress::{ProgressEvent, ProgressReporter, Subscription, TaskProgress};
pub use registry::{DeploymentRegistry, Teardown};
pub use runtime::{ContainerRuntime, ContainerStatus, DockerRuntime, MockRuntime, RunSpec};
pub use service::ControlService;
pub use state::{
    Building, BuildFailed, Deployment, DeploymentState, Healthy, Pending, RunFailed,
    RunningUnverified, Stopped, Unhealthy,
};
pub use store::{DeploymentFilter, DeploymentStore, MemoryStore, PostgresStore};
pub use types::{
    DeploymentId, DeploymentRecord, DeploymentStatus, DeploymentSummary, Phase, TaskId,
};
