//! Typestate view of a deployment attempt.
//!
//! The deployer drives one attempt through these states. Transitions consume
//! the value, so a build failure cannot later be marked healthy and a stopped
//! deployment cannot be verified:
//!
//! ```ignore
//! let building = Deployment::<Pending>::create(data).start_build();
//! let running = building.started();
//! let healthy = running.verified();
//! // healthy.started() does not compile
//! ```
//!
//! Records loaded from storage carry a runtime [`DeploymentStatus`] instead;
//! the registry checks those transitions with
//! [`DeploymentStatus::can_transition_to`].

use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use foundry_intent::Category;

use crate::types::{
    Analytics, ContainerHandle, DeploymentId, DeploymentRecord, DeploymentStatus,
};

/// Marker trait for deployment states.
pub trait DeploymentState: private::Sealed + Send + Sync {
    /// Status persisted for this state.
    fn status() -> DeploymentStatus;
}

mod private {
    pub trait Sealed {}
}

macro_rules! states {
    ($($(#[$doc:meta])* $name:ident => $status:ident;)*) => {
        $(
            $(#[$doc])*
            #[derive(Debug, Clone, Copy)]
            pub struct $name;

            impl private::Sealed for $name {}

            impl DeploymentState for $name {
                fn status() -> DeploymentStatus {
                    DeploymentStatus::$status
                }
            }
        )*
    };
}

states! {
    /// Created, nothing started.
    Pending => Pending;
    /// Image build in progress.
    Building => Building;
    /// Image build failed.
    BuildFailed => BuildFailed;
    /// Container failed to start.
    RunFailed => RunFailed;
    /// Container started, liveness unconfirmed.
    RunningUnverified => RunningUnverified;
    /// Liveness confirmed.
    Healthy => Healthy;
    /// Liveness never confirmed.
    Unhealthy => Unhealthy;
    /// Torn down.
    Stopped => Stopped;
}

/// Data shared by every state of one attempt.
#[derive(Debug, Clone)]
pub struct DeploymentData {
    /// Deployment identifier.
    pub id: DeploymentId,
    /// Service display name.
    pub name: String,
    /// Category.
    pub category: Category,
    /// Token unique to this attempt.
    pub instance: String,
    /// When the attempt started.
    pub created_at: DateTime<Utc>,
    /// Last transition.
    pub updated_at: DateTime<Utc>,
    /// Failure reason, if any.
    pub error: Option<String>,
}

impl DeploymentData {
    /// Data for a new attempt with a fresh instance token.
    #[must_use]
    pub fn new(id: DeploymentId, name: impl Into<String>, category: Category) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            category,
            instance: ulid::Ulid::new().to_string().to_lowercase(),
            created_at: now,
            updated_at: now,
            error: None,
        }
    }
}

/// Where a started container can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    /// Leased host port.
    pub port: u16,
    /// Base URL.
    pub endpoint: String,
    /// Container handle.
    pub container: ContainerHandle,
}

/// A deployment attempt in state `S`.
#[derive(Debug)]
pub struct Deployment<S: DeploymentState> {
    data: DeploymentData,
    _state: PhantomData<S>,
}

impl<S: DeploymentState> Deployment<S> {
    /// Shared data.
    #[must_use]
    pub const fn data(&self) -> &DeploymentData {
        &self.data
    }

    /// Deployment ID.
    #[must_use]
    pub const fn id(&self) -> &DeploymentId {
        &self.data.id
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> DeploymentStatus {
        S::status()
    }

    /// Record for this attempt at `placement`.
    #[must_use]
    pub fn record(&self, placement: &Placement) -> DeploymentRecord {
        DeploymentRecord {
            id: self.data.id.clone(),
            name: self.data.name.clone(),
            category: self.data.category,
            port: placement.port,
            endpoint: placement.endpoint.clone(),
            container: placement.container.clone(),
            instance: self.data.instance.clone(),
            status: S::status(),
            created_at: self.data.created_at,
            updated_at: self.data.updated_at,
            analytics: Analytics::default(),
            error: self.data.error.clone(),
        }
    }

    fn transition<T: DeploymentState>(mut self) -> Deployment<T> {
        debug_assert!(S::status().can_transition_to(T::status()));
        self.data.updated_at = Utc::now();
        Deployment {
            data: self.data,
            _state: PhantomData,
        }
    }

    fn fail<T: DeploymentState>(mut self, error: String) -> Deployment<T> {
        self.data.error = Some(error);
        self.transition()
    }
}

impl Deployment<Pending> {
    /// Start a new attempt.
    #[must_use]
    pub const fn create(data: DeploymentData) -> Self {
        Self {
            data,
            _state: PhantomData,
        }
    }

    /// Begin building the image.
    #[must_use]
    pub fn start_build(self) -> Deployment<Building> {
        self.transition()
    }
}

impl Deployment<Building> {
    /// The image build failed.
    #[must_use]
    pub fn build_failed(self, error: String) -> Deployment<BuildFailed> {
        self.fail(error)
    }

    /// The container could not be started.
    #[must_use]
    pub fn run_failed(self, error: String) -> Deployment<RunFailed> {
        self.fail(error)
    }

    /// The container is running.
    #[must_use]
    pub fn started(self) -> Deployment<RunningUnverified> {
        self.transition()
    }
}

impl Deployment<RunningUnverified> {
    /// Liveness confirmed.
    #[must_use]
    pub fn verified(self) -> Deployment<Healthy> {
        self.transition()
    }

    /// Liveness never confirmed.
    #[must_use]
    pub fn unhealthy(self, error: String) -> Deployment<Unhealthy> {
        self.fail(error)
    }

    /// Torn down before verification finished.
    #[must_use]
    pub fn stop(self) -> Deployment<Stopped> {
        self.transition()
    }
}

impl Deployment<Healthy> {
    /// Torn down.
    #[must_use]
    pub fn stop(self) -> Deployment<Stopped> {
        self.transition()
    }
}

impl Deployment<Unhealthy> {
    /// Torn down.
    #[must_use]
    pub fn stop(self) -> Deployment<Stopped> {
        self.transition()
    }
}
