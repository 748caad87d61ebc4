//! Deployment orchestration and lifecycle management.
//!
//! This module drives a rendered artifact through image build, container
//! start and liveness verification, and owns teardown of what it started.

mod guard;
mod manager;

pub use manager::{ContainerDeployer, DeployRequest, ReconcileReport};
