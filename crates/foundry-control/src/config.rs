//! Configuration for foundry-control.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::error::{ControlError, ControlResult};
use crate::types::DeploymentId;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ControlConfig {
    /// Port range for published services.
    #[serde(default)]
    pub ports: PortConfig,

    /// Deployment and verification behaviour.
    #[serde(default)]
    pub deployment: DeploymentConfig,

    /// Container runtime selection.
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Where artifacts are rendered.
    #[serde(default)]
    pub artifacts: ArtifactConfig,

    /// Record storage.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Progress fan-out.
    #[serde(default)]
    pub progress: ProgressConfig,
}

impl ControlConfig {
    /// Load configuration from the default sources.
    ///
    /// Later sources override earlier ones:
    /// 1. Default values
    /// 2. `foundry.toml` in the current directory (if present)
    /// 3. Environment variables with the `FOUNDRY_` prefix, `__` separating sections
    pub fn load() -> ControlResult<Self> {
        Self::figment(Toml::file("foundry.toml"))
    }

    /// Load configuration from a specific TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> ControlResult<Self> {
        Self::figment(Toml::file(path.as_ref()))
    }

    fn figment(file: figment::providers::Data<Toml>) -> ControlResult<Self> {
        let config: Self = Figment::new()
            .merge(file)
            .merge(Env::prefixed("FOUNDRY_").split("__"))
            .extract()
            .map_err(|e| ControlError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot work.
    pub fn validate(&self) -> ControlResult<()> {
        if self.ports.start > self.ports.end {
            return Err(ControlError::Config(format!(
                "port range {}-{} is empty",
                self.ports.start, self.ports.end
            )));
        }
        if self.deployment.health_retries == 0 {
            return Err(ControlError::Config(
                "deployment.health_retries must be at least 1".to_owned(),
            ));
        }
        if self.progress.channel_capacity == 0 {
            return Err(ControlError::Config(
                "progress.channel_capacity must be at least 1".to_owned(),
            ));
        }
        if self.progress.retain_finished == 0 {
            return Err(ControlError::Config(
                "progress.retain_finished must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Port range configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PortConfig {
    /// First port handed out.
    #[serde(default = "default_port_start")]
    pub start: u16,

    /// Last port handed out (inclusive).
    #[serde(default = "default_port_end")]
    pub end: u16,

    /// Address the bind probe tests ports on.
    #[serde(default = "default_probe_host")]
    pub probe_host: IpAddr,
}

const fn default_port_start() -> u16 {
    8001
}

const fn default_port_end() -> u16 {
    8999
}

const fn default_probe_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            start: default_port_start(),
            end: default_port_end(),
            probe_host: default_probe_host(),
        }
    }
}

/// Deployment behaviour configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentConfig {
    /// Liveness path appended to the endpoint.
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Probes before a deployment is marked unhealthy.
    #[serde(default = "default_health_retries")]
    pub health_retries: u32,

    /// Delay between probes in milliseconds.
    #[serde(default = "default_health_delay_ms")]
    pub health_delay_ms: u64,

    /// Timeout for a single probe in milliseconds.
    #[serde(default = "default_health_timeout_ms")]
    pub health_timeout_ms: u64,

    /// Port services listen on inside their container.
    #[serde(default = "default_internal_port")]
    pub internal_port: u16,

    /// Host name used when building endpoints.
    #[serde(default = "default_public_host")]
    pub public_host: String,

    /// Prefix for image tags and container names.
    #[serde(default = "default_image_prefix")]
    pub image_prefix: String,
}

fn default_health_path() -> String {
    "/health".to_owned()
}

const fn default_health_retries() -> u32 {
    10
}

const fn default_health_delay_ms() -> u64 {
    1000
}

const fn default_health_timeout_ms() -> u64 {
    5000
}

const fn default_internal_port() -> u16 {
    8000
}

fn default_public_host() -> String {
    "localhost".to_owned()
}

fn default_image_prefix() -> String {
    "foundry".to_owned()
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            health_path: default_health_path(),
            health_retries: default_health_retries(),
            health_delay_ms: default_health_delay_ms(),
            health_timeout_ms: default_health_timeout_ms(),
            internal_port: default_internal_port(),
            public_host: default_public_host(),
            image_prefix: default_image_prefix(),
        }
    }
}

impl DeploymentConfig {
    /// Delay between liveness probes.
    #[must_use]
    pub const fn health_delay(&self) -> Duration {
        Duration::from_millis(self.health_delay_ms)
    }

    /// Timeout for one liveness probe.
    #[must_use]
    pub const fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    /// Image tag for a deployment. Stable across redeploys.
    #[must_use]
    pub fn image_tag(&self, id: &DeploymentId) -> String {
        format!("{}-{id}:latest", self.image_prefix)
    }

    /// Container name for one deploy attempt.
    #[must_use]
    pub fn container_name(&self, id: &DeploymentId, instance: &str) -> String {
        format!("{}-{id}-{instance}", self.image_prefix)
    }

    /// Base URL for a published port.
    #[must_use]
    pub fn endpoint(&self, port: u16) -> String {
        format!("http://{}:{port}", self.public_host)
    }
}

/// Container runtime configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Which runtime to use.
    #[serde(default)]
    pub kind: RuntimeKind,

    /// Path to the container CLI.
    #[serde(default = "default_runtime_binary")]
    pub binary: PathBuf,
}

fn default_runtime_binary() -> PathBuf {
    PathBuf::from("docker")
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            kind: RuntimeKind::default(),
            binary: default_runtime_binary(),
        }
    }
}

/// Type of container runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    /// Docker CLI.
    #[default]
    Docker,

    /// In-process mock for testing.
    Mock,
}

/// Artifact configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactConfig {
    /// Directory artifacts are rendered below, one subdirectory per deployment.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(".foundry/artifacts")
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL. Records are kept in memory when unset.
    #[serde(default)]
    pub url: Option<String>,

    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

const fn default_max_connections() -> u32 {
    10
}

const fn default_connect_timeout_secs() -> u64 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// Progress fan-out configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressConfig {
    /// Events buffered per subscriber before it starts lagging.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Finished tasks whose outcome and last event are kept for lookup.
    #[serde(default = "default_retain_finished")]
    pub retain_finished: usize,
}

const fn default_channel_capacity() -> usize {
    256
}

const fn default_retain_finished() -> usize {
    1024
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            retain_finished: default_retain_finished(),
        }
    }
}
