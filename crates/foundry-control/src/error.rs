//! Error types for foundry-control.

use std::fmt;

use foundry_template::TemplateError;
use serde::Serialize;

use crate::types::Phase;

/// Result type alias using [`ControlError`].
pub type ControlResult<T> = Result<T, ControlError>;

/// Errors that can occur in the control plane.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// Every port in the range is leased or unavailable.
    #[error("no ports available in {start}-{end}")]
    NoPortsAvailable {
        /// First port of the range.
        start: u16,
        /// Last port of the range.
        end: u16,
    },

    /// No template is registered for the category.
    #[error("template not found: {0}")]
    TemplateNotFound(String),

    /// Conflicting route claims or a live deployment already under the id.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The image build failed.
    #[error("image build failed: {0}")]
    BuildFailed(String),

    /// The container failed to start.
    #[error("container failed to start: {0}")]
    RunFailed(String),

    /// The service never answered its liveness check.
    #[error("health check timed out after {attempts} attempts")]
    HealthCheckTimeout {
        /// Probes made before giving up.
        attempts: u32,
    },

    /// The container disappeared while it was being verified.
    #[error("container {0} no longer exists")]
    ContainerGone(String),

    /// Deployment not found.
    #[error("deployment not found: {0}")]
    NotFound(String),

    /// Task not found.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// A compare-and-set saw a different status than expected.
    #[error("deployment {id} is {actual}, expected {expected}")]
    StaleStatus {
        /// Deployment identifier.
        id: String,
        /// Status the caller expected.
        expected: &'static str,
        /// Status actually stored.
        actual: &'static str,
    },

    /// Invalid state transition attempted.
    #[error("invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: &'static str,
        /// Attempted target state.
        to: &'static str,
    },

    /// The task was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Container runtime error outside build and run.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Create a runtime error.
    #[must_use]
    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime(msg.into())
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Boundary code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::NoPortsAvailable { .. } => ErrorCode::NoPortsAvailable,
            Self::TemplateNotFound(_) => ErrorCode::TemplateNotFound,
            Self::Conflict(_) | Self::StaleStatus { .. } | Self::InvalidStateTransition { .. } => {
                ErrorCode::Conflict
            }
            Self::BuildFailed(_) => ErrorCode::BuildFailed,
            Self::RunFailed(_) | Self::ContainerGone(_) => ErrorCode::RunFailed,
            Self::HealthCheckTimeout { .. } => ErrorCode::HealthCheckTimeout,
            Self::NotFound(_) | Self::TaskNotFound(_) => ErrorCode::NotFound,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::Database(_) | Self::Serialisation(_) => ErrorCode::Persistence,
            Self::Runtime(_)
            | Self::Config(_)
            | Self::Http(_)
            | Self::Io(_)
            | Self::Internal(_) => ErrorCode::Internal,
        }
    }
}

impl From<TemplateError> for ControlError {
    fn from(err: TemplateError) -> Self {
        match err {
            TemplateError::TemplateNotFound(name) => Self::TemplateNotFound(name),
            TemplateError::Conflict { .. } => Self::Conflict(err.to_string()),
            TemplateError::Io { source, .. } => Self::Io(source),
            TemplateError::Serialisation(e) => Self::Serialisation(e.to_string()),
        }
    }
}

/// Result codes surfaced at the pipeline boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorCode {
    /// Port range exhausted.
    NoPortsAvailable,
    /// Unknown category template.
    TemplateNotFound,
    /// Route or status conflict.
    Conflict,
    /// Image build failed.
    BuildFailed,
    /// Container failed to start or died.
    RunFailed,
    /// Liveness never confirmed.
    HealthCheckTimeout,
    /// Unknown deployment or task.
    NotFound,
    /// Task cancelled.
    Cancelled,
    /// Record store failure.
    Persistence,
    /// Anything else.
    Internal,
}

impl ErrorCode {
    /// Code as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NoPortsAvailable => "NoPortsAvailable",
            Self::TemplateNotFound => "TemplateNotFound",
            Self::Conflict => "Conflict",
            Self::BuildFailed => "BuildFailed",
            Self::RunFailed => "RunFailed",
            Self::HealthCheckTimeout => "HealthCheckTimeout",
            Self::NotFound => "NotFound",
            Self::Cancelled => "Cancelled",
            Self::Persistence => "Persistence",
            Self::Internal => "Internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pipeline failure together with the phase it happened in.
#[derive(Debug, thiserror::Error)]
#[error("{phase} failed: {error}")]
pub struct PhasedError {
    /// Phase in which the failure occurred.
    pub phase: Phase,
    /// The failure.
    #[source]
    pub error: ControlError,
}

impl PhasedError {
    /// Attach a phase to an error.
    #[must_use]
    pub const fn new(phase: Phase, error: ControlError) -> Self {
        Self { phase, error }
    }

    /// Boundary code of the underlying error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        self.error.code()
    }
}

/// Attach a phase to the error of a [`ControlResult`].
pub trait PhaseExt<T> {
    /// Tag the error with `phase`.
    fn in_phase(self, phase: Phase) -> Result<T, PhasedError>;
}

impl<T, E: Into<ControlError>> PhaseExt<T> for Result<T, E> {
    fn in_phase(self, phase: Phase) -> Result<T, PhasedError> {
        self.map_err(|e| PhasedError::new(phase, e.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ControlError::NoPortsAvailable { start: 1, end: 2 }, ErrorCode::NoPortsAvailable)]
    #[case(ControlError::TemplateNotFound("x".into()), ErrorCode::TemplateNotFound)]
    #[case(ControlError::StaleStatus { id: "a".into(), expected: "healthy", actual: "stopped" }, ErrorCode::Conflict)]
    #[case(ControlError::ContainerGone("c".into()), ErrorCode::RunFailed)]
    #[case(ControlError::Database(sqlx::Error::PoolTimedOut), ErrorCode::Persistence)]
    #[case(ControlError::Cancelled, ErrorCode::Cancelled)]
    fn codes(#[case] error: ControlError, #[case] code: ErrorCode) {
        assert_eq!(error.code(), code);
    }

    #[test]
    fn template_errors_keep_their_kind() {
        let err: ControlError = TemplateError::Conflict {
            route: "/analyze".into(),
            first: "template api_monitor".into(),
            second: "feature reporting".into(),
        }
        .into();
        assert_eq!(err.code(), ErrorCode::Conflict);
        assert!(err.to_string().contains("/analyze"));
    }

    #[test]
    fn phase_is_preserved() {
        let result: ControlResult<()> = Err(ControlError::BuildFailed("exit 1".into()));
        let err = result.in_phase(Phase::Build).unwrap_err();
        assert_eq!(err.phase, Phase::Build);
        assert_eq!(err.code(), ErrorCode::BuildFailed);
        assert_eq!(err.to_string(), "build failed: image build failed: exit 1");
    }
}
