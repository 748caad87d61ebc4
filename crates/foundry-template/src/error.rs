//! Error types for foundry-template.

use std::path::PathBuf;

/// Result type alias using [`TemplateError`].
pub type TemplateResult<T> = Result<T, TemplateError>;

/// Errors that can occur while rendering or writing an artifact.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    /// No template is registered for the requested category.
    #[error("template not found: {0}")]
    TemplateNotFound(String),

    /// Two parts of the output claim the same external route.
    #[error("route {route} is claimed by both {first} and {second}")]
    Conflict {
        /// The contested route.
        route: String,
        /// Owner of the first claim.
        first: String,
        /// Owner of the second claim.
        second: String,
    },

    /// Writing or removing artifact files failed.
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Metadata could not be serialised.
    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}

impl TemplateError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
