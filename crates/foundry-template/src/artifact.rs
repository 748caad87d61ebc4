//! Rendered output, in memory and on disk.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use foundry_intent::{Category, FeatureFlags};
use serde::Serialize;
use tracing::debug;

use crate::error::{TemplateError, TemplateResult};

/// One rendered file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedFile {
    /// Path relative to the artifact root.
    pub path: PathBuf,
    /// File contents.
    pub contents: String,
}

/// A fully rendered artifact that has not been written anywhere yet.
#[derive(Debug, Clone)]
pub struct RenderedArtifact {
    /// Category the artifact was rendered for.
    pub category: Category,
    /// Features applied.
    pub features: FeatureFlags,
    /// Files in output order.
    pub files: Vec<RenderedFile>,
    /// Routes bound by the service.
    pub routes: Vec<String>,
    /// Placeholder markers left after substitution.
    pub unresolved: Vec<String>,
    /// Render timestamp, recorded only in the metadata file.
    pub generated_at: DateTime<Utc>,
}

impl RenderedArtifact {
    /// Look up a rendered file by relative path.
    #[must_use]
    pub fn file(&self, path: impl AsRef<Path>) -> Option<&RenderedFile> {
        self.files.iter().find(|f| f.path == path.as_ref())
    }

    /// Write every file below `dir`, replacing anything already there.
    pub fn write_to(self, dir: impl Into<PathBuf>) -> TemplateResult<GeneratedArtifact> {
        let dir = dir.into();
        if dir.exists() {
            std::fs::remove_dir_all(&dir).map_err(|e| TemplateError::io(&dir, e))?;
        }
        std::fs::create_dir_all(&dir).map_err(|e| TemplateError::io(&dir, e))?;

        let mut manifest = Vec::with_capacity(self.files.len());
        for file in &self.files {
            let target = dir.join(&file.path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|e| TemplateError::io(parent, e))?;
            }
            std::fs::write(&target, &file.contents).map_err(|e| TemplateError::io(&target, e))?;
            manifest.push(FileEntry {
                name: file
                    .path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                path: file.path.clone(),
                size: u64::try_from(file.contents.len()).unwrap_or(u64::MAX),
            });
        }

        debug!(dir = %dir.display(), files = manifest.len(), "artifact written");

        Ok(GeneratedArtifact {
            dir,
            files: manifest,
            category: self.category,
            features: self.features,
            unresolved: self.unresolved,
        })
    }
}

/// A manifest entry for a written file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    /// File name.
    pub name: String,
    /// Path relative to the artifact root.
    pub path: PathBuf,
    /// Size in bytes.
    pub size: u64,
}

/// A rendered source tree on disk, ready to be containerised.
///
/// Owned by the pipeline invocation that rendered it.
#[derive(Debug)]
pub struct GeneratedArtifact {
    dir: PathBuf,
    files: Vec<FileEntry>,
    category: Category,
    features: FeatureFlags,
    unresolved: Vec<String>,
}

impl GeneratedArtifact {
    /// Root directory of the artifact.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File manifest in output order.
    #[must_use]
    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    /// Category the artifact was rendered for.
    #[must_use]
    pub const fn category(&self) -> Category {
        self.category
    }

    /// Features applied.
    #[must_use]
    pub const fn features(&self) -> FeatureFlags {
        self.features
    }

    /// Placeholders left unresolved.
    #[must_use]
    pub fn unresolved(&self) -> &[String] {
        &self.unresolved
    }

    /// Delete the artifact directory.
    pub fn discard(self) -> TemplateResult<()> {
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TemplateError::io(&self.dir, e)),
        }
    }
}
