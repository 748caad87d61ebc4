//! Template rendering for Foundry.
//!
//! A [`TemplateEngine`] turns a category, a set of feature flags and a bag of
//! parameters into a self-contained service source tree:
//!
//! - the primary source file, built from the category template with one
//!   snippet appended per enabled feature (in canonical feature order)
//! - a dependency manifest, container build descriptor, environment and
//!   ignore descriptors, and a usage document derived from the same inputs
//! - a metadata file whose `generated_at` field is the only part of the
//!   output that differs between two renders of the same inputs
//!
//! Rendering happens in memory first ([`RenderedArtifact`]) and is written
//! to disk as a [`GeneratedArtifact`] only once it is known to be valid.

#![forbid(unsafe_code)]

pub mod artifact;
mod descriptors;
pub mod engine;
pub mod error;
pub mod library;
pub mod params;

pub use artifact::{FileEntry, GeneratedArtifact, RenderedArtifact, RenderedFile};
pub use engine::TemplateEngine;
pub use error::{TemplateError, TemplateResult};
pub use library::{CatalogueEntry, ServiceTemplate, Snippet, TemplateLibrary};
pub use params::RenderParams;
