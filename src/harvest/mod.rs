//! Harvest module - package inventory extraction for container layers.
//!
//! This module provides the building blocks of an extraction:
//! - **Gate**: [`PathPattern`] sets deciding which listers run on a layer
//! - **Versions**: per-format syntax validation via [`version::validate`]
//! - **Listers**: format implementations under [`formats`]
//! - **Merge**: first-wins deduplication into an [`Inventory`]
//! - **Namespace**: ecosystem detection via [`CondaNamespaceDetector`]
//! - **Pipeline**: async orchestrator via [`pipeline::ExtractionPipeline`]

pub mod formats;
pub mod gate;
pub mod merge;
pub mod namespace;
pub mod pipeline;
pub mod version;

// Re-export commonly used types
pub use gate::{should_run, Gating, PathPattern};
pub use merge::{merge, Inventory};
pub use namespace::{detect_namespace, CondaNamespaceDetector};
pub use version::{VersionError, VersionFormat};

pub use pipeline::{
    Extraction, ExtractionPipeline, ExtractionStats, FailureKind, ListerFailure, PipelineError,
    ScratchDir,
};
