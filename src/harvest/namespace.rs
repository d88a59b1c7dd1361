//! Namespace detection from ecosystem signature files.

use tracing::debug;

use crate::harvest::gate::PathPattern;
use crate::model::{FileSnapshot, Namespace};
use crate::traits::NamespaceDetector;

pub const CONDA_NAMESPACE: &str = "conda";
pub const CONDA_VERSION_FORMAT: &str = "4.11";

/// Detects a conda installation by its `conda-meta/history` marker.
///
/// The version format is a fixed tag; it is not derived from the installed
/// conda release.
#[derive(Debug, Clone)]
pub struct CondaNamespaceDetector {
    marker: String,
    patterns: Vec<PathPattern>,
}

impl CondaNamespaceDetector {
    pub fn new() -> Self {
        Self::with_root(crate::harvest::formats::conda_meta::DEFAULT_ROOT)
    }

    pub fn with_root(root: &str) -> Self {
        let marker = format!("{}/conda-meta/history", root.trim_matches('/'));
        Self {
            patterns: vec![PathPattern::exact(marker.clone())],
            marker,
        }
    }
}

impl Default for CondaNamespaceDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl NamespaceDetector for CondaNamespaceDetector {
    fn name(&self) -> &str {
        "conda-sources"
    }

    fn required_patterns(&self) -> &[PathPattern] {
        &self.patterns
    }

    fn detect(&self, snapshot: &FileSnapshot) -> Option<Namespace> {
        if !snapshot.contains(&self.marker) {
            return None;
        }
        Some(Namespace {
            name: CONDA_NAMESPACE.to_string(),
            version_format: CONDA_VERSION_FORMAT.to_string(),
        })
    }
}

/// Runs `detectors` in order and returns the first namespace found.
pub fn detect_namespace(
    detectors: &[Box<dyn NamespaceDetector>],
    snapshot: &FileSnapshot,
) -> Option<Namespace> {
    detectors.iter().find_map(|detector| {
        let namespace = detector.detect(snapshot);
        if let Some(ref ns) = namespace {
            debug!(
                detector = detector.name(),
                namespace = %ns.name,
                version_format = %ns.version_format,
                "Detected namespace"
            );
        }
        namespace
    })
}
