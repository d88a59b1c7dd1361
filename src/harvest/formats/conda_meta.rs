//! Lister for conda `conda-meta` manifests.
//!
//! Every package installed into a conda environment leaves one JSON manifest
//! under `<env>/conda-meta/<dist>.json`. The base environment lives at the
//! install root, named environments under `<root>/envs/<name>`. Manifests are
//! read straight from the snapshot; nothing is staged to disk.

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;
use tracing::info;

use crate::harvest::gate::PathPattern;
use crate::harvest::version::VersionFormat;
use crate::model::PackageRecord;
use crate::model::SourceOrigin;
use crate::traits::{ListContext, ListError, Lister, Listing};

/// Default conda install root inside a layer.
pub const DEFAULT_ROOT: &str = "opt/conda";

static DEFAULT_MANIFESTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&manifest_expression(DEFAULT_ROOT)).expect("valid manifest regex")
});

fn manifest_expression(root: &str) -> String {
    format!(
        r"^{}/(?:.*/)?conda-meta/[^/]+\.json$",
        regex::escape(root.trim_matches('/'))
    )
}

/// Fields of a manifest the inventory cares about; everything else
/// (`build_string`, `channel`, `files`, ...) is ignored.
#[derive(Debug, Deserialize)]
struct CondaManifest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    version: Option<String>,
}

/// Lists packages from `conda-meta/*.json` manifests below a conda root.
#[derive(Debug, Clone)]
pub struct CondaMetaLister {
    patterns: Vec<PathPattern>,
}

impl CondaMetaLister {
    /// Lister for the default root, `opt/conda`.
    pub fn new() -> Self {
        Self {
            patterns: vec![PathPattern::Regex(DEFAULT_MANIFESTS.clone())],
        }
    }

    /// Lister for a conda installation rooted at `root` (layer-relative).
    ///
    /// # Errors
    ///
    /// Returns the regex error if the derived path expression cannot be
    /// compiled.
    pub fn with_root(root: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            patterns: vec![PathPattern::regex(&manifest_expression(root))?],
        })
    }
}

impl Default for CondaMetaLister {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Lister for CondaMetaLister {
    fn name(&self) -> &str {
        "conda-meta"
    }

    fn required_patterns(&self) -> &[PathPattern] {
        &self.patterns
    }

    async fn list(&self, ctx: &ListContext<'_>) -> Result<Listing, ListError> {
        let mut listing = Listing::new();
        for (path, content) in ctx.files.iter() {
            listing.absorb(parse_manifest(path, content));
        }

        info!(
            manifests = ctx.files.len(),
            records = listing.records.len(),
            issues = listing.issues.len(),
            "Parsed conda-meta manifests"
        );
        Ok(listing)
    }
}

/// Parses a single manifest into at most one record.
pub fn parse_manifest(path: &str, content: &[u8]) -> Listing {
    let mut listing = Listing::new();

    let manifest: CondaManifest = match serde_json::from_slice(content) {
        Ok(manifest) => manifest,
        Err(e) => {
            listing.report(ListError::MalformedManifest {
                path: path.to_string(),
                reason: e.to_string(),
            });
            return listing;
        }
    };

    let (Some(name), Some(version)) = (manifest.name, manifest.version) else {
        listing.report(ListError::MalformedManifest {
            path: path.to_string(),
            reason: "missing `name` or `version`".to_string(),
        });
        return listing;
    };

    match PackageRecord::new(name, version, SourceOrigin::MetadataFile, VersionFormat::Conda) {
        Ok(record) => listing.push(record),
        Err(source) => listing.report(ListError::InvalidRecord {
            location: path.to_string(),
            source,
        }),
    }
    listing
}
