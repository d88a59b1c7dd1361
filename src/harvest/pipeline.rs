//! Extraction pipeline for one layer snapshot.
//!
//! [`ExtractionPipeline`] drives the listers registered with it:
//! - Gate each lister on its required patterns (keys only, no content)
//! - Run the selected listers under a per-lister timeout via `tokio`, unless
//!   a lister bounds its own invocations
//! - Merge their record sets into one [`Inventory`]
//! - Detect the layer namespace independently of listing
//! - Provision scratch storage per call, released via RAII (`Drop` on [`ScratchDir`])
//!
//! A lister that fails or times out is recorded in [`Extraction::failures`];
//! it never prevents the others from contributing.

use serde::{Deserialize, Serialize, Serializer};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::config::{ConfigError, HarvesterConfig};
use crate::harvest::formats::{CondaListLister, CondaMetaLister, DpkgLister};
use crate::harvest::gate::{should_run, Gating, PathPattern};
use crate::harvest::merge::{merge, Inventory};
use crate::harvest::namespace::{detect_namespace, CondaNamespaceDetector};
use crate::model::{FileSnapshot, Namespace};
use crate::traits::{ListContext, ListError, Lister, NamespaceDetector};

// ============================================================================
// Scratch Storage
// ============================================================================

const SCRATCH_PREFIX: &str = "layer-harvest-";

/// Private temporary directory scoped to one extraction call.
///
/// The directory is created with a unique name (mode `0700` on Unix) and
/// removed when the value is dropped, whether the call succeeded, failed or
/// unwound from a panic. It intentionally does **not** implement `Clone`.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
    dir: Option<TempDir>,
}

impl ScratchDir {
    /// Creates a scratch directory under `root`, or the system temp dir.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Scratch`] if the directory cannot be created.
    pub fn create(root: Option<&Path>) -> Result<Self, PipelineError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(SCRATCH_PREFIX);

        let created = match root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        };
        let dir = created.map_err(|source| PipelineError::Scratch {
            root: root
                .map(Path::to_path_buf)
                .unwrap_or_else(std::env::temp_dir)
                .display()
                .to_string(),
            source,
        })?;

        Ok(Self {
            path: dir.path().to_path_buf(),
            dir: Some(dir),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            if let Err(e) = dir.close() {
                warn!(path = %self.path.display(), error = %e, "Failed to remove scratch directory");
            }
        }
    }
}

// ============================================================================
// Results
// ============================================================================

/// Everything one extraction call produced.
///
/// Serializes to JSON for downstream matching; failure causes are rendered
/// as their display text.
#[derive(Debug, Default, Serialize)]
pub struct Extraction {
    /// Deduplicated packages from every lister that ran
    pub inventory: Inventory,

    /// Packaging namespace, when a detector recognized the layer
    pub namespace: Option<Namespace>,

    /// Recoverable issues and lister-level failures, in occurrence order
    pub failures: Vec<ListerFailure>,

    pub stats: ExtractionStats,
}

impl Extraction {
    /// `true` when no lister reported any problem.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// A problem attributed to one lister.
#[derive(Debug, Serialize)]
pub struct ListerFailure {
    pub lister: String,
    pub kind: FailureKind,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// Recoverable issue; the lister's other records were kept.
    Issue(#[serde(serialize_with = "display_error")] ListError),
    /// The lister returned an error and contributed nothing.
    Failed(#[serde(serialize_with = "display_error")] ListError),
    /// The lister exceeded the pipeline timeout and contributed nothing.
    TimedOut { timeout_secs: u64 },
}

fn display_error<S: Serializer>(error: &ListError, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(error)
}

/// Statistics about one extraction call.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionStats {
    /// Listers that passed the gate and were invoked
    pub listers_run: usize,

    /// Listers skipped because their required files were absent
    pub listers_skipped: usize,

    /// Records returned by listers, duplicates included
    pub records_seen: usize,

    /// Records left after the dedup merge
    pub records_kept: usize,

    /// Wall time of the whole call (milliseconds)
    pub duration_ms: u64,
}

// ============================================================================
// Pipeline Errors
// ============================================================================

/// Fatal errors of an extraction call.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    /// Scratch storage could not be established
    #[error("Failed to create scratch directory under '{root}': {source}")]
    Scratch {
        root: String,
        #[source]
        source: std::io::Error,
    },

    /// A spawned extraction task panicked or was cancelled
    #[error("Extraction task for layer '{layer}' failed: {reason}")]
    Join { layer: String, reason: String },
}

// ============================================================================
// Pipeline
// ============================================================================

/// Orchestrates listers and namespace detectors over layer snapshots.
///
/// # Thread Safety
///
/// The pipeline holds no mutable state; share it behind an `Arc` to extract
/// many layers concurrently.
///
/// # Example
///
/// ```ignore
/// let pipeline = ExtractionPipeline::new(vec![Box::new(DpkgLister::new())])
///     .with_detector(Box::new(CondaNamespaceDetector::new()))
///     .with_timeout(Duration::from_secs(30));
///
/// let extraction = pipeline.extract(&snapshot).await?;
/// for record in extraction.inventory.iter() {
///     println!("{} {}", record.name(), record.version());
/// }
/// ```
pub struct ExtractionPipeline {
    listers: Vec<Box<dyn Lister>>,
    detectors: Vec<Box<dyn NamespaceDetector>>,

    /// Timeout for each lister (default: 5 minutes)
    lister_timeout: Duration,

    /// Parent directory for scratch storage (default: system temp dir)
    scratch_root: Option<PathBuf>,
}

impl ExtractionPipeline {
    /// Creates a pipeline running `listers` in the given order, with no
    /// namespace detectors.
    pub fn new(listers: Vec<Box<dyn Lister>>) -> Self {
        Self {
            listers,
            detectors: Vec::new(),
            lister_timeout: Duration::from_secs(300),
            scratch_root: None,
        }
    }

    /// Builds the lister and detector set enabled in `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration does not validate.
    pub fn from_config(config: &HarvesterConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut listers: Vec<Box<dyn Lister>> = Vec::new();
        let mut detectors: Vec<Box<dyn NamespaceDetector>> = Vec::new();

        if config.dpkg.enabled {
            listers.push(Box::new(DpkgLister::new()));
        }
        if config.conda.enabled {
            let lister =
                CondaMetaLister::with_root(&config.conda.root).map_err(|e| ConfigError::InvalidValue {
                    field: "conda.root".to_string(),
                    reason: e.to_string(),
                })?;
            listers.push(Box::new(lister));
            detectors.push(Box::new(CondaNamespaceDetector::with_root(&config.conda.root)));
        }
        if config.conda_list.enabled {
            let settings = &config.conda_list;
            let lister = CondaListLister::new(
                &settings.program,
                Duration::from_secs(settings.timeout_secs),
            )
            .default_environment(&settings.default_environment)
            .environments_prefix(&settings.environments_prefix)
            .extra_environments(settings.extra_environments.clone());
            listers.push(Box::new(lister));
        }

        let mut pipeline = Self::new(listers)
            .with_detectors(detectors)
            .with_timeout(Duration::from_secs(config.lister_timeout_secs));
        if let Some(root) = &config.scratch_root {
            pipeline = pipeline.with_scratch_root(root);
        }
        Ok(pipeline)
    }

    pub fn with_detectors(mut self, detectors: Vec<Box<dyn NamespaceDetector>>) -> Self {
        self.detectors = detectors;
        self
    }

    pub fn with_detector(mut self, detector: Box<dyn NamespaceDetector>) -> Self {
        self.detectors.push(detector);
        self
    }

    /// Sets the maximum time any single lister may take.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.lister_timeout = timeout;
        self
    }

    /// Creates scratch directories under `root` instead of the system temp dir.
    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(root.into());
        self
    }

    pub fn listers(&self) -> impl Iterator<Item = &(dyn Lister + 'static)> {
        self.listers.iter().map(|lister| lister.as_ref())
    }

    /// Every path pattern any lister or detector needs, so the unpacking side
    /// can ship only interesting files.
    pub fn required_patterns(&self) -> Vec<PathPattern> {
        self.listers
            .iter()
            .flat_map(|l| l.required_patterns().iter().cloned())
            .chain(
                self.detectors
                    .iter()
                    .flat_map(|d| d.required_patterns().iter().cloned()),
            )
            .collect()
    }

    /// Extracts the package inventory and namespace of one layer.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Scratch`] only when a selected lister needs
    /// scratch storage and it cannot be created. Every lister-level problem
    /// is reported in [`Extraction::failures`] instead.
    #[instrument(skip_all, fields(files = snapshot.len()))]
    pub async fn extract(&self, snapshot: &FileSnapshot) -> Result<Extraction, PipelineError> {
        let start = Instant::now();
        let mut stats = ExtractionStats::default();
        let mut failures = Vec::new();

        // ====================================================================
        // Gate
        // ====================================================================

        let mut selected: Vec<&dyn Lister> = Vec::new();
        for lister in self.listers() {
            let run = match lister.gating() {
                Gating::Always => true,
                Gating::Snapshot => should_run(lister.required_patterns(), snapshot),
            };
            if run {
                selected.push(lister);
            } else {
                debug!(lister = lister.name(), "Required files absent, skipping");
                stats.listers_skipped += 1;
            }
        }

        // Dropped at the end of this call on every path, including `?` and unwinding.
        let scratch = if selected.iter().any(|l| l.needs_scratch()) {
            Some(ScratchDir::create(self.scratch_root.as_deref())?)
        } else {
            None
        };

        // ====================================================================
        // List
        // ====================================================================

        let mut record_sets = Vec::with_capacity(selected.len());
        for lister in selected {
            let ctx = ListContext {
                files: snapshot.view(lister.required_patterns()),
                scratch: scratch.as_ref().map(ScratchDir::path),
            };
            info!(lister = lister.name(), files = ctx.files.len(), "Starting lister");
            stats.listers_run += 1;

            let outcome = if lister.bounds_own_runtime() {
                Ok(lister.list(&ctx).await)
            } else {
                timeout(self.lister_timeout, lister.list(&ctx)).await
            };
            match outcome {
                Ok(Ok(listing)) => {
                    stats.records_seen += listing.records.len();
                    failures.extend(listing.issues.into_iter().map(|issue| ListerFailure {
                        lister: lister.name().to_string(),
                        kind: FailureKind::Issue(issue),
                    }));
                    record_sets.push(listing.records);
                }
                Ok(Err(e)) => {
                    warn!(lister = lister.name(), error = %e, "Lister failed");
                    failures.push(ListerFailure {
                        lister: lister.name().to_string(),
                        kind: FailureKind::Failed(e),
                    });
                }
                Err(_) => {
                    warn!(
                        lister = lister.name(),
                        timeout_secs = self.lister_timeout.as_secs(),
                        "Lister timed out"
                    );
                    failures.push(ListerFailure {
                        lister: lister.name().to_string(),
                        kind: FailureKind::TimedOut {
                            timeout_secs: self.lister_timeout.as_secs(),
                        },
                    });
                }
            }
        }

        // ====================================================================
        // Merge + namespace
        // ====================================================================

        let inventory = merge(record_sets);
        stats.records_kept = inventory.len();
        let namespace = detect_namespace(&self.detectors, snapshot);
        stats.duration_ms = start.elapsed().as_millis() as u64;

        info!(
            packages = stats.records_kept,
            duplicates = stats.records_seen - stats.records_kept,
            failures = failures.len(),
            namespace = namespace.as_ref().map(|ns| ns.name.as_str()).unwrap_or("none"),
            duration_ms = stats.duration_ms,
            "Extraction completed"
        );

        Ok(Extraction {
            inventory,
            namespace,
            failures,
            stats,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
