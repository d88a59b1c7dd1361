use crate::harvest::gate::{Gating, PathPattern};
use crate::model::{FileSnapshot, Namespace, PackageRecord, RecordError, SnapshotView};
use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;
use tracing::warn;

/// Recoverable failure at the smallest granularity a lister can isolate:
/// one record, one manifest file or one environment.
#[derive(Error, Debug)]
pub enum ListError {
    #[error("invalid record at {location}: {source}")]
    InvalidRecord {
        location: String,
        #[source]
        source: RecordError,
    },
    #[error("malformed manifest {path}: {reason}")]
    MalformedManifest { path: String, reason: String },
    #[error("malformed output for environment '{environment}': {reason}")]
    MalformedOutput { environment: String, reason: String },
    #[error("inventory command failed for environment '{environment}': {reason}")]
    CommandFailed { environment: String, reason: String },
    #[error("inventory command for environment '{environment}' timed out after {timeout_secs}s")]
    CommandTimeout {
        environment: String,
        timeout_secs: u64,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Records produced by one lister plus every issue it recovered from.
#[derive(Debug, Default)]
pub struct Listing {
    pub records: Vec<PackageRecord>,
    pub issues: Vec<ListError>,
}

impl Listing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: PackageRecord) {
        self.records.push(record);
    }

    /// Logs a recoverable issue and keeps it for the caller.
    pub fn report(&mut self, issue: ListError) {
        warn!(error = %issue, "Skipping unusable input");
        self.issues.push(issue);
    }

    /// Folds another listing into this one, preserving order.
    pub fn absorb(&mut self, other: Listing) {
        self.records.extend(other.records);
        self.issues.extend(other.issues);
    }
}

/// What a lister gets to see during one extraction call.
#[derive(Debug)]
pub struct ListContext<'a> {
    /// Snapshot entries matching the lister's required patterns.
    pub files: SnapshotView<'a>,
    /// Private scratch directory, present when the lister asked for one.
    pub scratch: Option<&'a Path>,
}

/// A format-specific package lister.
///
/// Implementations are registered explicitly with the pipeline; adding a new
/// package format means adding one implementation of this trait.
#[async_trait]
pub trait Lister: Send + Sync {
    /// Identifier used in logs and failure reports (e.g. "dpkg").
    fn name(&self) -> &str;

    /// Paths this lister needs; used for gating and to build its view.
    fn required_patterns(&self) -> &[PathPattern];

    fn gating(&self) -> Gating {
        Gating::Snapshot
    }

    /// Whether the pipeline must provision scratch storage before calling
    /// [`Lister::list`].
    fn needs_scratch(&self) -> bool {
        false
    }

    /// Whether the lister enforces its own time limits (one per external
    /// invocation). The pipeline does not wrap such listers in its per-lister
    /// timeout, so records and issues gathered before a slow invocation are
    /// returned.
    fn bounds_own_runtime(&self) -> bool {
        false
    }

    /// Lists the packages visible in `ctx`.
    ///
    /// Per-record problems belong in [`Listing::issues`]; `Err` means the
    /// whole lister failed and contributes nothing.
    async fn list(&self, ctx: &ListContext<'_>) -> Result<Listing, ListError>;
}

/// Identifies the packaging namespace of a layer from signature files.
pub trait NamespaceDetector: Send + Sync {
    fn name(&self) -> &str;

    fn required_patterns(&self) -> &[PathPattern];

    /// Returns `None` when the signature is absent, a normal outcome.
    fn detect(&self, snapshot: &FileSnapshot) -> Option<Namespace>;
}
