use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use thiserror::Error;

use crate::harvest::gate::PathPattern;
use crate::harvest::version::{self, VersionError, VersionFormat};

/// Every file of one layer that some lister declared interest in, keyed by
/// normalized path (no leading `/` or `./`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSnapshot {
    files: BTreeMap<String, Vec<u8>>,
}

impl FileSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a file, replacing any previous content at the same normalized path.
    pub fn with_file(mut self, path: impl AsRef<str>, content: impl Into<Vec<u8>>) -> Self {
        self.files
            .insert(normalize_path(path.as_ref()), content.into());
        self
    }

    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.files.get(normalize_path(path).as_str()).map(Vec::as_slice)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(normalize_path(path).as_str())
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Borrows the entries whose path matches at least one of `patterns`.
    pub fn view(&self, patterns: &[PathPattern]) -> SnapshotView<'_> {
        let files = self
            .files
            .iter()
            .filter(|(path, _)| patterns.iter().any(|p| p.matches(path)))
            .map(|(path, content)| (path.as_str(), content.as_slice()))
            .collect();
        SnapshotView { files }
    }
}

impl<P, C> FromIterator<(P, C)> for FileSnapshot
where
    P: AsRef<str>,
    C: Into<Vec<u8>>,
{
    fn from_iter<I: IntoIterator<Item = (P, C)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Self::new(), |snapshot, (path, content)| {
                snapshot.with_file(path, content)
            })
    }
}

fn normalize_path(path: &str) -> String {
    let mut trimmed = path;
    loop {
        if let Some(rest) = trimmed.strip_prefix("./") {
            trimmed = rest;
        } else if let Some(rest) = trimmed.strip_prefix('/') {
            trimmed = rest;
        } else {
            break;
        }
    }
    trimmed.to_string()
}

/// Read-only subset of a [`FileSnapshot`] handed to a single lister.
#[derive(Debug, Clone, Default)]
pub struct SnapshotView<'a> {
    files: BTreeMap<&'a str, &'a [u8]>,
}

impl<'a> SnapshotView<'a> {
    pub fn get(&self, path: &str) -> Option<&'a [u8]> {
        self.files.get(path).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'a str, &'a [u8])> + '_ {
        self.files.iter().map(|(path, content)| (*path, *content))
    }

    pub fn paths(&self) -> impl Iterator<Item = &'a str> + '_ {
        self.files.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Why a record could not be materialized.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("package name is empty")]
    EmptyName,

    #[error(transparent)]
    InvalidVersion(#[from] VersionError),
}

/// Where a record's version information came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceOrigin {
    StatusLine,
    SourceLine,
    MetadataFile,
    CommandOutput,
}

/// One installed unit observed in a layer.
///
/// Identity is `(name, version)`: equality, ordering and hashing ignore
/// `origin`, which is provenance only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageRecord {
    name: String,
    version: String,
    origin: SourceOrigin,
}

impl PackageRecord {
    /// Explicit marker for a package whose version could not be determined.
    pub const UNKNOWN_VERSION: &'static str = "unknown";

    /// Materializes a record, rejecting empty fields and versions that are not
    /// valid for `format`.
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        origin: SourceOrigin,
        format: VersionFormat,
    ) -> Result<Self, RecordError> {
        let name = name.into().trim().to_string();
        let version = version.into();
        if name.is_empty() {
            return Err(RecordError::EmptyName);
        }
        if version != Self::UNKNOWN_VERSION {
            version::validate(format, &version)?;
        }
        Ok(Self {
            name,
            version,
            origin,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn origin(&self) -> SourceOrigin {
        self.origin
    }

    pub fn key(&self) -> InventoryKey {
        InventoryKey::new(&self.name, &self.version)
    }
}

impl PartialEq for PackageRecord {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.version == other.version
    }
}

impl Eq for PackageRecord {}

impl Hash for PackageRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.version.hash(state);
    }
}

impl PartialOrd for PackageRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PackageRecord {
    fn cmp(&self, other: &Self) -> Ordering {
        (&self.name, &self.version).cmp(&(&other.name, &other.version))
    }
}

/// Dedup identity of a record: `name#version`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InventoryKey(String);

impl InventoryKey {
    pub const SEPARATOR: char = '#';

    pub fn new(name: &str, version: &str) -> Self {
        Self(format!("{name}{}{version}", Self::SEPARATOR))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InventoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Packaging ecosystem a layer belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    pub name: String,
    pub version_format: String,
}
