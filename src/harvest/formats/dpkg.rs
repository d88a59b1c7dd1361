//! Lister for the Debian `dpkg` status database.
//!
//! The status file is a sequence of blank-line separated stanzas. Only three
//! fields matter for the inventory:
//!
//! ```text
//! Package: libssl3
//! Source: openssl (3.0.11-1~deb12u2)
//! Version: 3.0.11-1~deb12u2
//! ```
//!
//! A version carried by the `Source:` line takes precedence over the
//! `Version:` field: Debian advisories are keyed on source packages, and the
//! binary version often drops the epoch or carries a `+bN` rebuild suffix.

use async_trait::async_trait;
use regex::Regex;
use std::sync::LazyLock;
use tracing::{debug, info};

use crate::harvest::gate::PathPattern;
use crate::harvest::version::{self, VersionFormat};
use crate::model::{PackageRecord, RecordError, SourceOrigin};
use crate::traits::{ListContext, ListError, Lister, Listing};

/// Location of the status database inside a layer.
pub const STATUS_PATH: &str = "var/lib/dpkg/status";

static SOURCE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Source: (?P<name>\S*)( \((?P<version>.*)\))?").expect("valid source regex")
});

/// Lists packages from `var/lib/dpkg/status`.
#[derive(Debug, Clone)]
pub struct DpkgLister {
    patterns: Vec<PathPattern>,
}

impl DpkgLister {
    pub fn new() -> Self {
        Self {
            patterns: vec![PathPattern::exact(STATUS_PATH)],
        }
    }
}

impl Default for DpkgLister {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Lister for DpkgLister {
    fn name(&self) -> &str {
        "dpkg"
    }

    fn required_patterns(&self) -> &[PathPattern] {
        &self.patterns
    }

    async fn list(&self, ctx: &ListContext<'_>) -> Result<Listing, ListError> {
        let Some(content) = ctx.files.get(STATUS_PATH) else {
            debug!("No dpkg status file in view");
            return Ok(Listing::new());
        };

        let text = String::from_utf8_lossy(content);
        let listing = parse_status(&text, STATUS_PATH);
        info!(
            records = listing.records.len(),
            issues = listing.issues.len(),
            "Parsed dpkg status file"
        );
        Ok(listing)
    }
}

/// In-progress stanza. Both fields are cleared after every commit.
#[derive(Default)]
struct Pending {
    name: String,
    version: Option<(String, SourceOrigin)>,
}

impl Pending {
    fn reset(&mut self) {
        self.name.clear();
        self.version = None;
    }
}

/// Parses the text of a status file.
///
/// `path` is only used to locate issues (`path:line`). Records are emitted as
/// soon as a name and a version are both known, so a stanza that completes
/// before its terminating blank line is still captured. Partial stanzas are
/// dropped at the next blank line or `Package:` line.
pub fn parse_status(text: &str, path: &str) -> Listing {
    let mut listing = Listing::new();
    let mut pending = Pending::default();

    for (index, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim_end_matches('\r');
        let location = || format!("{path}:{}", index + 1);

        if let Some(rest) = line.strip_prefix("Package: ") {
            pending.name = rest.trim().to_string();
            pending.version = None;
        } else if line.starts_with("Source: ") {
            if let Some(captures) = SOURCE_LINE.captures(line) {
                pending.name = captures
                    .name("name")
                    .map(|m| m.as_str().trim().to_string())
                    .unwrap_or_default();

                let source_version = captures
                    .name("version")
                    .map(|m| m.as_str().trim())
                    .filter(|v| !v.is_empty());
                if let Some(candidate) = source_version {
                    match version::validate(VersionFormat::Dpkg, candidate) {
                        Ok(()) => {
                            pending.version = Some((candidate.to_string(), SourceOrigin::SourceLine))
                        }
                        Err(e) => listing.report(ListError::InvalidRecord {
                            location: location(),
                            source: RecordError::InvalidVersion(e),
                        }),
                    }
                }
            }
        } else if let Some(rest) = line.strip_prefix("Version: ") {
            if pending.version.is_none() {
                let candidate = rest.trim();
                match version::validate(VersionFormat::Dpkg, candidate) {
                    Ok(()) => {
                        pending.version = Some((candidate.to_string(), SourceOrigin::StatusLine))
                    }
                    Err(e) => listing.report(ListError::InvalidRecord {
                        location: location(),
                        source: RecordError::InvalidVersion(e),
                    }),
                }
            }
        } else if line.is_empty() {
            pending.reset();
        }

        if pending.name.is_empty() {
            continue;
        }
        if let Some((version, origin)) = pending.version.take() {
            let name = std::mem::take(&mut pending.name);
            match PackageRecord::new(name, version, origin, VersionFormat::Dpkg) {
                Ok(record) => listing.push(record),
                Err(source) => listing.report(ListError::InvalidRecord {
                    location: location(),
                    source,
                }),
            }
            pending.reset();
        }
    }

    listing
}
