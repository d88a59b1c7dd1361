//! Required-file gate.
//!
//! Every lister declares the path patterns it needs. The pipeline asks
//! [`should_run`] before invoking a lister: only snapshot keys are inspected,
//! never file contents, so skipping an irrelevant lister costs
//! `O(keys × patterns)`.

use regex::Regex;
use std::fmt;

use crate::model::FileSnapshot;

/// A path (or family of paths) a lister needs to find in a layer.
#[derive(Clone)]
pub enum PathPattern {
    /// Matches exactly one normalized path.
    Exact(String),
    /// Matches every path starting with the prefix.
    Prefix(String),
    /// Matches every path the regular expression finds a match in.
    Regex(Regex),
}

impl PathPattern {
    pub fn exact(path: impl Into<String>) -> Self {
        PathPattern::Exact(path.into())
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        PathPattern::Prefix(prefix.into())
    }

    /// Compiles `pattern` into a [`PathPattern::Regex`].
    ///
    /// # Errors
    ///
    /// Returns the compilation error for an invalid expression.
    pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
        Regex::new(pattern).map(PathPattern::Regex)
    }

    /// An empty path, prefix or expression would match nothing meaningful (or
    /// everything); such patterns never match.
    pub fn is_degenerate(&self) -> bool {
        match self {
            PathPattern::Exact(path) => path.is_empty(),
            PathPattern::Prefix(prefix) => prefix.is_empty(),
            PathPattern::Regex(re) => re.as_str().is_empty(),
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        if self.is_degenerate() {
            return false;
        }
        match self {
            PathPattern::Exact(exact) => path == exact,
            PathPattern::Prefix(prefix) => path.starts_with(prefix.as_str()),
            PathPattern::Regex(re) => re.is_match(path),
        }
    }
}

impl fmt::Debug for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathPattern::Exact(path) => write!(f, "Exact({path:?})"),
            PathPattern::Prefix(prefix) => write!(f, "Prefix({prefix:?})"),
            PathPattern::Regex(re) => write!(f, "Regex({:?})", re.as_str()),
        }
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathPattern::Exact(path) => f.write_str(path),
            PathPattern::Prefix(prefix) => write!(f, "{prefix}*"),
            PathPattern::Regex(re) => write!(f, "/{}/", re.as_str()),
        }
    }
}

/// How the pipeline decides whether a lister runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Gating {
    /// Run only when [`should_run`] finds a declared pattern in the snapshot.
    #[default]
    Snapshot,
    /// Run whenever the lister is configured; its patterns only select which
    /// files it gets to see.
    Always,
}

/// Returns `true` iff at least one pattern matches at least one snapshot key.
///
/// An empty pattern set, or one made only of degenerate patterns, never
/// matches.
pub fn should_run(patterns: &[PathPattern], snapshot: &FileSnapshot) -> bool {
    let live: Vec<&PathPattern> = patterns.iter().filter(|p| !p.is_degenerate()).collect();
    if live.is_empty() {
        return false;
    }

    // Exact paths are answered by a map lookup before scanning keys.
    let exact_hit = live.iter().any(|p| match p {
        PathPattern::Exact(path) => snapshot.contains(path),
        _ => false,
    });
    if exact_hit {
        return true;
    }

    snapshot
        .paths()
        .any(|path| live.iter().any(|p| p.matches(path)))
}
