//! Syntactic version validation per packaging ecosystem.
//!
//! Listers call [`validate`] before materializing a record so that garbage in
//! one field is skipped without aborting the rest of the scan. Validation is
//! purely syntactic: no ordering or comparison is implied.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Version grammar a raw version string is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionFormat {
    /// Debian `[epoch:]upstream[-revision]`
    Dpkg,
    /// Conda / PEP 440-like `[epoch!]version[+local]`
    Conda,
}

impl VersionFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionFormat::Dpkg => "dpkg",
            VersionFormat::Conda => "conda",
        }
    }
}

impl fmt::Display for VersionFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a version string was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("version string is empty")]
    Empty,

    #[error("version '{0}' contains whitespace")]
    Whitespace(String),

    #[error("version '{version}' has an invalid epoch")]
    InvalidEpoch { version: String },

    #[error("version '{version}' has an invalid upstream part: {reason}")]
    InvalidUpstream { version: String, reason: String },

    #[error("version '{version}' has an invalid revision")]
    InvalidRevision { version: String },

    #[error("version '{version}' contains invalid character '{found}'")]
    InvalidCharacter { version: String, found: char },
}

/// Checks that `raw` is a syntactically valid version for `format`.
pub fn validate(format: VersionFormat, raw: &str) -> Result<(), VersionError> {
    if raw.is_empty() {
        return Err(VersionError::Empty);
    }
    if raw.chars().any(char::is_whitespace) {
        return Err(VersionError::Whitespace(raw.to_string()));
    }
    match format {
        VersionFormat::Dpkg => validate_dpkg(raw),
        VersionFormat::Conda => validate_conda(raw),
    }
}

fn validate_dpkg(raw: &str) -> Result<(), VersionError> {
    let (epoch, rest) = match raw.split_once(':') {
        Some((epoch, rest)) => (Some(epoch), rest),
        None => (None, raw),
    };

    if let Some(epoch) = epoch {
        if epoch.is_empty() || epoch.parse::<u32>().is_err() {
            return Err(VersionError::InvalidEpoch {
                version: raw.to_string(),
            });
        }
    }

    let (upstream, revision) = match rest.rsplit_once('-') {
        Some((upstream, revision)) => (upstream, Some(revision)),
        None => (rest, None),
    };

    if let Some(revision) = revision {
        let valid = !revision.is_empty()
            && revision
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '.' | '~'));
        if !valid {
            return Err(VersionError::InvalidRevision {
                version: raw.to_string(),
            });
        }
    }

    match upstream.chars().next() {
        None => {
            return Err(VersionError::InvalidUpstream {
                version: raw.to_string(),
                reason: "empty".to_string(),
            })
        }
        Some(first) if !first.is_ascii_digit() => {
            return Err(VersionError::InvalidUpstream {
                version: raw.to_string(),
                reason: "must start with a digit".to_string(),
            })
        }
        Some(_) => {}
    }

    // '-' is only legal because a revision was split off, ':' only after an epoch.
    if let Some(found) = upstream.chars().find(|&c| {
        !(c.is_ascii_alphanumeric()
            || matches!(c, '.' | '+' | '~' | '-')
            || (c == ':' && epoch.is_some()))
    }) {
        return Err(VersionError::InvalidCharacter {
            version: raw.to_string(),
            found,
        });
    }

    Ok(())
}

fn validate_conda(raw: &str) -> Result<(), VersionError> {
    if let Some(found) = raw
        .chars()
        .find(|&c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '+' | '!' | '*')))
    {
        return Err(VersionError::InvalidCharacter {
            version: raw.to_string(),
            found,
        });
    }

    let (epoch, rest) = match raw.split_once('!') {
        Some((epoch, rest)) => (Some(epoch), rest),
        None => (None, raw),
    };
    if let Some(epoch) = epoch {
        if epoch.is_empty() || !epoch.chars().all(|c| c.is_ascii_digit()) || rest.contains('!') {
            return Err(VersionError::InvalidEpoch {
                version: raw.to_string(),
            });
        }
    }

    let mut parts = rest.splitn(2, '+');
    let public = parts.next().unwrap_or_default();
    let local = parts.next();

    for segment in std::iter::once(public).chain(local) {
        let empty_component = segment
            .split(['.', '_', '-'])
            .any(|component| component.is_empty());
        if empty_component || segment.contains('+') {
            return Err(VersionError::InvalidUpstream {
                version: raw.to_string(),
                reason: "empty version component".to_string(),
            });
        }
    }

    Ok(())
}
