//! Harvester configuration.
//!
//! [`HarvesterConfig`] selects which listers a pipeline runs and tunes
//! timeouts, concurrency and scratch placement. It is read from TOML; every
//! field has a default so an empty file is a valid configuration.
//!
//! ```toml
//! lister_timeout_secs = 120
//! max_concurrent_layers = 8
//!
//! [conda]
//! root = "opt/miniconda3"
//!
//! [conda_list]
//! enabled = true
//! program = "/usr/local/bin/conda"
//! extra_environments = ["analytics"]
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

use crate::harvest::formats::conda_list::{
    DEFAULT_ENVIRONMENT, DEFAULT_ENVIRONMENTS_PREFIX, DEFAULT_PROGRAM,
};
use crate::harvest::formats::conda_meta::DEFAULT_ROOT;

const ENV_PREFIX: &str = "LAYER_HARVEST_";

/// Configuration loading and validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: String },

    #[error("failed to read config '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {reason}")]
    ParseFailed { reason: String },

    #[error("invalid config value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvesterConfig {
    /// Maximum time a single lister may run (seconds)
    pub lister_timeout_secs: u64,
    /// Layers extracted concurrently by the executor
    pub max_concurrent_layers: usize,
    /// Parent directory for scratch storage; system temp dir when unset
    pub scratch_root: Option<PathBuf>,

    pub dpkg: DpkgConfig,
    pub conda: CondaConfig,
    pub conda_list: CondaListConfig,
}

impl Default for HarvesterConfig {
    fn default() -> Self {
        Self {
            lister_timeout_secs: 300,
            max_concurrent_layers: 4,
            scratch_root: None,
            dpkg: DpkgConfig::default(),
            conda: CondaConfig::default(),
            conda_list: CondaListConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DpkgConfig {
    pub enabled: bool,
}

impl Default for DpkgConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Manifest lister and namespace detection for a conda installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CondaConfig {
    pub enabled: bool,
    /// Install root inside the layer, without leading slash
    pub root: String,
}

impl Default for CondaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root: DEFAULT_ROOT.to_owned(),
        }
    }
}

/// The `conda list --json` lister. Off by default since it runs an
/// external program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CondaListConfig {
    pub enabled: bool,
    pub program: String,
    /// Environment that is always queried
    pub default_environment: String,
    /// Snapshot prefix under which named environments are discovered
    pub environments_prefix: String,
    /// Environments queried even when absent from the snapshot
    pub extra_environments: Vec<String>,
    /// Timeout of one command invocation (seconds)
    pub timeout_secs: u64,
}

impl Default for CondaListConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            program: DEFAULT_PROGRAM.to_owned(),
            default_environment: DEFAULT_ENVIRONMENT.to_owned(),
            environments_prefix: DEFAULT_ENVIRONMENTS_PREFIX.to_owned(),
            extra_environments: Vec::new(),
            timeout_secs: 60,
        }
    }
}

impl HarvesterConfig {
    /// Loads a TOML file, applies `LAYER_HARVEST_*` environment overrides and
    /// validates the result.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                ConfigError::Io {
                    path: path.display().to_string(),
                    source: e,
                }
            }
        })?;

        let mut config = Self::parse(&content)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config = Self::parse(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    fn parse(toml_str: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml_str).map_err(|e| ConfigError::ParseFailed {
            reason: e.to_string(),
        })
    }

    /// Overrides fields from `lookup`, keyed `LAYER_HARVEST_{SECTION}_{FIELD}`.
    ///
    /// Only scalar fields are covered. A value that does not parse is an
    /// error rather than being silently ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |field: &str| lookup(&format!("{ENV_PREFIX}{}", field.to_uppercase()));

        if let Some(v) = var("lister_timeout_secs") {
            self.lister_timeout_secs = parse_override("lister_timeout_secs", &v)?;
        }
        if let Some(v) = var("max_concurrent_layers") {
            self.max_concurrent_layers = parse_override("max_concurrent_layers", &v)?;
        }
        if let Some(v) = var("scratch_root") {
            self.scratch_root = Some(PathBuf::from(v));
        }
        if let Some(v) = var("dpkg_enabled") {
            self.dpkg.enabled = parse_override("dpkg.enabled", &v)?;
        }
        if let Some(v) = var("conda_enabled") {
            self.conda.enabled = parse_override("conda.enabled", &v)?;
        }
        if let Some(v) = var("conda_root") {
            self.conda.root = v;
        }
        if let Some(v) = var("conda_list_enabled") {
            self.conda_list.enabled = parse_override("conda_list.enabled", &v)?;
        }
        if let Some(v) = var("conda_list_program") {
            self.conda_list.program = v;
        }
        if let Some(v) = var("conda_list_timeout_secs") {
            self.conda_list.timeout_secs = parse_override("conda_list.timeout_secs", &v)?;
        }
        Ok(())
    }

    /// Checks field values.
    ///
    /// # Rules
    ///
    /// - `lister_timeout_secs`, `max_concurrent_layers`, `conda_list.timeout_secs`: non-zero
    /// - `conda.root`, `conda_list.program`, `conda_list.default_environment`: non-empty
    /// - layer-relative paths and environment names: no `..` component
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lister_timeout_secs == 0 {
            return Err(invalid("lister_timeout_secs", "must be greater than 0"));
        }
        if self.max_concurrent_layers == 0 {
            return Err(invalid("max_concurrent_layers", "must be greater than 0"));
        }

        if self.conda.enabled {
            require_relative("conda.root", &self.conda.root)?;
        }

        if self.conda_list.enabled {
            let settings = &self.conda_list;
            if settings.timeout_secs == 0 {
                return Err(invalid("conda_list.timeout_secs", "must be greater than 0"));
            }
            if settings.program.trim().is_empty() {
                return Err(invalid("conda_list.program", "must not be empty"));
            }
            require_environment("conda_list.default_environment", &settings.default_environment)?;
            require_relative("conda_list.environments_prefix", &settings.environments_prefix)?;
            for environment in &settings.extra_environments {
                require_environment("conda_list.extra_environments", environment)?;
            }
        }

        Ok(())
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_owned(),
        reason: reason.into(),
    }
}

fn parse_override<T: std::str::FromStr>(field: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(field, format!("cannot parse override value '{value}'")))
}

fn has_parent_component(path: &str) -> bool {
    Path::new(path)
        .components()
        .any(|c| c == Component::ParentDir)
}

fn require_relative(field: &str, path: &str) -> Result<(), ConfigError> {
    if path.trim_matches('/').is_empty() {
        return Err(invalid(field, "must not be empty"));
    }
    if has_parent_component(path) {
        return Err(invalid(
            field,
            format!("'{path}' contains path traversal pattern '..'"),
        ));
    }
    Ok(())
}

fn require_environment(field: &str, name: &str) -> Result<(), ConfigError> {
    if name.trim().is_empty() {
        return Err(invalid(field, "environment name must not be empty"));
    }
    if name.starts_with('-') {
        return Err(invalid(field, format!("environment '{name}' must not start with '-'")));
    }
    if has_parent_component(name) || name.contains('/') {
        return Err(invalid(field, format!("environment '{name}' is not a plain name")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_is_valid() {
        let config = HarvesterConfig::default();
        config.validate().unwrap();
        assert_eq!(config.lister_timeout_secs, 300);
        assert_eq!(config.max_concurrent_layers, 4);
        assert!(config.dpkg.enabled);
        assert!(config.conda.enabled);
        assert!(!config.conda_list.enabled);
        assert_eq!(config.conda.root, "opt/conda");
        assert_eq!(config.conda_list.environments_prefix, "opt/conda/envs/");
    }

    #[test]
    fn empty_document_yields_defaults() {
        let config = HarvesterConfig::from_toml_str("").unwrap();
        assert_eq!(config, HarvesterConfig::default());
    }

    #[test]
    fn partial_document_keeps_other_defaults() {
        let config = HarvesterConfig::from_toml_str(
            r#"
lister_timeout_secs = 30

[conda_list]
enabled = true
extra_environments = ["analytics", "ml"]
"#,
        )
        .unwrap();

        assert_eq!(config.lister_timeout_secs, 30);
        assert_eq!(config.max_concurrent_layers, 4);
        assert!(config.conda_list.enabled);
        assert_eq!(config.conda_list.program, "conda");
        assert_eq!(config.conda_list.extra_environments, vec!["analytics", "ml"]);
    }

    #[test]
    fn parse_error_is_reported() {
        let err = HarvesterConfig::from_toml_str("lister_timeout_secs = \"soon\"").unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed { .. }));
    }

    #[test]
    fn zero_values_are_rejected() {
        let err = HarvesterConfig::from_toml_str("max_concurrent_layers = 0").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { ref field, .. } if field == "max_concurrent_layers"
        ));

        let mut config = HarvesterConfig::default();
        config.lister_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = HarvesterConfig::default();
        config.conda_list.enabled = true;
        config.conda_list.timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn traversal_and_empty_values_are_rejected() {
        let mut config = HarvesterConfig::default();
        config.conda.root = "opt/../etc".to_owned();
        assert!(config.validate().is_err());

        let mut config = HarvesterConfig::default();
        config.conda.root = "/".to_owned();
        assert!(config.validate().is_err());

        let mut config = HarvesterConfig::default();
        config.conda_list.enabled = true;
        config.conda_list.program = "  ".to_owned();
        assert!(config.validate().is_err());

        let mut config = HarvesterConfig::default();
        config.conda_list.enabled = true;
        config.conda_list.extra_environments = vec!["..".to_owned()];
        assert!(config.validate().is_err());

        let mut config = HarvesterConfig::default();
        config.conda_list.enabled = true;
        config.conda_list.default_environment = "--help".to_owned();
        assert!(config.validate().is_err());
    }

    #[test]
    fn disabled_sections_are_not_validated() {
        let mut config = HarvesterConfig::default();
        config.conda_list.program = String::new();
        config.validate().unwrap();
    }

    #[test]
    fn overrides_replace_scalar_fields() {
        let vars: HashMap<&str, &str> = [
            ("LAYER_HARVEST_LISTER_TIMEOUT_SECS", "45"),
            ("LAYER_HARVEST_CONDA_LIST_ENABLED", "true"),
            ("LAYER_HARVEST_CONDA_LIST_PROGRAM", "/opt/bin/mamba"),
            ("LAYER_HARVEST_SCRATCH_ROOT", "/var/tmp/harvest"),
        ]
        .into_iter()
        .collect();

        let mut config = HarvesterConfig::default();
        config
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.lister_timeout_secs, 45);
        assert!(config.conda_list.enabled);
        assert_eq!(config.conda_list.program, "/opt/bin/mamba");
        assert_eq!(config.scratch_root, Some(PathBuf::from("/var/tmp/harvest")));
        assert_eq!(config.max_concurrent_layers, 4);
    }

    #[test]
    fn unparsable_override_is_an_error() {
        let mut config = HarvesterConfig::default();
        let err = config
            .apply_overrides(|key| {
                (key == "LAYER_HARVEST_MAX_CONCURRENT_LAYERS").then(|| "many".to_string())
            })
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[tokio::test]
    async fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harvester.toml");
        std::fs::write(&path, "[dpkg]\nenabled = false\n").unwrap();

        let config = HarvesterConfig::load(&path).await.unwrap();
        assert!(!config.dpkg.enabled);
    }

    #[tokio::test]
    async fn load_missing_file() {
        let err = HarvesterConfig::load("/nonexistent/harvester.toml")
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }
}
