//! Lister backed by the `conda list` command.
//!
//! Instead of reading manifests, this lister asks an already-installed conda
//! binary for the inventory of each environment:
//!
//! ```text
//! conda list --json -n <environment>
//! ```
//!
//! and expects a JSON array of objects carrying at least `name` and
//! `version`. Environments are the configured default, every
//! `<environments_prefix><name>/` directory seen in the snapshot, and any
//! configured extras. Each invocation is isolated: a failing, hanging or
//! garbled environment is reported and the others still contribute.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, instrument};

use crate::harvest::gate::{Gating, PathPattern};
use crate::harvest::version::VersionFormat;
use crate::model::{PackageRecord, SnapshotView, SourceOrigin};
use crate::traits::{ListContext, ListError, Lister, Listing};

pub const DEFAULT_PROGRAM: &str = "conda";
pub const DEFAULT_ENVIRONMENT: &str = "base";
pub const DEFAULT_ENVIRONMENTS_PREFIX: &str = "opt/conda/envs/";

/// Runs the inventory query for one environment and returns its stdout.
#[async_trait]
pub trait InventoryCommand: Send + Sync {
    /// Whether [`InventoryCommand::run`] wants a private working directory.
    fn needs_workdir(&self) -> bool {
        false
    }

    /// # Errors
    ///
    /// Returns [`ListError::CommandFailed`] or [`ListError::CommandTimeout`];
    /// both are recoverable for the calling lister.
    async fn run(&self, environment: &str, workdir: Option<&Path>) -> Result<Vec<u8>, ListError>;
}

/// Spawns the real executable with a per-invocation timeout.
#[derive(Debug, Clone)]
pub struct ProcessCommand {
    program: PathBuf,
    timeout: Duration,
}

impl ProcessCommand {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

#[async_trait]
impl InventoryCommand for ProcessCommand {
    fn needs_workdir(&self) -> bool {
        true
    }

    #[instrument(skip(self, workdir))]
    async fn run(&self, environment: &str, workdir: Option<&Path>) -> Result<Vec<u8>, ListError> {
        let mut command = Command::new(&self.program);
        command
            .args(["list", "--json", "-n", environment])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Keep the tool away from the invoking user's ~/.condarc.
        if let Some(dir) = workdir {
            command.current_dir(dir).env("HOME", dir);
        }

        let output = match timeout(self.timeout, command.output()).await {
            Err(_) => {
                return Err(ListError::CommandTimeout {
                    environment: environment.to_string(),
                    timeout_secs: self.timeout.as_secs(),
                })
            }
            Ok(Err(e)) => {
                return Err(ListError::CommandFailed {
                    environment: environment.to_string(),
                    reason: format!("failed to spawn '{}': {}", self.program.display(), e),
                })
            }
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ListError::CommandFailed {
                environment: environment.to_string(),
                reason: format!("exit code {}: {}", code, stderr.trim()),
            });
        }

        debug!(bytes = output.stdout.len(), "Inventory command finished");
        Ok(output.stdout)
    }
}

#[derive(Debug, Deserialize)]
struct ListEntry {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    version: Option<String>,
}

/// Lists packages by querying every discovered environment.
#[derive(Debug, Clone)]
pub struct CondaListLister<C = ProcessCommand> {
    command: C,
    default_environment: String,
    environments_prefix: String,
    extra_environments: Vec<String>,
    patterns: Vec<PathPattern>,
}

impl CondaListLister<ProcessCommand> {
    /// Lister spawning `program` with `invocation_timeout` per environment.
    pub fn new(program: impl Into<PathBuf>, invocation_timeout: Duration) -> Self {
        Self::with_command(ProcessCommand::new(program, invocation_timeout))
    }
}

impl<C: InventoryCommand> CondaListLister<C> {
    pub fn with_command(command: C) -> Self {
        Self {
            command,
            default_environment: DEFAULT_ENVIRONMENT.to_string(),
            environments_prefix: DEFAULT_ENVIRONMENTS_PREFIX.to_string(),
            extra_environments: Vec::new(),
            patterns: vec![PathPattern::prefix(DEFAULT_ENVIRONMENTS_PREFIX)],
        }
    }

    pub fn default_environment(mut self, environment: impl Into<String>) -> Self {
        self.default_environment = environment.into();
        self
    }

    /// Snapshot prefix below which each directory names an environment.
    pub fn environments_prefix(mut self, prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into().trim_start_matches('/').to_string();
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }
        self.patterns = vec![PathPattern::prefix(prefix.clone())];
        self.environments_prefix = prefix;
        self
    }

    pub fn extra_environments(mut self, environments: Vec<String>) -> Self {
        self.extra_environments = environments;
        self
    }

    /// Environments to query, in invocation order: the default, then those
    /// discovered in `files` (sorted), then the configured extras.
    pub fn environments(&self, files: &SnapshotView<'_>) -> Vec<String> {
        let discovered: BTreeSet<&str> = files
            .paths()
            .filter_map(|path| path.strip_prefix(self.environments_prefix.as_str()))
            .filter_map(|rest| rest.split_once('/').map(|(env, _)| env))
            .filter(|env| !env.is_empty())
            .collect();

        let mut environments: Vec<String> = Vec::new();
        let candidates = std::iter::once(self.default_environment.as_str())
            .chain(discovered)
            .chain(self.extra_environments.iter().map(String::as_str));
        for env in candidates {
            // A leading '-' would be parsed as a flag by the tool.
            if env.is_empty() || env.starts_with('-') {
                debug!(environment = env, "Ignoring unusable environment name");
                continue;
            }
            if !environments.iter().any(|known| known == env) {
                environments.push(env.to_string());
            }
        }
        environments
    }
}

#[async_trait]
impl<C: InventoryCommand> Lister for CondaListLister<C> {
    fn name(&self) -> &str {
        "conda-list"
    }

    fn required_patterns(&self) -> &[PathPattern] {
        &self.patterns
    }

    fn gating(&self) -> Gating {
        Gating::Always
    }

    fn needs_scratch(&self) -> bool {
        self.command.needs_workdir()
    }

    fn bounds_own_runtime(&self) -> bool {
        true
    }

    async fn list(&self, ctx: &ListContext<'_>) -> Result<Listing, ListError> {
        let mut listing = Listing::new();
        let environments = self.environments(&ctx.files);

        for environment in &environments {
            match self.command.run(environment, ctx.scratch).await {
                Ok(stdout) => listing.absorb(parse_list_output(environment, &stdout)),
                Err(e) => listing.report(e),
            }
        }

        info!(
            environments = environments.len(),
            records = listing.records.len(),
            issues = listing.issues.len(),
            "Queried conda environments"
        );
        Ok(listing)
    }
}

/// Parses the JSON array printed by `conda list --json`.
///
/// Unusable elements are reported one by one; the rest are kept.
pub fn parse_list_output(environment: &str, stdout: &[u8]) -> Listing {
    let mut listing = Listing::new();

    let elements: Vec<serde_json::Value> = match serde_json::from_slice(stdout) {
        Ok(elements) => elements,
        Err(e) => {
            listing.report(ListError::MalformedOutput {
                environment: environment.to_string(),
                reason: e.to_string(),
            });
            return listing;
        }
    };

    for (index, element) in elements.into_iter().enumerate() {
        let entry = match serde_json::from_value::<ListEntry>(element) {
            Ok(entry) => entry,
            Err(e) => {
                listing.report(ListError::MalformedOutput {
                    environment: environment.to_string(),
                    reason: format!("element {index}: {e}"),
                });
                continue;
            }
        };

        let (Some(name), Some(version)) = (entry.name, entry.version) else {
            listing.report(ListError::MalformedOutput {
                environment: environment.to_string(),
                reason: format!("element {index}: missing `name` or `version`"),
            });
            continue;
        };

        match PackageRecord::new(name, version, SourceOrigin::CommandOutput, VersionFormat::Conda)
        {
            Ok(record) => listing.push(record),
            Err(source) => listing.report(ListError::InvalidRecord {
                location: format!("{environment}[{index}]"),
                source,
            }),
        }
    }

    listing
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FileSnapshot;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Replays canned results per environment and records invocations.
    #[derive(Default)]
    struct MockCommand {
        responses: HashMap<String, Result<String, String>>,
        calls: Mutex<Vec<String>>,
    }

    impl MockCommand {
        fn respond(mut self, environment: &str, stdout: &str) -> Self {
            self.responses
                .insert(environment.to_string(), Ok(stdout.to_string()));
            self
        }

        fn fail(mut self, environment: &str, reason: &str) -> Self {
            self.responses
                .insert(environment.to_string(), Err(reason.to_string()));
            self
        }
    }

    #[async_trait]
    impl InventoryCommand for MockCommand {
        async fn run(
            &self,
            environment: &str,
            _workdir: Option<&Path>,
        ) -> Result<Vec<u8>, ListError> {
            self.calls.lock().unwrap().push(environment.to_string());
            match self.responses.get(environment) {
                Some(Ok(stdout)) => Ok(stdout.clone().into_bytes()),
                Some(Err(reason)) => Err(ListError::CommandFailed {
                    environment: environment.to_string(),
                    reason: reason.clone(),
                }),
                None => Err(ListError::CommandFailed {
                    environment: environment.to_string(),
                    reason: "EnvironmentLocationNotFound".to_string(),
                }),
            }
        }
    }

    const BASE: &str = r#"[
      {"base_url": "https://repo.anaconda.com/pkgs/main", "build_number": 0,
       "build_string": "py311h06a4308_0", "channel": "pkgs/main",
       "dist_name": "pip-23.3.1-py311h06a4308_0", "name": "pip",
       "platform": "linux-64", "version": "23.3.1"},
      {"name": "python", "version": "3.11.5", "channel": "pkgs/main"}
    ]"#;

    const ML: &str = r#"[{"name": "numpy", "version": "1.26.4"}, {"name": "pip", "version": "23.3.1"}]"#;

    fn snapshot() -> FileSnapshot {
        FileSnapshot::new()
            .with_file("opt/conda/envs/ml/conda-meta/history", "")
            .with_file("opt/conda/envs/broken/conda-meta/history", "")
            .with_file("opt/conda/envs/README", "not an environment")
    }

    #[test]
    fn environments_are_default_then_discovered_then_extras() {
        let lister = CondaListLister::with_command(MockCommand::default())
            .extra_environments(vec!["tools".to_string(), "ml".to_string()]);
        let snapshot = snapshot();
        let view = snapshot.view(lister.required_patterns());

        assert_eq!(
            lister.environments(&view),
            vec!["base", "broken", "ml", "tools"]
        );
    }

    #[test]
    fn environment_names_that_look_like_flags_are_ignored() {
        let lister = CondaListLister::with_command(MockCommand::default());
        let snapshot = FileSnapshot::new().with_file("opt/conda/envs/--help/x", "");
        let view = snapshot.view(lister.required_patterns());

        assert_eq!(lister.environments(&view), vec!["base"]);
    }

    #[tokio::test]
    async fn failing_environment_does_not_hide_others() {
        let command = MockCommand::default()
            .respond("base", BASE)
            .respond("ml", ML)
            .fail("broken", "exit code 1: CondaError");
        let lister = CondaListLister::with_command(command);
        let snapshot = snapshot();
        let ctx = ListContext {
            files: snapshot.view(lister.required_patterns()),
            scratch: None,
        };

        let listing = lister.list(&ctx).await.unwrap();

        assert_eq!(listing.records.len(), 4);
        assert!(listing
            .records
            .iter()
            .any(|r| r.name() == "numpy" && r.version() == "1.26.4"));
        assert!(listing
            .records
            .iter()
            .all(|r| r.origin() == SourceOrigin::CommandOutput));
        assert_eq!(listing.issues.len(), 1);
        assert!(matches!(
            &listing.issues[0],
            ListError::CommandFailed { environment, .. } if environment == "broken"
        ));
        assert_eq!(
            *lister.command.calls.lock().unwrap(),
            vec!["base", "broken", "ml"]
        );
    }

    #[test]
    fn non_json_output_is_reported() {
        let listing = parse_list_output("base", b"CondaValueError: no such env");
        assert!(listing.records.is_empty());
        assert!(matches!(
            &listing.issues[0],
            ListError::MalformedOutput { environment, .. } if environment == "base"
        ));
    }

    #[test]
    fn bad_elements_are_skipped_individually() {
        let stdout = br#"[{"name": "ok", "version": "1.0"}, "garbage", {"name": "nover"}, {"name": "bad", "version": "1..0"}]"#;
        let listing = parse_list_output("base", stdout);

        assert_eq!(listing.records.len(), 1);
        assert_eq!(listing.records[0].name(), "ok");
        assert_eq!(listing.issues.len(), 3);
    }

    #[test]
    fn lister_always_runs_and_needs_scratch_only_for_processes() {
        let mocked = CondaListLister::with_command(MockCommand::default());
        assert_eq!(mocked.gating(), Gating::Always);
        assert!(!mocked.needs_scratch());

        let real = CondaListLister::new("conda", Duration::from_secs(5));
        assert!(real.needs_scratch());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_command_reports_spawn_failure() {
        let command = ProcessCommand::new(
            "/nonexistent/definitely-not-conda",
            Duration::from_secs(5),
        );
        let result = command.run("base", None).await;
        assert!(matches!(result, Err(ListError::CommandFailed { .. })));
    }
}
