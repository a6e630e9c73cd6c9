//! Link, unlink and inspect git -> Keboola branch mappings.

use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::core::context::{BRANCH_ENV_VAR, EnvMap};
use crate::error::{GateError, Result};
use crate::io::cli::{CLI_TIMEOUT, CliInvocation, CliRunner, KbcCli};
use crate::io::config::Settings;
use crate::io::git::{BranchSource, Git};
use crate::io::mapping_store::BranchMappings;
use crate::resolver::BranchResolver;

/// `ID: 123`, optionally parenthesized, as printed by `kbc remote create branch`.
static CREATED_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bID:[ \t]*(\d+)\b").unwrap()
});

/// How a link request was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkSource {
    /// Default branch mapped to production.
    Production,
    /// A mapping already existed and was left unchanged.
    AlreadyLinked,
    /// An existing remote branch was found by name.
    Existing,
    /// A new remote branch was created.
    Created,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkReport {
    pub git_branch: String,
    pub keboola_branch_id: Option<String>,
    pub keboola_branch_name: String,
    pub created: bool,
    pub link: LinkSource,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnlinkReport {
    pub git_branch: String,
    /// Whether a mapping existed and was removed.
    pub unlinked: bool,
    pub unlinked_keboola_branch_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MappingStatus {
    pub git_branch: String,
    pub keboola_branch_id: Option<String>,
    pub linked: bool,
    pub is_production: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MappingList {
    pub mappings: BranchMappings,
    pub current_git_branch: Option<String>,
}

pub struct BranchLifecycle<B = Git, R = KbcCli> {
    resolver: Arc<BranchResolver<B>>,
    runner: R,
    cli_path: PathBuf,
    workdir: PathBuf,
}

impl<B: BranchSource, R: CliRunner> BranchLifecycle<B, R> {
    pub fn new(
        resolver: Arc<BranchResolver<B>>,
        runner: R,
        cli_path: impl Into<PathBuf>,
        workdir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            resolver,
            runner,
            cli_path: cli_path.into(),
            workdir: workdir.into(),
        }
    }

    pub fn from_settings(resolver: Arc<BranchResolver<B>>, runner: R, settings: &Settings) -> Self {
        Self::new(resolver, runner, &settings.cli_path, &settings.working_dir)
    }

    /// Link the current git branch to a Keboola branch named `display_name`
    /// (defaults to the git branch name), creating it when none exists.
    #[instrument(skip_all)]
    pub fn link(&self, display_name: Option<&str>) -> Result<LinkReport> {
        let git_branch = self.resolver.current_branch()?;
        self.resolver.guard().validate()?;
        let mappings = self.resolver.mappings();

        if self.resolver.is_default_branch(&git_branch) {
            mappings.add_or_update(&git_branch, None)?;
            info!(branch = %git_branch, "default branch linked to production");
            return Ok(LinkReport {
                message: format!(
                    "Default branch '{git_branch}' mapped to production (no {BRANCH_ENV_VAR} override)"
                ),
                git_branch,
                keboola_branch_id: None,
                keboola_branch_name: "production".to_string(),
                created: false,
                link: LinkSource::Production,
            });
        }

        let name = display_name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(&git_branch)
            .to_string();

        if let Some(existing) = mappings.get(&git_branch) {
            info!(branch = %git_branch, workspace_id = ?existing, "branch already linked");
            return Ok(LinkReport {
                message: format!(
                    "Branch already linked to Keboola branch {}",
                    existing.as_deref().unwrap_or("production")
                ),
                git_branch,
                keboola_branch_id: existing,
                keboola_branch_name: name,
                created: false,
                link: LinkSource::AlreadyLinked,
            });
        }

        if let Some(found) = self.resolver.guard().find_workspace(&name) {
            mappings.add_or_update(&git_branch, Some(found.id.as_str()))?;
            info!(branch = %git_branch, workspace_id = %found.id, "linked to existing Keboola branch");
            return Ok(LinkReport {
                message: format!("Linked to existing Keboola branch '{name}' (ID: {})", found.id),
                git_branch,
                keboola_branch_id: Some(found.id),
                keboola_branch_name: name,
                created: false,
                link: LinkSource::Existing,
            });
        }

        let id = self.create_remote_branch(&name)?;
        mappings.add_or_update(&git_branch, Some(id.as_str()))?;
        info!(branch = %git_branch, workspace_id = %id, "created and linked Keboola branch");
        Ok(LinkReport {
            message: format!("Successfully created and linked Keboola branch '{name}' (ID: {id})"),
            git_branch,
            keboola_branch_id: Some(id),
            keboola_branch_name: name,
            created: true,
            link: LinkSource::Created,
        })
    }

    /// Remove the mapping for the current git branch. The remote branch is kept.
    #[instrument(skip_all)]
    pub fn unlink(&self) -> Result<UnlinkReport> {
        let git_branch = self.resolver.current_branch()?;
        match self.resolver.mappings().remove(&git_branch)? {
            None => Ok(UnlinkReport {
                message: format!("No mapping exists for git branch '{git_branch}'"),
                git_branch,
                unlinked: false,
                unlinked_keboola_branch_id: None,
            }),
            Some(removed) => {
                info!(branch = %git_branch, workspace_id = ?removed, "mapping removed");
                Ok(UnlinkReport {
                    message: format!(
                        "Mapping removed. Keboola branch {} still exists.",
                        removed.as_deref().unwrap_or("production")
                    ),
                    git_branch,
                    unlinked: true,
                    unlinked_keboola_branch_id: removed,
                })
            }
        }
    }

    /// Read-only view of the current branch's mapping. Never requires the manifest.
    pub fn status(&self) -> Result<MappingStatus> {
        let git_branch = self.resolver.current_branch()?;
        if let Some(workspace_id) = self.resolver.mappings().get(&git_branch) {
            return Ok(MappingStatus {
                is_production: workspace_id.is_none(),
                git_branch,
                keboola_branch_id: workspace_id,
                linked: true,
            });
        }
        let is_default = self.resolver.is_default_branch(&git_branch);
        Ok(MappingStatus {
            git_branch,
            keboola_branch_id: None,
            linked: is_default,
            is_production: is_default,
        })
    }

    /// All mappings plus the current branch (`None` when git is unavailable).
    pub fn list(&self) -> MappingList {
        let current_git_branch = match self.resolver.current_branch() {
            Ok(branch) => Some(branch),
            Err(err) => {
                warn!(err = %err, "current branch unavailable for listing");
                None
            }
        };
        MappingList {
            mappings: self.resolver.mappings().load(),
            current_git_branch,
        }
    }

    /// Create a Keboola branch via `kbc remote create branch` and return its id.
    ///
    /// `kbc` may exit non-zero on validation warnings while still creating the
    /// branch, so the manifest is consulted before the exit code.
    fn create_remote_branch(&self, name: &str) -> Result<String> {
        let invocation = CliInvocation {
            program: self.cli_path.clone(),
            args: ["remote", "create", "branch", "-n", name]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            workdir: self.workdir.clone(),
            env: production_env(std::env::vars_os()),
            timeout: CLI_TIMEOUT,
        };
        let output = self
            .runner
            .run(&invocation)
            .map_err(|err| GateError::BranchCreationFailed(format!("{err:#}")))?;

        if output.timed_out {
            return Err(GateError::CommandTimedOut {
                command: format!("remote create branch -n {name}"),
                timeout: invocation.timeout,
            });
        }

        if let Some(found) = self.resolver.guard().find_workspace(name) {
            return Ok(found.id);
        }
        if output.success() {
            if let Some(id) = parse_created_id(&output.stdout) {
                return Ok(id);
            }
        } else {
            let detail = if output.stderr.trim().is_empty() {
                output.stdout.trim()
            } else {
                output.stderr.trim()
            };
            return Err(GateError::BranchCreationFailed(detail.to_string()));
        }
        Err(GateError::BranchCreationFailed(format!(
            "Branch created but could not find it in manifest: {}",
            output.stdout.trim()
        )))
    }
}

/// Baseline environment with any inherited branch override removed.
fn production_env<I, K, V>(baseline: I) -> EnvMap
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<std::ffi::OsString>,
    V: Into<std::ffi::OsString>,
{
    let mut env: EnvMap = baseline
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect();
    env.remove(OsStr::new(BRANCH_ENV_VAR));
    env
}

/// Extract a numeric branch id from `kbc remote create branch` output.
pub fn parse_created_id(output: &str) -> Option<String> {
    CREATED_ID_RE
        .captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::cli::CliOutput;
    use crate::io::manifest::{MANIFEST_RELATIVE_PATH, ProjectGuard};
    use crate::io::mapping_store::MappingStore;
    use crate::test_support::{ScriptedBranch, ScriptedCli, manifest_json, write_manifest};
    use std::fs;

    struct Fixture {
        temp: tempfile::TempDir,
        branch: ScriptedBranch,
        cli: ScriptedCli,
    }

    impl Fixture {
        fn new(current: &str, remote_branches: &[(&str, &str)]) -> Self {
            let temp = tempfile::tempdir().expect("tempdir");
            write_manifest(temp.path(), true, remote_branches).expect("manifest");
            Self {
                temp,
                branch: ScriptedBranch::on(current),
                cli: ScriptedCli::new(),
            }
        }

        fn store(&self) -> MappingStore {
            MappingStore::new(self.temp.path().join("branch-mapping.json"))
        }

        fn lifecycle(&self) -> BranchLifecycle<ScriptedBranch, ScriptedCli> {
            let resolver = BranchResolver::new(
                self.branch.clone(),
                self.store(),
                ProjectGuard::new(self.temp.path()),
                "main",
            );
            BranchLifecycle::new(Arc::new(resolver), self.cli.clone(), "kbc", self.temp.path())
        }
    }

    #[test]
    fn default_branch_links_to_production_without_remote_call() {
        let f = Fixture::new("master", &[]);
        let report = f.lifecycle().link(None).expect("link");
        assert_eq!(report.link, LinkSource::Production);
        assert_eq!(report.keboola_branch_id, None);
        assert_eq!(f.store().get("master"), Some(None));
        assert!(f.cli.invocations().is_empty());
    }

    #[test]
    fn already_linked_branch_is_reported_unchanged() {
        let f = Fixture::new("feature/x", &[("999", "feature-x")]);
        f.store().add_or_update("feature/x", Some("123")).expect("seed");
        let before = fs::read_to_string(f.store().path()).expect("read");

        let report = f.lifecycle().link(None).expect("link");
        assert_eq!(report.link, LinkSource::AlreadyLinked);
        assert_eq!(report.keboola_branch_id.as_deref(), Some("123"));
        assert!(!report.created);
        assert!(f.cli.invocations().is_empty());
        assert_eq!(fs::read_to_string(f.store().path()).expect("read"), before);
    }

    #[test]
    fn existing_remote_branch_found_by_normalized_path() {
        let f = Fixture::new("feature/login", &[("111", "main"), ("972851", "feature-login")]);
        let report = f.lifecycle().link(None).expect("link");
        assert_eq!(report.link, LinkSource::Existing);
        assert_eq!(report.keboola_branch_id.as_deref(), Some("972851"));
        assert_eq!(f.store().get("feature/login"), Some(Some("972851".to_string())));
        assert!(f.cli.invocations().is_empty());
    }

    #[test]
    fn display_name_overrides_git_branch_name() {
        let f = Fixture::new("feature/login", &[("5", "shared-dev")]);
        let report = f.lifecycle().link(Some("shared-dev")).expect("link");
        assert_eq!(report.keboola_branch_name, "shared-dev");
        assert_eq!(report.keboola_branch_id.as_deref(), Some("5"));
    }

    #[test]
    fn missing_remote_branch_is_created_and_read_from_manifest() {
        let f = Fixture::new("feature/new", &[("111", "main")]);
        f.cli.push_output_writing(
            f.temp.path().join(MANIFEST_RELATIVE_PATH),
            manifest_json(true, &[("111", "main"), ("4242", "feature-new")]),
            CliOutput {
                exit_code: Some(0),
                stdout: "Created new branch \"feature/new\".".to_string(),
                stderr: String::new(),
                timed_out: false,
            },
        );

        let report = f.lifecycle().link(None).expect("link");
        assert_eq!(report.link, LinkSource::Created);
        assert!(report.created);
        assert_eq!(report.keboola_branch_id.as_deref(), Some("4242"));
        assert_eq!(f.store().get("feature/new"), Some(Some("4242".to_string())));

        let inv = &f.cli.invocations()[0];
        assert_eq!(inv.args, vec!["remote", "create", "branch", "-n", "feature/new"]);
        assert!(inv.env.get(OsStr::new(BRANCH_ENV_VAR)).is_none());
    }

    #[test]
    fn created_id_falls_back_to_cli_output() {
        let f = Fixture::new("feature/new", &[]);
        f.cli.push_output(CliOutput {
            exit_code: Some(0),
            stdout: "Created new branch \"feature-new\" (ID: 972851).".to_string(),
            stderr: String::new(),
            timed_out: false,
        });
        let report = f.lifecycle().link(None).expect("link");
        assert_eq!(report.keboola_branch_id.as_deref(), Some("972851"));
    }

    #[test]
    fn failed_creation_without_id_is_branch_creation_error() {
        let f = Fixture::new("feature/new", &[]);
        f.cli.push_output(CliOutput {
            exit_code: Some(1),
            stdout: String::new(),
            stderr: "invalid token".to_string(),
            timed_out: false,
        });
        let err = f.lifecycle().link(None).unwrap_err();
        match err {
            GateError::BranchCreationFailed(msg) => assert_eq!(msg, "invalid token"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!f.store().contains("feature/new"));
    }

    #[test]
    fn link_requires_allow_target_env() {
        let f = Fixture::new("feature/x", &[]);
        write_manifest(f.temp.path(), false, &[]).expect("manifest");
        let err = f.lifecycle().link(None).unwrap_err();
        assert!(matches!(err, GateError::ProjectMisconfigured));
    }

    #[test]
    fn unlink_absent_is_not_an_error_and_keeps_file() {
        let f = Fixture::new("feature/x", &[]);
        f.store().add_or_update("main", None).expect("seed");
        let before = fs::read_to_string(f.store().path()).expect("read");

        let report = f.lifecycle().unlink().expect("unlink");
        assert!(!report.unlinked);
        assert_eq!(report.unlinked_keboola_branch_id, None);
        assert_eq!(fs::read_to_string(f.store().path()).expect("read"), before);
    }

    #[test]
    fn unlink_removes_mapping_only() {
        let f = Fixture::new("feature/x", &[]);
        f.store().add_or_update("feature/x", Some("123")).expect("seed");
        let report = f.lifecycle().unlink().expect("unlink");
        assert!(report.unlinked);
        assert_eq!(report.unlinked_keboola_branch_id.as_deref(), Some("123"));
        assert!(!f.store().contains("feature/x"));
        assert!(f.cli.invocations().is_empty());
    }

    #[test]
    fn status_reports_explicit_implicit_and_missing_links() {
        let f = Fixture::new("feature/x", &[]);
        fs::remove_file(f.temp.path().join(MANIFEST_RELATIVE_PATH)).expect("remove manifest");
        let lifecycle = f.lifecycle();

        let status = lifecycle.status().expect("status");
        assert!(!status.linked);
        assert!(!status.is_production);

        f.store().add_or_update("feature/x", Some("7")).expect("seed");
        let status = lifecycle.status().expect("status");
        assert!(status.linked);
        assert_eq!(status.keboola_branch_id.as_deref(), Some("7"));

        f.branch.switch("main");
        let status = lifecycle.status().expect("status");
        assert!(status.linked);
        assert!(status.is_production);
    }

    #[test]
    fn list_survives_git_failure() {
        let f = Fixture::new("feature/x", &[]);
        f.store().add_or_update("feature/x", Some("7")).expect("seed");
        f.branch.detach();
        let list = f.lifecycle().list();
        assert_eq!(list.current_git_branch, None);
        assert_eq!(list.mappings.len(), 1);
    }

    #[test]
    fn created_id_parsing() {
        assert_eq!(parse_created_id("Created branch (ID: 12)"), Some("12".to_string()));
        assert_eq!(
            parse_created_id("Created new branch \"feature-new\" (ID: 972851)."),
            Some("972851".to_string())
        );
        assert_eq!(parse_created_id("ID: 5"), Some("5".to_string()));
        assert_eq!(parse_created_id("no identifier here"), None);
    }

    #[test]
    fn created_id_ignores_loose_id_mentions() {
        assert_eq!(parse_created_id("branch id 77 created"), None);
        assert_eq!(parse_created_id("job id=5 queued"), None);
        assert_eq!(parse_created_id("Storage job ID 431 waiting"), None);
        assert_eq!(
            parse_created_id("project id 3\nCreated new branch \"x\" (ID: 88)."),
            Some("88".to_string())
        );
    }

    #[test]
    fn production_env_strips_override() {
        let env = production_env([(BRANCH_ENV_VAR, "1"), ("PATH", "/bin")]);
        assert_eq!(env.len(), 1);
        assert!(env.get(OsStr::new("PATH")).is_some());
    }
}
