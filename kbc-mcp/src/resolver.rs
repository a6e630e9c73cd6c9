//! Deterministic git branch -> Keboola branch resolution.
//!
//! The resolver holds no resolved state. Every call re-reads the mapping file,
//! re-queries git and re-checks the manifest, so a branch switch between two
//! operations is always observed.

use std::ffi::OsString;

use tracing::{debug, info, instrument, warn};

use crate::core::context::{ExecutionContext, is_default_branch};
use crate::error::{GateError, Result};
use crate::io::config::Settings;
use crate::io::git::{BranchSource, Git};
use crate::io::manifest::ProjectGuard;
use crate::io::mapping_store::MappingStore;

pub struct BranchResolver<B = Git> {
    branches: B,
    mappings: MappingStore,
    guard: ProjectGuard,
    default_branch: String,
}

impl BranchResolver<Git> {
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            Git::new(&settings.working_dir),
            MappingStore::new(settings.mapping_file_path()),
            ProjectGuard::new(&settings.working_dir),
            settings.git_default_branch.clone(),
        )
    }
}

impl<B: BranchSource> BranchResolver<B> {
    pub fn new(
        branches: B,
        mappings: MappingStore,
        guard: ProjectGuard,
        default_branch: impl Into<String>,
    ) -> Self {
        Self {
            branches,
            mappings,
            guard,
            default_branch: default_branch.into(),
        }
    }

    pub fn mappings(&self) -> &MappingStore {
        &self.mappings
    }

    pub fn guard(&self) -> &ProjectGuard {
        &self.guard
    }

    pub fn current_branch(&self) -> Result<String> {
        self.branches.current_branch()
    }

    /// True for the configured default branch, `main` and `master`.
    pub fn is_default_branch(&self, name: &str) -> bool {
        is_default_branch(&self.default_branch, name)
    }

    /// Resolve `branch` to a workspace id (`None` = production).
    ///
    /// Default branches resolve to production without consulting the mapping
    /// file, even if it holds an id for them.
    pub fn resolve_workspace_id(&self, branch: &str) -> Result<Option<String>> {
        if self.is_default_branch(branch) {
            debug!(branch, "default branch resolves to production");
            return Ok(None);
        }
        let mut mappings = self.mappings.load();
        match mappings.remove(branch) {
            Some(workspace_id) => {
                debug!(branch, workspace_id = ?workspace_id, "branch resolved");
                Ok(workspace_id)
            }
            None => {
                warn!(branch, "branch is not linked");
                Err(GateError::BranchUnmapped {
                    branch: branch.to_string(),
                    known: mappings.into_keys().collect(),
                })
            }
        }
    }

    /// Current branch and its resolved workspace id.
    pub fn resolve_current(&self) -> Result<(String, Option<String>)> {
        let branch = self.current_branch()?;
        let workspace_id = self.resolve_workspace_id(&branch)?;
        Ok((branch, workspace_id))
    }

    /// Execution context for one operation, based on the ambient environment.
    pub fn branch_context(&self) -> Result<ExecutionContext> {
        self.branch_context_from(std::env::vars_os())
    }

    /// Execution context for one operation, based on an explicit environment.
    ///
    /// The project guard runs first so misconfiguration is reported before any
    /// resolution. Errors are returned unchanged.
    #[instrument(skip_all)]
    pub fn branch_context_from<I, K, V>(&self, baseline: I) -> Result<ExecutionContext>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        self.guard.validate()?;
        let (branch, workspace_id) = self.resolve_current()?;
        let is_default = self.is_default_branch(&branch);
        info!(branch = %branch, workspace_id = ?workspace_id, is_default, "branch context resolved");
        Ok(ExecutionContext::new(
            baseline,
            branch,
            workspace_id,
            is_default,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::BRANCH_ENV_VAR;
    use crate::test_support::{ScriptedBranch, write_manifest};
    use std::ffi::OsStr;
    use std::fs;

    struct Fixture {
        _temp: tempfile::TempDir,
        resolver: BranchResolver<ScriptedBranch>,
        branch: ScriptedBranch,
    }

    fn fixture(current: &str, mapping: Option<&str>, allow_target_env: Option<bool>) -> Fixture {
        let temp = tempfile::tempdir().expect("tempdir");
        let mapping_path = temp.path().join("branch-mapping.json");
        if let Some(mapping) = mapping {
            fs::write(&mapping_path, mapping).expect("write mapping");
        }
        if let Some(allow) = allow_target_env {
            write_manifest(temp.path(), allow, &[]).expect("write manifest");
        }
        let branch = ScriptedBranch::on(current);
        let resolver = BranchResolver::new(
            branch.clone(),
            MappingStore::new(mapping_path),
            ProjectGuard::new(temp.path()),
            "main",
        );
        Fixture {
            _temp: temp,
            resolver,
            branch,
        }
    }

    #[test]
    fn default_branch_detection_ignores_mapping_contents() {
        let f = fixture("main", Some(r#"{"feature/test": "1"}"#), Some(true));
        assert!(f.resolver.is_default_branch("main"));
        assert!(f.resolver.is_default_branch("master"));
        assert!(!f.resolver.is_default_branch("feature/test"));
    }

    #[test]
    fn configured_default_joins_fallbacks() {
        let temp = tempfile::tempdir().expect("tempdir");
        let resolver = BranchResolver::new(
            ScriptedBranch::on("develop"),
            MappingStore::new(temp.path().join("m.json")),
            ProjectGuard::new(temp.path()),
            "develop",
        );
        assert!(resolver.is_default_branch("develop"));
        assert!(resolver.is_default_branch("main"));
        assert!(resolver.is_default_branch("master"));
        assert!(!resolver.is_default_branch("trunk"));
    }

    #[test]
    fn default_branch_short_circuits_mapping() {
        let f = fixture("main", Some(r#"{"main": "999", "master": "888"}"#), Some(true));
        assert_eq!(f.resolver.resolve_workspace_id("main").expect("resolve"), None);
        assert_eq!(f.resolver.resolve_workspace_id("master").expect("resolve"), None);
    }

    #[test]
    fn mapped_branch_resolves_to_stored_value() {
        let f = fixture(
            "feature/test",
            Some(r#"{"feature/test": "12345", "feature/prod": null}"#),
            Some(true),
        );
        assert_eq!(
            f.resolver.resolve_workspace_id("feature/test").expect("resolve"),
            Some("12345".to_string())
        );
        assert_eq!(f.resolver.resolve_workspace_id("feature/prod").expect("resolve"), None);
    }

    #[test]
    fn unmapped_branch_lists_known_mappings() {
        let f = fixture(
            "feature/unknown",
            Some(r#"{"main": null, "feature/a": "1", "feature/b": "2"}"#),
            Some(true),
        );
        let err = f.resolver.resolve_workspace_id("feature/unknown").unwrap_err();
        match err {
            GateError::BranchUnmapped { branch, known } => {
                assert_eq!(branch, "feature/unknown");
                assert_eq!(known, vec!["feature/a", "feature/b", "main"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn context_sets_override_for_mapped_branch() {
        let f = fixture("feature/x", Some(r#"{"main": null, "feature/x": "123"}"#), Some(true));
        let ctx = f
            .resolver
            .branch_context_from([("PATH", "/bin")])
            .expect("context");
        assert_eq!(ctx.env_var(BRANCH_ENV_VAR), Some(OsStr::new("123")));
        assert_eq!(ctx.current_branch(), "feature/x");
        assert!(!ctx.is_default());
    }

    #[test]
    fn context_follows_branch_switches() {
        let f = fixture("feature/x", Some(r#"{"main": null, "feature/x": "123"}"#), Some(true));
        let first = f
            .resolver
            .branch_context_from([(BRANCH_ENV_VAR, "stale")])
            .expect("context");
        assert_eq!(first.workspace_id(), Some("123"));

        f.branch.switch("main");
        let second = f
            .resolver
            .branch_context_from([(BRANCH_ENV_VAR, "stale")])
            .expect("context");
        assert_eq!(second.env_var(BRANCH_ENV_VAR), None);
        assert!(second.is_default());
        assert!(second.is_production());
    }

    #[test]
    fn misconfigured_project_wins_over_valid_mapping() {
        let f = fixture("feature/x", Some(r#"{"feature/x": "123"}"#), Some(false));
        let err = f.resolver.branch_context_from([("PATH", "/bin")]).unwrap_err();
        assert!(matches!(err, GateError::ProjectMisconfigured));
    }

    #[test]
    fn guard_runs_before_git() {
        let f = fixture("feature/x", None, None);
        f.branch.detach();
        let err = f.resolver.branch_context_from([("PATH", "/bin")]).unwrap_err();
        assert!(matches!(err, GateError::ProjectUninitialized { .. }));
    }

    #[test]
    fn git_failure_propagates_unchanged() {
        let f = fixture("feature/x", None, Some(true));
        f.branch.detach();
        let err = f.resolver.branch_context_from([("PATH", "/bin")]).unwrap_err();
        assert!(matches!(err, GateError::GitUnavailable(_)));
    }

    #[test]
    fn unmapped_branch_fails_context() {
        let f = fixture("feature/new", Some(r#"{"main": null}"#), Some(true));
        let err = f.resolver.branch_context_from([("PATH", "/bin")]).unwrap_err();
        assert!(matches!(err, GateError::BranchUnmapped { ref known, .. } if known == &["main"]));
    }
}
