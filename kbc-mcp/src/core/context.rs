//! Execution context produced by branch resolution.
//!
//! An [`ExecutionContext`] is a plain value: the environment overlay and branch
//! metadata for exactly one subprocess or outbound request. It is
//! not `Clone`; callers consume it and resolve again for the next operation.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};

use serde::Serialize;

/// Environment variable `kbc` reads to select its target branch.
pub const BRANCH_ENV_VAR: &str = "KBC_BRANCH_ID";

/// Header carrying the branch id on proxied HTTP requests.
pub const BRANCH_HEADER: &str = "X-Branch-Id";

/// Branch names that always resolve to production, whatever the configuration.
pub const FALLBACK_DEFAULT_BRANCHES: [&str; 2] = ["main", "master"];

/// Full environment handed to a child process.
pub type EnvMap = BTreeMap<OsString, OsString>;

/// True if `name` is the configured default branch or one of the fallbacks.
pub fn is_default_branch(configured_default: &str, name: &str) -> bool {
    name == configured_default || FALLBACK_DEFAULT_BRANCHES.contains(&name)
}

/// Branch metadata reported alongside command results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BranchInfo {
    pub git_branch: String,
    pub keboola_branch_id: Option<String>,
    pub is_production: bool,
}

/// Resolved environment and branch metadata for one operation.
#[derive(Debug, PartialEq, Eq)]
pub struct ExecutionContext {
    env: EnvMap,
    current_branch: String,
    workspace_id: Option<String>,
    is_default: bool,
}

impl ExecutionContext {
    /// Build a context from a baseline environment.
    ///
    /// `KBC_BRANCH_ID` is set to `workspace_id` when present and removed from
    /// the baseline otherwise, so an inherited override can never leak into a
    /// production run.
    pub fn new<I, K, V>(
        baseline: I,
        current_branch: String,
        workspace_id: Option<String>,
        is_default: bool,
    ) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        let mut env: EnvMap = baseline
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        match &workspace_id {
            Some(id) => {
                env.insert(BRANCH_ENV_VAR.into(), id.into());
            }
            None => {
                env.remove(OsStr::new(BRANCH_ENV_VAR));
            }
        }
        Self {
            env,
            current_branch,
            workspace_id,
            is_default,
        }
    }

    pub fn env(&self) -> &EnvMap {
        &self.env
    }

    pub fn env_var(&self, key: &str) -> Option<&OsStr> {
        self.env.get(OsStr::new(key)).map(OsString::as_os_str)
    }

    pub fn current_branch(&self) -> &str {
        &self.current_branch
    }

    pub fn workspace_id(&self) -> Option<&str> {
        self.workspace_id.as_deref()
    }

    /// True when the current branch is a default branch.
    pub fn is_default(&self) -> bool {
        self.is_default
    }

    /// True when no override is in effect.
    pub fn is_production(&self) -> bool {
        self.workspace_id.is_none()
    }

    pub fn branch_info(&self) -> BranchInfo {
        BranchInfo {
            git_branch: self.current_branch.clone(),
            keboola_branch_id: self.workspace_id.clone(),
            is_production: self.is_production(),
        }
    }

    /// Headers an HTTP consumer must send to target the same branch.
    pub fn request_headers(&self) -> Vec<(&'static str, String)> {
        self.workspace_id
            .iter()
            .map(|id| (BRANCH_HEADER, id.clone()))
            .collect()
    }

    /// Consume the context, yielding the overlay and branch metadata.
    pub fn into_parts(self) -> (EnvMap, BranchInfo) {
        let info = self.branch_info();
        (self.env, info)
    }
}
