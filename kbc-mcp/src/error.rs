//! Error taxonomy surfaced to tool callers.
//!
//! Every variant maps to a stable machine code (see [`GateError::code`]) so the
//! calling agent can pick a remediation: re-link, re-initialize, or retry.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Command that initializes a project so `KBC_BRANCH_ID` is honored.
pub const INIT_FIX: &str = "Run 'kbc sync init --allow-target-env' to initialize the project properly";

pub type Result<T> = std::result::Result<T, GateError>;

#[derive(Error, Debug)]
pub enum GateError {
    #[error("{0}")]
    GitUnavailable(String),

    #[error(
        "Keboola project is not initialized ({}). Run 'kbc sync init --allow-target-env' first.",
        manifest.display()
    )]
    ProjectUninitialized { manifest: PathBuf },

    #[error("Failed to parse {}: {reason}", manifest.display())]
    ProjectCorrupt { manifest: PathBuf, reason: String },

    #[error(
        "The project was not initialized with --allow-target-env. \
         The KBC_BRANCH_ID environment variable override will NOT work. \
         Re-initialize the project with: kbc sync init --allow-target-env"
    )]
    ProjectMisconfigured,

    #[error(
        "Git branch \"{branch}\" is not linked to any Keboola branch. \
         Use the \"link_branch\" tool first. Available mappings: {known:?}"
    )]
    BranchUnmapped { branch: String, known: Vec<String> },

    #[error("Command '{command}' is not allowed. Available commands: {}", allowed.join(", "))]
    CommandNotAllowed {
        command: String,
        allowed: Vec<String>,
    },

    #[error("Command '{command}' timed out after {} seconds", timeout.as_secs())]
    CommandTimedOut { command: String, timeout: Duration },

    #[error("Failed to create Keboola branch: {0}")]
    BranchCreationFailed(String),

    #[error("{0}")]
    ExecutionError(String),

    #[error("Failed to write branch mapping {}: {reason}", path.display())]
    MappingWrite { path: PathBuf, reason: String },

    #[error("Documentation query failed: {0}")]
    DocsQuery(String),
}

impl GateError {
    /// Stable machine-readable code for the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::GitUnavailable(_) => "GIT_ERROR",
            Self::ProjectUninitialized { .. } => "PROJECT_NOT_INITIALIZED",
            Self::ProjectCorrupt { .. } => "PROJECT_INVALID",
            Self::ProjectMisconfigured => "PROJECT_MISCONFIGURED",
            Self::BranchUnmapped { .. } => "NO_MAPPING",
            Self::CommandNotAllowed { .. } => "INVALID_COMMAND",
            Self::CommandTimedOut { .. } => "TIMEOUT",
            Self::BranchCreationFailed(_) => "BRANCH_CREATION_ERROR",
            Self::ExecutionError(_) => "EXECUTION_ERROR",
            Self::MappingWrite { .. } => "MAPPING_WRITE_ERROR",
            Self::DocsQuery(_) => "DOCS_QUERY_ERROR",
        }
    }

    /// Remediation hint for project guard failures.
    pub fn fix(&self) -> Option<&'static str> {
        match self {
            Self::ProjectUninitialized { .. }
            | Self::ProjectCorrupt { .. }
            | Self::ProjectMisconfigured => Some(INIT_FIX),
            _ => None,
        }
    }
}
