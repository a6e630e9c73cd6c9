//! Git adapter for branch discovery.
//!
//! Branch resolution depends on knowing exactly which branch is checked out,
//! so we keep a small, explicit wrapper around `git` subprocess calls.

use std::path::PathBuf;
use std::process::{Command, Output};

use tracing::{debug, instrument, warn};

use crate::error::{GateError, Result};

/// Source of the currently checked-out branch name.
///
/// Implemented by [`Git`]; tests substitute fixed or scripted branches.
pub trait BranchSource {
    fn current_branch(&self) -> Result<String>;
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_checked(&["branch", "--show-current"])?;
        let name = String::from_utf8_lossy(&out.stdout).trim().to_string();
        if name.is_empty() {
            warn!("detached HEAD detected");
            return Err(GateError::GitUnavailable(
                "Not on a branch (possibly detached HEAD)".to_string(),
            ));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// True if the working directory is inside a git repository.
    pub fn is_repository(&self) -> bool {
        self.run(&["rev-parse", "--git-dir"])
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// Create a branch at HEAD, optionally checking it out.
    #[instrument(skip_all, fields(branch, checkout))]
    pub fn create_branch(&self, branch: &str, checkout: bool) -> Result<()> {
        debug!(branch, checkout, "creating branch");
        if checkout {
            self.run_checked(&["checkout", "-b", branch])?;
        } else {
            self.run_checked(&["branch", branch])?;
        }
        Ok(())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GateError::GitUnavailable(format!(
                "git {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .map_err(|err| {
                GateError::GitUnavailable(format!("spawn git {}: {err}", args.join(" ")))
            })
    }
}

impl BranchSource for Git {
    fn current_branch(&self) -> Result<String> {
        Git::current_branch(self)
    }
}
