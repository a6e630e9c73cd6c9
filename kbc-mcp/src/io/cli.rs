//! Runner abstraction for `kbc` invocations.
//!
//! The [`CliRunner`] trait decouples dispatch and branch linking from the real
//! `kbc` binary. Tests use scripted runners that record invocations and return
//! predetermined outputs without spawning processes.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::core::context::EnvMap;
use crate::io::process::run_command_with_timeout;

/// Upper bound for a single `kbc` invocation.
pub const CLI_TIMEOUT: Duration = Duration::from_secs(300);

/// Default cap on captured stdout/stderr per stream.
pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 1_000_000;

/// A fully specified `kbc` invocation.
#[derive(Debug, Clone)]
pub struct CliInvocation {
    /// Path (or name on `PATH`) of the `kbc` binary.
    pub program: PathBuf,
    /// Arguments after the program.
    pub args: Vec<String>,
    /// Working directory (project root).
    pub workdir: PathBuf,
    /// Complete child environment; the parent environment is not inherited.
    pub env: EnvMap,
    pub timeout: Duration,
}

impl CliInvocation {
    /// Human-readable command line for reporting.
    pub fn command_line(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// Captured result of a finished (or killed) invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliOutput {
    /// Exit code; `None` when terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CliOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Abstraction over `kbc` execution backends.
pub trait CliRunner {
    /// Run the invocation. Errors mean the process could not be run at all.
    fn run(&self, invocation: &CliInvocation) -> Result<CliOutput>;
}

/// Runner that spawns the real `kbc` binary.
#[derive(Debug, Clone)]
pub struct KbcCli {
    pub output_limit_bytes: usize,
}

impl Default for KbcCli {
    fn default() -> Self {
        Self {
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
        }
    }
}

impl CliRunner for KbcCli {
    #[instrument(skip_all, fields(timeout_secs = invocation.timeout.as_secs()))]
    fn run(&self, invocation: &CliInvocation) -> Result<CliOutput> {
        info!(command = %invocation.command_line(), workdir = %invocation.workdir.display(), "running kbc");
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .current_dir(&invocation.workdir)
            .env_clear()
            .envs(&invocation.env);

        let output = run_command_with_timeout(cmd, invocation.timeout, self.output_limit_bytes)
            .with_context(|| format!("run {}", invocation.program.display()))?;

        if output.timed_out {
            warn!(timeout_secs = invocation.timeout.as_secs(), "kbc timed out");
        } else if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "kbc failed");
        }

        Ok(CliOutput {
            exit_code: output.status.code(),
            stdout: output.stdout_text(),
            stderr: output.stderr_text(),
            timed_out: output.timed_out,
        })
    }
}
