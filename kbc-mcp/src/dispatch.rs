//! Allow-listed `kbc` execution under the resolved branch context.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::core::allow_list::{allowed_commands, validate_command};
use crate::core::context::BranchInfo;
use crate::core::flags::args_to_flags;
use crate::error::{GateError, Result};
use crate::io::cli::{CLI_TIMEOUT, CliInvocation, CliRunner, KbcCli};
use crate::io::config::Settings;
use crate::io::git::{BranchSource, Git};
use crate::resolver::BranchResolver;

/// Flag `kbc` accepts for writing machine-readable output to a file.
const OUTPUT_JSON_FLAG: &str = "--output-json";

/// Result of a `kbc` run that reached the subprocess.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommandOutcome {
    Succeeded {
        command: String,
        #[serde(flatten)]
        branch: BranchInfo,
        output: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        structured: Option<Value>,
    },
    Failed {
        command: String,
        #[serde(flatten)]
        branch: BranchInfo,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },
}

impl CommandOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    pub fn branch(&self) -> &BranchInfo {
        match self {
            Self::Succeeded { branch, .. } | Self::Failed { branch, .. } => branch,
        }
    }
}

pub struct CommandDispatcher<B = Git, R = KbcCli> {
    resolver: Arc<BranchResolver<B>>,
    runner: R,
    cli_path: PathBuf,
    workdir: PathBuf,
    timeout: Duration,
}

impl<B: BranchSource, R: CliRunner> CommandDispatcher<B, R> {
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
            timeout: CLI_TIMEOUT,
        }
    }

    pub fn from_settings(resolver: Arc<BranchResolver<B>>, runner: R, settings: &Settings) -> Self {
        Self::new(resolver, runner, &settings.cli_path, &settings.working_dir)
    }

    /// Override the subprocess timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run an allow-listed command with flags derived from `args`.
    pub fn execute(&self, command: &str, args: &Map<String, Value>) -> Result<CommandOutcome> {
        self.run(command, args, false)
    }

    /// Like [`execute`](Self::execute), additionally asking `kbc` for JSON output
    /// through a temporary file that is removed afterwards.
    pub fn execute_structured(
        &self,
        command: &str,
        args: &Map<String, Value>,
    ) -> Result<CommandOutcome> {
        self.run(command, args, true)
    }

    #[instrument(skip_all, fields(command, structured))]
    fn run(&self, command: &str, args: &Map<String, Value>, structured: bool) -> Result<CommandOutcome> {
        if !validate_command(command) {
            warn!(command, "command rejected by allow-list");
            return Err(GateError::CommandNotAllowed {
                command: command.to_string(),
                allowed: allowed_commands(),
            });
        }

        let ctx = self.resolver.branch_context()?;
        let (env, branch) = ctx.into_parts();

        let mut argv: Vec<String> = command.split_whitespace().map(str::to_string).collect();
        argv.extend(args_to_flags(args));

        let output_file = if structured {
            let file = tempfile::Builder::new()
                .prefix("kbc-output-")
                .suffix(".json")
                .tempfile()
                .map_err(|err| GateError::ExecutionError(format!("create output file: {err}")))?;
            argv.push(OUTPUT_JSON_FLAG.to_string());
            argv.push(file.path().display().to_string());
            Some(file)
        } else {
            None
        };

        let invocation = CliInvocation {
            program: self.cli_path.clone(),
            args: argv,
            workdir: self.workdir.clone(),
            env,
            timeout: self.timeout,
        };
        let command_line = invocation.command_line();

        let output = self
            .runner
            .run(&invocation)
            .map_err(|err| GateError::ExecutionError(format!("{err:#}")))?;

        if output.timed_out {
            return Err(GateError::CommandTimedOut {
                command: command.to_string(),
                timeout: self.timeout,
            });
        }

        if output.exit_code != Some(0) {
            info!(exit_code = ?output.exit_code, "kbc command failed");
            return Ok(CommandOutcome::Failed {
                command: command_line,
                branch,
                exit_code: output.exit_code,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }

        let structured = output_file.as_ref().and_then(|file| read_structured(file.path()));
        debug!(has_structured = structured.is_some(), "kbc command succeeded");
        Ok(CommandOutcome::Succeeded {
            command: command_line,
            branch,
            output: output.stdout,
            structured,
        })
    }
}

fn read_structured(path: &std::path::Path) -> Option<Value> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            warn!(err = %err, "structured output unreadable");
            return None;
        }
    };
    if contents.trim().is_empty() {
        return None;
    }
    match serde_json::from_str(&contents) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(err = %err, "structured output is not valid json");
            None
        }
    }
}
