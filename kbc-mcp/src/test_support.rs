//! Test-only helpers: scratch git repositories, manifest fixtures and scripted
//! stand-ins for git and the `kbc` binary.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow, bail};
use serde_json::json;

use crate::error::GateError;
use crate::io::cli::{CliInvocation, CliOutput, CliRunner};
use crate::io::git::BranchSource;
use crate::io::manifest::MANIFEST_RELATIVE_PATH;

/// Temporary git repository with one commit on `main`.
pub struct TestRepo {
    temp: tempfile::TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create tempdir")?;
        let repo = Self { temp };
        repo.git(&["init", "--quiet"])?;
        repo.git(&["config", "user.email", "test@example.com"])?;
        repo.git(&["config", "user.name", "test"])?;
        repo.git(&["config", "commit.gpgsign", "false"])?;
        fs::write(repo.path().join("README.md"), "hi\n").context("write README")?;
        repo.git(&["add", "README.md"])?;
        repo.git(&["commit", "--quiet", "-m", "init"])?;
        repo.git(&["branch", "-M", "main"])?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    /// Run git in the repository, failing on non-zero exit. Returns trimmed stdout.
    pub fn git(&self, args: &[&str]) -> Result<String> {
        let out = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .output()
            .with_context(|| format!("run git {args:?}"))?;
        if !out.status.success() {
            bail!(
                "git {args:?} failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    pub fn checkout_new(&self, branch: &str) -> Result<()> {
        self.git(&["checkout", "--quiet", "-b", branch]).map(|_| ())
    }

    pub fn checkout(&self, branch: &str) -> Result<()> {
        self.git(&["checkout", "--quiet", branch]).map(|_| ())
    }

    pub fn write_manifest(&self, allow_target_env: bool, branches: &[(&str, &str)]) -> Result<PathBuf> {
        write_manifest(self.path(), allow_target_env, branches)
    }

    /// Write `branch-mapping.json` at the repository root.
    pub fn write_mapping(&self, contents: &str) -> Result<PathBuf> {
        let path = self.path().join("branch-mapping.json");
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }
}

/// Manifest body with the given `allowTargetEnv` and `(id, path)` branches.
pub fn manifest_json(allow_target_env: bool, branches: &[(&str, &str)]) -> String {
    let branches: Vec<_> = branches
        .iter()
        .map(|(id, path)| match id.parse::<u64>() {
            Ok(num) => json!({"id": num, "path": path}),
            Err(_) => json!({"id": id, "path": path}),
        })
        .collect();
    let doc = json!({
        "version": 2,
        "project": {"id": 1, "apiHost": "connection.keboola.com"},
        "allowTargetEnv": allow_target_env,
        "branches": branches,
    });
    format!("{doc:#}\n")
}

/// Write `.keboola/manifest.json` under `root`.
pub fn write_manifest(
    root: &Path,
    allow_target_env: bool,
    branches: &[(&str, &str)],
) -> Result<PathBuf> {
    let path = root.join(MANIFEST_RELATIVE_PATH);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(&path, manifest_json(allow_target_env, branches))
        .with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

/// Branch source whose current branch is set by the test. Clones share state.
#[derive(Debug, Clone)]
pub struct ScriptedBranch {
    current: Arc<Mutex<Option<String>>>,
}

impl ScriptedBranch {
    pub fn on(branch: &str) -> Self {
        Self {
            current: Arc::new(Mutex::new(Some(branch.to_string()))),
        }
    }

    pub fn switch(&self, branch: &str) {
        *self.current.lock().expect("branch lock") = Some(branch.to_string());
    }

    /// Simulate a detached HEAD.
    pub fn detach(&self) {
        *self.current.lock().expect("branch lock") = None;
    }
}

impl BranchSource for ScriptedBranch {
    fn current_branch(&self) -> crate::error::Result<String> {
        self.current
            .lock()
            .expect("branch lock")
            .clone()
            .ok_or_else(|| GateError::GitUnavailable("Not on a branch (possibly detached HEAD)".to_string()))
    }
}

enum ScriptedResponse {
    Output(CliOutput),
    /// Write JSON to the path following `--output-json`, then succeed.
    OutputJson(String),
    /// Write a file, then return the output.
    Writing {
        path: PathBuf,
        contents: String,
        output: CliOutput,
    },
    Failure(String),
}

#[derive(Default)]
struct ScriptedCliState {
    responses: VecDeque<ScriptedResponse>,
    invocations: Vec<CliInvocation>,
}

/// `kbc` runner that replays queued responses and records invocations.
/// Clones share state.
#[derive(Clone, Default)]
pub struct ScriptedCli {
    state: Arc<Mutex<ScriptedCliState>>,
}

impl ScriptedCli {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, response: ScriptedResponse) {
        self.state
            .lock()
            .expect("cli lock")
            .responses
            .push_back(response);
    }

    pub fn push_output(&self, output: CliOutput) {
        self.push(ScriptedResponse::Output(output));
    }

    pub fn push_output_json(&self, json: &str) {
        self.push(ScriptedResponse::OutputJson(json.to_string()));
    }

    pub fn push_output_writing(&self, path: impl Into<PathBuf>, contents: impl Into<String>, output: CliOutput) {
        self.push(ScriptedResponse::Writing {
            path: path.into(),
            contents: contents.into(),
            output,
        });
    }

    /// Queue a spawn-level failure (the process could not be run).
    pub fn push_failure(&self, message: &str) {
        self.push(ScriptedResponse::Failure(message.to_string()));
    }

    pub fn invocations(&self) -> Vec<CliInvocation> {
        self.state.lock().expect("cli lock").invocations.clone()
    }
}

/// Successful output with the given stdout.
pub fn ok_output(stdout: &str) -> CliOutput {
    CliOutput {
        exit_code: Some(0),
        stdout: stdout.to_string(),
        stderr: String::new(),
        timed_out: false,
    }
}

impl CliRunner for ScriptedCli {
    fn run(&self, invocation: &CliInvocation) -> Result<CliOutput> {
        let response = {
            let mut state = self.state.lock().expect("cli lock");
            state.invocations.push(invocation.clone());
            state.responses.pop_front()
        };
        match response {
            None => Err(anyhow!("no scripted response for {}", invocation.command_line())),
            Some(ScriptedResponse::Output(output)) => Ok(output),
            Some(ScriptedResponse::Failure(message)) => Err(anyhow!(message)),
            Some(ScriptedResponse::OutputJson(json)) => {
                let at = invocation
                    .args
                    .iter()
                    .position(|a| a == "--output-json")
                    .context("invocation has no --output-json flag")?;
                let path = invocation
                    .args
                    .get(at + 1)
                    .context("--output-json without a path")?;
                fs::write(path, json).with_context(|| format!("write {path}"))?;
                Ok(ok_output(""))
            }
            Some(ScriptedResponse::Writing {
                path,
                contents,
                output,
            }) => {
                fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
                Ok(output)
            }
        }
    }
}
