//! Server settings: defaults, an optional TOML file, then environment overrides.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Environment variable naming an optional TOML settings file.
pub const CONFIG_ENV_VAR: &str = "KBC_MCP_CONFIG";

/// Server settings (TOML).
///
/// Every field can also be set from the environment; see [`Settings::apply_env`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    /// Storage API token, sent to the documentation service.
    pub storage_token: String,

    /// Storage API host, e.g. `connection.keboola.com`.
    pub storage_api_host: String,

    /// Git branch that always maps to production (in addition to main/master).
    pub git_default_branch: String,

    /// Project root: cwd for `git` and `kbc`, home of `.keboola/manifest.json`.
    pub working_dir: PathBuf,

    /// Mapping file; relative paths are resolved against `working_dir`.
    pub mapping_file: PathBuf,

    /// `kbc` binary (name on PATH or absolute path).
    pub cli_path: PathBuf,

    /// Report the remote MCP endpoint for branch-aware proxying.
    pub proxy_mode: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            storage_token: String::new(),
            storage_api_host: "connection.keboola.com".to_string(),
            git_default_branch: "main".to_string(),
            working_dir: PathBuf::from("."),
            mapping_file: PathBuf::from("branch-mapping.json"),
            cli_path: PathBuf::from("kbc"),
            proxy_mode: false,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.storage_api_host.trim().is_empty() {
            return Err(anyhow!("storage_api_host must not be empty"));
        }
        if self.git_default_branch.trim().is_empty() {
            return Err(anyhow!("git_default_branch must not be empty"));
        }
        if self.cli_path.as_os_str().is_empty() {
            return Err(anyhow!("cli_path must not be empty"));
        }
        Ok(())
    }

    /// Settings required by tools that call the Storage API.
    pub fn validate_required(&self) -> Result<()> {
        if self.storage_token.is_empty() {
            return Err(anyhow!(
                "KBC_STORAGE_API_TOKEN environment variable is required"
            ));
        }
        self.validate()
    }

    /// Override fields from environment variables read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup("KBC_STORAGE_API_TOKEN") {
            self.storage_token = token;
        }
        if let Some(host) = lookup("KBC_STORAGE_API_HOST") {
            self.storage_api_host = host;
        }
        if let Some(branch) = lookup("GIT_DEFAULT_BRANCH") {
            self.git_default_branch = branch;
        }
        if let Some(dir) = lookup("KBC_WORKING_DIR") {
            self.working_dir = PathBuf::from(dir);
        }
        if let Some(file) = lookup("KBC_MAPPING_FILE") {
            self.mapping_file = PathBuf::from(file);
        }
        if let Some(cli) = lookup("KBC_CLI_PATH") {
            self.cli_path = PathBuf::from(cli);
        }
        if let Some(flag) = lookup("KBC_MCP_PROXY_MODE") {
            self.proxy_mode = matches!(flag.to_lowercase().as_str(), "true" | "1" | "yes");
        }
    }

    /// Absolute (or working-dir relative) path of the mapping file.
    pub fn mapping_file_path(&self) -> PathBuf {
        if self.mapping_file.is_absolute() {
            return self.mapping_file.clone();
        }
        self.working_dir.join(&self.mapping_file)
    }

    pub fn storage_api_url(&self) -> String {
        format!("https://{}", self.storage_api_host)
    }

    /// AI service base URL: `connection.` becomes `ai.`; otherwise the first
    /// host label is replaced with `ai`.
    pub fn ai_service_url(&self) -> String {
        let host = self.storage_api_host.as_str();
        let ai_host = match host.strip_prefix("connection.") {
            Some(rest) => format!("ai.{rest}"),
            None => match host.split_once('.') {
                Some((_, rest)) => format!("ai.{rest}"),
                None => format!("ai.{host}"),
            },
        };
        format!("https://{ai_host}")
    }

    /// Remote Keboola MCP endpoint: `connection.` becomes `mcp-agent.`;
    /// otherwise `mcp-agent.` is prefixed.
    pub fn mcp_server_url(&self) -> String {
        let host = self.storage_api_host.as_str();
        let mcp_host = match host.strip_prefix("connection.") {
            Some(rest) => format!("mcp-agent.{rest}"),
            None => format!("mcp-agent.{host}"),
        };
        format!("https://{mcp_host}/mcp")
    }
}

/// Load settings from an optional TOML file, apply process environment
/// overrides, then `overrides` (command-line flags), and validate once.
///
/// A missing file is an error only when explicitly requested.
pub fn load_settings<F>(path: Option<&Path>, overrides: F) -> Result<Settings>
where
    F: FnOnce(&mut Settings),
{
    let mut settings = match path {
        Some(path) => load_file(path)?,
        None => Settings::default(),
    };
    settings.apply_env(|key| std::env::var(key).ok());
    overrides(&mut settings);
    if settings.working_dir == Path::new(".") {
        settings.working_dir = std::env::current_dir().context("resolve current directory")?;
    }
    settings.validate()?;
    debug!(
        working_dir = %settings.working_dir.display(),
        mapping_file = %settings.mapping_file_path().display(),
        default_branch = %settings.git_default_branch,
        "settings loaded"
    );
    Ok(settings)
}

fn load_file(path: &Path) -> Result<Settings> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let settings: Settings =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    Ok(settings)
}
