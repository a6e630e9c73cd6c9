//! MCP tool surface over stdio.
//!
//! Each tool resolves branch state from scratch. Blocking work (git, file
//! reads, `kbc` subprocesses) runs on the blocking pool so the transport stays
//! responsive while a long `kbc` command is in flight.

use std::sync::Arc;

use rmcp::handler::server::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo};
use rmcp::schemars;
use rmcp::{ErrorData as McpError, ServerHandler, tool, tool_handler, tool_router};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use crate::dispatch::{CommandDispatcher, CommandOutcome};
use crate::error::GateError;
use crate::io::cli::KbcCli;
use crate::io::config::Settings;
use crate::io::docs::{DocsClient, cli_query};
use crate::io::git::Git;
use crate::lifecycle::BranchLifecycle;
use crate::resolver::BranchResolver;

/// Name reported in the MCP handshake.
pub const SERVER_NAME: &str = "keboola-cli";

/// Error code for a `kbc` run that started but exited non-zero. Runs that could
/// not be started at all report `EXECUTION_ERROR`.
pub const CLI_ERROR: &str = "CLI_ERROR";

const INSTRUCTIONS: &str = "\
Keboola CLI tools with automatic git branch mapping.

Every git branch must be linked to a Keboola branch before running commands:
1. Run link_branch on a new git branch. It links to an existing Keboola branch \
with the same name or creates one. main/master always map to production.
2. Run kbc commands. They target the linked Keboola branch automatically.
3. Use get_mapping or list_mappings to inspect links, unlink_branch to remove one.

The project must be initialized with 'kbc sync init --allow-target-env'. \
Without it the branch override is ignored and commands would hit production, \
so every command is refused until the project is re-initialized.

Use search_cli_docs for questions about kbc commands and flags.";

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct KbcRequest {
    #[schemars(
        description = "kbc subcommand, e.g. 'sync push', 'remote table preview in.c-main.users'. Must start with an allow-listed command."
    )]
    pub command: String,
    #[schemars(
        description = "Flags as key/value pairs: true adds --flag, false/null omits it, arrays repeat the flag, other values become --flag value. Underscores become dashes."
    )]
    #[serde(default)]
    pub args: Option<Map<String, Value>>,
    #[schemars(description = "Ask kbc for JSON output and return it parsed alongside stdout.")]
    #[serde(default)]
    pub output_json: bool,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct LinkBranchRequest {
    #[schemars(
        description = "Keboola branch name to link or create. Defaults to the current git branch name."
    )]
    #[serde(default)]
    pub branch_name: Option<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct SearchDocsRequest {
    #[schemars(description = "Question about Keboola CLI usage.")]
    pub query: String,
}

/// Tool error payload: machine code, message and kind-specific context.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_mappings: Option<Vec<String>>,
}

impl From<&GateError> for ErrorBody {
    fn from(err: &GateError) -> Self {
        let (git_branch, available_mappings) = match err {
            GateError::BranchUnmapped { branch, known } => {
                (Some(branch.clone()), Some(known.clone()))
            }
            _ => (None, None),
        };
        Self {
            error: err.code(),
            message: err.to_string(),
            fix: err.fix(),
            git_branch,
            available_mappings,
        }
    }
}

fn json_result<T: Serialize>(value: &T) -> Result<CallToolResult, McpError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|err| McpError::internal_error(format!("serialize result: {err}"), None))?;
    Ok(CallToolResult::success(vec![Content::text(text)]))
}

fn json_error(body: Value) -> CallToolResult {
    let text = serde_json::to_string_pretty(&body).unwrap_or_else(|_| body.to_string());
    CallToolResult::error(vec![Content::text(text)])
}

/// Map a gate error to a tool error result.
pub fn gate_error_result(err: &GateError) -> CallToolResult {
    warn!(code = err.code(), err = %err, "tool call failed");
    json_error(json!(ErrorBody::from(err)))
}

/// Map a finished `kbc` run to a tool result; non-zero exits become tool errors.
pub fn outcome_result(outcome: &CommandOutcome) -> Result<CallToolResult, McpError> {
    match outcome {
        CommandOutcome::Succeeded { .. } => json_result(outcome),
        CommandOutcome::Failed {
            command,
            branch,
            exit_code,
            stdout,
            stderr,
        } => {
            let message = match exit_code {
                Some(code) => format!("Command '{command}' failed with exit code {code}"),
                None => format!("Command '{command}' was terminated by a signal"),
            };
            Ok(json_error(json!({
                "error": CLI_ERROR,
                "message": message,
                "git_branch": branch.git_branch,
                "keboola_branch_id": branch.keboola_branch_id,
                "exit_code": exit_code,
                "stdout": stdout,
                "stderr": stderr,
            })))
        }
    }
}

async fn blocking<T, F>(work: F) -> Result<T, McpError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| McpError::internal_error(format!("blocking task failed: {err}"), None))
}

#[derive(Clone)]
pub struct KbcService {
    dispatcher: Arc<CommandDispatcher<Git, KbcCli>>,
    lifecycle: Arc<BranchLifecycle<Git, KbcCli>>,
    docs: Option<Arc<DocsClient>>,
    tool_router: ToolRouter<Self>,
}

impl KbcService {
    pub fn new(settings: &Settings) -> Self {
        let resolver = Arc::new(BranchResolver::from_settings(settings));
        let dispatcher = CommandDispatcher::from_settings(resolver.clone(), KbcCli::default(), settings);
        let lifecycle = BranchLifecycle::from_settings(resolver, KbcCli::default(), settings);
        let docs = if settings.storage_token.is_empty() {
            None
        } else {
            match DocsClient::new(settings.ai_service_url(), &settings.storage_token) {
                Ok(client) => Some(Arc::new(client)),
                Err(err) => {
                    warn!(err = %err, "documentation search disabled");
                    None
                }
            }
        };
        Self {
            dispatcher: Arc::new(dispatcher),
            lifecycle: Arc::new(lifecycle),
            docs,
            tool_router: Self::tool_router(),
        }
    }
}

#[tool_router]
impl KbcService {
    #[tool(
        description = "Run an allow-listed Keboola CLI command against the Keboola branch linked to the current git branch."
    )]
    pub async fn kbc(
        &self,
        Parameters(request): Parameters<KbcRequest>,
    ) -> Result<CallToolResult, McpError> {
        let dispatcher = self.dispatcher.clone();
        let KbcRequest {
            command,
            args,
            output_json,
        } = request;
        let args = args.unwrap_or_default();
        let outcome = blocking(move || {
            if output_json {
                dispatcher.execute_structured(&command, &args)
            } else {
                dispatcher.execute(&command, &args)
            }
        })
        .await?;
        match outcome {
            Ok(outcome) => outcome_result(&outcome),
            Err(err) => Ok(gate_error_result(&err)),
        }
    }

    #[tool(
        description = "Link the current git branch to a Keboola branch, reusing an existing branch with the same name or creating a new one. main/master map to production."
    )]
    pub async fn link_branch(
        &self,
        Parameters(request): Parameters<LinkBranchRequest>,
    ) -> Result<CallToolResult, McpError> {
        let lifecycle = self.lifecycle.clone();
        let report = blocking(move || lifecycle.link(request.branch_name.as_deref())).await?;
        match report {
            Ok(report) => json_result(&report),
            Err(err) => Ok(gate_error_result(&err)),
        }
    }

    #[tool(
        description = "Remove the mapping for the current git branch. The Keboola branch itself is not deleted."
    )]
    pub async fn unlink_branch(&self) -> Result<CallToolResult, McpError> {
        let lifecycle = self.lifecycle.clone();
        match blocking(move || lifecycle.unlink()).await? {
            Ok(report) => json_result(&report),
            Err(err) => Ok(gate_error_result(&err)),
        }
    }

    #[tool(description = "Show the Keboola branch linked to the current git branch.")]
    pub async fn get_mapping(&self) -> Result<CallToolResult, McpError> {
        let lifecycle = self.lifecycle.clone();
        match blocking(move || lifecycle.status()).await? {
            Ok(status) => json_result(&status),
            Err(err) => Ok(gate_error_result(&err)),
        }
    }

    #[tool(description = "List all git branch to Keboola branch mappings.")]
    pub async fn list_mappings(&self) -> Result<CallToolResult, McpError> {
        let lifecycle = self.lifecycle.clone();
        let list = blocking(move || lifecycle.list()).await?;
        json_result(&list)
    }

    #[tool(description = "Search Keboola documentation for CLI usage, commands and flags.")]
    pub async fn search_cli_docs(
        &self,
        Parameters(request): Parameters<SearchDocsRequest>,
    ) -> Result<CallToolResult, McpError> {
        let Some(docs) = &self.docs else {
            return Ok(gate_error_result(&GateError::DocsQuery(
                "KBC_STORAGE_API_TOKEN environment variable is required".to_string(),
            )));
        };
        info!("searching cli docs");
        match docs.docs_question(&cli_query(&request.query)).await {
            Ok(answer) => json_result(&answer),
            Err(err) => Ok(gate_error_result(&err)),
        }
    }
}

#[tool_handler]
impl ServerHandler for KbcService {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(INSTRUCTIONS.to_string()),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: SERVER_NAME.to_string(),
                ..Implementation::from_build_env()
            },
            ..Default::default()
        }
    }
}
