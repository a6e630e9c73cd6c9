//! `kbc-mcp`: branch-aware Keboola CLI tool server.
//!
//! Add to an MCP client configuration:
//! ```json
//! {
//!   "mcpServers": {
//!     "keboola-cli": {
//!       "command": "kbc-mcp",
//!       "env": { "KBC_STORAGE_API_TOKEN": "..." }
//!     }
//!   }
//! }
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kbc_mcp::core::context::BRANCH_ENV_VAR;
use kbc_mcp::error::GateError;
use kbc_mcp::exit_codes;
use kbc_mcp::io::config::{CONFIG_ENV_VAR, Settings, load_settings};
use kbc_mcp::io::mapping_store::MappingStore;
use kbc_mcp::logging;
use kbc_mcp::resolver::BranchResolver;
use kbc_mcp::server::{ErrorBody, KbcService};
use rmcp::ServiceExt;
use rmcp::transport::stdio;
use serde_json::{Map, Value, json};
use tracing::info;

#[derive(Parser)]
#[command(
    name = "kbc-mcp",
    version,
    about = "Branch-aware MCP server for the Keboola CLI"
)]
struct Cli {
    /// TOML settings file.
    #[arg(long, global = true, env = CONFIG_ENV_VAR)]
    config: Option<PathBuf>,

    /// Project root (overrides KBC_WORKING_DIR).
    #[arg(long, global = true)]
    working_dir: Option<PathBuf>,

    /// Git branch that maps to production (overrides GIT_DEFAULT_BRANCH).
    #[arg(long, global = true)]
    default_branch: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve MCP tools over stdio (default).
    Serve,
    /// Print the branch context the next `kbc` command would run under.
    Resolve,
    /// Print the git -> Keboola branch mapping file.
    Mappings,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let settings = load_settings(cli.config.as_deref(), |settings| {
        if let Some(dir) = cli.working_dir {
            settings.working_dir = dir;
        }
        if let Some(branch) = cli.default_branch {
            settings.git_default_branch = branch;
        }
    })?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => cmd_serve(settings),
        Command::Resolve => Ok(cmd_resolve(&settings)),
        Command::Mappings => cmd_mappings(&settings),
    }
}

fn cmd_serve(settings: Settings) -> Result<i32> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    runtime.block_on(async move {
        info!(working_dir = %settings.working_dir.display(), "starting keboola-cli MCP server");
        let server = KbcService::new(&settings)
            .serve(stdio())
            .await
            .context("start MCP server")?;
        server.waiting().await.context("MCP server")?;
        info!("keboola-cli MCP server stopped");
        Ok(exit_codes::OK)
    })
}

fn cmd_resolve(settings: &Settings) -> i32 {
    let resolver = BranchResolver::from_settings(settings);
    match resolver.branch_context() {
        Ok(ctx) => {
            let headers: Map<String, Value> = ctx
                .request_headers()
                .into_iter()
                .map(|(name, value)| (name.to_string(), Value::String(value)))
                .collect();
            let mut summary = json!({
                "git_branch": ctx.current_branch(),
                "keboola_branch_id": ctx.workspace_id(),
                "is_production": ctx.is_production(),
                "is_default": ctx.is_default(),
                "env": {
                    BRANCH_ENV_VAR: ctx.env_var(BRANCH_ENV_VAR).map(|v| v.to_string_lossy().into_owned()),
                },
                "headers": headers,
            });
            if settings.proxy_mode {
                summary["mcp_server_url"] = Value::String(settings.mcp_server_url());
            }
            println!("{summary:#}");
            exit_codes::OK
        }
        Err(err) => {
            print_error(&err);
            match err {
                GateError::GitUnavailable(_)
                | GateError::ProjectUninitialized { .. }
                | GateError::ProjectCorrupt { .. }
                | GateError::ProjectMisconfigured
                | GateError::BranchUnmapped { .. } => exit_codes::UNRESOLVED,
                _ => exit_codes::INVALID,
            }
        }
    }
}

fn cmd_mappings(settings: &Settings) -> Result<i32> {
    let mappings = MappingStore::new(settings.mapping_file_path()).load();
    let text = serde_json::to_string_pretty(&mappings).context("serialize mappings")?;
    println!("{text}");
    Ok(exit_codes::OK)
}

fn print_error(err: &GateError) {
    let body = ErrorBody::from(err);
    match serde_json::to_string_pretty(&body) {
        Ok(text) => println!("{text}"),
        Err(_) => eprintln!("{err}"),
    }
}
