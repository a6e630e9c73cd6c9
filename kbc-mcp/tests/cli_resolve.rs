//! CLI tests for `kbc-mcp resolve` and `kbc-mcp mappings`.
//!
//! Spawns the binary inside a scratch git repository and checks the printed
//! context and exit codes.

use std::process::{Command, Output};

use kbc_mcp::exit_codes;
use kbc_mcp::test_support::TestRepo;
use serde_json::Value;

fn kbc_mcp(repo: &TestRepo, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_kbc-mcp"))
        .args(args)
        .current_dir(repo.path())
        .env_remove("KBC_MCP_CONFIG")
        .env_remove("KBC_WORKING_DIR")
        .env_remove("KBC_MAPPING_FILE")
        .env_remove("GIT_DEFAULT_BRANCH")
        .env_remove("KBC_MCP_PROXY_MODE")
        .env_remove("KBC_STORAGE_API_HOST")
        .env_remove("KBC_BRANCH_ID")
        .output()
        .expect("run kbc-mcp")
}

fn stdout_json(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("json stdout")
}

#[test]
fn resolve_mapped_branch_prints_override_and_header() {
    let repo = TestRepo::new().expect("repo");
    repo.write_manifest(true, &[]).expect("manifest");
    repo.write_mapping(r#"{"main": null, "feature/x": "123"}"#).expect("mapping");
    repo.checkout_new("feature/x").expect("checkout");

    let output = kbc_mcp(&repo, &["resolve"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let body = stdout_json(&output);
    assert_eq!(body["git_branch"], "feature/x");
    assert_eq!(body["keboola_branch_id"], "123");
    assert_eq!(body["env"]["KBC_BRANCH_ID"], "123");
    assert_eq!(body["headers"]["X-Branch-Id"], "123");
    assert!(body.get("mcp_server_url").is_none());
}

#[test]
fn resolve_default_branch_is_production() {
    let repo = TestRepo::new().expect("repo");
    repo.write_manifest(true, &[]).expect("manifest");

    let output = kbc_mcp(&repo, &["resolve"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let body = stdout_json(&output);
    assert_eq!(body["is_production"], true);
    assert_eq!(body["env"]["KBC_BRANCH_ID"], Value::Null);
    assert_eq!(body["headers"], serde_json::json!({}));
}

#[test]
fn resolve_in_proxy_mode_reports_remote_endpoint() {
    let repo = TestRepo::new().expect("repo");
    repo.write_manifest(true, &[]).expect("manifest");

    let output = Command::new(env!("CARGO_BIN_EXE_kbc-mcp"))
        .arg("resolve")
        .current_dir(repo.path())
        .env_remove("KBC_WORKING_DIR")
        .env_remove("KBC_MAPPING_FILE")
        .env_remove("KBC_MCP_CONFIG")
        .env("KBC_MCP_PROXY_MODE", "true")
        .env("KBC_STORAGE_API_HOST", "connection.eu-central-1.keboola.com")
        .output()
        .expect("run kbc-mcp");
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert_eq!(
        stdout_json(&output)["mcp_server_url"],
        "https://mcp-agent.eu-central-1.keboola.com/mcp"
    );
}

#[test]
fn resolve_unmapped_branch_exits_unresolved() {
    let repo = TestRepo::new().expect("repo");
    repo.write_manifest(true, &[]).expect("manifest");
    repo.write_mapping(r#"{"main": null}"#).expect("mapping");
    repo.checkout_new("feature/new").expect("checkout");

    let output = kbc_mcp(&repo, &["resolve"]);
    assert_eq!(output.status.code(), Some(exit_codes::UNRESOLVED));
    let body = stdout_json(&output);
    assert_eq!(body["error"], "NO_MAPPING");
    assert_eq!(body["git_branch"], "feature/new");
}

#[test]
fn resolve_without_allow_target_env_exits_unresolved() {
    let repo = TestRepo::new().expect("repo");
    repo.write_manifest(false, &[]).expect("manifest");

    let output = kbc_mcp(&repo, &["resolve"]);
    assert_eq!(output.status.code(), Some(exit_codes::UNRESOLVED));
    let body = stdout_json(&output);
    assert_eq!(body["error"], "PROJECT_MISCONFIGURED");
    assert!(body["fix"].as_str().expect("fix").contains("--allow-target-env"));
}

#[test]
fn missing_config_file_is_invalid() {
    let repo = TestRepo::new().expect("repo");
    let output = kbc_mcp(&repo, &["--config", "missing.toml", "resolve"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
}

#[test]
fn mappings_prints_file_contents() {
    let repo = TestRepo::new().expect("repo");
    repo.write_mapping(r#"{"feature/x": "123", "main": null}"#).expect("mapping");

    let output = kbc_mcp(&repo, &["mappings"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert_eq!(
        stdout_json(&output),
        serde_json::json!({"feature/x": "123", "main": null})
    );
}
