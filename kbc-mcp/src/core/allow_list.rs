//! Allow-list of `kbc` subcommands the dispatcher may run.

/// Subcommands accepted by the `kbc` tool, in display order.
pub const ALLOWED_COMMANDS: &[&str] = &[
    "sync push",
    "sync pull",
    "sync diff",
    "sync init",
    "remote job run",
    "remote table preview",
    "remote table download",
    "remote table upload",
    "remote create bucket",
    "remote create branch",
    "remote list branches",
    "local validate",
    "local create config",
    "local encrypt",
    "status",
];

/// Return true if `command` is an allow-listed entry, optionally followed by a
/// space and further arguments. Matching is case-insensitive.
///
/// A bare prefix never matches: `"sync"` is rejected even though it starts
/// `"sync push"`, and `"statusx"` is rejected even though `"status"` is listed.
pub fn validate_command(command: &str) -> bool {
    let normalized = command.trim().to_lowercase();
    ALLOWED_COMMANDS.iter().any(|allowed| {
        normalized == *allowed
            || normalized
                .strip_prefix(allowed)
                .is_some_and(|rest| rest.starts_with(' '))
    })
}

/// Allow-list as owned strings, for error payloads.
pub fn allowed_commands() -> Vec<String> {
    ALLOWED_COMMANDS.iter().map(|c| (*c).to_string()).collect()
}
