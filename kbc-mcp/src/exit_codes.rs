//! Stable exit codes for `kbc-mcp` commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid configuration, arguments or other errors.
pub const INVALID: i32 = 1;
/// Branch context could not be resolved (git, project guard or missing mapping).
pub const UNRESOLVED: i32 = 2;
