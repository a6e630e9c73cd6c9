//! Branch-aware tool server for the Keboola CLI.
//!
//! Every `kbc` invocation is bound to the Keboola development branch linked to
//! the current git branch. The mapping lives in a small JSON file; the binding
//! is applied through the `KBC_BRANCH_ID` override, which `kbc` honors only for
//! projects initialized with `--allow-target-env`.
//!
//! - **[`core`]**: Pure logic (allow-list, flag rendering, execution context).
//! - **[`io`]**: Side effects (git, manifest, mapping file, subprocesses, HTTP).
//!
//! [`resolver`], [`dispatch`] and [`lifecycle`] combine the two; [`server`]
//! exposes them as MCP tools.

pub mod core;
pub mod dispatch;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod lifecycle;
pub mod logging;
pub mod resolver;
pub mod server;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
