//! I/O adapters: filesystem state, git, `kbc` subprocesses and HTTP.

pub mod cli;
pub mod config;
pub mod docs;
pub mod git;
pub mod manifest;
pub mod mapping_store;
pub mod process;
