//! Git command construction for working-copy syncs.
//!
//! Commands are built as argument vectors for [`tokio::process::Command`];
//! nothing here goes through a shell.  Credentials reach git through
//! environment variables so they never appear in process listings or in the
//! checkout's remote configuration.

pub mod commands;

pub use commands::{
    auth_env, clone_url, git_version, redact, sync_command, validate_branch, BranchError,
    SyncPlan,
};
