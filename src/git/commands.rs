//! Git command builders using [`tokio::process::Command`].
//!
//! The builders only assemble commands; running them and streaming their
//! output is the deploy runner's job.

use std::borrow::Cow;
use std::path::Path;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use base64::Engine;
use tokio::process::Command;
use tracing::debug;

use crate::registry::RepoId;

// ---------------------------------------------------------------------------
// Sync plan
// ---------------------------------------------------------------------------

/// Which git operation brings a working directory up to date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPlan {
    /// No checkout yet: clone the branch into the directory.
    Clone,
    /// Existing checkout: pull the branch into it.
    Pull,
}

impl SyncPlan {
    /// Decide between clone and pull by looking for `.git` in `work_dir`.
    ///
    /// Callers must hold the working-directory lock across this check and
    /// the command it selects, otherwise two runs could both decide to clone.
    pub fn for_dir(work_dir: &Path) -> Self {
        if work_dir.join(".git").exists() {
            Self::Pull
        } else {
            Self::Clone
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clone => "clone",
            Self::Pull => "pull",
        }
    }
}

/// Build the clone-or-pull command for `work_dir`.
///
/// * clone: `git clone --branch <branch> --single-branch <url> <work_dir>`
/// * pull:  `git -C <work_dir> pull origin <branch>`
pub fn sync_command(
    plan: SyncPlan,
    url: &str,
    branch: &str,
    work_dir: &Path,
    env_vars: &[(String, String)],
) -> Command {
    let mut cmd = Command::new("git");
    match plan {
        SyncPlan::Clone => {
            cmd.arg("clone")
                .arg("--branch")
                .arg(branch)
                .arg("--single-branch")
                .arg("--")
                .arg(url)
                .arg(work_dir);
        }
        SyncPlan::Pull => {
            cmd.arg("-C")
                .arg(work_dir)
                .arg("pull")
                .arg("origin")
                .arg(branch);
        }
    }

    cmd.env("GIT_TERMINAL_PROMPT", "0");
    for (k, v) in env_vars {
        cmd.env(k, v);
    }

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    debug!(plan = plan.as_str(), %branch, work_dir = %work_dir.display(), "built git sync command");
    cmd
}

/// HTTPS clone URL for `repo` under `git_url` (e.g. `https://github.com`).
pub fn clone_url(git_url: &str, repo: &RepoId) -> String {
    format!(
        "{}/{}/{}.git",
        git_url.trim_end_matches('/'),
        repo.owner(),
        repo.name()
    )
}

/// Environment that makes git send `token` to `git_url` as basic auth.
///
/// Uses git's `GIT_CONFIG_COUNT` mechanism to set a URL-scoped
/// `http.extraHeader`, so the token is neither an argument nor persisted in
/// `.git/config`.
pub fn auth_env(git_url: &str, token: Option<&str>) -> Vec<(String, String)> {
    let Some(token) = token.filter(|t| !t.is_empty()) else {
        return Vec::new();
    };
    let basic = base64::engine::general_purpose::STANDARD.encode(format!("x-access-token:{token}"));
    vec![
        ("GIT_CONFIG_COUNT".to_string(), "1".to_string()),
        (
            "GIT_CONFIG_KEY_0".to_string(),
            format!("http.{}/.extraHeader", git_url.trim_end_matches('/')),
        ),
        (
            "GIT_CONFIG_VALUE_0".to_string(),
            format!("Authorization: Basic {basic}"),
        ),
    ]
}

// ---------------------------------------------------------------------------
// Branch validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BranchError {
    #[error("branch name must not be empty")]
    Empty,
    #[error("branch name {0:?} is not a valid git ref name")]
    Invalid(String),
}

/// Reject names git would refuse or could read as an option.
///
/// A subset of `git check-ref-format`: no leading `-` or `/`, no `..`, no
/// whitespace, control or glob characters, no trailing `/`, `.` or `.lock`.
pub fn validate_branch(branch: &str) -> Result<(), BranchError> {
    if branch.is_empty() {
        return Err(BranchError::Empty);
    }
    let bad_char = branch.chars().any(|c| {
        c.is_whitespace() || c.is_control() || matches!(c, '~' | '^' | ':' | '?' | '*' | '[' | '\\')
    });
    let invalid = bad_char
        || branch.starts_with('-')
        || branch.starts_with('/')
        || branch.ends_with('/')
        || branch.ends_with('.')
        || branch.ends_with(".lock")
        || branch.contains("..")
        || branch.contains("//")
        || branch.contains("@{")
        || branch == "@";
    if invalid {
        return Err(BranchError::Invalid(branch.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Misc
// ---------------------------------------------------------------------------

/// `git --version`, used by the health check.
pub async fn git_version() -> Result<String> {
    let output = Command::new("git")
        .arg("--version")
        .stdin(Stdio::null())
        .output()
        .await
        .context("failed to spawn git --version")?;
    if !output.status.success() {
        bail!("git --version exited with status {}", output.status);
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Replace every occurrence of `secret` in `text` with `***`.
pub fn redact<'a>(text: &'a str, secret: Option<&str>) -> Cow<'a, str> {
    match secret {
        Some(s) if !s.is_empty() && text.contains(s) => Cow::Owned(text.replace(s, "***")),
        _ => Cow::Borrowed(text),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
