//! Subprocess side of a deployment: the git sync and the script run.
//!
//! [`StepRunner`] is the seam between the executor's state machine and the
//! operating system.  [`ProcessRunner`] is the real implementation; tests
//! substitute their own.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, instrument};

use super::sink::{OutputSink, OutputStream};
use crate::git::{self, SyncPlan};
use crate::registry::RepoId;

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct SyncJob {
    pub repo: RepoId,
    pub branch: String,
    pub work_dir: PathBuf,
    pub token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ScriptJob {
    pub repo: RepoId,
    pub branch: String,
    pub work_dir: PathBuf,
    pub script_path: PathBuf,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Runs the two subprocess steps of a deployment, streaming their output
/// into `sink` and returning the exit code.
///
/// An `Err` means the step could not be run at all (for example the binary
/// is missing); the executor treats it like a non-zero exit.
#[async_trait::async_trait]
pub trait StepRunner: Send + Sync {
    async fn sync(&self, job: &SyncJob, sink: &OutputSink) -> Result<i32>;

    async fn run_script(&self, job: &ScriptJob, sink: &OutputSink) -> Result<i32>;
}

// ---------------------------------------------------------------------------
// Process-backed implementation
// ---------------------------------------------------------------------------

pub struct ProcessRunner {
    git_url: String,
    shell: String,
}

impl ProcessRunner {
    pub fn new(git_url: impl Into<String>, shell: impl Into<String>) -> Self {
        Self {
            git_url: git_url.into(),
            shell: shell.into(),
        }
    }
}

#[async_trait::async_trait]
impl StepRunner for ProcessRunner {
    #[instrument(skip(self, job, sink), fields(repo = %job.repo, branch = %job.branch))]
    async fn sync(&self, job: &SyncJob, sink: &OutputSink) -> Result<i32> {
        let plan = SyncPlan::for_dir(&job.work_dir);
        let url = git::clone_url(&self.git_url, &job.repo);
        let env = git::auth_env(&self.git_url, job.token.as_deref());

        sink.note(format!(
            "git {} {} (branch {}) in {}",
            plan.as_str(),
            job.repo,
            job.branch,
            job.work_dir.display()
        ));

        let cmd = git::sync_command(plan, &url, &job.branch, &job.work_dir, &env);
        run_streaming(cmd, sink).await
    }

    #[instrument(skip(self, job, sink), fields(repo = %job.repo, branch = %job.branch))]
    async fn run_script(&self, job: &ScriptJob, sink: &OutputSink) -> Result<i32> {
        sink.note(format!(
            "running {} in {}",
            job.script_path.display(),
            job.work_dir.display()
        ));

        let mut cmd = Command::new(&self.shell);
        cmd.arg(&job.script_path)
            .current_dir(&job.work_dir)
            .env("DEPLOY_OWNER", job.repo.owner())
            .env("DEPLOY_REPO", job.repo.name())
            .env("DEPLOY_BRANCH", &job.branch)
            .env("DEPLOY_WORKDIR", &job.work_dir);
        run_streaming(cmd, sink).await
    }
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

/// Spawn `cmd`, forward stdout and stderr line by line as they arrive, and
/// return the exit code (`-1` if the process died from a signal).
///
/// The child is not killed if the caller goes away; a started step always
/// runs to completion.
pub async fn run_streaming(mut cmd: Command, sink: &OutputSink) -> Result<i32> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {program}"))?;

    let stdout = child
        .stdout
        .take()
        .context("failed to capture child stdout")?;
    let stderr = child
        .stderr
        .take()
        .context("failed to capture child stderr")?;

    let (out, err) = tokio::join!(
        forward_lines(stdout, OutputStream::Stdout, sink),
        forward_lines(stderr, OutputStream::Stderr, sink),
    );
    out?;
    err?;

    let status = child
        .wait()
        .await
        .with_context(|| format!("failed to wait on {program}"))?;
    debug!(%program, %status, "child exited");
    Ok(status.code().unwrap_or(-1))
}

async fn forward_lines<R>(reader: R, stream: OutputStream, sink: &OutputSink) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let n = reader
            .read_until(b'\n', &mut buf)
            .await
            .context("failed to read child output")?;
        if n == 0 {
            return Ok(());
        }
        let line = String::from_utf8_lossy(&buf);
        sink.line(stream, line.trim_end_matches(['\n', '\r']));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
