use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::registry::RepoId;

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Lifecycle of one deployment run.
///
/// ```text
/// Pending -> Syncing -> SyncFailed
///                    -> Synced -> Running -> Succeeded | ScriptFailed
/// Pending -> ScriptNotFound
/// Pending -> Succeeded            (empty script)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Pending,
    Syncing,
    SyncFailed,
    Synced,
    Running,
    Succeeded,
    ScriptFailed,
    ScriptNotFound,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::SyncFailed | Self::Succeeded | Self::ScriptFailed | Self::ScriptNotFound
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::SyncFailed => "sync_failed",
            Self::Synced => "synced",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::ScriptFailed => "script_failed",
            Self::ScriptNotFound => "script_not_found",
        }
    }
}

/// What started a run.  Only affects reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Webhook,
    Manual,
}

// ---------------------------------------------------------------------------
// Request / report
// ---------------------------------------------------------------------------

/// Everything the executor needs for one run.
#[derive(Clone)]
pub struct DeployRequest {
    pub repo: RepoId,
    pub branch: String,
    pub work_dir: PathBuf,
    /// Bearer token used for the git sync, if the provider needs one.
    pub token: Option<String>,
    pub trigger: Trigger,
}

impl std::fmt::Debug for DeployRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeployRequest")
            .field("repo", &self.repo)
            .field("branch", &self.branch)
            .field("work_dir", &self.work_dir)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("trigger", &self.trigger)
            .finish()
    }
}

/// Exit status of one subprocess step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOutcome {
    /// Process exit code; `-1` when the process was killed by a signal.
    pub exit_code: i32,
}

impl StepOutcome {
    pub fn ok(&self) -> bool {
        self.exit_code == 0
    }
}

/// Final record of a finished run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub repo: String,
    pub branch: String,
    pub work_dir: PathBuf,
    pub trigger: Trigger,
    pub state: RunState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync: Option<StepOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<StepOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.state == RunState::Succeeded
    }

    /// Exit code of the step that decided the outcome, if any ran.
    pub fn exit_code(&self) -> Option<i32> {
        match self.state {
            RunState::SyncFailed => self.sync.map(|s| s.exit_code),
            _ => self.script.map(|s| s.exit_code),
        }
    }

    pub fn duration_secs(&self) -> f64 {
        (self.finished_at - self.started_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }

    /// One-line human summary used as the closing line of streamed output.
    pub fn summary(&self) -> String {
        match self.state {
            RunState::Succeeded => format!("DEPLOY SUCCEEDED: {} ({})", self.repo, self.branch),
            RunState::SyncFailed => match self.sync {
                Some(s) => format!(
                    "DEPLOY FAILED: git sync for {} exited with code {}",
                    self.repo, s.exit_code
                ),
                None => format!(
                    "DEPLOY FAILED: git sync for {} could not start: {}",
                    self.repo,
                    self.detail.as_deref().unwrap_or("unknown error")
                ),
            },
            RunState::ScriptFailed => match self.script {
                Some(s) => format!(
                    "DEPLOY FAILED: script for {} exited with code {}",
                    self.repo, s.exit_code
                ),
                None => format!(
                    "DEPLOY FAILED: script for {} could not start: {}",
                    self.repo,
                    self.detail.as_deref().unwrap_or("unknown error")
                ),
            },
            RunState::ScriptNotFound => {
                format!("DEPLOY FAILED: script not found for {}", self.repo)
            }
            other => format!("DEPLOY INCOMPLETE: {} ({})", self.repo, other.as_str()),
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Item delivered to the consumer of a run, in order.
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// One line of output, newline-terminated.
    Output(String),
    /// The run moved to a new state.
    State(RunState),
    /// The run is over; always the last event.
    Finished(RunReport),
}
