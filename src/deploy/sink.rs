//! Output tee for a running deployment.
//!
//! Each line produced by git or the script goes to two independent sinks:
//! a `tracing` event and the run's event channel.  The channel is unbounded
//! so a slow or departed HTTP client never stalls the subprocess, and a
//! closed channel is ignored so the run still reaches a terminal state.

use tokio::sync::mpsc::UnboundedSender;
use tracing::info;

use super::run::{RunEvent, RunState};
use crate::git::redact;

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

#[derive(Clone)]
pub struct OutputSink {
    tx: UnboundedSender<RunEvent>,
    repo: String,
    secret: Option<String>,
}

impl OutputSink {
    /// `secret`, when given, is masked out of every line before it reaches
    /// either sink.
    pub fn new(tx: UnboundedSender<RunEvent>, repo: impl Into<String>, secret: Option<String>) -> Self {
        Self {
            tx,
            repo: repo.into(),
            secret: secret.filter(|s| !s.is_empty()),
        }
    }

    /// Forward one line of subprocess output.
    pub fn line(&self, stream: OutputStream, text: &str) {
        let text = redact(text, self.secret.as_deref());
        info!(
            target: "pushdeploy::deploy::output",
            repo = %self.repo,
            stream = stream.as_str(),
            "{text}"
        );
        let _ = self.tx.send(RunEvent::Output(format!("{text}\n")));
    }

    /// Forward a progress line written by the executor itself.
    pub fn note(&self, text: impl AsRef<str>) {
        let text = redact(text.as_ref(), self.secret.as_deref());
        info!(target: "pushdeploy::deploy::output", repo = %self.repo, stream = "executor", "{text}");
        let _ = self.tx.send(RunEvent::Output(format!("==> {text}\n")));
    }

    pub(crate) fn state(&self, state: RunState) {
        info!(repo = %self.repo, state = state.as_str(), "deployment state changed");
        let _ = self.tx.send(RunEvent::State(state));
    }

    pub(crate) fn finish(&self, event: RunEvent) {
        let _ = self.tx.send(event);
    }
}
