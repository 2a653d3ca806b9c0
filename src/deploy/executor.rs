use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{info, warn, Instrument};

use super::locks::WorkDirLocks;
use super::run::{DeployRequest, RunEvent, RunReport, RunState, StepOutcome};
use super::runner::{ScriptJob, StepRunner, SyncJob};
use super::sink::OutputSink;
use crate::metrics::MetricsRegistry;
use crate::registry::ScriptRegistry;

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Consumer side of a run started by [`DeployExecutor::execute`].
///
/// Dropping the handle does not stop the run.
pub struct RunHandle {
    events: mpsc::UnboundedReceiver<RunEvent>,
}

impl RunHandle {
    /// Events in order, ending with [`RunEvent::Finished`].
    pub fn into_stream(self) -> impl Stream<Item = RunEvent> + Send + 'static {
        UnboundedReceiverStream::new(self.events)
    }

    /// Wait for the run to finish, returning the report and the combined
    /// output.  `None` if the run task died without reporting.
    pub async fn collect(mut self) -> Option<(RunReport, String)> {
        let mut output = String::new();
        while let Some(event) = self.events.recv().await {
            match event {
                RunEvent::Output(text) => output.push_str(&text),
                RunEvent::State(_) => {}
                RunEvent::Finished(report) => return Some((report, output)),
            }
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Drives deployment runs: script lookup, per-directory locking, git sync,
/// then the script itself.
#[derive(Clone)]
pub struct DeployExecutor {
    registry: ScriptRegistry,
    runner: Arc<dyn StepRunner>,
    locks: WorkDirLocks,
    metrics: MetricsRegistry,
}

impl DeployExecutor {
    pub fn new(
        registry: ScriptRegistry,
        runner: Arc<dyn StepRunner>,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            registry,
            runner,
            locks: WorkDirLocks::new(),
            metrics,
        }
    }

    /// Start a run on a background task and return its event stream.
    ///
    /// The run proceeds to a terminal state regardless of whether anyone is
    /// still reading the handle.
    pub fn execute(&self, request: DeployRequest) -> RunHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = OutputSink::new(tx, request.repo.full_name(), request.token.clone());
        let span = tracing::info_span!(
            "deploy",
            repo = %request.repo,
            branch = %request.branch,
            trigger = ?request.trigger,
        );

        let this = self.clone();
        tokio::spawn(
            async move {
                this.metrics.metrics.deploys_in_progress.inc();
                let report = this.drive(request, &sink).await;
                this.metrics.metrics.deploys_in_progress.dec();
                this.metrics.metrics.observe_run(&report);
                info!(
                    state = report.state.as_str(),
                    duration_secs = report.duration_secs(),
                    "deployment finished"
                );
                sink.finish(RunEvent::Finished(report));
            }
            .instrument(span),
        );

        RunHandle { events: rx }
    }

    async fn drive(&self, request: DeployRequest, sink: &OutputSink) -> RunReport {
        let mut run = RunRecord::start(&request);
        sink.state(RunState::Pending);

        // 1. The script decides whether there is anything to do at all.
        let script = match self.registry.lookup_script(&request.repo).await {
            Ok(Some(text)) => text,
            Ok(None) => {
                sink.note(format!("no deployment script registered for {}", request.repo));
                return run.finish(sink, RunState::ScriptNotFound);
            }
            Err(e) => {
                warn!(error = %format!("{e:#}"), "failed to read deployment script");
                sink.note(format!("deployment script for {} could not be read", request.repo));
                run.detail = Some(format!("{e:#}"));
                return run.finish(sink, RunState::ScriptNotFound);
            }
        };
        if script.trim().is_empty() {
            return run.finish(sink, RunState::Succeeded);
        }

        // 2. Own the working directory until the run is over.
        let _guard = match self.locks.try_acquire(&request.work_dir) {
            Some(guard) => guard,
            None => {
                self.metrics.metrics.workdir_lock_waits.inc();
                sink.note(format!(
                    "waiting for another deployment in {}",
                    request.work_dir.display()
                ));
                self.locks.acquire(&request.work_dir).await
            }
        };

        // 3. Sync.
        sink.state(RunState::Syncing);
        if let Err(e) = tokio::fs::create_dir_all(&request.work_dir).await {
            sink.note(format!(
                "cannot create working directory {}: {e}",
                request.work_dir.display()
            ));
            run.detail = Some(e.to_string());
            self.metrics.metrics.observe_sync(false);
            return run.finish(sink, RunState::SyncFailed);
        }

        let sync_job = SyncJob {
            repo: request.repo.clone(),
            branch: request.branch.clone(),
            work_dir: request.work_dir.clone(),
            token: request.token.clone(),
        };
        let sync = match self.runner.sync(&sync_job, sink).await {
            Ok(exit_code) => StepOutcome { exit_code },
            Err(e) => {
                sink.note(format!("git sync could not run: {e:#}"));
                run.detail = Some(format!("{e:#}"));
                self.metrics.metrics.observe_sync(false);
                return run.finish(sink, RunState::SyncFailed);
            }
        };
        run.sync = Some(sync);
        self.metrics.metrics.observe_sync(sync.ok());
        if !sync.ok() {
            return run.finish(sink, RunState::SyncFailed);
        }
        sink.state(RunState::Synced);

        // 4. Script.
        sink.state(RunState::Running);
        let script_job = ScriptJob {
            repo: request.repo.clone(),
            branch: request.branch.clone(),
            work_dir: request.work_dir.clone(),
            script_path: self.registry.script_path(&request.repo),
        };
        let outcome = match self.runner.run_script(&script_job, sink).await {
            Ok(exit_code) => StepOutcome { exit_code },
            Err(e) => {
                sink.note(format!("script could not run: {e:#}"));
                run.detail = Some(format!("{e:#}"));
                return run.finish(sink, RunState::ScriptFailed);
            }
        };
        run.script = Some(outcome);
        let state = if outcome.ok() {
            RunState::Succeeded
        } else {
            RunState::ScriptFailed
        };
        run.finish(sink, state)
    }
}

/// Report under construction.
struct RunRecord {
    repo: String,
    branch: String,
    work_dir: PathBuf,
    trigger: super::run::Trigger,
    sync: Option<StepOutcome>,
    script: Option<StepOutcome>,
    detail: Option<String>,
    started_at: chrono::DateTime<Utc>,
}

impl RunRecord {
    fn start(request: &DeployRequest) -> Self {
        Self {
            repo: request.repo.full_name(),
            branch: request.branch.clone(),
            work_dir: request.work_dir.clone(),
            trigger: request.trigger,
            sync: None,
            script: None,
            detail: None,
            started_at: Utc::now(),
        }
    }

    fn finish(self, sink: &OutputSink, state: RunState) -> RunReport {
        debug_assert!(state.is_terminal());
        sink.state(state);
        RunReport {
            repo: self.repo,
            branch: self.branch,
            work_dir: self.work_dir,
            trigger: self.trigger,
            state,
            sync: self.sync,
            script: self.script,
            detail: self.detail,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
