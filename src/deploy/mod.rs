//! Deployment execution.
//!
//! A run resolves the registered script for a repository, takes the
//! per-working-directory lock, clones or pulls the requested branch and then
//! runs the script inside the working copy.  Output from both subprocesses is
//! teed to the log and to a per-run event channel so HTTP handlers can stream
//! or buffer it.

pub mod executor;
pub mod locks;
pub mod run;
pub mod runner;
pub mod sink;
pub mod workdir;

pub use executor::{DeployExecutor, RunHandle};
pub use locks::{WorkDirGuard, WorkDirLocks};
pub use run::{DeployRequest, RunEvent, RunReport, RunState, StepOutcome, Trigger};
pub use runner::{ProcessRunner, ScriptJob, StepRunner, SyncJob};
pub use sink::{OutputSink, OutputStream};
pub use workdir::{resolve_work_dir, WorkDirError};
