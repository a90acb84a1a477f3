//! Job workers, one per action.
//!
//! [`run_job`] is the single entrypoint used by the engine: it re-validates
//! the job spec, dispatches to the worker for the action and turns the outcome
//! into a terminal [`JobStatus`].

mod delete;
mod export;
mod migrate;
mod mover;
mod pull;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use provisioning_core::{validation, Job, JobAction, JobStatus, Repository, Settings};

use crate::error::SyncError;
use crate::progress::JobProgress;
use crate::repository::{RepositoryAdapter, WriteOptions};
use crate::resources::ResourceStore;

pub use delete::DeleteWorker;
pub use export::{export_path, ExportWorker};
pub use migrate::MigrateWorker;
pub use mover::MoveWorker;
pub use pull::{pull, PullWorker};

/// Everything a worker touches, handed in by the engine.
#[derive(Clone)]
pub struct JobContext {
    pub repository: Repository,
    pub adapter: Arc<dyn RepositoryAdapter>,
    pub store: Arc<dyn ResourceStore>,
    pub settings: Settings,
}

impl JobContext {
    /// `true` when `git_ref` names something other than the default branch.
    fn is_other_ref(&self, git_ref: Option<&str>) -> bool {
        match (git_ref, self.adapter.default_branch()) {
            (None, _) => false,
            (Some(r), Some(default)) => r != default,
            (Some(_), None) => true,
        }
    }

    fn write_options(&self, branch: Option<&str>, message: String) -> WriteOptions {
        WriteOptions {
            branch: branch
                .filter(|b| self.is_other_ref(Some(b)))
                .map(str::to_owned),
            message,
        }
    }
}

pub trait Worker: Send + Sync {
    fn action(&self) -> JobAction;

    fn process(
        &self,
        ctx: &JobContext,
        job: &Job,
        progress: &mut JobProgress,
    ) -> Result<(), SyncError>;
}

pub fn worker_for(action: JobAction) -> &'static dyn Worker {
    match action {
        JobAction::Pull => &PullWorker,
        JobAction::Push => &ExportWorker,
        JobAction::Delete => &DeleteWorker,
        JobAction::Move => &MoveWorker,
        JobAction::Migrate => &MigrateWorker,
    }
}

/// Run `job` to completion. Never returns a non-terminal state.
pub fn run_job(ctx: &JobContext, job: &Job, cancel: CancellationToken) -> JobStatus {
    let mut progress = JobProgress::new(ctx.settings.max_errors, cancel);
    let result = match validation::validate_job_spec(&job.spec) {
        Ok(action) => {
            let worker = worker_for(action);
            tracing::info!(
                job = %job.name,
                repository = %ctx.repository.name,
                action = %worker.action(),
                "processing job"
            );
            worker.process(ctx, job, &mut progress)
        }
        Err(e) => Err(SyncError::Rejected(e.to_string())),
    };

    match ctx.adapter.latest_ref() {
        Ok(head) => progress.set_ref(head),
        Err(e) => tracing::debug!(repository = %ctx.repository.name, error = %e, "no latest ref"),
    }

    let status = progress.complete(result);
    match status.state {
        provisioning_core::JobState::Error => {
            tracing::error!(job = %job.name, message = %status.message, "job failed")
        }
        state => tracing::info!(job = %job.name, state = %state, message = %status.message, "job finished"),
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_action_has_a_worker() {
        for action in JobAction::all() {
            assert_eq!(worker_for(*action).action(), *action);
        }
    }
}
