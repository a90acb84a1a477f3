//! Migrate: export everything into the repository, then pull it back so the
//! store is managed from files.

use provisioning_core::{Job, JobAction, PullOptions, PushOptions};

use crate::error::{Context, SyncError};
use crate::progress::JobProgress;

use super::export::export;
use super::{pull, JobContext, Worker};

pub struct MigrateWorker;

impl Worker for MigrateWorker {
    fn action(&self) -> JobAction {
        JobAction::Migrate
    }

    fn process(
        &self,
        ctx: &JobContext,
        job: &Job,
        progress: &mut JobProgress,
    ) -> Result<(), SyncError> {
        let options = job.spec.migrate.clone().unwrap_or_default();
        if options.history {
            progress.warning("history is not migrated, only the current version of each dashboard");
        }

        let push = PushOptions {
            message: options.message.clone(),
            ..PushOptions::default()
        };
        export(ctx, &push, progress).context("export resources")?;

        progress.check_cancelled()?;
        progress.too_many_errors()?;
        pull(ctx, &PullOptions::default(), progress).context("pull resources")?;
        progress.set_message("migration completed");
        Ok(())
    }
}
