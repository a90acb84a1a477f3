//! Delete: remove files (and, through a follow-up pull, their resources).

use provisioning_core::{path, DeleteOptions, Job, JobAction, PullOptions, ResourceKind, ResourceRef};

use crate::diff::FileAction;
use crate::error::{Context, RepositoryError, SyncError};
use crate::ownership::Ownership;
use crate::progress::{JobProgress, JobResourceResult};

use super::{pull, JobContext, Worker};

pub struct DeleteWorker;

impl Worker for DeleteWorker {
    fn action(&self) -> JobAction {
        JobAction::Delete
    }

    fn process(
        &self,
        ctx: &JobContext,
        job: &Job,
        progress: &mut JobProgress,
    ) -> Result<(), SyncError> {
        let options = job.spec.delete.clone().unwrap_or_default();
        progress.strict();

        let mut paths = options.paths.clone();
        paths.extend(resolve_resources(ctx, &options.resources, progress)?);
        let paths = dedup(paths);

        delete_files(ctx, &options, &paths, progress).context("delete files from repository")?;

        if ctx.is_other_ref(options.git_ref.as_deref()) {
            tracing::debug!(git_ref = ?options.git_ref, "deleted on another ref, store left untouched");
            return Ok(());
        }
        progress.check_cancelled()?;
        progress.restart_budget(ctx.settings.max_errors);
        pull(ctx, &PullOptions::default(), progress).context("pull resources")
    }
}

/// Source paths of referenced resources. Unresolvable references are item
/// errors.
pub(super) fn resolve_resources(
    ctx: &JobContext,
    resources: &[ResourceRef],
    progress: &mut JobProgress,
) -> Result<Vec<String>, SyncError> {
    let mut out = Vec::new();
    for reference in resources {
        progress.check_cancelled()?;
        let kind = reference.resource_kind().unwrap_or(ResourceKind::Dashboard);
        let result =
            JobResourceResult::new("", FileAction::Deleted, kind).named(&reference.name);
        match find_path(ctx, reference) {
            Ok(p) => out.push(p),
            Err(message) => {
                progress.record(result.failed(message));
                progress.too_many_errors()?;
            }
        }
    }
    Ok(out)
}

fn find_path(ctx: &JobContext, reference: &ResourceRef) -> Result<String, String> {
    let repo = &ctx.repository.name;
    let kind = reference
        .resource_kind()
        .ok_or_else(|| format!("unsupported resource {reference}"))?;
    let obj = ctx
        .store
        .get(kind, &reference.name)
        .map_err(|e| format!("resource not found in repository: {reference}: {e}"))?;
    if Ownership::resolve(&obj.meta, repo) != Ownership::Owned {
        return Err(format!(
            "resource not found in repository: {reference} is not managed by repository {repo}"
        ));
    }
    obj.meta
        .source()
        .map(|s| s.path)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| format!("resource not found in repository: {reference} has no source path"))
}

/// Remove duplicates, keeping the first occurrence.
pub(super) fn dedup(paths: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    paths
        .into_iter()
        .filter(|p| seen.insert(p.clone()))
        .collect()
}

fn delete_files(
    ctx: &JobContext,
    options: &DeleteOptions,
    paths: &[String],
    progress: &mut JobProgress,
) -> Result<(), SyncError> {
    for p in paths {
        progress.check_cancelled()?;
        let kind = if path::is_dir(p) {
            ResourceKind::Folder
        } else {
            ResourceKind::Dashboard
        };
        let result = JobResourceResult::new(p, FileAction::Deleted, kind);
        let opts = ctx.write_options(options.git_ref.as_deref(), format!("Delete {p}"));
        let outcome = match ctx.adapter.exists(p, opts.branch.as_deref()) {
            Ok(true) => ctx.adapter.delete(p, &opts).map(|_| ()),
            Ok(false) => Err(RepositoryError::NotFound(p.clone())),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(()) => {
                tracing::info!(repository = %ctx.repository.name, path = %p, "deleted file");
                progress.record(result);
            }
            Err(e) => {
                progress.record(result.failed(e));
                progress.too_many_errors()?;
            }
        }
    }
    Ok(())
}
