//! Move: relocate files or directories, then pull so resources follow.

use provisioning_core::{path, Job, JobAction, MoveOptions, PullOptions, ResourceKind};

use crate::diff::FileAction;
use crate::error::{Context, RepositoryError, SyncError};
use crate::progress::{JobProgress, JobResourceResult};

use super::delete::{dedup, resolve_resources};
use super::{pull, JobContext, Worker};

pub struct MoveWorker;

impl Worker for MoveWorker {
    fn action(&self) -> JobAction {
        JobAction::Move
    }

    fn process(
        &self,
        ctx: &JobContext,
        job: &Job,
        progress: &mut JobProgress,
    ) -> Result<(), SyncError> {
        let options = job.spec.move_.clone().unwrap_or_default();
        let target = options
            .target_path
            .clone()
            .ok_or_else(|| SyncError::Rejected("target path is required".into()))?;
        progress.strict();

        let mut sources = options.paths.clone();
        sources.extend(resolve_resources(ctx, &options.resources, progress)?);
        let moves = plan_moves(&dedup(sources), &target)?;

        move_files(ctx, &options, &moves, progress).context("move files in repository")?;

        if ctx.is_other_ref(options.git_ref.as_deref()) {
            return Ok(());
        }
        progress.check_cancelled()?;
        progress.restart_budget(ctx.settings.max_errors);
        pull(ctx, &PullOptions::default(), progress).context("pull resources")
    }
}

/// Source → destination pairs.
///
/// A single source moves to `target` itself; several sources move into
/// `target`, which must then be a directory.
pub fn plan_moves(sources: &[String], target: &str) -> Result<Vec<(String, String)>, SyncError> {
    match sources {
        [] => Ok(Vec::new()),
        [single] => {
            if path::is_dir(single) != path::is_dir(target) {
                return Err(SyncError::Rejected(
                    "cannot move between file and directory types".into(),
                ));
            }
            Ok(vec![(single.clone(), target.to_owned())])
        }
        many => {
            if !path::is_dir(target) {
                return Err(SyncError::Rejected(
                    "moving several paths requires a directory target".into(),
                ));
            }
            Ok(many
                .iter()
                .map(|src| {
                    let mut dest = path::join(target, path::base(src));
                    if path::is_dir(src) {
                        dest = path::as_dir(&dest);
                    }
                    (src.clone(), dest)
                })
                .collect())
        }
    }
}

fn move_files(
    ctx: &JobContext,
    options: &MoveOptions,
    moves: &[(String, String)],
    progress: &mut JobProgress,
) -> Result<(), SyncError> {
    let branch = options.git_ref.as_deref();
    let read_ref = ctx.write_options(branch, String::new()).branch;

    // Check every pair before touching the tree.
    for (src, dest) in moves {
        let problem = match (
            ctx.adapter.exists(src, read_ref.as_deref()),
            ctx.adapter.exists(dest, read_ref.as_deref()),
        ) {
            (Err(e), _) | (_, Err(e)) => Some(e.to_string()),
            (Ok(false), _) => Some(RepositoryError::NotFound(src.clone()).to_string()),
            (_, Ok(true)) => Some(RepositoryError::AlreadyExists(dest.clone()).to_string()),
            _ if src == dest || path::is_under(dest, src) => {
                Some(format!("cannot move {src} into itself"))
            }
            _ => None,
        };
        if let Some(problem) = problem {
            progress.record(result_for(src).failed(problem));
            progress.too_many_errors()?;
        }
    }

    for (src, dest) in moves {
        progress.check_cancelled()?;
        let opts = ctx.write_options(branch, format!("Move {src} to {dest}"));
        match ctx.adapter.move_path(src, dest, &opts) {
            Ok(_) => {
                tracing::info!(repository = %ctx.repository.name, from = %src, to = %dest, "moved");
                progress.record(result_for(dest).named(src.clone()));
            }
            Err(e) => {
                progress.record(result_for(src).failed(e));
                progress.too_many_errors()?;
            }
        }
    }
    Ok(())
}

fn result_for(p: &str) -> JobResourceResult {
    let kind = if path::is_dir(p) {
        ResourceKind::Folder
    } else {
        ResourceKind::Dashboard
    };
    JobResourceResult::new(p, FileAction::Renamed, kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_source_moves_to_target() {
        let moves = plan_moves(&["a.json".into()], "b/c.json").expect("plan");
        assert_eq!(moves, vec![("a.json".to_string(), "b/c.json".to_string())]);
    }

    #[test]
    fn file_to_directory_is_rejected() {
        let err = plan_moves(&["a.json".into()], "b/").unwrap_err();
        assert_eq!(err.to_string(), "cannot move between file and directory types");
        let err = plan_moves(&["a/".into()], "b.json").unwrap_err();
        assert_eq!(err.to_string(), "cannot move between file and directory types");
    }

    #[test]
    fn several_sources_land_inside_target() {
        let moves = plan_moves(&["x/a.json".into(), "y/".into()], "dest/").expect("plan");
        assert_eq!(
            moves,
            vec![
                ("x/a.json".to_string(), "dest/a.json".to_string()),
                ("y/".to_string(), "dest/y/".to_string()),
            ]
        );
        assert!(plan_moves(&["a.json".into(), "b.json".into()], "c.json").is_err());
    }
}
