//! Pull: reconcile the resource store to the file tree.

use std::collections::HashSet;

use provisioning_core::{path, Job, JobAction, PullOptions, ResourceKind};

use crate::diff::{self, FileAction, ResourceFileChange, ResourceListItem};
use crate::error::{Context, StoreError, SyncError};
use crate::folders::FolderTree;
use crate::ownership::{self, Ownership};
use crate::parser::{self, ParsedResource};
use crate::progress::{JobProgress, JobResourceResult};
use crate::quota::{self, QuotaUsage};
use crate::resources::{ResourceObject, SourceProperties};

use super::{JobContext, Worker};

pub struct PullWorker;

impl Worker for PullWorker {
    fn action(&self) -> JobAction {
        JobAction::Pull
    }

    fn process(
        &self,
        ctx: &JobContext,
        job: &Job,
        progress: &mut JobProgress,
    ) -> Result<(), SyncError> {
        let options = job.spec.pull.clone().unwrap_or_default();
        pull(ctx, &options, progress)
    }
}

/// Sync the store to the repository contents.
pub fn pull(
    ctx: &JobContext,
    options: &PullOptions,
    progress: &mut JobProgress,
) -> Result<(), SyncError> {
    progress.check_cancelled()?;
    let repo = &ctx.repository;
    let store = ctx.store.as_ref();

    let managed = diff::list_managed(store, &repo.name).context("compare changes")?;
    let folders = FolderTree::new(store, repo, &managed);
    let plan = plan(ctx, options, &managed, &folders).context("compare changes")?;
    if plan.is_empty() {
        folders.ensure_root().context("create root folder")?;
        tracing::debug!(repository = %repo.name, "no changes to sync");
        progress.set_message("no changes to sync");
        return Ok(());
    }

    let creates = plan
        .iter()
        .filter(|c| c.action == FileAction::Created)
        .count() as u64;
    let deletes = plan
        .iter()
        .filter(|c| c.action == FileAction::Deleted)
        .count() as u64;
    let usage = QuotaUsage::new(
        quota::count_managed(store, &repo.name)?,
        ctx.settings.max_resources_per_repository,
    );
    usage.admit_pull(creates, deletes).map_err(SyncError::Quota)?;
    folders.ensure_root().context("create root folder")?;

    tracing::info!(
        repository = %repo.name,
        changes = plan.len(),
        creates,
        deletes,
        "applying changes"
    );

    let mut applier = Applier {
        ctx,
        folders,
        written: HashSet::new(),
    };
    for change in &plan {
        progress.check_cancelled()?;
        progress.too_many_errors()?;
        let result = applier.apply(change, progress);
        progress.record(result);
    }
    Ok(())
}

fn plan(
    ctx: &JobContext,
    options: &PullOptions,
    managed: &[ResourceListItem],
    folders: &FolderTree<'_>,
) -> Result<Vec<ResourceFileChange>, SyncError> {
    let last = ctx.repository.status.sync.last_ref.as_deref();
    if options.incremental && options.path.is_none() {
        if let (Some(last), Some(head)) = (last, ctx.adapter.latest_ref()?) {
            if last == head {
                return Ok(Vec::new());
            }
            let changes = ctx.adapter.compare(last, &head)?;
            tracing::debug!(
                repository = %ctx.repository.name,
                base = %last,
                head = %head,
                files = changes.len(),
                "incremental compare"
            );
            return Ok(diff::compare_incremental(&changes, managed));
        }
    }
    let files = ctx.adapter.list("", None)?;
    let mut changes = diff::compare(&files, managed, options.path.as_deref());
    if options.path.is_none() {
        diff::realign(&mut changes, managed, |dir| folders.folder_for(dir));
    }
    Ok(changes)
}

struct Applier<'a> {
    ctx: &'a JobContext,
    folders: FolderTree<'a>,
    /// Resources written during this run.
    written: HashSet<(ResourceKind, String)>,
}

impl Applier<'_> {
    fn apply(&mut self, change: &ResourceFileChange, progress: &JobProgress) -> JobResourceResult {
        let kind = change
            .existing
            .as_ref()
            .map(|e| e.kind)
            .unwrap_or(if change.is_dir() {
                ResourceKind::Folder
            } else {
                ResourceKind::Dashboard
            });

        if change.action != FileAction::Deleted && progress.is_nested_under_failed_creation(&change.path)
        {
            return JobResourceResult::new(&change.path, FileAction::Ignored, kind).warn(format!(
                "skipped {}: parent folder could not be created",
                change.path
            ));
        }

        match change.action {
            FileAction::Deleted => self.delete(change, kind, progress),
            _ if change.is_dir() => match self.folders.ensure(&change.path) {
                Ok(action) => JobResourceResult::new(&change.path, action, ResourceKind::Folder),
                Err(e) => JobResourceResult::new(&change.path, FileAction::Created, ResourceKind::Folder)
                    .failed(format!("creating folder for directory {}: {e}", change.path)),
            },
            _ => match self.write_file(change) {
                Ok((action, parsed)) => {
                    JobResourceResult::new(&change.path, action, parsed.obj.kind())
                        .named(parsed.obj.name())
                }
                Err(e) => JobResourceResult::new(&change.path, change.action, kind)
                    .failed(format!("writing resource from file {}: {e}", change.path)),
            },
        }
    }

    fn write_file(
        &mut self,
        change: &ResourceFileChange,
    ) -> Result<(FileAction, ParsedResource), SyncError> {
        let file = self.ctx.adapter.read(&change.path, None)?;
        let parsed = parser::parse(&change.path, &file.data)?;

        let dir = path::dir(&change.path);
        if !dir.is_empty() && !self.folders.is_known(dir) {
            self.folders.ensure(dir)?;
        }
        let mut desired = parsed.obj.clone();
        desired
            .meta
            .set_folder(self.folders.folder_for(dir).as_deref());

        let action = self.upsert(desired, &parsed)?;
        self.written
            .insert((parsed.obj.kind(), parsed.obj.name().to_owned()));

        // The file now declares a different resource than before.
        if let Some(previous) = &change.existing {
            let replaced = previous.name != parsed.obj.name() || previous.kind != parsed.obj.kind();
            if replaced && !self.written.contains(&(previous.kind, previous.name.clone())) {
                let version = Some(previous.resource_version);
                match self.ctx.store.delete(previous.kind, &previous.name, version) {
                    Ok(()) | Err(StoreError::NotFound { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok((action, parsed))
    }

    fn upsert(&self, mut desired: ResourceObject, parsed: &ParsedResource) -> Result<FileAction, SyncError> {
        let repo = &self.ctx.repository.name;
        let store = self.ctx.store.as_ref();
        let source = SourceProperties {
            path: parsed.path.clone(),
            checksum: parsed.checksum.clone(),
        };
        match store.get(desired.kind(), desired.name()) {
            Err(StoreError::NotFound { .. }) => {
                ownership::claim(&mut desired.meta, repo, &source);
                store.create(desired)?;
                tracing::info!(repository = %repo, path = %parsed.path, "created resource");
                Ok(FileAction::Created)
            }
            Err(e) => Err(e.into()),
            Ok(existing) => {
                let ownership = ownership::check_write(desired.kind(), &existing.meta, repo)?;
                if ownership == Ownership::Owned
                    && existing.meta.source().as_ref() == Some(&source)
                    && existing.same_content(&desired)
                {
                    tracing::debug!(repository = %repo, path = %parsed.path, "unchanged");
                    return Ok(FileAction::Ignored);
                }
                if let Ownership::Transferable { owner } = &ownership {
                    tracing::info!(
                        repository = %repo,
                        name = %existing.meta.name,
                        previous = %owner,
                        "taking over resource"
                    );
                }
                let folder = desired.meta.folder().map(str::to_owned);
                desired.meta = existing.meta.clone();
                desired.meta.set_folder(folder.as_deref());
                ownership::claim(&mut desired.meta, repo, &source);
                store.update(desired)?;
                tracing::info!(repository = %repo, path = %parsed.path, "updated resource");
                Ok(FileAction::Updated)
            }
        }
    }

    fn delete(
        &mut self,
        change: &ResourceFileChange,
        kind: ResourceKind,
        progress: &JobProgress,
    ) -> JobResourceResult {
        let Some(existing) = &change.existing else {
            return JobResourceResult::new(&change.path, FileAction::Deleted, kind).failed(format!(
                "processing deletion for file {}: missing existing reference",
                change.path
            ));
        };
        let result = JobResourceResult::new(&change.path, FileAction::Deleted, existing.kind)
            .named(&existing.name);

        if self
            .written
            .contains(&(existing.kind, existing.name.clone()))
        {
            tracing::debug!(path = %change.path, name = %existing.name, "resource moved, not deleting");
            return JobResourceResult {
                action: FileAction::Ignored,
                ..result
            };
        }
        if change.is_dir() && progress.has_failed_deletions_under(&change.path) {
            return JobResourceResult {
                action: FileAction::Ignored,
                ..result
            }
            .warn(format!(
                "skipped deleting folder {}: nested deletions failed",
                change.path
            ));
        }

        // Planned version: a resource claimed elsewhere since planning conflicts.
        match self
            .ctx
            .store
            .delete(existing.kind, &existing.name, Some(existing.resource_version))
        {
            Ok(()) | Err(StoreError::NotFound { .. }) => {
                if change.is_dir() {
                    self.folders.forget(&change.path);
                }
                tracing::info!(path = %change.path, name = %existing.name, "deleted resource");
                result
            }
            Err(e) => result.failed(format!(
                "deleting resource {} {}: {e}",
                existing.kind, existing.name
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;

    use provisioning_core::{
        JobState, Repository, RepositorySpec, Settings, StorageKind, StorageSpec, SyncOptions,
        SyncTarget,
    };

    use super::*;
    use crate::repository::{MemoryRepository, RepositoryAdapter, WriteOptions};
    use crate::resources::{MemoryResourceStore, ResourceStore};

    fn setup(target: SyncTarget) -> (JobContext, Arc<MemoryRepository>, Arc<MemoryResourceStore>) {
        let adapter = Arc::new(MemoryRepository::new(StorageKind::Git, "main"));
        let store = Arc::new(MemoryResourceStore::new());
        let repository = Repository::new(
            "r1",
            RepositorySpec {
                title: "Repo One".into(),
                description: None,
                storage: StorageSpec::Git {
                    url: "https://example.com/r1.git".into(),
                    branch: "main".into(),
                    path: String::new(),
                },
                sync: SyncOptions {
                    enabled: true,
                    target,
                    interval_seconds: 0,
                },
                orphan_policy: Default::default(),
            },
        );
        let ctx = JobContext {
            repository,
            adapter: adapter.clone(),
            store: store.clone(),
            settings: Settings::default(),
        };
        (ctx, adapter, store)
    }

    fn put(adapter: &MemoryRepository, p: &str, uid: &str, title: &str) {
        let body = format!(r#"{{"uid": "{uid}", "title": "{title}", "panels": []}}"#);
        adapter
            .write(p, body.as_bytes(), &WriteOptions::message("seed"))
            .expect("write");
    }

    fn run(ctx: &JobContext) -> provisioning_core::JobStatus {
        let mut progress = JobProgress::new(20, CancellationToken::new());
        let result = pull(ctx, &PullOptions::default(), &mut progress);
        progress.complete(result)
    }

    #[test]
    fn creates_folders_and_dashboards() {
        let (ctx, adapter, store) = setup(SyncTarget::Folder);
        put(&adapter, "team/a.json", "a", "A");
        let status = run(&ctx);
        assert_eq!(status.state, JobState::Success, "{status:?}");

        let dash = store.get(ResourceKind::Dashboard, "a").expect("dashboard");
        let folder = dash.meta.folder().expect("in a folder").to_owned();
        let parent = store.get(ResourceKind::Folder, &folder).expect("folder");
        assert_eq!(parent.meta.folder(), Some("r1"));
        assert_eq!(dash.meta.source().expect("source").path, "team/a.json");
    }

    #[test]
    fn second_pull_is_a_noop() {
        let (ctx, adapter, store) = setup(SyncTarget::Folder);
        put(&adapter, "a.json", "a", "A");
        run(&ctx);
        let version = store
            .get(ResourceKind::Dashboard, "a")
            .expect("a")
            .meta
            .resource_version;
        let status = run(&ctx);
        assert_eq!(status.message, "no changes to sync");
        assert_eq!(
            store.get(ResourceKind::Dashboard, "a").expect("a").meta.resource_version,
            version
        );
    }

    #[test]
    fn quota_blocks_growing_batch() {
        let (mut ctx, adapter, store) = setup(SyncTarget::Instance);
        ctx.settings.max_resources_per_repository = 1;
        put(&adapter, "a.json", "a", "A");
        put(&adapter, "b.json", "b", "B");
        let status = run(&ctx);
        assert_eq!(status.state, JobState::Error);
        assert_eq!(status.message, "sync would exceed quota: 2/1 resources");
        assert!(store.is_empty());
    }

    #[test]
    fn foreign_resource_is_an_item_error() {
        let (ctx, adapter, store) = setup(SyncTarget::Instance);
        let mut taken = ResourceObject::dashboard("a", Default::default());
        taken
            .meta
            .set_manager(&crate::resources::ManagerProperties::repository(&"other".into()));
        store.create(taken).expect("seed");
        put(&adapter, "a.json", "a", "A");
        put(&adapter, "b.json", "b", "B");

        let status = run(&ctx);
        assert_eq!(status.state, JobState::Warning);
        assert!(status.errors[0].contains("is managed by repository other"));
        assert!(store.get(ResourceKind::Dashboard, "b").is_ok());
    }

    #[test]
    fn removed_file_deletes_resource() {
        let (ctx, adapter, store) = setup(SyncTarget::Instance);
        put(&adapter, "a.json", "a", "A");
        run(&ctx);
        adapter
            .delete("a.json", &WriteOptions::message("rm"))
            .expect("delete");
        let status = run(&ctx);
        assert_eq!(status.state, JobState::Success);
        assert!(store.get(ResourceKind::Dashboard, "a").unwrap_err().is_not_found());
    }

    #[test]
    fn folder_file_is_rejected_per_item() {
        let (ctx, adapter, _store) = setup(SyncTarget::Instance);
        put(&adapter, "a.json", "a", "A");
        let folder = r#"{"apiVersion": "folder.grafana.app/v1", "kind": "Folder",
            "metadata": {"name": "f"}, "spec": {"title": "F"}}"#;
        adapter
            .write("f.json", folder.as_bytes(), &WriteOptions::message("seed"))
            .expect("write");
        let status = run(&ctx);
        assert_eq!(status.state, JobState::Warning);
        assert_eq!(
            status.errors,
            vec!["writing resource from file f.json: cannot declare folders through files".to_string()]
        );
    }
}
