//! Push: write store content to repository files.
//!
//! Every candidate is resolved and the quota is checked over the whole batch
//! before the first file is written.

use std::collections::{HashMap, HashSet};

use provisioning_core::{path, Job, JobAction, PushOptions, ResourceKind, SyncTarget};

use crate::checksum::sha256_hex;
use crate::diff::FileAction;
use crate::error::{StoreError, SyncError};
use crate::ownership::{self, Ownership};
use crate::parser::slugify;
use crate::progress::{JobProgress, JobResourceResult};
use crate::quota::{self, QuotaUsage};
use crate::resources::{ResourceObject, Selector, SourceProperties};

use super::{JobContext, Worker};

const DEFAULT_MESSAGE: &str = "Export from provisioning";

pub struct ExportWorker;

impl Worker for ExportWorker {
    fn action(&self) -> JobAction {
        JobAction::Push
    }

    fn process(
        &self,
        ctx: &JobContext,
        job: &Job,
        progress: &mut JobProgress,
    ) -> Result<(), SyncError> {
        let options = job.spec.push.clone().unwrap_or_default();
        export(ctx, &options, progress)
    }
}

/// File path for `dashboard` below `base`, nested in `folder_titles`.
pub fn export_path(base: &str, folder_titles: &[&str], dashboard: &ResourceObject) -> String {
    let mut dir = path::as_dir(base);
    for title in folder_titles {
        let slug = slugify(title);
        if !slug.is_empty() {
            dir = path::as_dir(&path::join(&dir, &slug));
        }
    }
    let stem = match slugify(dashboard.title()) {
        s if s.is_empty() => slugify(dashboard.name()),
        s => s,
    };
    path::join(&dir, &format!("{stem}.json"))
}

/// A folder the export will claim, with the directory it maps to.
struct FolderClaim {
    folder: ResourceObject,
    dir: String,
}

struct Planned {
    dashboard: ResourceObject,
    path: String,
    owned: bool,
    folders: Vec<String>,
}

pub(super) fn export(
    ctx: &JobContext,
    options: &PushOptions,
    progress: &mut JobProgress,
) -> Result<(), SyncError> {
    progress.check_cancelled()?;
    let repo = &ctx.repository;
    let store = ctx.store.as_ref();

    let candidates = collect(ctx, options, progress)?;
    let mut folder_claims: HashMap<String, FolderClaim> = HashMap::new();
    let mut used_paths = HashSet::new();
    let mut planned = Vec::with_capacity(candidates.len());
    for dashboard in candidates {
        let owned = Ownership::resolve(&dashboard.meta, &repo.name) == Ownership::Owned;
        let chain = folder_chain(ctx, &dashboard)?;

        let reused = dashboard
            .meta
            .source()
            .filter(|s| owned && !s.path.is_empty())
            .map(|s| s.path);
        let base = options.path.as_deref().unwrap_or("");
        let mut dir = path::as_dir(base);
        let mut folders = Vec::new();
        for folder in &chain {
            let folder_owned = Ownership::resolve(&folder.meta, &repo.name) == Ownership::Owned;
            dir = match folder.meta.source().filter(|s| folder_owned && !s.path.is_empty()) {
                Some(source) => source.path,
                None => export_path_dir(&dir, folder.title(), folder.name()),
            };
            if !folder_owned && Ownership::resolve(&folder.meta, &repo.name).allows_write() {
                folder_claims
                    .entry(folder.name().to_owned())
                    .or_insert_with(|| FolderClaim {
                        folder: folder.clone(),
                        dir: dir.clone(),
                    });
                folders.push(folder.name().to_owned());
            }
        }

        let mut file_path = reused.unwrap_or_else(|| export_path(&dir, &[], &dashboard));
        if !used_paths.insert(file_path.clone()) {
            file_path = path::join(&dir, &format!("{}.json", slugify(dashboard.name())));
            used_paths.insert(file_path.clone());
        }
        planned.push(Planned {
            dashboard,
            path: file_path,
            owned,
            folders,
        });
    }

    let new = planned.iter().filter(|p| !p.owned).count() + folder_claims.len();
    let usage = QuotaUsage::new(
        quota::count_managed(store, &repo.name)?,
        ctx.settings.max_resources_per_repository,
    );
    usage.admit_export(new as u64).map_err(SyncError::Quota)?;

    if planned.is_empty() {
        progress.set_message("nothing to export");
        return Ok(());
    }

    let other_branch = ctx.is_other_ref(options.branch.as_deref());
    let opts = ctx.write_options(
        options.branch.as_deref(),
        options
            .message
            .clone()
            .unwrap_or_else(|| DEFAULT_MESSAGE.to_owned()),
    );
    tracing::info!(
        repository = %repo.name,
        dashboards = planned.len(),
        folders = folder_claims.len(),
        branch = ?opts.branch,
        "exporting"
    );

    let mut claimed_folders = HashSet::new();
    for item in planned {
        progress.check_cancelled()?;
        progress.too_many_errors()?;
        let action = if item.owned {
            FileAction::Updated
        } else {
            FileAction::Created
        };
        let result = JobResourceResult::new(&item.path, action, ResourceKind::Dashboard)
            .named(item.dashboard.name());

        let written = write_one(ctx, &item, &opts);
        let checksum = match written {
            Ok(checksum) => checksum,
            Err(e) => {
                progress.record(result.failed(format!("exporting {}: {e}", item.path)));
                continue;
            }
        };
        if other_branch {
            progress.record(result);
            continue;
        }

        let claim = claim_all(ctx, &item, checksum, &folder_claims, &mut claimed_folders);
        match claim {
            Ok(()) => progress.record(result),
            Err(e) => progress.record(result.failed(format!("claiming {}: {e}", item.path))),
        }
    }
    Ok(())
}

fn export_path_dir(dir: &str, title: &str, name: &str) -> String {
    let slug = match slugify(title) {
        s if s.is_empty() => slugify(name),
        s => s,
    };
    path::as_dir(&path::join(dir, &slug))
}

/// Dashboards in scope, with explicit references checked per item.
fn collect(
    ctx: &JobContext,
    options: &PushOptions,
    progress: &mut JobProgress,
) -> Result<Vec<ResourceObject>, SyncError> {
    let repo = &ctx.repository.name;
    let store = ctx.store.as_ref();

    if options.resources.is_empty() {
        let mut out = Vec::new();
        for dashboard in store.list(ResourceKind::Dashboard, &Selector::All)? {
            match Ownership::resolve(&dashboard.meta, repo) {
                Ownership::Foreign { owner } => {
                    tracing::debug!(name = %dashboard.meta.name, owner = %owner, "skipping dashboard managed elsewhere");
                }
                _ => out.push(dashboard),
            }
        }
        return Ok(out);
    }

    let mut out = Vec::new();
    for reference in &options.resources {
        let kind = reference.resource_kind();
        let result = JobResourceResult::new("", FileAction::Ignored, kind.unwrap_or(ResourceKind::Dashboard))
            .named(&reference.name);
        match kind {
            Some(ResourceKind::Dashboard) => {}
            Some(ResourceKind::Folder) => {
                progress.record(result.failed("folders cannot be exported"));
                continue;
            }
            None => {
                progress.record(result.failed(format!("unsupported resource {reference}")));
                continue;
            }
        }
        match store.get(ResourceKind::Dashboard, &reference.name) {
            Ok(dashboard) => {
                match ownership::check_write(ResourceKind::Dashboard, &dashboard.meta, repo) {
                    Ok(_) => out.push(dashboard),
                    Err(e) => progress.record(result.failed(e)),
                }
            }
            Err(StoreError::NotFound { .. }) => {
                progress.record(result.failed(format!("dashboard {} not found", reference.name)));
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(out)
}

/// Parent folders of `dashboard`, outermost first. The root folder of a
/// folder-target repository and anything above it are left out.
fn folder_chain(ctx: &JobContext, dashboard: &ResourceObject) -> Result<Vec<ResourceObject>, SyncError> {
    let root = match ctx.repository.target() {
        SyncTarget::Folder => Some(ctx.repository.name.0.as_str()),
        SyncTarget::Instance => None,
    };
    let mut chain = Vec::new();
    let mut seen = HashSet::new();
    let mut next = dashboard.meta.folder().map(str::to_owned);
    while let Some(uid) = next {
        if Some(uid.as_str()) == root || !seen.insert(uid.clone()) {
            break;
        }
        let folder = match ctx.store.get(ResourceKind::Folder, &uid) {
            Ok(folder) => folder,
            Err(StoreError::NotFound { .. }) => break,
            Err(e) => return Err(e.into()),
        };
        next = folder.meta.folder().map(str::to_owned);
        chain.push(folder);
    }
    chain.reverse();
    Ok(chain)
}

fn write_one(
    ctx: &JobContext,
    item: &Planned,
    opts: &crate::repository::WriteOptions,
) -> Result<String, SyncError> {
    let manifest = item.dashboard.to_manifest()?;
    let mut data = serde_json::to_vec_pretty(&manifest)?;
    data.push(b'\n');
    ctx.adapter.write(&item.path, &data, opts)?;
    tracing::info!(repository = %ctx.repository.name, path = %item.path, "exported dashboard");
    Ok(sha256_hex(&data))
}

/// Claim the dashboard and any folders above it not yet claimed in this run.
fn claim_all(
    ctx: &JobContext,
    item: &Planned,
    checksum: String,
    folder_claims: &HashMap<String, FolderClaim>,
    claimed: &mut HashSet<String>,
) -> Result<(), SyncError> {
    for uid in &item.folders {
        if claimed.contains(uid) {
            continue;
        }
        if let Some(claim) = folder_claims.get(uid) {
            claim_folder(ctx, claim)?;
            claimed.insert(uid.clone());
        }
    }
    claim_dashboard(ctx, item, checksum)
}

fn claim_folder(ctx: &JobContext, claim: &FolderClaim) -> Result<(), SyncError> {
    let mut folder = ctx.store.get(ResourceKind::Folder, claim.folder.name())?;
    ownership::check_write(ResourceKind::Folder, &folder.meta, &ctx.repository.name)?;
    ownership::claim(
        &mut folder.meta,
        &ctx.repository.name,
        &SourceProperties {
            path: claim.dir.clone(),
            checksum: String::new(),
        },
    );
    ctx.store.update(folder)?;
    Ok(())
}

fn claim_dashboard(ctx: &JobContext, item: &Planned, checksum: String) -> Result<(), SyncError> {
    let mut dashboard = ctx.store.get(ResourceKind::Dashboard, item.dashboard.name())?;
    ownership::check_write(ResourceKind::Dashboard, &dashboard.meta, &ctx.repository.name)?;
    ownership::claim(
        &mut dashboard.meta,
        &ctx.repository.name,
        &SourceProperties {
            path: item.path.clone(),
            checksum,
        },
    );
    ctx.store.update(dashboard)?;
    Ok(())
}
