//! Repository status: quota condition, health and latest sync outcome.

use chrono::Utc;

use provisioning_core::{
    HealthStatus, Job, JobAction, Repository, RepositoryStatus, Settings, StorageSpec,
};
use provisioning_core::types::QuotaStatus;

use crate::error::StoreError;
use crate::quota::{self, QuotaUsage};
use crate::repository::RepositoryAdapter;
use crate::resources::ResourceStore;

/// Live quota usage for `repository`.
pub fn quota_usage(
    store: &dyn ResourceStore,
    repository: &Repository,
    settings: &Settings,
) -> Result<QuotaUsage, StoreError> {
    Ok(QuotaUsage::new(
        quota::count_managed(store, &repository.name)?,
        settings.max_resources_per_repository,
    ))
}

/// Stamp limits and the quota condition onto `status`.
pub fn apply_quota(status: &mut RepositoryStatus, usage: QuotaUsage, settings: &Settings) {
    status.quota = QuotaStatus {
        max_resources_per_repository: settings.max_resources_per_repository,
        max_repositories: settings.max_repositories,
    };
    status.set_condition(usage.condition());
}

/// Healthy when the repository root can be listed. Local repositories also
/// need their directory to exist.
pub fn check_health(repository: &Repository, adapter: &dyn RepositoryAdapter) -> HealthStatus {
    if let StorageSpec::Local { path } = &repository.spec.storage {
        if !path.is_dir() {
            return HealthStatus {
                healthy: false,
                message: vec![format!("directory not found: {}", path.display())],
                checked: Some(Utc::now()),
            };
        }
    }
    match adapter.list("", None) {
        Ok(_) => HealthStatus {
            healthy: true,
            message: Vec::new(),
            checked: Some(Utc::now()),
        },
        Err(e) => HealthStatus {
            healthy: false,
            message: vec![e.to_string()],
            checked: Some(Utc::now()),
        },
    }
}

/// Record a finished job as the latest sync when it changed the store.
///
/// Push jobs only write files, so they leave the sync status alone.
pub fn record_sync(status: &mut RepositoryStatus, job: &Job) {
    if job.spec.action == Some(JobAction::Push) || !job.status.state.is_terminal() {
        return;
    }
    let sync = &mut status.sync;
    sync.state = Some(job.status.state);
    sync.job = Some(job.name.clone());
    sync.finished = job.status.finished;
    sync.message = if job.status.errors.is_empty() {
        vec![job.status.message.clone()]
    } else {
        job.status.errors.clone()
    };
    if job.status.git_ref.is_some() {
        sync.last_ref = job.status.git_ref.clone();
    }
}

/// Recompute everything derived for `repository`.
pub fn refresh(
    repository: &mut Repository,
    store: &dyn ResourceStore,
    adapter: &dyn RepositoryAdapter,
    settings: &Settings,
    finished: Option<&Job>,
) -> Result<(), StoreError> {
    let usage = quota_usage(store, repository, settings)?;
    apply_quota(&mut repository.status, usage, settings);
    repository.status.health = check_health(repository, adapter);
    if let Some(job) = finished {
        record_sync(&mut repository.status, job);
    }
    tracing::debug!(
        repository = %repository.name,
        quota = %usage.reason(),
        healthy = repository.status.health.healthy,
        "refreshed status"
    );
    Ok(())
}
