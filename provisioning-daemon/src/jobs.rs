//! Active (queued or working) jobs.
//!
//! Every stored job carries a `resource_version`; [`JobStore::update`] only
//! accepts a job whose version matches the stored one. Finished jobs leave
//! the store and move to [`crate::history::HistoryStore`].

use std::collections::BTreeMap;

use chrono::Utc;

use provisioning_core::{Job, JobName, JobSpec, JobState, JobStatus, Namespace, RepositoryName};

use crate::error::EngineError;

/// `<repository>-<action>-<8 hex chars>`
pub fn generate_name(spec: &JobSpec) -> JobName {
    let action = spec
        .action
        .map(|a| a.to_string())
        .unwrap_or_else(|| "job".to_owned());
    let id = uuid::Uuid::new_v4().simple().to_string();
    JobName(format!("{}-{action}-{}", spec.repository, &id[..8]))
}

#[derive(Debug, Default)]
pub struct JobStore {
    jobs: BTreeMap<JobName, Job>,
    version: u64,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a new queued job. A repository runs one job at a time.
    pub fn create(&mut self, namespace: Namespace, spec: JobSpec) -> Result<Job, EngineError> {
        if let Some(active) = self.active_for(&namespace, &spec.repository) {
            return Err(EngineError::InProgress {
                repository: spec.repository.clone(),
                job: active.name.clone(),
            });
        }
        let name = generate_name(&spec);
        if self.jobs.contains_key(&name) {
            return Err(EngineError::AlreadyExists(name));
        }
        self.version += 1;
        let job = Job {
            name: name.clone(),
            namespace,
            resource_version: self.version,
            spec,
            status: JobStatus {
                state: JobState::Queued,
                ..JobStatus::default()
            },
            created_at: Utc::now(),
        };
        self.jobs.insert(name, job.clone());
        Ok(job)
    }

    pub fn get(&self, name: &JobName) -> Result<Job, EngineError> {
        self.jobs
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::JobNotFound(name.clone()))
    }

    /// Jobs in creation order of their names.
    pub fn list(&self) -> Vec<Job> {
        self.jobs.values().cloned().collect()
    }

    pub fn active_for(&self, namespace: &Namespace, repository: &RepositoryName) -> Option<&Job> {
        self.jobs
            .values()
            .find(|j| &j.namespace == namespace && j.repository() == repository)
    }

    /// Replace a job. Fails with [`EngineError::Conflict`] on a stale version.
    pub fn update(&mut self, mut job: Job) -> Result<Job, EngineError> {
        let current = self
            .jobs
            .get(&job.name)
            .ok_or_else(|| EngineError::JobNotFound(job.name.clone()))?;
        // Terminal jobs never change again.
        if current.resource_version != job.resource_version || current.status.state.is_terminal() {
            return Err(EngineError::Conflict {
                name: job.name,
                expected: job.resource_version,
                actual: current.resource_version,
            });
        }
        self.version += 1;
        job.resource_version = self.version;
        self.jobs.insert(job.name.clone(), job.clone());
        Ok(job)
    }

    /// Drop a job once it has been archived.
    pub fn remove(&mut self, name: &JobName) -> Option<Job> {
        self.jobs.remove(name)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
