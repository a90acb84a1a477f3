use std::path::PathBuf;

use thiserror::Error;

use provisioning_core::{JobName, RepositoryName};

/// Error surface for the job engine, history store and triggers.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("registry error: {0}")]
    Registry(#[from] provisioning_core::RegistryError),

    #[error("config error: {0}")]
    Config(#[from] provisioning_core::ConfigError),

    #[error(transparent)]
    Validation(#[from] provisioning_core::ValidationError),

    #[error("sync error: {0}")]
    Sync(#[from] provisioning_sync::SyncError),

    #[error("store error: {0}")]
    Store(#[from] provisioning_sync::StoreError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The caller's version token is stale.
    #[error("conflict updating job {name}: expected version {expected}, found {actual}")]
    Conflict {
        name: JobName,
        expected: u64,
        actual: u64,
    },

    #[error("job {0} already exists")]
    AlreadyExists(JobName),

    #[error("repository {repository} already has a job in progress: {job}")]
    InProgress {
        repository: RepositoryName,
        job: JobName,
    },

    #[error("job {0} not found")]
    JobNotFound(JobName),

    #[error("no adapter for {kind} repository {repository}")]
    NoAdapter {
        kind: String,
        repository: RepositoryName,
    },

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("{task} task join failure: {message}")]
    Join { task: String, message: String },
}

impl EngineError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Conflict { .. })
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(self, EngineError::InProgress { .. })
    }
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> EngineError {
    EngineError::Io {
        path: path.into(),
        source,
    }
}
