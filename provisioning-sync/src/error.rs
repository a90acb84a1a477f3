//! Error types for provisioning-sync.

use std::path::PathBuf;

use thiserror::Error;

use provisioning_core::{PathError, ResourceKind};

use crate::ownership::OwnershipError;

/// Failures reported by a [`crate::resources::ResourceStore`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("{kind} {name} not found")]
    NotFound { kind: ResourceKind, name: String },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: ResourceKind, name: String },

    /// The caller's resource version is stale.
    #[error("conflict updating {kind} {name}: expected version {expected}, found {actual}")]
    Conflict {
        kind: ResourceKind,
        name: String,
        expected: u64,
        actual: u64,
    },

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid {kind} {name}: {message}")]
    Invalid {
        kind: ResourceKind,
        name: String,
        message: String,
    },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Failures reported by a [`crate::repository::RepositoryAdapter`].
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("path not found: {0}")]
    NotFound(String),

    #[error("path already exists: {0}")]
    AlreadyExists(String),

    #[error("{0} is a directory")]
    IsDirectory(String),

    #[error(transparent)]
    InvalidPath(#[from] PathError),

    #[error("ref not found: {0}")]
    RefNotFound(String),

    #[error("{operation} is not supported by {kind} repositories")]
    Unsupported {
        operation: &'static str,
        kind: String,
    },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RepositoryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RepositoryError::NotFound(_))
    }
}

/// Why a file could not be turned into a resource.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unsupported file type: {0}")]
    Unsupported(String),

    #[error("invalid JSON: {0}")]
    Json(String),

    #[error("invalid YAML: {0}")]
    Yaml(String),

    #[error("cannot declare folders through files")]
    FolderFile,

    #[error("unsupported resource {0}")]
    UnsupportedKind(String),

    #[error("resource has neither metadata.name nor metadata.generateName")]
    MissingName,

    #[error("file does not contain a resource")]
    NotAResource,
}

/// Job-level failures. Any of these turns a job into `error`.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Ownership(#[from] OwnershipError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Quota admission refused the batch before any mutation.
    #[error("{0}")]
    Quota(String),

    /// Request is well-formed but cannot be carried out.
    #[error("{0}")]
    Rejected(String),

    #[error("too many errors")]
    TooManyErrors,

    #[error("job cancelled")]
    Cancelled,

    /// A failure annotated with the step that produced it.
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<SyncError>,
    },
}

impl SyncError {
    /// Innermost error, skipping context wrappers.
    pub fn root(&self) -> &SyncError {
        match self {
            SyncError::Context { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Convenience constructor for [`RepositoryError::Io`].
pub(crate) fn repo_io_err(path: impl Into<PathBuf>, source: std::io::Error) -> RepositoryError {
    RepositoryError::Io {
        path: path.into(),
        source,
    }
}

/// Attach a step description to an error.
pub trait Context<T> {
    fn context(self, context: impl Into<String>) -> Result<T, SyncError>;
}

impl<T, E: Into<SyncError>> Context<T> for Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T, SyncError> {
        self.map_err(|e| SyncError::Context {
            context: context.into(),
            source: Box::new(e.into()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_prefixes_message() {
        let res: Result<(), StoreError> = Err(StoreError::Forbidden("folders are read-only".into()));
        let err = res.context("create root folder").unwrap_err();
        assert_eq!(err.to_string(), "create root folder: forbidden: folders are read-only");
        assert!(matches!(err.root(), SyncError::Store(StoreError::Forbidden(_))));
    }

    #[test]
    fn not_found_and_forbidden_are_distinct() {
        let nf = StoreError::NotFound {
            kind: ResourceKind::Dashboard,
            name: "a".into(),
        };
        assert!(nf.is_not_found());
        assert!(!StoreError::Forbidden("x".into()).is_not_found());
    }

    #[test]
    fn cancellation_message() {
        assert_eq!(SyncError::Cancelled.to_string(), "job cancelled");
        assert_eq!(SyncError::TooManyErrors.to_string(), "too many errors");
    }
}
