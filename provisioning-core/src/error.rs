//! Error types for provisioning-core.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from repository registry persistence and admission.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Underlying I/O failure (file not found, permission denied, etc.).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization error (save path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// YAML parse error on load, with the offending file.
    #[error("failed to parse repository at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// `dirs::home_dir()` returned `None`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,

    #[error("repository not found at {path}")]
    RepositoryNotFound { path: PathBuf },

    #[error("repository {name} already exists")]
    AlreadyExists { name: String },

    #[error("Maximum number of {max} repositories reached")]
    MaxRepositories { max: u32 },

    #[error("Instance repository can only be created when no other repositories exist. Found: {found}")]
    InstanceRequiresEmpty { found: String },

    #[error("Cannot create folder repository when instance repository exists: {existing}")]
    FolderBlockedByInstance { existing: String },

    #[error("repository path {path:?} is already used by repository {existing}")]
    DuplicatePath { path: String, existing: String },

    #[error("repository path {path:?} overlaps the path of repository {existing}")]
    NestedPath { path: String, existing: String },

    #[error("sync target of repository {name} cannot change after it has been synced")]
    TargetLocked { name: String },

    #[error("invalid repository {name}: {message}")]
    Invalid { name: String, message: String },
}

/// Structural rejection of a job spec. The job is never created.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A single field failed validation.
    #[error("{field}: {message}")]
    Field { field: String, message: String },

    /// Payload could not be decoded at all.
    #[error("malformed job spec: {0}")]
    Malformed(String),
}

impl ValidationError {
    pub fn field(field: impl Into<String>, message: impl Into<String>) -> Self {
        ValidationError::Field {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Why a relative path was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("path must not be empty")]
    Empty,
    #[error("absolute paths are not allowed: {0}")]
    Absolute(String),
    #[error("path traversal is not allowed: {0}")]
    Traversal(String),
    #[error("invalid path segment in {0}")]
    InvalidSegment(String),
    #[error("path is too long ({len} > {max})")]
    TooLong { len: usize, max: usize },
}

/// Errors loading [`crate::config::Settings`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,

    #[error("invalid setting {key}: {message}")]
    Invalid { key: &'static str, message: String },
}
