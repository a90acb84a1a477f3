//! Provisioning core library: domain types, validation, settings and the
//! repository registry.
//!
//! - [`types`]: newtypes, repository and job structs
//! - [`validation`]: structural job spec checks
//! - [`path`]: safe relative path helpers
//! - [`config`]: [`Settings`]
//! - [`registry`]: repository load / save / admission
//! - [`error`]: error enums

pub mod config;
pub mod error;
pub mod path;
pub mod registry;
pub mod types;
pub mod validation;

pub use config::Settings;
pub use error::{ConfigError, PathError, RegistryError, ValidationError};
pub use types::{
    Condition, ConditionStatus, DeleteOptions, HealthStatus, Job, JobAction, JobName,
    JobResourceSummary, JobSpec, JobState, JobStatus, MigrateOptions, MoveOptions, Namespace,
    OrphanPolicy, PullOptions, PushOptions, Repository, RepositoryName, RepositorySpec,
    RepositoryStatus, ResourceKind, ResourceRef, StorageKind, StorageSpec, SyncOptions, SyncTarget,
};
