//! # provisioning-sync
//!
//! Reconciles a repository's file tree with the resource store.
//!
//! Build a [`JobContext`] for a repository and call [`run_job`] to carry out
//! a pull, push, delete, move or migrate job. [`status::refresh`] recomputes
//! the derived repository status and [`cleanup::cleanup`] handles removal.

pub mod checksum;
pub mod cleanup;
pub mod diff;
pub mod error;
pub mod folders;
pub mod ownership;
pub mod parser;
pub mod progress;
pub mod quota;
pub mod repository;
pub mod resources;
pub mod status;
pub mod workers;

pub use cleanup::{cleanup, CleanupReport};
pub use diff::{FileAction, ResourceFileChange};
pub use error::{ParseError, RepositoryError, StoreError, SyncError};
pub use progress::{JobProgress, JobResourceResult};
pub use repository::{LocalRepository, MemoryRepository, RepositoryAdapter};
pub use resources::{
    MemoryResourceStore, MemoryStoreProvider, ResourceObject, ResourceStore, StoreProvider,
};
pub use workers::{run_job, JobContext};
