//! Repository adapters: the file tree side of a sync.
//!
//! Paths are relative and `/`-separated; directories carry a trailing `/`.
//! Every path is checked with [`provisioning_core::path::validate`] before it
//! touches storage.

mod local;
mod memory;

pub use local::LocalRepository;
pub use memory::MemoryRepository;

use provisioning_core::StorageKind;

use crate::error::RepositoryError;

/// One listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    /// SHA-256 of the content; empty for directories.
    pub hash: String,
}

/// File content with its checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub path: String,
    pub data: Vec<u8>,
    pub hash: String,
    /// Commit the content was read at, for versioned storage.
    pub git_ref: Option<String>,
}

/// A named ref (branch) and the commit it points to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefInfo {
    pub name: String,
    pub hash: String,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// A file-level difference between two commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedChange {
    pub kind: ChangeKind,
    pub path: String,
    pub hash: String,
}

/// Branch and commit message for a mutation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WriteOptions {
    /// Target branch; `None` writes to the default branch.
    pub branch: Option<String>,
    pub message: String,
}

impl WriteOptions {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            branch: None,
            message: message.into(),
        }
    }
}

/// File tree operations. Mutations return the new commit for versioned
/// storage and `None` otherwise.
pub trait RepositoryAdapter: Send + Sync {
    fn kind(&self) -> StorageKind;

    fn read(&self, path: &str, git_ref: Option<&str>) -> Result<FileInfo, RepositoryError>;

    /// Recursive listing under `path` (`""` for the whole tree), sorted by path.
    fn list(&self, path: &str, git_ref: Option<&str>) -> Result<Vec<FileEntry>, RepositoryError>;

    /// Create or overwrite a file.
    fn write(
        &self,
        path: &str,
        data: &[u8],
        opts: &WriteOptions,
    ) -> Result<Option<String>, RepositoryError>;

    /// Move a file or a directory (both paths end in `/`).
    fn move_path(
        &self,
        from: &str,
        to: &str,
        opts: &WriteOptions,
    ) -> Result<Option<String>, RepositoryError>;

    /// Delete a file, or a directory and everything below it.
    fn delete(&self, path: &str, opts: &WriteOptions) -> Result<Option<String>, RepositoryError>;

    /// `true` when the entry exists at `git_ref`.
    fn exists(&self, path: &str, git_ref: Option<&str>) -> Result<bool, RepositoryError> {
        if provisioning_core::path::is_dir(path) {
            let trimmed = path.trim_end_matches('/');
            let parent = provisioning_core::path::dir(path);
            match self.list(parent, git_ref) {
                Ok(entries) => Ok(entries
                    .iter()
                    .any(|e| e.is_dir && e.path.trim_end_matches('/') == trimmed)),
                Err(RepositoryError::NotFound(_)) => Ok(false),
                Err(e) => Err(e),
            }
        } else {
            match self.read(path, git_ref) {
                Ok(_) => Ok(true),
                Err(RepositoryError::NotFound(_)) | Err(RepositoryError::IsDirectory(_)) => Ok(false),
                Err(e) => Err(e),
            }
        }
    }

    fn default_branch(&self) -> Option<&str> {
        None
    }

    fn refs(&self) -> Result<Vec<RefInfo>, RepositoryError> {
        Err(RepositoryError::Unsupported {
            operation: "refs",
            kind: self.kind().to_string(),
        })
    }

    /// Head of the default branch, for versioned storage.
    fn latest_ref(&self) -> Result<Option<String>, RepositoryError> {
        Ok(None)
    }

    fn compare(&self, base: &str, head: &str) -> Result<Vec<VersionedChange>, RepositoryError> {
        let _ = (base, head);
        Err(RepositoryError::Unsupported {
            operation: "compare",
            kind: self.kind().to_string(),
        })
    }
}
