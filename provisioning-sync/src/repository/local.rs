//! Local directory adapter.
//!
//! Writes follow the same protocol as the registry: content goes to a hidden
//! `.<name>.tmp` sibling which is then renamed over the target.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use provisioning_core::{path, StorageKind};

use super::{FileEntry, FileInfo, RepositoryAdapter, WriteOptions};
use crate::checksum::sha256_hex;
use crate::error::{repo_io_err, RepositoryError};

pub struct LocalRepository {
    root: PathBuf,
}

impl LocalRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, rel: &str) -> Result<PathBuf, RepositoryError> {
        if rel.is_empty() {
            return Ok(self.root.clone());
        }
        path::validate(rel)?;
        Ok(self.root.join(rel.trim_end_matches('/')))
    }

    fn reject_ref(&self, git_ref: Option<&str>) -> Result<(), RepositoryError> {
        match git_ref {
            Some(_) => Err(RepositoryError::Unsupported {
                operation: "refs",
                kind: StorageKind::Local.to_string(),
            }),
            None => Ok(()),
        }
    }

    fn relative(&self, full: &Path) -> Option<String> {
        let rel = full.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        if parts.is_empty() {
            return None;
        }
        Some(parts.join("/"))
    }
}

impl RepositoryAdapter for LocalRepository {
    fn kind(&self) -> StorageKind {
        StorageKind::Local
    }

    fn read(&self, rel: &str, git_ref: Option<&str>) -> Result<FileInfo, RepositoryError> {
        self.reject_ref(git_ref)?;
        let full = self.resolve(rel)?;
        if path::is_dir(rel) || full.is_dir() {
            return Err(RepositoryError::IsDirectory(rel.to_owned()));
        }
        let data = match std::fs::read(&full) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RepositoryError::NotFound(rel.to_owned()))
            }
            Err(e) => return Err(repo_io_err(&full, e)),
        };
        Ok(FileInfo {
            path: rel.to_owned(),
            hash: sha256_hex(&data),
            data,
            git_ref: None,
        })
    }

    fn list(&self, rel: &str, git_ref: Option<&str>) -> Result<Vec<FileEntry>, RepositoryError> {
        self.reject_ref(git_ref)?;
        let base = self.resolve(rel)?;
        if !base.exists() {
            if rel.is_empty() {
                return Ok(vec![]);
            }
            return Err(RepositoryError::NotFound(rel.to_owned()));
        }

        let mut entries = Vec::new();
        for entry in WalkDir::new(&base).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let p = e.path().map(Path::to_path_buf).unwrap_or_else(|| base.clone());
                repo_io_err(p, std::io::Error::other(e.to_string()))
            })?;
            let Some(rel_path) = self.relative(entry.path()) else {
                continue;
            };
            if entry.file_type().is_dir() {
                entries.push(FileEntry {
                    path: format!("{rel_path}/"),
                    is_dir: true,
                    size: 0,
                    hash: String::new(),
                });
            } else if entry.file_type().is_file() {
                let data = std::fs::read(entry.path()).map_err(|e| repo_io_err(entry.path(), e))?;
                entries.push(FileEntry {
                    path: rel_path,
                    is_dir: false,
                    size: data.len() as u64,
                    hash: sha256_hex(&data),
                });
            }
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    fn write(
        &self,
        rel: &str,
        data: &[u8],
        opts: &WriteOptions,
    ) -> Result<Option<String>, RepositoryError> {
        self.reject_ref(opts.branch.as_deref())?;
        if path::is_dir(rel) {
            let full = self.resolve(rel)?;
            std::fs::create_dir_all(&full).map_err(|e| repo_io_err(&full, e))?;
            return Ok(None);
        }
        let full = self.resolve(rel)?;
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).map_err(|e| repo_io_err(parent, e))?;
        }
        let tmp = full.with_file_name(format!(".{}.tmp", path::base(rel)));
        std::fs::write(&tmp, data).map_err(|e| repo_io_err(&tmp, e))?;
        if let Err(e) = std::fs::rename(&tmp, &full) {
            let _ = std::fs::remove_file(&tmp);
            return Err(repo_io_err(&full, e));
        }
        tracing::info!(path = %rel, "wrote file");
        Ok(None)
    }

    fn move_path(
        &self,
        from: &str,
        to: &str,
        opts: &WriteOptions,
    ) -> Result<Option<String>, RepositoryError> {
        self.reject_ref(opts.branch.as_deref())?;
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        if !src.exists() {
            return Err(RepositoryError::NotFound(from.to_owned()));
        }
        if dst.exists() {
            return Err(RepositoryError::AlreadyExists(to.to_owned()));
        }
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent).map_err(|e| repo_io_err(parent, e))?;
        }
        std::fs::rename(&src, &dst).map_err(|e| repo_io_err(&src, e))?;
        tracing::info!(from = %from, to = %to, "moved path");
        Ok(None)
    }

    fn delete(&self, rel: &str, opts: &WriteOptions) -> Result<Option<String>, RepositoryError> {
        self.reject_ref(opts.branch.as_deref())?;
        let full = self.resolve(rel)?;
        if !full.exists() {
            return Err(RepositoryError::NotFound(rel.to_owned()));
        }
        let result = if full.is_dir() {
            std::fs::remove_dir_all(&full)
        } else {
            std::fs::remove_file(&full)
        };
        result.map_err(|e| repo_io_err(&full, e))?;
        tracing::info!(path = %rel, "deleted path");
        Ok(None)
    }
}
