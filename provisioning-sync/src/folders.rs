//! Folder hierarchy mirroring the repository's directory structure.
//!
//! Folder-target repositories hang everything below a root folder whose uid
//! is the repository name. Other folders get a uid derived from the
//! repository and directory path, unless a managed folder already claims
//! that directory.

use std::collections::HashMap;

use provisioning_core::{path, Repository, RepositoryName, ResourceKind, SyncTarget};

use crate::checksum::short_hash;
use crate::diff::{FileAction, ResourceListItem};
use crate::error::{StoreError, SyncError};
use crate::ownership::{self, Ownership};
use crate::resources::{ResourceObject, ResourceSpec, ResourceStore, SourceProperties};

/// Stable uid for the folder at `dir` in `repository`.
pub fn folder_uid(repository: &RepositoryName, dir: &str) -> String {
    let dir = path::as_dir(dir);
    let slug = crate::parser::slugify(path::base(&dir));
    let hash = short_hash(&format!("{}:{dir}", repository.0));
    if slug.is_empty() {
        hash
    } else {
        let mut slug = slug;
        slug.truncate(24);
        format!("{}-{hash}", slug.trim_end_matches('-'))
    }
}

pub struct FolderTree<'a> {
    store: &'a dyn ResourceStore,
    repository: &'a Repository,
    by_path: HashMap<String, String>,
}

impl<'a> FolderTree<'a> {
    pub fn new(
        store: &'a dyn ResourceStore,
        repository: &'a Repository,
        managed: &[ResourceListItem],
    ) -> Self {
        let by_path = managed
            .iter()
            .filter(|i| i.kind == ResourceKind::Folder && !i.path.is_empty())
            .map(|i| (i.path.clone(), i.name.clone()))
            .collect();
        Self {
            store,
            repository,
            by_path,
        }
    }

    /// Root folder uid for folder targets.
    pub fn root(&self) -> Option<&str> {
        match self.repository.target() {
            SyncTarget::Folder => Some(&self.repository.name.0),
            SyncTarget::Instance => None,
        }
    }

    /// Make sure the root folder exists and belongs to the repository.
    pub fn ensure_root(&self) -> Result<(), SyncError> {
        let Some(root) = self.root() else {
            return Ok(());
        };
        let title = self.repository.spec.title.clone();
        let desired = ResourceObject::folder(root, title, None);
        self.upsert(desired, "").map(|_| ())
    }

    /// Folder uid a resource at top level of `dir` belongs to.
    pub fn folder_for(&self, dir: &str) -> Option<String> {
        if dir.is_empty() {
            return self.root().map(str::to_owned);
        }
        let dir = path::as_dir(dir);
        Some(
            self.by_path
                .get(&dir)
                .cloned()
                .unwrap_or_else(|| folder_uid(&self.repository.name, &dir)),
        )
    }

    pub fn is_known(&self, dir: &str) -> bool {
        self.by_path.contains_key(&path::as_dir(dir))
    }

    /// Create or reconcile the folder for `dir`, creating missing ancestors.
    ///
    /// Returns the outcome for `dir` itself; `Ignored` when nothing changed.
    pub fn ensure(&mut self, dir: &str) -> Result<FileAction, SyncError> {
        let dir = path::as_dir(dir);
        for ancestor in path::ancestors(&dir) {
            if !self.is_known(&ancestor) {
                self.ensure_one(&ancestor)?;
            }
        }
        self.ensure_one(&dir)
    }

    fn ensure_one(&mut self, dir: &str) -> Result<FileAction, SyncError> {
        let uid = self
            .folder_for(dir)
            .unwrap_or_else(|| folder_uid(&self.repository.name, dir));
        let parent = self.folder_for(path::dir(dir));
        let desired = ResourceObject::folder(&uid, path::base(dir), parent.as_deref());
        let action = self.upsert(desired, dir)?;
        self.by_path.insert(dir.to_owned(), uid);
        Ok(action)
    }

    /// Drop a deleted folder from the index.
    pub fn forget(&mut self, dir: &str) {
        self.by_path.remove(&path::as_dir(dir));
    }

    fn upsert(&self, mut desired: ResourceObject, dir: &str) -> Result<FileAction, SyncError> {
        let source = SourceProperties {
            path: dir.to_owned(),
            checksum: String::new(),
        };
        match self.store.get(ResourceKind::Folder, desired.name()) {
            Err(StoreError::NotFound { .. }) => {
                ownership::claim(&mut desired.meta, &self.repository.name, &source);
                self.store.create(desired)?;
                tracing::info!(repository = %self.repository.name, path = %dir, "created folder");
                Ok(FileAction::Created)
            }
            Err(e) => Err(e.into()),
            Ok(existing) => {
                let owned = ownership::check_write(
                    ResourceKind::Folder,
                    &existing.meta,
                    &self.repository.name,
                )? == Ownership::Owned;
                let same_source = existing.meta.source().map(|s| s.path) == Some(dir.to_owned());
                if owned && same_source && existing.same_content(&desired) {
                    return Ok(FileAction::Ignored);
                }
                let mut updated = existing.clone();
                if let (ResourceSpec::Folder(current), ResourceSpec::Folder(wanted)) =
                    (&mut updated.spec, desired.spec)
                {
                    current.title = wanted.title;
                }
                updated.meta.set_folder(desired.meta.folder());
                ownership::claim(&mut updated.meta, &self.repository.name, &source);
                self.store.update(updated)?;
                tracing::info!(repository = %self.repository.name, path = %dir, "updated folder");
                Ok(FileAction::Updated)
            }
        }
    }
}
