//! Sync planner: file tree snapshot + managed resources → ordered changes.
//!
//! Ordering of the returned plan:
//! 1. folder creations, shallowest first
//! 2. file creations, updates and renames, by path
//! 3. deletions, deepest first, files before their folders

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet};

use provisioning_core::{path, RepositoryName, ResourceKind};

use crate::error::StoreError;
use crate::parser::is_content_path;
use crate::repository::{ChangeKind, FileEntry, VersionedChange};
use crate::resources::{ResourceStore, Selector};

/// A resource managed by the repository, as seen by the planner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceListItem {
    pub kind: ResourceKind,
    pub name: String,
    /// Source path; folders carry a trailing `/`. Empty for the root folder.
    pub path: String,
    pub checksum: String,
    pub folder: Option<String>,
    pub resource_version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FileAction {
    Created,
    Updated,
    Deleted,
    Renamed,
    Ignored,
}

impl std::fmt::Display for FileAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FileAction::Created => "created",
            FileAction::Updated => "updated",
            FileAction::Deleted => "deleted",
            FileAction::Renamed => "renamed",
            FileAction::Ignored => "ignored",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceFileChange {
    pub action: FileAction,
    pub path: String,
    pub previous_path: Option<String>,
    pub existing: Option<ResourceListItem>,
}

impl ResourceFileChange {
    fn new(action: FileAction, path: impl Into<String>, existing: Option<ResourceListItem>) -> Self {
        Self {
            action,
            path: path.into(),
            previous_path: None,
            existing,
        }
    }

    pub fn is_dir(&self) -> bool {
        path::is_dir(&self.path)
    }
}

/// Every dashboard and folder managed by `repository`.
pub fn list_managed(
    store: &dyn ResourceStore,
    repository: &RepositoryName,
) -> Result<Vec<ResourceListItem>, StoreError> {
    let selector = Selector::ManagedBy(repository.clone());
    let mut items = Vec::new();
    for kind in ResourceKind::all() {
        for obj in store.list(*kind, &selector)? {
            let source = obj.meta.source().unwrap_or_default();
            items.push(ResourceListItem {
                kind: *kind,
                name: obj.meta.name.clone(),
                path: source.path,
                checksum: source.checksum,
                folder: obj.meta.folder().map(str::to_owned),
                resource_version: obj.meta.resource_version,
            });
        }
    }
    Ok(items)
}

fn index_by_path(managed: &[ResourceListItem]) -> HashMap<&str, &ResourceListItem> {
    managed
        .iter()
        .filter(|item| !item.path.is_empty())
        .map(|item| (item.path.as_str(), item))
        .collect()
}

/// Full comparison of a listing against managed resources.
///
/// With `scope`, only changes at or below that path are planned and nothing
/// is deleted.
pub fn compare(
    files: &[FileEntry],
    managed: &[ResourceListItem],
    scope: Option<&str>,
) -> Vec<ResourceFileChange> {
    let by_path = index_by_path(managed);
    let mut dirs = BTreeSet::new();
    let mut present = BTreeSet::new();
    let mut changes = Vec::new();

    for entry in files {
        if path::is_hidden(&entry.path) {
            continue;
        }
        if entry.is_dir {
            dirs.insert(path::as_dir(&entry.path));
            continue;
        }
        if !is_content_path(&entry.path) {
            continue;
        }
        dirs.extend(path::ancestors(&entry.path));
        present.insert(entry.path.clone());
        match by_path.get(entry.path.as_str()) {
            Some(existing) if existing.checksum == entry.hash => {}
            Some(existing) => changes.push(ResourceFileChange::new(
                FileAction::Updated,
                &entry.path,
                Some((*existing).clone()),
            )),
            None => changes.push(ResourceFileChange::new(FileAction::Created, &entry.path, None)),
        }
    }

    for dir in &dirs {
        if !by_path.contains_key(dir.as_str()) {
            changes.push(ResourceFileChange::new(FileAction::Created, dir, None));
        }
    }

    if scope.is_none() {
        for item in managed.iter().filter(|i| !i.path.is_empty()) {
            let gone = if path::is_dir(&item.path) {
                !dirs.contains(&item.path)
            } else {
                !present.contains(&item.path)
            };
            if gone {
                changes.push(ResourceFileChange::new(
                    FileAction::Deleted,
                    &item.path,
                    Some(item.clone()),
                ));
            }
        }
    }

    let mut plan = detect_renames(changes, files);
    if let Some(scope) = scope {
        plan.retain(|c| in_scope(c, scope));
    }
    order(&mut plan);
    plan
}

/// Plan from the file-level changes between the last synced commit and head.
pub fn compare_incremental(
    diff: &[VersionedChange],
    managed: &[ResourceListItem],
) -> Vec<ResourceFileChange> {
    let by_path = index_by_path(managed);
    let mut new_dirs = BTreeSet::new();
    let mut changes = Vec::new();
    let mut hashes = Vec::new();

    for change in diff {
        if !is_content_path(&change.path) {
            continue;
        }
        match change.kind {
            ChangeKind::Created | ChangeKind::Updated => {
                for dir in path::ancestors(&change.path) {
                    if !by_path.contains_key(dir.as_str()) {
                        new_dirs.insert(dir);
                    }
                }
                hashes.push(FileEntry {
                    path: change.path.clone(),
                    is_dir: false,
                    size: 0,
                    hash: change.hash.clone(),
                });
                match by_path.get(change.path.as_str()) {
                    Some(existing) if existing.checksum == change.hash => {}
                    Some(existing) => changes.push(ResourceFileChange::new(
                        FileAction::Updated,
                        &change.path,
                        Some((*existing).clone()),
                    )),
                    None => changes.push(ResourceFileChange::new(
                        FileAction::Created,
                        &change.path,
                        None,
                    )),
                }
            }
            ChangeKind::Deleted => {
                if let Some(existing) = by_path.get(change.path.as_str()) {
                    changes.push(ResourceFileChange::new(
                        FileAction::Deleted,
                        &change.path,
                        Some((*existing).clone()),
                    ));
                }
            }
        }
    }
    changes.extend(
        new_dirs
            .into_iter()
            .map(|d| ResourceFileChange::new(FileAction::Created, d, None)),
    );

    let mut plan = detect_renames(changes, &hashes);
    order(&mut plan);
    plan
}

/// Plan updates for managed resources whose parent folder no longer matches
/// their directory. `expected` maps a directory (`""` for the top level) to
/// the folder uid its contents belong in.
pub fn realign(
    plan: &mut Vec<ResourceFileChange>,
    managed: &[ResourceListItem],
    expected: impl Fn(&str) -> Option<String>,
) {
    let planned: HashSet<String> = plan
        .iter()
        .flat_map(|c| std::iter::once(c.path.clone()).chain(c.previous_path.clone()))
        .collect();
    let misplaced: Vec<ResourceFileChange> = managed
        .iter()
        .filter(|item| !item.path.is_empty() && !planned.contains(&item.path))
        .filter(|item| item.folder != expected(path::dir(&item.path)))
        .map(|item| ResourceFileChange::new(FileAction::Updated, &item.path, Some(item.clone())))
        .collect();
    if misplaced.is_empty() {
        return;
    }
    plan.extend(misplaced);
    order(plan);
}

/// Pair a deleted file with a created file of identical content.
fn detect_renames(changes: Vec<ResourceFileChange>, files: &[FileEntry]) -> Vec<ResourceFileChange> {
    let hash_of: HashMap<&str, &str> = files
        .iter()
        .filter(|f| !f.is_dir)
        .map(|f| (f.path.as_str(), f.hash.as_str()))
        .collect();

    let (mut deleted, rest): (Vec<_>, Vec<_>) = changes
        .into_iter()
        .partition(|c| c.action == FileAction::Deleted && !c.is_dir());

    let mut plan = Vec::with_capacity(rest.len() + deleted.len());
    for change in rest {
        if change.action != FileAction::Created || change.is_dir() {
            plan.push(change);
            continue;
        }
        let hash = hash_of.get(change.path.as_str()).copied().unwrap_or_default();
        let paired = deleted.iter().position(|d| {
            d.existing
                .as_ref()
                .map(|e| !hash.is_empty() && e.checksum == hash)
                .unwrap_or(false)
        });
        match paired {
            Some(idx) => {
                let old = deleted.remove(idx);
                plan.push(ResourceFileChange {
                    action: FileAction::Renamed,
                    path: change.path,
                    previous_path: Some(old.path),
                    existing: old.existing,
                });
            }
            None => plan.push(change),
        }
    }
    plan.extend(deleted);
    plan
}

fn in_scope(change: &ResourceFileChange, scope: &str) -> bool {
    if change.action == FileAction::Deleted {
        return false;
    }
    if change.path == scope || path::is_under(&change.path, scope) {
        return true;
    }
    // Folders needed to hold the scoped path.
    change.is_dir() && path::is_under(scope, &change.path)
}

fn order(plan: &mut [ResourceFileChange]) {
    plan.sort_by_key(|c| {
        let depth = path::depth(&c.path);
        match (c.action, c.is_dir()) {
            (FileAction::Deleted, dir) => (2, Reverse(depth), dir, c.path.clone()),
            (_, true) => (0, Reverse(0), true, c.path.clone()),
            (_, false) => (1, Reverse(0), false, c.path.clone()),
        }
    });
}
