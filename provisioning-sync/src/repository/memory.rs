//! In-memory versioned adapter standing in for git and github storage.
//!
//! Every mutation creates a commit holding a full snapshot of the tree.
//! Directories are implicit, as in git.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

use provisioning_core::{path, StorageKind};

use super::{
    ChangeKind, FileEntry, FileInfo, RefInfo, RepositoryAdapter, VersionedChange, WriteOptions,
};
use crate::checksum::sha256_hex;
use crate::error::RepositoryError;

type Tree = BTreeMap<String, Vec<u8>>;

struct Commit {
    tree: Tree,
}

struct MemoryRepoInner {
    branches: BTreeMap<String, String>,
    commits: HashMap<String, Commit>,
    counter: u64,
}

pub struct MemoryRepository {
    kind: StorageKind,
    url: Option<String>,
    default_branch: String,
    inner: RwLock<MemoryRepoInner>,
}

impl MemoryRepository {
    /// Empty repository with a single root commit on `default_branch`.
    pub fn new(kind: StorageKind, default_branch: impl Into<String>) -> Self {
        let default_branch = default_branch.into();
        let root = sha256_hex(format!("root:{default_branch}").as_bytes());
        let mut commits = HashMap::new();
        commits.insert(root.clone(), Commit { tree: Tree::new() });
        let mut branches = BTreeMap::new();
        branches.insert(default_branch.clone(), root);
        Self {
            kind,
            url: None,
            default_branch,
            inner: RwLock::new(MemoryRepoInner {
                branches,
                commits,
                counter: 0,
            }),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Tree of `git_ref` (branch or commit), defaulting to the default branch.
    fn tree_at(
        inner: &MemoryRepoInner,
        default: &str,
        git_ref: Option<&str>,
    ) -> Result<Tree, RepositoryError> {
        let commit = Self::resolve_ref(inner, default, git_ref)?;
        inner
            .commits
            .get(&commit)
            .map(|c| c.tree.clone())
            .ok_or(RepositoryError::RefNotFound(commit))
    }

    fn resolve_ref(
        inner: &MemoryRepoInner,
        default: &str,
        git_ref: Option<&str>,
    ) -> Result<String, RepositoryError> {
        let name = git_ref.unwrap_or(default);
        if let Some(head) = inner.branches.get(name) {
            return Ok(head.clone());
        }
        if inner.commits.contains_key(name) {
            return Ok(name.to_owned());
        }
        Err(RepositoryError::RefNotFound(name.to_owned()))
    }

    /// Apply `change` to the branch head and record a new commit.
    fn commit<F>(&self, opts: &WriteOptions, change: F) -> Result<Option<String>, RepositoryError>
    where
        F: FnOnce(&mut Tree) -> Result<(), RepositoryError>,
    {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let branch = opts
            .branch
            .clone()
            .unwrap_or_else(|| self.default_branch.clone());
        let parent = match inner.branches.get(&branch) {
            Some(head) => head.clone(),
            // New branches start from the default branch.
            None => Self::resolve_ref(&inner, &self.default_branch, None)?,
        };
        let mut tree = inner
            .commits
            .get(&parent)
            .map(|c| c.tree.clone())
            .ok_or_else(|| RepositoryError::RefNotFound(parent.clone()))?;
        change(&mut tree)?;

        inner.counter += 1;
        let hash = sha256_hex(format!("{parent}:{}:{}", inner.counter, opts.message).as_bytes());
        inner.commits.insert(hash.clone(), Commit { tree });
        inner.branches.insert(branch.clone(), hash.clone());
        tracing::debug!(branch = %branch, commit = %hash, message = %opts.message, "committed");
        Ok(Some(hash))
    }
}

fn is_dir_in(tree: &Tree, dir: &str) -> bool {
    let prefix = path::as_dir(dir);
    tree.keys().any(|k| k.starts_with(&prefix))
}

impl RepositoryAdapter for MemoryRepository {
    fn kind(&self) -> StorageKind {
        self.kind
    }

    fn read(&self, rel: &str, git_ref: Option<&str>) -> Result<FileInfo, RepositoryError> {
        path::validate(rel)?;
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let commit = Self::resolve_ref(&inner, &self.default_branch, git_ref)?;
        let tree = Self::tree_at(&inner, &self.default_branch, Some(commit.as_str()))?;
        if path::is_dir(rel) || is_dir_in(&tree, rel) {
            return Err(RepositoryError::IsDirectory(rel.to_owned()));
        }
        let data = tree
            .get(rel)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(rel.to_owned()))?;
        Ok(FileInfo {
            path: rel.to_owned(),
            hash: sha256_hex(&data),
            data,
            git_ref: Some(commit),
        })
    }

    fn list(&self, rel: &str, git_ref: Option<&str>) -> Result<Vec<FileEntry>, RepositoryError> {
        if !rel.is_empty() {
            path::validate(rel)?;
        }
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let tree = Self::tree_at(&inner, &self.default_branch, git_ref)?;
        let prefix = path::as_dir(rel);
        if !prefix.is_empty() && !is_dir_in(&tree, &prefix) {
            return Err(RepositoryError::NotFound(rel.to_owned()));
        }

        let mut dirs = BTreeSet::new();
        let mut entries = Vec::new();
        for (file, data) in tree.iter().filter(|(k, _)| k.starts_with(&prefix)) {
            for ancestor in path::ancestors(file) {
                if ancestor.len() > prefix.len() {
                    dirs.insert(ancestor);
                }
            }
            entries.push(FileEntry {
                path: file.clone(),
                is_dir: false,
                size: data.len() as u64,
                hash: sha256_hex(data),
            });
        }
        entries.extend(dirs.into_iter().map(|d| FileEntry {
            path: d,
            is_dir: true,
            size: 0,
            hash: String::new(),
        }));
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    fn write(
        &self,
        rel: &str,
        data: &[u8],
        opts: &WriteOptions,
    ) -> Result<Option<String>, RepositoryError> {
        path::validate(rel)?;
        if path::is_dir(rel) {
            return Err(RepositoryError::IsDirectory(rel.to_owned()));
        }
        let data = data.to_vec();
        self.commit(opts, |tree| {
            if is_dir_in(tree, rel) {
                return Err(RepositoryError::IsDirectory(rel.to_owned()));
            }
            tree.insert(rel.to_owned(), data);
            Ok(())
        })
    }

    fn move_path(
        &self,
        from: &str,
        to: &str,
        opts: &WriteOptions,
    ) -> Result<Option<String>, RepositoryError> {
        path::validate(from)?;
        path::validate(to)?;
        self.commit(opts, |tree| {
            if path::is_dir(from) {
                if !is_dir_in(tree, from) {
                    return Err(RepositoryError::NotFound(from.to_owned()));
                }
                if is_dir_in(tree, to) {
                    return Err(RepositoryError::AlreadyExists(to.to_owned()));
                }
                let moved: Vec<String> =
                    tree.keys().filter(|k| k.starts_with(from)).cloned().collect();
                for key in moved {
                    if let Some(data) = tree.remove(&key) {
                        let dest = format!("{to}{}", &key[from.len()..]);
                        tree.insert(dest, data);
                    }
                }
            } else {
                if tree.contains_key(to) {
                    return Err(RepositoryError::AlreadyExists(to.to_owned()));
                }
                let data = tree
                    .remove(from)
                    .ok_or_else(|| RepositoryError::NotFound(from.to_owned()))?;
                tree.insert(to.to_owned(), data);
            }
            Ok(())
        })
    }

    fn delete(&self, rel: &str, opts: &WriteOptions) -> Result<Option<String>, RepositoryError> {
        path::validate(rel)?;
        self.commit(opts, |tree| {
            if path::is_dir(rel) {
                let before = tree.len();
                tree.retain(|k, _| !k.starts_with(rel));
                if tree.len() == before {
                    return Err(RepositoryError::NotFound(rel.to_owned()));
                }
            } else if tree.remove(rel).is_none() {
                return Err(RepositoryError::NotFound(rel.to_owned()));
            }
            Ok(())
        })
    }

    fn default_branch(&self) -> Option<&str> {
        Some(&self.default_branch)
    }

    fn refs(&self) -> Result<Vec<RefInfo>, RepositoryError> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        Ok(inner
            .branches
            .iter()
            .map(|(name, hash)| RefInfo {
                name: name.clone(),
                hash: hash.clone(),
                url: self.url.as_ref().map(|u| format!("{u}/tree/{name}")),
            })
            .collect())
    }

    fn latest_ref(&self) -> Result<Option<String>, RepositoryError> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        Self::resolve_ref(&inner, &self.default_branch, None).map(Some)
    }

    fn compare(&self, base: &str, head: &str) -> Result<Vec<VersionedChange>, RepositoryError> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let old = Self::tree_at(&inner, &self.default_branch, Some(base))?;
        let new = Self::tree_at(&inner, &self.default_branch, Some(head))?;

        let mut changes = Vec::new();
        for (file, data) in &new {
            match old.get(file) {
                None => changes.push(VersionedChange {
                    kind: ChangeKind::Created,
                    path: file.clone(),
                    hash: sha256_hex(data),
                }),
                Some(prev) if prev != data => changes.push(VersionedChange {
                    kind: ChangeKind::Updated,
                    path: file.clone(),
                    hash: sha256_hex(data),
                }),
                Some(_) => {}
            }
        }
        for (file, data) in &old {
            if !new.contains_key(file) {
                changes.push(VersionedChange {
                    kind: ChangeKind::Deleted,
                    path: file.clone(),
                    hash: sha256_hex(data),
                });
            }
        }
        changes.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> WriteOptions {
        WriteOptions::message("test")
    }

    #[test]
    fn each_write_is_a_new_commit() {
        let repo = MemoryRepository::new(StorageKind::Git, "main");
        let first = repo.write("a.json", b"1", &opts()).expect("write");
        let second = repo.write("a.json", b"2", &opts()).expect("write");
        assert_ne!(first, second);
        assert_eq!(repo.latest_ref().expect("ref"), second);

        let old = repo.read("a.json", first.as_deref()).expect("read old");
        assert_eq!(old.data, b"1");
        let new = repo.read("a.json", None).expect("read new");
        assert_eq!(new.data, b"2");
    }

    #[test]
    fn branches_fork_from_default() {
        let repo = MemoryRepository::new(StorageKind::Github, "main")
            .with_url("https://github.com/org/repo");
        repo.write("a.json", b"1", &opts()).expect("write");
        let on_branch = WriteOptions {
            branch: Some("feature".into()),
            message: "branch".into(),
        };
        repo.write("b.json", b"2", &on_branch).expect("write branch");

        assert!(repo.read("b.json", None).unwrap_err().is_not_found());
        assert_eq!(repo.read("a.json", Some("feature")).expect("inherited").data, b"1");
        let refs = repo.refs().expect("refs");
        assert_eq!(refs.len(), 2);
        assert_eq!(
            refs[0].url.as_deref(),
            Some("https://github.com/org/repo/tree/feature")
        );
    }

    #[test]
    fn list_derives_directories() {
        let repo = MemoryRepository::new(StorageKind::Git, "main");
        repo.write("a/b/c.json", b"{}", &opts()).expect("write");
        let paths: Vec<String> = repo
            .list("", None)
            .expect("list")
            .into_iter()
            .map(|e| e.path)
            .collect();
        assert_eq!(paths, vec!["a/", "a/b/", "a/b/c.json"]);
        let sub: Vec<String> = repo
            .list("a/", None)
            .expect("list")
            .into_iter()
            .map(|e| e.path)
            .collect();
        assert_eq!(sub, vec!["a/b/", "a/b/c.json"]);
    }

    #[test]
    fn compare_reports_file_changes() {
        let repo = MemoryRepository::new(StorageKind::Git, "main");
        let base = repo
            .write("keep.json", b"1", &opts())
            .expect("write")
            .expect("ref");
        repo.write("gone.json", b"x", &opts()).expect("write");
        let base2 = repo.latest_ref().expect("ref").expect("ref");
        repo.write("keep.json", b"2", &opts()).expect("write");
        repo.delete("gone.json", &opts()).expect("delete");
        repo.write("new.json", b"n", &opts()).expect("write");
        let head = repo.latest_ref().expect("ref").expect("ref");

        let changes = repo.compare(&base2, &head).expect("compare");
        let kinds: Vec<(ChangeKind, &str)> =
            changes.iter().map(|c| (c.kind, c.path.as_str())).collect();
        assert_eq!(
            kinds,
            vec![
                (ChangeKind::Deleted, "gone.json"),
                (ChangeKind::Updated, "keep.json"),
                (ChangeKind::Created, "new.json"),
            ]
        );
        assert!(repo.compare(&base, &base).expect("same").is_empty());
    }

    #[test]
    fn directory_move_keeps_relative_structure() {
        let repo = MemoryRepository::new(StorageKind::Git, "main");
        repo.write("old/a.json", b"a", &opts()).expect("write");
        repo.write("old/sub/b.json", b"b", &opts()).expect("write");
        repo.move_path("old/", "new/deeper/", &opts()).expect("move");
        assert_eq!(repo.read("new/deeper/sub/b.json", None).expect("read").data, b"b");
        assert!(!repo.exists("old/", None).expect("exists"));
    }
}
