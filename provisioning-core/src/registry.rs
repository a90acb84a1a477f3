//! Per-namespace YAML repository registry.
//!
//! # Storage layout
//!
//! ```text
//! ~/.provisioning/
//!   config.yaml
//!   namespaces/
//!     <namespace>/
//!       <repository>.yaml   (one file per repository, mode 0600)
//! ```
//!
//! # API pattern
//!
//! Every function has two forms:
//! - `fn_at(home: &Path, …)`: explicit home; used in tests with `TempDir`
//! - `fn(…)`: derives home from `dirs::home_dir()`, delegates to `_at`
//!
//! Tests must NEVER call the no-arg wrappers; always use `_at`.

use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::config::Settings;
use crate::error::RegistryError;
use crate::path;
use crate::types::{Namespace, Repository, RepositoryName, StorageSpec, SyncTarget};

// ---------------------------------------------------------------------------
// 1. Path helpers
// ---------------------------------------------------------------------------

/// `<home>/.provisioning/namespaces/<namespace>/`
///
/// Creates the directory (mode `0700`) if it does not yet exist.
pub fn namespace_dir_at(home: &Path, namespace: &Namespace) -> Result<PathBuf, RegistryError> {
    let dir = namespaces_root(home).join(&namespace.0);
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
        set_dir_permissions(&dir)?;
    }
    Ok(dir)
}

/// `<home>/.provisioning/namespaces/<namespace>/<repository>.yaml`: pure, no I/O.
pub fn repository_path_at(home: &Path, namespace: &Namespace, name: &RepositoryName) -> PathBuf {
    namespaces_root(home)
        .join(&namespace.0)
        .join(format!("{}.yaml", name.0))
}

/// Names of every namespace directory, sorted.
pub fn list_namespaces_at(home: &Path) -> Result<Vec<Namespace>, RegistryError> {
    let dir = namespaces_root(home);
    if !dir.exists() {
        return Ok(vec![]);
    }
    let mut names: Vec<Namespace> = std::fs::read_dir(&dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|e| Namespace::from(e.file_name().to_string_lossy().into_owned()))
        .collect();
    names.sort();
    Ok(names)
}

/// `list_namespaces_at` convenience wrapper.
pub fn list_namespaces() -> Result<Vec<Namespace>, RegistryError> {
    list_namespaces_at(&home()?)
}

// ---------------------------------------------------------------------------
// 2. Load
// ---------------------------------------------------------------------------

/// Returns `RepositoryNotFound` if absent, `Parse` (with path) if malformed.
pub fn load_repository_at(
    home: &Path,
    namespace: &Namespace,
    name: &RepositoryName,
) -> Result<Repository, RegistryError> {
    let path = repository_path_at(home, namespace, name);
    if !path.exists() {
        return Err(RegistryError::RepositoryNotFound { path });
    }
    let contents = std::fs::read_to_string(&path)?;
    serde_yaml::from_str(&contents).map_err(|e| RegistryError::Parse { path, source: e })
}

/// `load_repository_at` convenience wrapper.
pub fn load_repository(
    namespace: &Namespace,
    name: &RepositoryName,
) -> Result<Repository, RegistryError> {
    load_repository_at(&home()?, namespace, name)
}

/// All repositories in a namespace, sorted by name.
pub fn list_repositories_at(
    home: &Path,
    namespace: &Namespace,
) -> Result<Vec<Repository>, RegistryError> {
    let dir = namespaces_root(home).join(&namespace.0);
    if !dir.exists() {
        return Ok(vec![]);
    }
    let mut entries: Vec<_> = std::fs::read_dir(&dir)?.filter_map(|e| e.ok()).collect();
    entries.sort_by_key(|e| e.file_name());

    let mut result = Vec::new();
    for entry in entries {
        let fname = entry.file_name();
        if !fname.to_string_lossy().ends_with(".yaml") {
            continue;
        }
        let contents = std::fs::read_to_string(entry.path())?;
        let repo: Repository = serde_yaml::from_str(&contents)
            .map_err(|e| RegistryError::Parse { path: entry.path(), source: e })?;
        result.push(repo);
    }
    Ok(result)
}

/// `list_repositories_at` convenience wrapper.
pub fn list_repositories(namespace: &Namespace) -> Result<Vec<Repository>, RegistryError> {
    list_repositories_at(&home()?, namespace)
}

// ---------------------------------------------------------------------------
// 3. Save (atomic)
// ---------------------------------------------------------------------------

/// Atomically write a repository to its namespace directory.
///
/// Write flow: serialize → `.yaml.tmp` sibling → `chmod 0600` → `rename`.
pub fn save_repository_at(home: &Path, repo: &Repository) -> Result<(), RegistryError> {
    namespace_dir_at(home, &repo.namespace)?;
    let path = repository_path_at(home, &repo.namespace, &repo.name);
    let tmp_path = path.with_file_name(format!("{}.yaml.tmp", repo.name.0));

    let yaml = serde_yaml::to_string(repo)?;
    std::fs::write(&tmp_path, yaml)?;
    set_file_permissions(&tmp_path)?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(())
}

/// `save_repository_at` convenience wrapper.
pub fn save_repository(repo: &Repository) -> Result<(), RegistryError> {
    save_repository_at(&home()?, repo)
}

// ---------------------------------------------------------------------------
// 4. Admission
// ---------------------------------------------------------------------------

/// Field-level checks on a single repository definition.
pub fn validate_repository(repo: &Repository) -> Result<(), RegistryError> {
    let invalid = |message: &str| RegistryError::Invalid {
        name: repo.name.0.clone(),
        message: message.to_owned(),
    };
    let name = &repo.name.0;
    if name.is_empty()
        || name.len() > 63
        || !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        || name.starts_with('-')
        || name.ends_with('-')
    {
        return Err(invalid("name must be lowercase alphanumeric or '-'"));
    }
    if repo.spec.title.trim().is_empty() {
        return Err(invalid("title is required"));
    }
    match &repo.spec.storage {
        StorageSpec::Local { path } => {
            if path.as_os_str().is_empty() {
                return Err(invalid("local path is required"));
            }
        }
        StorageSpec::Git { url, path: sub, .. } | StorageSpec::Github { url, path: sub, .. } => {
            if url.trim().is_empty() {
                return Err(invalid("url is required"));
            }
            if !sub.is_empty() {
                path::validate(sub).map_err(|e| invalid(&e.to_string()))?;
            }
        }
    }
    Ok(())
}

/// Rules for adding `candidate` to a namespace that already holds `existing`.
pub fn check_admission(
    existing: &[Repository],
    candidate: &Repository,
    max_repositories: u32,
) -> Result<(), RegistryError> {
    let others: Vec<&Repository> = existing.iter().filter(|r| r.name != candidate.name).collect();

    if others.len() >= max_repositories as usize {
        return Err(RegistryError::MaxRepositories {
            max: max_repositories,
        });
    }
    check_target(&others, candidate)?;
    check_storage_overlap(&others, candidate)
}

/// Rules for replacing `current` with `updated`.
pub fn check_update(
    existing: &[Repository],
    current: &Repository,
    updated: &Repository,
) -> Result<(), RegistryError> {
    let others: Vec<&Repository> = existing.iter().filter(|r| r.name != updated.name).collect();
    if current.target() != updated.target() {
        if current.status.sync.job.is_some() {
            return Err(RegistryError::TargetLocked {
                name: updated.name.0.clone(),
            });
        }
        check_target(&others, updated)?;
    }
    check_storage_overlap(&others, updated)
}

fn check_target(others: &[&Repository], candidate: &Repository) -> Result<(), RegistryError> {
    match candidate.target() {
        SyncTarget::Instance if !others.is_empty() => {
            let found: Vec<&str> = others.iter().map(|r| r.name.0.as_str()).collect();
            Err(RegistryError::InstanceRequiresEmpty {
                found: found.join(", "),
            })
        }
        SyncTarget::Folder => match others.iter().find(|r| r.target() == SyncTarget::Instance) {
            Some(instance) => Err(RegistryError::FolderBlockedByInstance {
                existing: instance.name.0.clone(),
            }),
            None => Ok(()),
        },
        SyncTarget::Instance => Ok(()),
    }
}

/// Two repositories may not point at the same tree, or at nested trees of
/// the same remote.
fn check_storage_overlap(
    others: &[&Repository],
    candidate: &Repository,
) -> Result<(), RegistryError> {
    let Some((location, sub)) = storage_location(&candidate.spec.storage) else {
        return Ok(());
    };
    for other in others {
        let Some((other_location, other_sub)) = storage_location(&other.spec.storage) else {
            continue;
        };
        if other_location != location {
            continue;
        }
        if other_sub == sub {
            return Err(RegistryError::DuplicatePath {
                path: sub,
                existing: other.name.0.clone(),
            });
        }
        if path::is_under(&sub, &other_sub) || path::is_under(&other_sub, &sub) {
            return Err(RegistryError::NestedPath {
                path: sub,
                existing: other.name.0.clone(),
            });
        }
    }
    Ok(())
}

/// (remote identity, normalised sub-directory) for versioned storage.
fn storage_location(storage: &StorageSpec) -> Option<(String, String)> {
    match storage {
        StorageSpec::Local { .. } => None,
        StorageSpec::Git { url, branch, path: sub }
        | StorageSpec::Github { url, branch, path: sub } => {
            let url = url.trim_end_matches('/').trim_end_matches(".git");
            Some((format!("{url}@{branch}"), path::as_dir(sub)))
        }
    }
}

// ---------------------------------------------------------------------------
// 5. Lifecycle
// ---------------------------------------------------------------------------

/// Validate, admit and persist a new repository.
pub fn create_repository_at(
    home: &Path,
    settings: &Settings,
    mut repo: Repository,
) -> Result<Repository, RegistryError> {
    validate_repository(&repo)?;
    if repository_path_at(home, &repo.namespace, &repo.name).exists() {
        return Err(RegistryError::AlreadyExists {
            name: repo.name.0.clone(),
        });
    }
    let existing = list_repositories_at(home, &repo.namespace)?;
    check_admission(&existing, &repo, settings.max_repositories)?;

    let now = Utc::now();
    repo.created_at = now;
    repo.updated_at = now;
    repo.status.quota.max_repositories = settings.max_repositories;
    repo.status.quota.max_resources_per_repository = settings.max_resources_per_repository;
    save_repository_at(home, &repo)?;
    Ok(repo)
}

/// `create_repository_at` convenience wrapper.
pub fn create_repository(settings: &Settings, repo: Repository) -> Result<Repository, RegistryError> {
    create_repository_at(&home()?, settings, repo)
}

/// Replace the `spec` of an existing repository, keeping its status.
pub fn update_repository_at(home: &Path, updated: Repository) -> Result<Repository, RegistryError> {
    validate_repository(&updated)?;
    let current = load_repository_at(home, &updated.namespace, &updated.name)?;
    let existing = list_repositories_at(home, &updated.namespace)?;
    check_update(&existing, &current, &updated)?;

    let repo = Repository {
        status: current.status,
        created_at: current.created_at,
        updated_at: Utc::now(),
        ..updated
    };
    save_repository_at(home, &repo)?;
    Ok(repo)
}

/// Remove the registry entry and return what was stored.
pub fn delete_repository_at(
    home: &Path,
    namespace: &Namespace,
    name: &RepositoryName,
) -> Result<Repository, RegistryError> {
    let repo = load_repository_at(home, namespace, name)?;
    std::fs::remove_file(repository_path_at(home, namespace, name))?;
    Ok(repo)
}

/// `delete_repository_at` convenience wrapper.
pub fn delete_repository(
    namespace: &Namespace,
    name: &RepositoryName,
) -> Result<Repository, RegistryError> {
    delete_repository_at(&home()?, namespace, name)
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn namespaces_root(home: &Path) -> PathBuf {
    home.join(".provisioning").join("namespaces")
}

fn home() -> Result<PathBuf, RegistryError> {
    dirs::home_dir().ok_or(RegistryError::HomeNotFound)
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), RegistryError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), RegistryError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), RegistryError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), RegistryError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RepositorySpec, SyncOptions};
    use tempfile::TempDir;

    fn git_repo(name: &str, sub: &str, target: SyncTarget) -> Repository {
        Repository::new(
            name,
            RepositorySpec {
                title: name.to_uppercase(),
                description: None,
                storage: StorageSpec::Git {
                    url: "https://example.com/org/dashboards.git".into(),
                    branch: "main".into(),
                    path: sub.into(),
                },
                sync: SyncOptions {
                    enabled: true,
                    target,
                    interval_seconds: 0,
                },
                orphan_policy: Default::default(),
            },
        )
    }

    #[test]
    fn repository_path_is_correct() {
        let home = TempDir::new().expect("tempdir");
        let path = repository_path_at(home.path(), &Namespace::default(), &"r1".into());
        assert!(path.ends_with(".provisioning/namespaces/default/r1.yaml"));
    }

    #[test]
    fn namespace_dir_created_with_perms() {
        let home = TempDir::new().expect("tempdir");
        let dir = namespace_dir_at(home.path(), &Namespace::default()).expect("dir");
        assert!(dir.exists());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&dir).expect("meta").permissions().mode() & 0o777;
            assert_eq!(mode, 0o700);
        }
    }

    #[test]
    fn save_and_load_roundtrip() {
        let home = TempDir::new().expect("tempdir");
        let repo = git_repo("r1", "dashboards", SyncTarget::Folder);
        save_repository_at(home.path(), &repo).expect("save");
        let loaded = load_repository_at(home.path(), &repo.namespace, &repo.name).expect("load");
        assert_eq!(loaded.spec, repo.spec);
        let tmp = repository_path_at(home.path(), &repo.namespace, &repo.name)
            .with_file_name("r1.yaml.tmp");
        assert!(!tmp.exists(), ".tmp must be gone after successful save");
    }

    #[test]
    fn instance_requires_empty_namespace() {
        let existing = vec![git_repo("a", "a", SyncTarget::Folder)];
        let err = check_admission(&existing, &git_repo("b", "", SyncTarget::Instance), 10)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Instance repository can only be created when no other repositories exist. Found: a"
        );
    }

    #[test]
    fn folder_blocked_by_instance() {
        let existing = vec![git_repo("inst", "x", SyncTarget::Instance)];
        let err =
            check_admission(&existing, &git_repo("b", "y", SyncTarget::Folder), 10).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot create folder repository when instance repository exists: inst"
        );
    }

    #[test]
    fn max_repositories_enforced() {
        let existing = vec![
            git_repo("a", "a", SyncTarget::Folder),
            git_repo("b", "b", SyncTarget::Folder),
        ];
        let err =
            check_admission(&existing, &git_repo("c", "c", SyncTarget::Folder), 2).unwrap_err();
        assert_eq!(err.to_string(), "Maximum number of 2 repositories reached");
    }

    #[test]
    fn overlapping_git_paths_rejected() {
        let existing = vec![git_repo("a", "team", SyncTarget::Folder)];
        let dup = check_admission(&existing, &git_repo("b", "team/", SyncTarget::Folder), 10);
        assert!(matches!(dup, Err(RegistryError::DuplicatePath { .. })));
        let nested = check_admission(&existing, &git_repo("c", "team/sub", SyncTarget::Folder), 10);
        assert!(matches!(nested, Err(RegistryError::NestedPath { .. })));
        let sibling = check_admission(&existing, &git_repo("d", "teammates", SyncTarget::Folder), 10);
        assert!(sibling.is_ok());
    }

    #[test]
    fn target_change_locked_after_sync() {
        let mut current = git_repo("a", "a", SyncTarget::Folder);
        current.status.sync.job = Some("a-pull-1".into());
        let updated = git_repo("a", "a", SyncTarget::Instance);
        let err = check_update(&[current.clone()], &current, &updated).unwrap_err();
        assert!(matches!(err, RegistryError::TargetLocked { .. }));
    }

    #[test]
    fn invalid_names_rejected() {
        let repo = git_repo("Bad_Name", "", SyncTarget::Folder);
        assert!(matches!(
            validate_repository(&repo),
            Err(RegistryError::Invalid { .. })
        ));
    }
}
