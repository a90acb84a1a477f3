//! What happens to managed resources when their repository is removed.

use provisioning_core::{path, OrphanPolicy, Repository, ResourceKind};

use crate::error::StoreError;
use crate::resources::{ResourceObject, ResourceStore, Selector};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub released: usize,
    pub deleted: usize,
    /// Per-resource failures; cleanup carries on past them.
    pub errors: Vec<String>,
}

/// Release or delete everything `repository` manages, per its orphan policy.
pub fn cleanup(store: &dyn ResourceStore, repository: &Repository) -> Result<CleanupReport, StoreError> {
    let selector = Selector::ManagedBy(repository.name.clone());
    let dashboards = store.list(ResourceKind::Dashboard, &selector)?;
    let mut folders = store.list(ResourceKind::Folder, &selector)?;
    let mut report = CleanupReport::default();

    match repository.spec.orphan_policy {
        OrphanPolicy::Release => {
            for obj in dashboards.into_iter().chain(folders) {
                release(store, obj, &mut report);
            }
        }
        OrphanPolicy::Delete => {
            // Deepest folders first; the root folder has an empty path and
            // goes last.
            folders.sort_by_key(|f| {
                let p = f.meta.source().map(|s| s.path).unwrap_or_default();
                (p.is_empty(), std::cmp::Reverse(path::depth(&p)), p)
            });
            for obj in dashboards.into_iter().chain(folders) {
                let kind = obj.kind();
                match store.delete(kind, obj.name(), Some(obj.meta.resource_version)) {
                    Ok(()) | Err(StoreError::NotFound { .. }) => report.deleted += 1,
                    Err(e) => report.errors.push(e.to_string()),
                }
            }
        }
    }
    tracing::info!(
        repository = %repository.name,
        policy = ?repository.spec.orphan_policy,
        released = report.released,
        deleted = report.deleted,
        errors = report.errors.len(),
        "cleaned up managed resources"
    );
    Ok(report)
}

fn release(store: &dyn ResourceStore, mut obj: ResourceObject, report: &mut CleanupReport) {
    obj.meta.release();
    match store.update(obj) {
        Ok(_) => report.released += 1,
        Err(StoreError::NotFound { .. }) => {}
        Err(e) => report.errors.push(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ownership;
    use crate::resources::{DashboardSpec, MemoryResourceStore, SourceProperties};
    use provisioning_core::{RepositorySpec, StorageSpec};

    fn repository(policy: OrphanPolicy) -> Repository {
        Repository::new(
            "r1",
            RepositorySpec {
                title: "R1".into(),
                description: None,
                storage: StorageSpec::Local {
                    path: "/tmp/r1".into(),
                },
                sync: Default::default(),
                orphan_policy: policy,
            },
        )
    }

    fn seed(store: &MemoryResourceStore, repo: &Repository) {
        let claim = |obj: &mut ResourceObject, p: &str| {
            ownership::claim(
                &mut obj.meta,
                &repo.name,
                &SourceProperties {
                    path: p.into(),
                    checksum: String::new(),
                },
            )
        };
        let mut root = ResourceObject::folder("r1", "R1", None);
        claim(&mut root, "");
        store.create(root).expect("root");
        let mut team = ResourceObject::folder("team", "team", Some("r1"));
        claim(&mut team, "team/");
        store.create(team).expect("team");
        let mut nested = ResourceObject::folder("nested", "nested", Some("team"));
        claim(&mut nested, "team/nested/");
        store.create(nested).expect("nested");
        let mut dash = ResourceObject::dashboard("d", DashboardSpec::default());
        dash.meta.set_folder(Some("nested"));
        claim(&mut dash, "team/nested/d.json");
        store.create(dash).expect("dash");
        store
            .create(ResourceObject::dashboard("free", DashboardSpec::default()))
            .expect("free");
    }

    #[test]
    fn delete_policy_removes_bottom_up() {
        let store = MemoryResourceStore::new();
        let repo = repository(OrphanPolicy::Delete);
        seed(&store, &repo);
        let report = cleanup(&store, &repo).expect("cleanup");
        assert_eq!(report.deleted, 4, "{report:?}");
        assert!(report.errors.is_empty());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn release_policy_keeps_resources() {
        let store = MemoryResourceStore::new();
        let repo = repository(OrphanPolicy::Release);
        seed(&store, &repo);
        let report = cleanup(&store, &repo).expect("cleanup");
        assert_eq!(report.released, 4);
        assert_eq!(store.len(), 5);
        let dash = store.get(ResourceKind::Dashboard, "d").expect("d");
        assert!(dash.meta.manager().is_none());
        assert_eq!(dash.meta.folder(), Some("nested"));
    }
}
