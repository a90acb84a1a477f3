//! Which repository, if any, may write a resource.

use thiserror::Error;

use provisioning_core::{RepositoryName, ResourceKind};

use crate::resources::{ManagerProperties, ObjectMeta, SourceProperties};

/// Relationship between a resource and the repository looking at it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ownership {
    /// No manager; any repository may claim it.
    Unmanaged,
    /// Managed by the repository itself.
    Owned,
    /// Managed elsewhere, but the manager allows edits. Ownership moves on write.
    Transferable { owner: String },
    /// Managed elsewhere; writes are refused.
    Foreign { owner: String },
}

impl Ownership {
    pub fn resolve(meta: &ObjectMeta, repository: &RepositoryName) -> Self {
        match meta.manager() {
            None => Ownership::Unmanaged,
            Some(m) if m.is_repository(repository) => Ownership::Owned,
            Some(m) if m.allows_edits => Ownership::Transferable {
                owner: m.to_string(),
            },
            Some(m) => Ownership::Foreign {
                owner: m.to_string(),
            },
        }
    }

    pub fn allows_write(&self) -> bool {
        !matches!(self, Ownership::Foreign { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} {name} is managed by {owner}, cannot be modified by repository {repository}")]
pub struct OwnershipError {
    pub kind: ResourceKind,
    pub name: String,
    pub owner: String,
    pub repository: String,
}

/// Refuse writes to resources managed by someone else.
pub fn check_write(
    kind: ResourceKind,
    meta: &ObjectMeta,
    repository: &RepositoryName,
) -> Result<Ownership, OwnershipError> {
    let ownership = Ownership::resolve(meta, repository);
    match &ownership {
        Ownership::Foreign { owner } => Err(OwnershipError {
            kind,
            name: meta.name.clone(),
            owner: owner.clone(),
            repository: repository.0.clone(),
        }),
        _ => Ok(ownership),
    }
}

/// Mark `meta` as managed by `repository` and sourced from `source`.
///
/// Any previous manager, including its allows-edits flag, is replaced.
pub fn claim(meta: &mut ObjectMeta, repository: &RepositoryName, source: &SourceProperties) {
    meta.set_manager(&ManagerProperties::repository(repository));
    meta.set_source(source);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn managed_by(repo: &str, allows_edits: bool) -> ObjectMeta {
        let mut meta = ObjectMeta::named("d1");
        meta.set_manager(&ManagerProperties {
            allows_edits,
            ..ManagerProperties::repository(&repo.into())
        });
        meta
    }

    #[test]
    fn resolve_cases() {
        let me: RepositoryName = "b".into();
        assert_eq!(Ownership::resolve(&ObjectMeta::named("x"), &me), Ownership::Unmanaged);
        assert_eq!(Ownership::resolve(&managed_by("b", false), &me), Ownership::Owned);
        assert!(matches!(
            Ownership::resolve(&managed_by("a", true), &me),
            Ownership::Transferable { .. }
        ));
        assert!(matches!(
            Ownership::resolve(&managed_by("a", false), &me),
            Ownership::Foreign { .. }
        ));
    }

    #[test]
    fn foreign_write_message_names_both_repositories() {
        let err = check_write(ResourceKind::Dashboard, &managed_by("a", false), &"b".into())
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Dashboard d1 is managed by repository a, cannot be modified by repository b"
        );
    }

    #[test]
    fn claim_transfers_and_resets_allows_edits() {
        let mut meta = managed_by("a", true);
        claim(
            &mut meta,
            &"b".into(),
            &SourceProperties {
                path: "d1.json".into(),
                checksum: "c".into(),
            },
        );
        let manager = meta.manager().expect("manager");
        assert_eq!(manager.identity, "b");
        assert!(!manager.allows_edits);
        assert_eq!(meta.source().expect("source").path, "d1.json");
    }
}
