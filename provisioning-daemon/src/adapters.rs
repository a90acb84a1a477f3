use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use provisioning_core::{Namespace, Repository, RepositoryName, StorageSpec};
use provisioning_sync::{LocalRepository, RepositoryAdapter};

use crate::error::EngineError;

type Key = (Namespace, RepositoryName);

/// Resolves the file tree behind a repository.
///
/// Local repositories open their directory unless an adapter was registered
/// for them. Git and github repositories need a registered adapter.
#[derive(Default)]
pub struct Adapters {
    registered: RwLock<HashMap<Key, Arc<dyn RepositoryAdapter>>>,
}

impl Adapters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        namespace: &Namespace,
        repository: &RepositoryName,
        adapter: Arc<dyn RepositoryAdapter>,
    ) {
        let mut registered = self.registered.write().unwrap_or_else(|e| e.into_inner());
        registered.insert((namespace.clone(), repository.clone()), adapter);
    }

    pub fn remove(&self, namespace: &Namespace, repository: &RepositoryName) {
        let mut registered = self.registered.write().unwrap_or_else(|e| e.into_inner());
        registered.remove(&(namespace.clone(), repository.clone()));
    }

    pub fn adapter_for(&self, repo: &Repository) -> Result<Arc<dyn RepositoryAdapter>, EngineError> {
        let registered = self.registered.read().unwrap_or_else(|e| e.into_inner());
        if let Some(adapter) = registered.get(&(repo.namespace.clone(), repo.name.clone())) {
            return Ok(adapter.clone());
        }
        match &repo.spec.storage {
            StorageSpec::Local { path } => Ok(Arc::new(LocalRepository::new(path))),
            other => Err(EngineError::NoAdapter {
                kind: other.kind().to_string(),
                repository: repo.name.clone(),
            }),
        }
    }
}
