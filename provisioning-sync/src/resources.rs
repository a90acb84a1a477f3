//! Resource objects, ownership annotations and the resource store client.
//!
//! [`ResourceStore`] is the seam to the application's dashboard/folder
//! storage. [`MemoryResourceStore`] is the in-process implementation used by
//! the engine and by tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use provisioning_core::{Namespace, RepositoryName, ResourceKind};

use crate::error::{ParseError, StoreError};

// ---------------------------------------------------------------------------
// Annotations
// ---------------------------------------------------------------------------

pub const ANNO_MANAGER_KIND: &str = "grafana.app/managedBy";
pub const ANNO_MANAGER_ID: &str = "grafana.app/managerId";
pub const ANNO_ALLOWS_EDITS: &str = "grafana.app/managerAllowsEdits";
pub const ANNO_SOURCE_PATH: &str = "grafana.app/sourcePath";
pub const ANNO_SOURCE_CHECKSUM: &str = "grafana.app/sourceChecksum";
pub const ANNO_FOLDER: &str = "grafana.app/folder";

/// Manager kind written by repositories.
pub const MANAGER_REPO: &str = "repo";

/// Who manages a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerProperties {
    pub kind: String,
    pub identity: String,
    pub allows_edits: bool,
}

impl ManagerProperties {
    pub fn repository(name: &RepositoryName) -> Self {
        Self {
            kind: MANAGER_REPO.to_owned(),
            identity: name.0.clone(),
            allows_edits: false,
        }
    }

    pub fn is_repository(&self, name: &RepositoryName) -> bool {
        self.kind == MANAGER_REPO && self.identity == name.0
    }
}

impl std::fmt::Display for ManagerProperties {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.kind == MANAGER_REPO {
            write!(f, "repository {}", self.identity)
        } else {
            write!(f, "{} {}", self.kind, self.identity)
        }
    }
}

/// Which file a managed resource came from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceProperties {
    pub path: String,
    pub checksum: String,
}

// ---------------------------------------------------------------------------
// Objects
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ObjectMeta {
    pub name: String,
    /// Store-assigned version; 0 on objects that were never stored.
    pub resource_version: u64,
    pub annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn manager(&self) -> Option<ManagerProperties> {
        let kind = self.annotations.get(ANNO_MANAGER_KIND)?;
        let identity = self.annotations.get(ANNO_MANAGER_ID)?;
        Some(ManagerProperties {
            kind: kind.clone(),
            identity: identity.clone(),
            allows_edits: self
                .annotations
                .get(ANNO_ALLOWS_EDITS)
                .map(|v| v == "true")
                .unwrap_or(false),
        })
    }

    pub fn set_manager(&mut self, manager: &ManagerProperties) {
        self.annotations
            .insert(ANNO_MANAGER_KIND.to_owned(), manager.kind.clone());
        self.annotations
            .insert(ANNO_MANAGER_ID.to_owned(), manager.identity.clone());
        if manager.allows_edits {
            self.annotations
                .insert(ANNO_ALLOWS_EDITS.to_owned(), "true".to_owned());
        } else {
            self.annotations.remove(ANNO_ALLOWS_EDITS);
        }
    }

    pub fn source(&self) -> Option<SourceProperties> {
        let path = self.annotations.get(ANNO_SOURCE_PATH)?;
        Some(SourceProperties {
            path: path.clone(),
            checksum: self
                .annotations
                .get(ANNO_SOURCE_CHECKSUM)
                .cloned()
                .unwrap_or_default(),
        })
    }

    pub fn set_source(&mut self, source: &SourceProperties) {
        self.annotations
            .insert(ANNO_SOURCE_PATH.to_owned(), source.path.clone());
        if source.checksum.is_empty() {
            self.annotations.remove(ANNO_SOURCE_CHECKSUM);
        } else {
            self.annotations
                .insert(ANNO_SOURCE_CHECKSUM.to_owned(), source.checksum.clone());
        }
    }

    /// Parent folder uid; `None` at the top level.
    pub fn folder(&self) -> Option<&str> {
        self.annotations
            .get(ANNO_FOLDER)
            .map(String::as_str)
            .filter(|f| !f.is_empty())
    }

    pub fn set_folder(&mut self, folder: Option<&str>) {
        match folder {
            Some(f) if !f.is_empty() => {
                self.annotations.insert(ANNO_FOLDER.to_owned(), f.to_owned());
            }
            _ => {
                self.annotations.remove(ANNO_FOLDER);
            }
        }
    }

    /// Strip manager and source annotations.
    pub fn release(&mut self) {
        for key in [
            ANNO_MANAGER_KIND,
            ANNO_MANAGER_ID,
            ANNO_ALLOWS_EDITS,
            ANNO_SOURCE_PATH,
            ANNO_SOURCE_CHECKSUM,
        ] {
            self.annotations.remove(key);
        }
    }
}

/// Dashboard body. Fields other than `title` are carried opaquely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DashboardSpec {
    #[serde(default)]
    pub title: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FolderSpec {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Kind-specific payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceSpec {
    Dashboard(DashboardSpec),
    Folder(FolderSpec),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceObject {
    pub meta: ObjectMeta,
    pub spec: ResourceSpec,
}

impl ResourceObject {
    pub fn dashboard(name: impl Into<String>, spec: DashboardSpec) -> Self {
        Self {
            meta: ObjectMeta::named(name),
            spec: ResourceSpec::Dashboard(spec),
        }
    }

    pub fn folder(name: impl Into<String>, title: impl Into<String>, parent: Option<&str>) -> Self {
        let mut meta = ObjectMeta::named(name);
        meta.set_folder(parent);
        Self {
            meta,
            spec: ResourceSpec::Folder(FolderSpec {
                title: title.into(),
                description: None,
            }),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        match self.spec {
            ResourceSpec::Dashboard(_) => ResourceKind::Dashboard,
            ResourceSpec::Folder(_) => ResourceKind::Folder,
        }
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn title(&self) -> &str {
        match &self.spec {
            ResourceSpec::Dashboard(d) => &d.title,
            ResourceSpec::Folder(f) => &f.title,
        }
    }

    /// Same payload and parent folder, ignoring versions and annotations
    /// other than the folder.
    pub fn same_content(&self, other: &ResourceObject) -> bool {
        self.spec == other.spec && self.meta.folder() == other.meta.folder()
    }

    /// Kubernetes-style manifest written to repository files.
    ///
    /// Ownership annotations and the resource version are not exported.
    pub fn to_manifest(&self) -> Result<Value, serde_json::Error> {
        let kind = self.kind();
        let spec = match &self.spec {
            ResourceSpec::Dashboard(d) => serde_json::to_value(d)?,
            ResourceSpec::Folder(f) => serde_json::to_value(f)?,
        };
        Ok(json!({
            "apiVersion": format!("{}/v1", kind.group()),
            "kind": kind.to_string(),
            "metadata": { "name": self.meta.name },
            "spec": spec,
        }))
    }

    /// Decode the `spec` of a manifest for a known kind.
    pub fn from_spec(kind: ResourceKind, name: String, spec: Value) -> Result<Self, ParseError> {
        let spec = match kind {
            ResourceKind::Dashboard => ResourceSpec::Dashboard(
                serde_json::from_value(spec).map_err(|e| ParseError::Json(e.to_string()))?,
            ),
            ResourceKind::Folder => ResourceSpec::Folder(
                serde_json::from_value(spec).map_err(|e| ParseError::Json(e.to_string()))?,
            ),
        };
        Ok(Self {
            meta: ObjectMeta::named(name),
            spec,
        })
    }
}

// ---------------------------------------------------------------------------
// Store client
// ---------------------------------------------------------------------------

/// List filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    All,
    /// Resources whose manager is the given repository.
    ManagedBy(RepositoryName),
    /// Resources without any manager.
    Unmanaged,
}

impl Selector {
    pub fn matches(&self, meta: &ObjectMeta) -> bool {
        match self {
            Selector::All => true,
            Selector::ManagedBy(repo) => meta
                .manager()
                .map(|m| m.is_repository(repo))
                .unwrap_or(false),
            Selector::Unmanaged => meta.manager().is_none(),
        }
    }
}

/// Typed CRUD with resource-version preconditions.
pub trait ResourceStore: Send + Sync {
    fn get(&self, kind: ResourceKind, name: &str) -> Result<ResourceObject, StoreError>;

    /// Matching objects sorted by name.
    fn list(&self, kind: ResourceKind, selector: &Selector)
        -> Result<Vec<ResourceObject>, StoreError>;

    fn create(&self, obj: ResourceObject) -> Result<ResourceObject, StoreError>;

    /// Replace an object. `meta.resource_version` must equal the stored one.
    fn update(&self, obj: ResourceObject) -> Result<ResourceObject, StoreError>;

    /// Delete an object, optionally gated on its resource version.
    fn delete(
        &self,
        kind: ResourceKind,
        name: &str,
        resource_version: Option<u64>,
    ) -> Result<(), StoreError>;
}

#[derive(Default)]
struct MemoryInner {
    objects: BTreeMap<(ResourceKind, String), ResourceObject>,
    version: u64,
    forbidden: HashSet<(ResourceKind, String)>,
}

/// In-memory [`ResourceStore`].
///
/// Versions come from a single monotonic counter. Dashboards must live in an
/// existing folder and non-empty folders cannot be deleted.
#[derive(Default)]
pub struct MemoryResourceStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every write to `kind/name` with [`StoreError::Forbidden`].
    pub fn forbid(&self, kind: ResourceKind, name: &str) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.forbidden.insert((kind, name.to_owned()));
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .objects
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_writable(inner: &MemoryInner, kind: ResourceKind, name: &str) -> Result<(), StoreError> {
        if inner.forbidden.contains(&(kind, name.to_owned())) {
            return Err(StoreError::Forbidden(format!(
                "writes to {kind} {name} are not permitted"
            )));
        }
        Ok(())
    }

    fn check_parent(inner: &MemoryInner, obj: &ResourceObject) -> Result<(), StoreError> {
        let Some(parent) = obj.meta.folder() else {
            return Ok(());
        };
        if obj.kind() == ResourceKind::Folder && parent == obj.name() {
            return Err(StoreError::Invalid {
                kind: obj.kind(),
                name: obj.name().to_owned(),
                message: "folder cannot be its own parent".into(),
            });
        }
        if !inner
            .objects
            .contains_key(&(ResourceKind::Folder, parent.to_owned()))
        {
            return Err(StoreError::Invalid {
                kind: obj.kind(),
                name: obj.name().to_owned(),
                message: format!("parent folder {parent} not found"),
            });
        }
        Ok(())
    }
}

impl ResourceStore for MemoryResourceStore {
    fn get(&self, kind: ResourceKind, name: &str) -> Result<ResourceObject, StoreError> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .objects
            .get(&(kind, name.to_owned()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind,
                name: name.to_owned(),
            })
    }

    fn list(
        &self,
        kind: ResourceKind,
        selector: &Selector,
    ) -> Result<Vec<ResourceObject>, StoreError> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        Ok(inner
            .objects
            .iter()
            .filter(|((k, _), obj)| *k == kind && selector.matches(&obj.meta))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    fn create(&self, mut obj: ResourceObject) -> Result<ResourceObject, StoreError> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let kind = obj.kind();
        if obj.meta.name.is_empty() {
            return Err(StoreError::Invalid {
                kind,
                name: String::new(),
                message: "name is required".into(),
            });
        }
        Self::check_writable(&inner, kind, &obj.meta.name)?;
        let key = (kind, obj.meta.name.clone());
        if inner.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind,
                name: obj.meta.name,
            });
        }
        Self::check_parent(&inner, &obj)?;
        inner.version += 1;
        obj.meta.resource_version = inner.version;
        inner.objects.insert(key, obj.clone());
        Ok(obj)
    }

    fn update(&self, mut obj: ResourceObject) -> Result<ResourceObject, StoreError> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let kind = obj.kind();
        Self::check_writable(&inner, kind, &obj.meta.name)?;
        let key = (kind, obj.meta.name.clone());
        let current = inner
            .objects
            .get(&key)
            .map(|o| o.meta.resource_version)
            .ok_or_else(|| StoreError::NotFound {
                kind,
                name: obj.meta.name.clone(),
            })?;
        if obj.meta.resource_version != current {
            return Err(StoreError::Conflict {
                kind,
                name: obj.meta.name,
                expected: obj.meta.resource_version,
                actual: current,
            });
        }
        Self::check_parent(&inner, &obj)?;
        inner.version += 1;
        obj.meta.resource_version = inner.version;
        inner.objects.insert(key, obj.clone());
        Ok(obj)
    }

    fn delete(
        &self,
        kind: ResourceKind,
        name: &str,
        resource_version: Option<u64>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        Self::check_writable(&inner, kind, name)?;
        let key = (kind, name.to_owned());
        let current = inner
            .objects
            .get(&key)
            .map(|o| o.meta.resource_version)
            .ok_or_else(|| StoreError::NotFound {
                kind,
                name: name.to_owned(),
            })?;
        if let Some(expected) = resource_version {
            if expected != current {
                return Err(StoreError::Conflict {
                    kind,
                    name: name.to_owned(),
                    expected,
                    actual: current,
                });
            }
        }
        if kind == ResourceKind::Folder
            && inner
                .objects
                .values()
                .any(|o| o.meta.folder() == Some(name))
        {
            return Err(StoreError::Invalid {
                kind,
                name: name.to_owned(),
                message: "folder is not empty".into(),
            });
        }
        inner.objects.remove(&key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Per-namespace stores
// ---------------------------------------------------------------------------

/// Hands out the store for a namespace.
pub trait StoreProvider: Send + Sync {
    fn store(&self, namespace: &Namespace) -> Arc<dyn ResourceStore>;
}

/// One [`MemoryResourceStore`] per namespace, created on first use.
#[derive(Default)]
pub struct MemoryStoreProvider {
    stores: Mutex<HashMap<Namespace, Arc<MemoryResourceStore>>>,
}

impl MemoryStoreProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Typed handle, for seeding and inspection.
    pub fn memory(&self, namespace: &Namespace) -> Arc<MemoryResourceStore> {
        let mut stores = self.stores.lock().unwrap_or_else(|e| e.into_inner());
        stores
            .entry(namespace.clone())
            .or_insert_with(|| Arc::new(MemoryResourceStore::new()))
            .clone()
    }
}

impl StoreProvider for MemoryStoreProvider {
    fn store(&self, namespace: &Namespace) -> Arc<dyn ResourceStore> {
        self.memory(namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dash(name: &str, title: &str) -> ResourceObject {
        ResourceObject::dashboard(
            name,
            DashboardSpec {
                title: title.into(),
                fields: Map::new(),
            },
        )
    }

    #[test]
    fn create_assigns_monotonic_versions() {
        let store = MemoryResourceStore::new();
        let a = store.create(dash("a", "A")).expect("create a");
        let b = store.create(dash("b", "B")).expect("create b");
        assert!(b.meta.resource_version > a.meta.resource_version);
        let err = store.create(dash("a", "again")).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
    }

    #[test]
    fn stale_update_conflicts() {
        let store = MemoryResourceStore::new();
        let created = store.create(dash("a", "A")).expect("create");
        let mut first = created.clone();
        first.spec = dash("a", "A1").spec;
        store.update(first).expect("first update");

        let mut stale = created;
        stale.spec = dash("a", "A2").spec;
        let err = store.update(stale).unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }), "got: {err}");
        assert_eq!(store.get(ResourceKind::Dashboard, "a").expect("get").title(), "A1");
    }

    #[test]
    fn dashboards_need_existing_folder() {
        let store = MemoryResourceStore::new();
        let mut d = dash("a", "A");
        d.meta.set_folder(Some("missing"));
        assert!(matches!(store.create(d.clone()), Err(StoreError::Invalid { .. })));

        store
            .create(ResourceObject::folder("missing", "Now here", None))
            .expect("folder");
        store.create(d).expect("dashboard in folder");
        let err = store.delete(ResourceKind::Folder, "missing", None).unwrap_err();
        assert!(err.to_string().contains("not empty"));
    }

    #[test]
    fn forbidden_differs_from_not_found() {
        let store = MemoryResourceStore::new();
        store.forbid(ResourceKind::Folder, "locked");
        let err = store
            .create(ResourceObject::folder("locked", "Locked", None))
            .unwrap_err();
        assert!(matches!(err, StoreError::Forbidden(_)));
        let err = store.get(ResourceKind::Folder, "locked").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn selector_filters_by_manager() {
        let store = MemoryResourceStore::new();
        let mut owned = dash("owned", "Owned");
        owned
            .meta
            .set_manager(&ManagerProperties::repository(&"r1".into()));
        store.create(owned).expect("owned");
        store.create(dash("free", "Free")).expect("free");

        let managed = store
            .list(ResourceKind::Dashboard, &Selector::ManagedBy("r1".into()))
            .expect("list");
        assert_eq!(managed.len(), 1);
        assert_eq!(managed[0].name(), "owned");
        let free = store
            .list(ResourceKind::Dashboard, &Selector::Unmanaged)
            .expect("list");
        assert_eq!(free[0].name(), "free");
    }

    #[test]
    fn release_strips_ownership_only() {
        let mut meta = ObjectMeta::named("x");
        meta.set_manager(&ManagerProperties::repository(&"r1".into()));
        meta.set_source(&SourceProperties {
            path: "x.json".into(),
            checksum: "abc".into(),
        });
        meta.set_folder(Some("f"));
        meta.release();
        assert!(meta.manager().is_none());
        assert!(meta.source().is_none());
        assert_eq!(meta.folder(), Some("f"));
    }

    #[test]
    fn manifest_omits_ownership() {
        let mut d = dash("uid-1", "Hello");
        d.meta
            .set_manager(&ManagerProperties::repository(&"r1".into()));
        d.meta.resource_version = 9;
        let manifest = d.to_manifest().expect("manifest");
        assert_eq!(manifest["apiVersion"], "dashboard.grafana.app/v1");
        assert_eq!(manifest["metadata"], json!({"name": "uid-1"}));
        assert_eq!(manifest["spec"]["title"], "Hello");
    }
}
