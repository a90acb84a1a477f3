//! Domain types for repositories, jobs and managed resources.
//!
//! All types are serializable/deserializable via serde. Job payloads are
//! camelCase JSON; repository definitions are persisted as YAML by
//! [`crate::registry`].

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A strongly-typed repository name, unique inside a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepositoryName(pub String);

impl fmt::Display for RepositoryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for RepositoryName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RepositoryName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A tenant. Repository limits are enforced per namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Namespace(pub String);

impl Default for Namespace {
    fn default() -> Self {
        Self("default".to_owned())
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for Namespace {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Namespace {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A generated job name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobName(pub String);

impl fmt::Display for JobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for JobName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Repository definition
// ---------------------------------------------------------------------------

/// Which resources a repository manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncTarget {
    /// The whole tenant. At most one per namespace.
    Instance,
    /// A dedicated root folder named after the repository.
    #[default]
    Folder,
}

impl fmt::Display for SyncTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncTarget::Instance => write!(f, "instance"),
            SyncTarget::Folder => write!(f, "folder"),
        }
    }
}

/// Storage backend family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Local,
    Git,
    Github,
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageKind::Local => write!(f, "local"),
            StorageKind::Git => write!(f, "git"),
            StorageKind::Github => write!(f, "github"),
        }
    }
}

fn default_branch() -> String {
    "main".to_owned()
}

/// Where the file tree lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageSpec {
    /// A directory on the local filesystem.
    Local { path: PathBuf },
    /// A remote git repository, optionally scoped to a sub-path.
    Git {
        url: String,
        #[serde(default = "default_branch")]
        branch: String,
        #[serde(default)]
        path: String,
    },
    /// A repository hosted on GitHub.
    Github {
        url: String,
        #[serde(default = "default_branch")]
        branch: String,
        #[serde(default)]
        path: String,
    },
}

impl StorageSpec {
    pub fn kind(&self) -> StorageKind {
        match self {
            StorageSpec::Local { .. } => StorageKind::Local,
            StorageSpec::Git { .. } => StorageKind::Git,
            StorageSpec::Github { .. } => StorageKind::Github,
        }
    }

    /// Default branch for versioned storage; `None` for local directories.
    pub fn branch(&self) -> Option<&str> {
        match self {
            StorageSpec::Local { .. } => None,
            StorageSpec::Git { branch, .. } | StorageSpec::Github { branch, .. } => Some(branch),
        }
    }
}

/// Sync settings for a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SyncOptions {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub target: SyncTarget,
    /// Scheduled pull interval; 0 disables scheduling.
    #[serde(default)]
    pub interval_seconds: u64,
}

/// What happens to managed resources when their repository is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OrphanPolicy {
    /// Strip ownership annotations and keep the resources.
    #[default]
    Release,
    /// Delete every resource the repository manages.
    Delete,
}

/// Desired state of a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositorySpec {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub storage: StorageSpec,
    #[serde(default)]
    pub sync: SyncOptions,
    #[serde(default)]
    pub orphan_policy: OrphanPolicy,
}

/// A repository registered in a namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    pub name: RepositoryName,
    #[serde(default)]
    pub namespace: Namespace,
    pub spec: RepositorySpec,
    #[serde(default)]
    pub status: RepositoryStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Repository {
    pub fn new(name: impl Into<RepositoryName>, spec: RepositorySpec) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            namespace: Namespace::default(),
            spec,
            status: RepositoryStatus::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn target(&self) -> SyncTarget {
        self.spec.sync.target
    }
}

// ---------------------------------------------------------------------------
// Repository status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
}

/// A status condition, e.g. `{type: Quota, status: True, reason: WithinQuota}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub last_transition: DateTime<Utc>,
}

/// Limits in effect for a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct QuotaStatus {
    pub max_resources_per_repository: u64,
    pub max_repositories: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HealthStatus {
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub message: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checked: Option<DateTime<Utc>>,
}

/// Outcome of the latest sync-related job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SyncStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<JobState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<JobName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub message: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RepositoryStatus {
    #[serde(default)]
    pub health: HealthStatus,
    #[serde(default)]
    pub quota: QuotaStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub sync: SyncStatus,
}

impl RepositoryStatus {
    /// Insert or replace the condition with the same type.
    ///
    /// `last_transition` is kept when status and reason are unchanged.
    pub fn set_condition(&mut self, mut condition: Condition) {
        match self.conditions.iter_mut().find(|c| c.kind == condition.kind) {
            Some(existing) => {
                if existing.status == condition.status && existing.reason == condition.reason {
                    condition.last_transition = existing.last_transition;
                }
                *existing = condition;
            }
            None => self.conditions.push(condition),
        }
    }

    pub fn condition(&self, kind: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.kind == kind)
    }
}

// ---------------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------------

pub const DASHBOARD_GROUP: &str = "dashboard.grafana.app";
pub const FOLDER_GROUP: &str = "folder.grafana.app";

/// Resource kinds the engine knows how to reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    Dashboard,
    Folder,
}

impl ResourceKind {
    pub fn group(&self) -> &'static str {
        match self {
            ResourceKind::Dashboard => DASHBOARD_GROUP,
            ResourceKind::Folder => FOLDER_GROUP,
        }
    }

    pub fn all() -> &'static [ResourceKind] {
        &[ResourceKind::Folder, ResourceKind::Dashboard]
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Dashboard => write!(f, "Dashboard"),
            ResourceKind::Folder => write!(f, "Folder"),
        }
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Dashboard" => Ok(ResourceKind::Dashboard),
            "Folder" => Ok(ResourceKind::Folder),
            other => Err(format!("unsupported resource kind '{other}'")),
        }
    }
}

/// A resource named in a job spec (`kind` + `group` + `name`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub group: String,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.to_string(),
            group: kind.group().to_owned(),
        }
    }

    /// Resolved kind; `None` when kind or group are not recognised.
    pub fn resource_kind(&self) -> Option<ResourceKind> {
        let kind = ResourceKind::from_str(&self.kind).ok()?;
        if self.group.is_empty() || self.group == kind.group() {
            Some(kind)
        } else {
            None
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.group, self.kind, self.name)
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobAction {
    Pull,
    Push,
    Delete,
    Move,
    Migrate,
}

impl JobAction {
    pub fn all() -> &'static [JobAction] {
        &[
            JobAction::Pull,
            JobAction::Push,
            JobAction::Delete,
            JobAction::Move,
            JobAction::Migrate,
        ]
    }
}

impl fmt::Display for JobAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobAction::Pull => write!(f, "pull"),
            JobAction::Push => write!(f, "push"),
            JobAction::Delete => write!(f, "delete"),
            JobAction::Move => write!(f, "move"),
            JobAction::Migrate => write!(f, "migrate"),
        }
    }
}

impl FromStr for JobAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobAction::all()
            .iter()
            .copied()
            .find(|a| a.to_string() == s)
            .ok_or_else(|| format!("unsupported action '{s}'"))
    }
}

/// Options for `pull` (sync) jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PullOptions {
    /// Only plan files changed since the last synced ref.
    #[serde(default)]
    pub incremental: bool,
    /// Restrict the sync to a single file or directory. Scoped syncs never delete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Options for `push` (export) jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PushOptions {
    /// Directory prefix inside the repository.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Specific resources; empty exports everything exportable.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOptions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceRef>,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MoveOptions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_path: Option<String>,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MigrateOptions {
    #[serde(default)]
    pub history: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Job submission payload. Exactly one options block matches `action`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<JobAction>,
    pub repository: RepositoryName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull: Option<PullOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push: Option<PushOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete: Option<DeleteOptions>,
    #[serde(rename = "move", default, skip_serializing_if = "Option::is_none")]
    pub move_: Option<MoveOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migrate: Option<MigrateOptions>,
}

impl Default for RepositoryName {
    fn default() -> Self {
        Self(String::new())
    }
}

impl JobSpec {
    pub fn pull(repository: impl Into<RepositoryName>, options: PullOptions) -> Self {
        Self {
            action: Some(JobAction::Pull),
            repository: repository.into(),
            pull: Some(options),
            ..Self::default()
        }
    }

    pub fn push(repository: impl Into<RepositoryName>, options: PushOptions) -> Self {
        Self {
            action: Some(JobAction::Push),
            repository: repository.into(),
            push: Some(options),
            ..Self::default()
        }
    }

    pub fn delete(repository: impl Into<RepositoryName>, options: DeleteOptions) -> Self {
        Self {
            action: Some(JobAction::Delete),
            repository: repository.into(),
            delete: Some(options),
            ..Self::default()
        }
    }

    pub fn relocate(repository: impl Into<RepositoryName>, options: MoveOptions) -> Self {
        Self {
            action: Some(JobAction::Move),
            repository: repository.into(),
            move_: Some(options),
            ..Self::default()
        }
    }

    pub fn migrate(repository: impl Into<RepositoryName>, options: MigrateOptions) -> Self {
        Self {
            action: Some(JobAction::Migrate),
            repository: repository.into(),
            migrate: Some(options),
            ..Self::default()
        }
    }

    /// Which options blocks are populated, in declaration order.
    pub fn populated_options(&self) -> Vec<JobAction> {
        let mut found = Vec::new();
        if self.pull.is_some() {
            found.push(JobAction::Pull);
        }
        if self.push.is_some() {
            found.push(JobAction::Push);
        }
        if self.delete.is_some() {
            found.push(JobAction::Delete);
        }
        if self.move_.is_some() {
            found.push(JobAction::Move);
        }
        if self.migrate.is_some() {
            found.push(JobAction::Migrate);
        }
        found
    }
}

/// Job lifecycle state. Terminal states never transition again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    #[default]
    Queued,
    Working,
    Success,
    Warning,
    Error,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Success | JobState::Warning | JobState::Error)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Working => write!(f, "working"),
            JobState::Success => write!(f, "success"),
            JobState::Warning => write!(f, "warning"),
            JobState::Error => write!(f, "error"),
        }
    }
}

/// Per-kind counters attached to a finished job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct JobResourceSummary {
    pub group: String,
    pub kind: String,
    pub create: u64,
    pub update: u64,
    pub delete: u64,
    pub noop: u64,
    pub error: u64,
    pub warning: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub state: JobState,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub summary: Vec<JobResourceSummary>,
    /// Ref the repository was at when the job finished, if versioned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,
}

/// A job record. `resource_version` is the optimistic-concurrency token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub name: JobName,
    #[serde(default)]
    pub namespace: Namespace,
    #[serde(default)]
    pub resource_version: u64,
    pub spec: JobSpec,
    #[serde(default)]
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn repository(&self) -> &RepositoryName {
        &self.spec.repository
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newtype_display() {
        assert_eq!(RepositoryName::from("repo").to_string(), "repo");
        assert_eq!(JobName::from("repo-pull-1").to_string(), "repo-pull-1");
        assert_eq!(Namespace::default().to_string(), "default");
    }

    #[test]
    fn job_spec_uses_move_keyword_on_the_wire() {
        let spec = JobSpec::relocate(
            "repo",
            MoveOptions {
                paths: vec!["a.json".into()],
                target_path: Some("b.json".into()),
                ..MoveOptions::default()
            },
        );
        let json = serde_json::to_value(&spec).expect("serialize");
        assert_eq!(json["action"], "move");
        assert_eq!(json["move"]["targetPath"], "b.json");
        let back: JobSpec = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, spec);
    }

    #[test]
    fn storage_spec_is_internally_tagged() {
        let yaml = "type: github\nurl: https://example.com/org/repo\n";
        let storage: StorageSpec = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(storage.kind(), StorageKind::Github);
        assert_eq!(storage.branch(), Some("main"));
    }

    #[test]
    fn terminal_states() {
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Working.is_terminal());
        assert!(JobState::Success.is_terminal());
        assert!(JobState::Warning.is_terminal());
        assert!(JobState::Error.is_terminal());
    }

    #[test]
    fn resource_ref_kind_requires_matching_group() {
        let ok = ResourceRef::new(ResourceKind::Dashboard, "abc");
        assert_eq!(ok.resource_kind(), Some(ResourceKind::Dashboard));

        let wrong_group = ResourceRef {
            name: "abc".into(),
            kind: "Dashboard".into(),
            group: FOLDER_GROUP.into(),
        };
        assert_eq!(wrong_group.resource_kind(), None);

        let unknown = ResourceRef {
            name: "abc".into(),
            kind: "AlertRule".into(),
            group: String::new(),
        };
        assert_eq!(unknown.resource_kind(), None);
    }

    #[test]
    fn set_condition_keeps_transition_time_when_unchanged() {
        let mut status = RepositoryStatus::default();
        let first = Utc::now() - chrono::Duration::hours(1);
        status.set_condition(Condition {
            kind: "Quota".into(),
            status: ConditionStatus::True,
            reason: "WithinQuota".into(),
            message: "1/10".into(),
            last_transition: first,
        });
        status.set_condition(Condition {
            kind: "Quota".into(),
            status: ConditionStatus::True,
            reason: "WithinQuota".into(),
            message: "2/10".into(),
            last_transition: Utc::now(),
        });
        let cond = status.condition("Quota").expect("condition");
        assert_eq!(cond.message, "2/10");
        assert_eq!(cond.last_transition, first);
        assert_eq!(status.conditions.len(), 1);
    }
}
