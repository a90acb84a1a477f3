use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use provisioning_core::{
    JobSpec, JobState, Namespace, OrphanPolicy, PullOptions, Repository, RepositorySpec,
    ResourceKind, Settings, StorageKind, StorageSpec, SyncOptions, SyncTarget,
};
use provisioning_daemon::{Engine, EngineConfig, EngineError};
use provisioning_sync::repository::WriteOptions;
use provisioning_sync::{MemoryRepository, MemoryStoreProvider, RepositoryAdapter, ResourceStore};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Harness {
    _home: TempDir,
    files: TempDir,
    stores: Arc<MemoryStoreProvider>,
    engine: Engine,
}

fn harness(settings: Settings) -> Harness {
    let home = TempDir::new().expect("home");
    let files = TempDir::new().expect("files");
    let stores = Arc::new(MemoryStoreProvider::new());
    let mut config = EngineConfig::new(home.path(), settings);
    config.stores = stores.clone();
    Harness {
        engine: Engine::start(config),
        _home: home,
        files,
        stores,
    }
}

fn repo(storage: StorageSpec, orphan_policy: OrphanPolicy) -> Repository {
    Repository::new(
        "r1",
        RepositorySpec {
            title: "Repo One".into(),
            description: None,
            storage,
            sync: SyncOptions {
                enabled: true,
                target: SyncTarget::Folder,
                interval_seconds: 0,
            },
            orphan_policy,
        },
    )
}

fn local(dir: &Path, orphan_policy: OrphanPolicy) -> Repository {
    repo(
        StorageSpec::Local {
            path: dir.to_path_buf(),
        },
        orphan_policy,
    )
}

fn seed(dir: &Path) {
    std::fs::create_dir_all(dir.join("team")).expect("mkdir");
    std::fs::write(
        dir.join("team/cpu.json"),
        r#"{"uid": "cpu", "title": "CPU", "panels": []}"#,
    )
    .expect("write");
}

fn ns() -> Namespace {
    Namespace::default()
}

async fn pull_and_wait(engine: &Engine) -> provisioning_core::Job {
    let job = engine
        .submit(&ns(), JobSpec::pull("r1", PullOptions::default()))
        .await
        .expect("submit");
    engine.wait(&job).await.expect("wait")
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pull_job_runs_to_success_and_is_archived() {
    let h = harness(Settings::default());
    seed(h.files.path());
    h.engine
        .create_repository(local(h.files.path(), OrphanPolicy::Release))
        .expect("create");

    let done = pull_and_wait(&h.engine).await;
    assert_eq!(done.status.state, JobState::Success, "{:?}", done.status);
    assert!(done.status.started.is_some() && done.status.finished.is_some());

    let store = h.stores.memory(&ns());
    assert!(store.get(ResourceKind::Dashboard, "cpu").is_ok());

    let history = h.engine.history(&ns()).list(&"r1".into()).expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].name, done.name);
    assert!(h.engine.active_jobs().is_empty());

    let looked_up = h.engine.job(&ns(), &"r1".into(), &done.name).expect("job");
    assert_eq!(looked_up.status.state, JobState::Success);

    let repo = h
        .engine
        .repositories()
        .expect("list")
        .into_iter()
        .find(|r| r.name.0 == "r1")
        .expect("r1");
    assert_eq!(repo.status.sync.job.as_ref(), Some(&done.name));
    assert_eq!(repo.status.sync.state, Some(JobState::Success));

    h.engine.shutdown().await;
}

#[tokio::test]
async fn one_active_job_per_repository() {
    let h = harness(Settings::default());
    seed(h.files.path());
    h.engine
        .create_repository(local(h.files.path(), OrphanPolicy::Release))
        .expect("create");

    // The current-thread runtime does not run workers until we yield.
    let first = h
        .engine
        .submit(&ns(), JobSpec::pull("r1", PullOptions::default()))
        .await
        .expect("first");
    let err = h
        .engine
        .submit(&ns(), JobSpec::pull("r1", PullOptions::default()))
        .await
        .unwrap_err();
    assert!(err.is_in_progress(), "{err}");

    let err = h.engine.remove_repository(&ns(), &"r1".into()).unwrap_err();
    assert!(err.is_in_progress(), "{err}");

    h.engine.wait(&first).await.expect("wait");
    let second = pull_and_wait(&h.engine).await;
    assert_ne!(second.name, first.name);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn invalid_specs_never_create_jobs() {
    let h = harness(Settings::default());
    h.engine
        .create_repository(local(h.files.path(), OrphanPolicy::Release))
        .expect("create");

    let err = h.engine.submit_json(&ns(), "{not json").await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)), "{err}");

    let err = h
        .engine
        .submit_json(
            &ns(),
            r#"{"action": "pull", "repository": "r1", "pull": {}, "delete": {"paths": ["a.json"]}}"#,
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("must not be set for pull jobs"), "{err}");

    assert!(h.engine.active_jobs().is_empty());
    assert!(h.engine.history(&ns()).list(&"r1".into()).expect("history").is_empty());
    h.engine.shutdown().await;
}

#[tokio::test]
async fn cancelled_job_finishes_with_error() {
    let h = harness(Settings::default());
    seed(h.files.path());
    h.engine
        .create_repository(local(h.files.path(), OrphanPolicy::Release))
        .expect("create");

    let job = h
        .engine
        .submit(&ns(), JobSpec::pull("r1", PullOptions::default()))
        .await
        .expect("submit");
    h.engine.cancel(&job.name).expect("cancel");

    let done = h.engine.wait(&job).await.expect("wait");
    assert_eq!(done.status.state, JobState::Error);
    assert!(h.stores.memory(&ns()).get(ResourceKind::Dashboard, "cpu").is_err());
    assert!(matches!(
        h.engine.cancel(&job.name),
        Err(EngineError::JobNotFound(_))
    ));
    h.engine.shutdown().await;
}

#[tokio::test]
async fn history_is_trimmed_to_limit() {
    let h = harness(Settings {
        history_limit: 1,
        ..Settings::default()
    });
    seed(h.files.path());
    h.engine
        .create_repository(local(h.files.path(), OrphanPolicy::Release))
        .expect("create");

    pull_and_wait(&h.engine).await;
    let last = pull_and_wait(&h.engine).await;

    let history = h.engine.history(&ns()).list(&"r1".into()).expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].name, last.name);
    h.engine.shutdown().await;
}

// ---------------------------------------------------------------------------
// Repositories
// ---------------------------------------------------------------------------

#[tokio::test]
async fn git_repository_uses_registered_adapter() {
    let h = harness(Settings::default());
    let git = repo(
        StorageSpec::Git {
            url: "https://example.com/r1.git".into(),
            branch: "main".into(),
            path: String::new(),
        },
        OrphanPolicy::Release,
    );

    // Without an adapter the repository is admitted but unhealthy.
    let created = h.engine.create_repository(git.clone()).expect("create");
    assert!(!created.status.health.healthy);
    assert_eq!(
        created.status.health.message,
        vec!["no adapter for git repository r1".to_string()]
    );

    let adapter = Arc::new(MemoryRepository::new(StorageKind::Git, "main"));
    adapter
        .write(
            "ops/db.json",
            br#"{"uid": "db", "title": "DB", "panels": []}"#,
            &WriteOptions::message("seed"),
        )
        .expect("write");
    h.engine.adapters().register(&ns(), &git.name, adapter);

    let done = pull_and_wait(&h.engine).await;
    assert_eq!(done.status.state, JobState::Success, "{:?}", done.status);
    assert!(h.stores.memory(&ns()).get(ResourceKind::Dashboard, "db").is_ok());

    let refreshed = h
        .engine
        .refresh_repository(&ns(), &git.name, None)
        .expect("refresh");
    assert!(refreshed.status.health.healthy);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn removal_with_delete_policy_drops_resources() {
    let h = harness(Settings::default());
    seed(h.files.path());
    h.engine
        .create_repository(local(h.files.path(), OrphanPolicy::Delete))
        .expect("create");
    pull_and_wait(&h.engine).await;

    let report = h.engine.remove_repository(&ns(), &"r1".into()).expect("remove");
    assert!(report.deleted > 0);
    assert_eq!(report.released, 0);
    assert!(report.errors.is_empty(), "{:?}", report.errors);
    assert!(h.stores.memory(&ns()).is_empty());
    assert!(h.engine.repositories().expect("list").is_empty());
    assert!(h.engine.history(&ns()).list(&"r1".into()).expect("history").is_empty());
    h.engine.shutdown().await;
}

#[tokio::test]
async fn removal_with_release_policy_keeps_resources() {
    let h = harness(Settings::default());
    seed(h.files.path());
    h.engine
        .create_repository(local(h.files.path(), OrphanPolicy::Release))
        .expect("create");
    pull_and_wait(&h.engine).await;

    let report = h.engine.remove_repository(&ns(), &"r1".into()).expect("remove");
    assert_eq!(report.deleted, 0);
    assert!(report.released > 0);

    let cpu = h
        .stores
        .memory(&ns())
        .get(ResourceKind::Dashboard, "cpu")
        .expect("kept");
    assert!(cpu.meta.manager().is_none());
    h.engine.shutdown().await;
}
