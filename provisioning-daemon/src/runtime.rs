//! Job engine: admission, queue, worker pool, completion and repository
//! lifecycle.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use provisioning_core::{
    config, registry, validation, Job, JobName, JobSpec, JobState, JobStatus, Namespace,
    Repository, RepositoryName, Settings,
};
use provisioning_sync::{
    cleanup, run_job, status, CleanupReport, JobContext, MemoryStoreProvider, StoreProvider,
};

use crate::adapters::Adapters;
use crate::error::{io_err, EngineError};
use crate::history::HistoryStore;
use crate::jobs::JobStore;
use crate::paths::{history_dir, QUEUE_CAPACITY};
use crate::retry::{retry_on_conflict, Backoff};
use crate::{ticker, watcher};

/// Everything the engine is built from.
pub struct EngineConfig {
    pub home: PathBuf,
    pub settings: Settings,
    pub stores: Arc<dyn StoreProvider>,
    pub adapters: Arc<Adapters>,
    pub backoff: Backoff,
}

impl EngineConfig {
    /// In-memory resource stores and no registered adapters.
    pub fn new(home: impl Into<PathBuf>, settings: Settings) -> Self {
        Self {
            home: home.into(),
            settings,
            stores: Arc::new(MemoryStoreProvider::new()),
            adapters: Arc::new(Adapters::new()),
            backoff: Backoff::default(),
        }
    }
}

struct Inner {
    home: PathBuf,
    settings: Settings,
    stores: Arc<dyn StoreProvider>,
    adapters: Arc<Adapters>,
    backoff: Backoff,
    jobs: Mutex<JobStore>,
    tokens: Mutex<HashMap<JobName, CancellationToken>>,
    queue: mpsc::Sender<JobName>,
    finished: broadcast::Sender<Job>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Cheap to clone; every clone drives the same engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Build the engine and spawn `settings.workers` workers on the current
    /// runtime.
    pub fn start(config: EngineConfig) -> Engine {
        let (queue, rx) = mpsc::channel::<JobName>(QUEUE_CAPACITY);
        let (finished, _) = broadcast::channel::<Job>(QUEUE_CAPACITY);
        let workers = config.settings.workers.max(1);
        let engine = Engine {
            inner: Arc::new(Inner {
                home: config.home,
                settings: config.settings,
                stores: config.stores,
                adapters: config.adapters,
                backoff: config.backoff,
                jobs: Mutex::new(JobStore::new()),
                tokens: Mutex::new(HashMap::new()),
                queue,
                finished,
                shutdown: CancellationToken::new(),
                workers: Mutex::new(Vec::new()),
            }),
        };

        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let handles: Vec<JoinHandle<()>> = (0..workers)
            .map(|id| {
                let engine = engine.clone();
                let rx = rx.clone();
                tokio::spawn(async move { worker_task(engine, id, rx).await })
            })
            .collect();
        engine.lock_workers().extend(handles);
        tracing::info!(workers, home = %engine.inner.home.display(), "job engine started");
        engine
    }

    pub fn home(&self) -> &Path {
        &self.inner.home
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn adapters(&self) -> &Arc<Adapters> {
        &self.inner.adapters
    }

    pub fn stores(&self) -> &Arc<dyn StoreProvider> {
        &self.inner.stores
    }

    /// Fires once shutdown starts.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn history(&self, namespace: &Namespace) -> HistoryStore {
        HistoryStore::new(history_dir(&self.inner.home, namespace))
    }

    // -----------------------------------------------------------------------
    // Jobs
    // -----------------------------------------------------------------------

    /// Validate and enqueue a job. Structural failures never create a job.
    pub async fn submit(&self, namespace: &Namespace, spec: JobSpec) -> Result<Job, EngineError> {
        validation::validate_job_spec(&spec)?;
        registry::load_repository_at(&self.inner.home, namespace, &spec.repository)?;

        let job = self.lock_jobs().create(namespace.clone(), spec)?;
        self.lock_tokens()
            .insert(job.name.clone(), CancellationToken::new());

        if self.inner.queue.send(job.name.clone()).await.is_err() {
            self.lock_jobs().remove(&job.name);
            self.lock_tokens().remove(&job.name);
            return Err(EngineError::ChannelClosed("job queue"));
        }
        tracing::info!(
            job = %job.name,
            repository = %job.repository(),
            namespace = %job.namespace,
            "job queued"
        );
        Ok(job)
    }

    /// Submit a job from its JSON wire form.
    pub async fn submit_json(&self, namespace: &Namespace, raw: &str) -> Result<Job, EngineError> {
        let spec = validation::parse_job_spec(raw)?;
        self.submit(namespace, spec).await
    }

    /// Active job by name, falling back to the repository's history.
    pub fn job(
        &self,
        namespace: &Namespace,
        repository: &RepositoryName,
        name: &JobName,
    ) -> Result<Job, EngineError> {
        match self.lock_jobs().get(name) {
            Ok(job) => return Ok(job),
            Err(EngineError::JobNotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.history(namespace).get(repository, name)
    }

    pub fn active_jobs(&self) -> Vec<Job> {
        self.lock_jobs().list()
    }

    /// Ask a queued or working job to stop at its next checkpoint.
    pub fn cancel(&self, name: &JobName) -> Result<(), EngineError> {
        let token = self
            .lock_tokens()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::JobNotFound(name.clone()))?;
        token.cancel();
        tracing::info!(job = %name, "cancellation requested");
        Ok(())
    }

    /// Wait for `job` to reach a terminal state.
    pub async fn wait(&self, job: &Job) -> Result<Job, EngineError> {
        let mut finished = self.inner.finished.subscribe();
        let history = self.history(&job.namespace);
        // Archiving happens before the broadcast, so subscribing first
        // means no completion is missed.
        if let Ok(done) = history.get(job.repository(), &job.name) {
            return Ok(done);
        }
        loop {
            match finished.recv().await {
                Ok(done) if done.name == job.name => return Ok(done),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if let Ok(done) = history.get(job.repository(), &job.name) {
                        return Ok(done);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(EngineError::ChannelClosed("finished jobs"))
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Repositories
    // -----------------------------------------------------------------------

    /// Every registered repository across namespaces.
    pub fn repositories(&self) -> Result<Vec<Repository>, EngineError> {
        let mut out = Vec::new();
        for namespace in registry::list_namespaces_at(&self.inner.home)? {
            out.extend(registry::list_repositories_at(&self.inner.home, &namespace)?);
        }
        Ok(out)
    }

    /// Admit and persist a repository, then compute its initial status.
    pub fn create_repository(&self, repo: Repository) -> Result<Repository, EngineError> {
        let repo = registry::create_repository_at(&self.inner.home, &self.inner.settings, repo)?;
        tracing::info!(repository = %repo.name, namespace = %repo.namespace, "repository created");
        self.refresh_repository(&repo.namespace, &repo.name, None)
    }

    /// Recompute and persist the derived status of a repository.
    pub fn refresh_repository(
        &self,
        namespace: &Namespace,
        name: &RepositoryName,
        finished: Option<&Job>,
    ) -> Result<Repository, EngineError> {
        let mut repo = registry::load_repository_at(&self.inner.home, namespace, name)?;
        let store = self.inner.stores.store(namespace);
        match self.inner.adapters.adapter_for(&repo) {
            Ok(adapter) => status::refresh(
                &mut repo,
                store.as_ref(),
                adapter.as_ref(),
                &self.inner.settings,
                finished,
            )?,
            Err(err) => {
                let usage = status::quota_usage(store.as_ref(), &repo, &self.inner.settings)?;
                status::apply_quota(&mut repo.status, usage, &self.inner.settings);
                repo.status.health.healthy = false;
                repo.status.health.message = vec![err.to_string()];
                repo.status.health.checked = Some(Utc::now());
                if let Some(job) = finished {
                    status::record_sync(&mut repo.status, job);
                }
            }
        }
        registry::save_repository_at(&self.inner.home, &repo)?;
        Ok(repo)
    }

    /// Unregister a repository and release or delete what it manages.
    ///
    /// Refused while the repository has a job in flight.
    pub fn remove_repository(
        &self,
        namespace: &Namespace,
        name: &RepositoryName,
    ) -> Result<CleanupReport, EngineError> {
        if let Some(active) = self.lock_jobs().active_for(namespace, name) {
            return Err(EngineError::InProgress {
                repository: name.clone(),
                job: active.name.clone(),
            });
        }
        let repo = registry::delete_repository_at(&self.inner.home, namespace, name)?;
        let store = self.inner.stores.store(namespace);
        let report = cleanup(store.as_ref(), &repo)?;
        self.history(namespace).remove_repository(name)?;
        self.inner.adapters.remove(namespace, name);
        tracing::info!(
            repository = %name,
            namespace = %namespace,
            released = report.released,
            deleted = report.deleted,
            "repository removed"
        );
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Stop the workers, cancelling whatever they are running.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        for token in self.lock_tokens().values() {
            token.cancel();
        }
        let handles: Vec<JoinHandle<()>> = self.lock_workers().drain(..).collect();
        for handle in handles {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "worker join failure");
            }
        }
        tracing::info!("job engine stopped");
    }

    // -----------------------------------------------------------------------
    // Processing
    // -----------------------------------------------------------------------

    async fn process(&self, name: &JobName) -> Result<(), EngineError> {
        let token = self
            .lock_tokens()
            .get(name)
            .cloned()
            .unwrap_or_default();

        let job = retry_on_conflict(self.inner.backoff, || {
            let mut jobs = self.lock_jobs();
            let mut job = jobs.get(name)?;
            job.status.state = JobState::Working;
            job.status.started = Some(Utc::now());
            jobs.update(job)
        })
        .await?;
        tracing::info!(job = %job.name, repository = %job.repository(), "job working");

        let ctx = self.context(&job);
        let status = match &ctx {
            _ if token.is_cancelled() => failed_status("job cancelled"),
            Err(err) => failed_status(&err.to_string()),
            Ok(ctx) => {
                let ctx = ctx.clone();
                let running = job.clone();
                match tokio::task::spawn_blocking(move || run_job(&ctx, &running, token)).await {
                    Ok(status) => status,
                    Err(err) => failed_status(&format!("job task join failure: {err}")),
                }
            }
        };

        let done = self.finish(name, status).await?;

        if let Err(err) = self.refresh_repository(&done.namespace, done.repository(), Some(&done)) {
            tracing::warn!(repository = %done.repository(), error = %err, "status refresh failed");
        }
        let _ = self.inner.finished.send(done);
        Ok(())
    }

    fn context(&self, job: &Job) -> Result<JobContext, EngineError> {
        let repository = registry::load_repository_at(&self.inner.home, &job.namespace, job.repository())?;
        let adapter = self.inner.adapters.adapter_for(&repository)?;
        Ok(JobContext {
            repository,
            adapter,
            store: self.inner.stores.store(&job.namespace),
            settings: self.inner.settings.clone(),
        })
    }

    /// Store the terminal status, archive the job and release the
    /// repository for the next one.
    async fn finish(&self, name: &JobName, mut status: JobStatus) -> Result<Job, EngineError> {
        let done = retry_on_conflict(self.inner.backoff, || {
            let mut jobs = self.lock_jobs();
            let mut job = jobs.get(name)?;
            if status.started.is_none() {
                status.started = job.status.started;
            }
            if status.finished.is_none() {
                status.finished = Some(Utc::now());
            }
            job.status = status.clone();
            jobs.update(job)
        })
        .await?;

        let history = self.history(&done.namespace);
        if let Err(err) = history.record(&done) {
            tracing::error!(job = %done.name, error = %err, "archiving job failed");
        }
        self.lock_jobs().remove(name);
        self.lock_tokens().remove(name);
        match history.trim(done.repository(), self.inner.settings.history_limit) {
            Ok(0) => {}
            Ok(removed) => tracing::debug!(repository = %done.repository(), removed, "trimmed job history"),
            Err(err) => tracing::warn!(repository = %done.repository(), error = %err, "history trim failed"),
        }
        Ok(done)
    }

    fn lock_jobs(&self) -> std::sync::MutexGuard<'_, JobStore> {
        self.inner.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_tokens(&self) -> std::sync::MutexGuard<'_, HashMap<JobName, CancellationToken>> {
        self.inner.tokens.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_workers(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.inner.workers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn failed_status(message: &str) -> JobStatus {
    JobStatus {
        state: JobState::Error,
        message: message.to_owned(),
        errors: vec![message.to_owned()],
        finished: Some(Utc::now()),
        ..JobStatus::default()
    }
}

async fn worker_task(
    engine: Engine,
    id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<JobName>>>,
) {
    let shutdown = engine.shutdown_token();
    loop {
        let next = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = shutdown.cancelled() => None,
                name = rx.recv() => name,
            }
        };
        let Some(name) = next else { break };
        tracing::debug!(worker = id, job = %name, "picked up job");
        if let Err(err) = engine.process(&name).await {
            tracing::error!(worker = id, job = %name, error = %err, "job processing failed");
        }
    }
    tracing::debug!(worker = id, "worker stopped");
}

// ---------------------------------------------------------------------------
// Daemon entrypoints
// ---------------------------------------------------------------------------

/// Start the engine and block the current thread until it exits.
pub fn start_blocking(home: &Path) -> Result<(), EngineError> {
    init_tracing();
    let settings = config::load_at(home)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(EngineConfig::new(home, settings)))
}

/// Run the engine with its watcher and ticker until ctrl-c.
pub async fn run(config: EngineConfig) -> Result<(), EngineError> {
    let engine = Engine::start(config);
    let shutdown = engine.shutdown_token();

    let watcher_handle = {
        let engine = engine.clone();
        tokio::spawn(async move { watcher::watch(engine).await })
    };
    let ticker_handle = {
        let engine = engine.clone();
        tokio::spawn(async move { ticker::run(engine).await })
    };

    tokio::select! {
        _ = shutdown.cancelled() => {}
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => tracing::info!("received ctrl-c, shutting down"),
            Err(err) => tracing::error!(error = %err, "ctrl-c handler failed"),
        },
    }
    engine.shutdown().await;

    handle_join("watcher", watcher_handle.await)?;
    handle_join("ticker", ticker_handle.await)?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), EngineError>, tokio::task::JoinError>,
) -> Result<(), EngineError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(EngineError::Join {
            task: task.to_owned(),
            message: err.to_string(),
        }),
    }
}

/// `PROVISIONING_LOG_JSON=1` switches to JSON lines.
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("PROVISIONING_LOG_JSON").is_ok_and(|v| v == "1");
    let result = if json {
        fmt().json().with_env_filter(filter).with_target(false).try_init()
    } else {
        fmt().with_env_filter(filter).with_target(false).try_init()
    };
    let _ = result;
}

#[cfg(test)]
mod tests {
    use super::*;
    use provisioning_core::{PullOptions, RepositorySpec, StorageSpec, SyncOptions, SyncTarget};
    use tempfile::TempDir;

    fn local_repo(dir: &Path) -> Repository {
        Repository::new(
            "r1",
            RepositorySpec {
                title: "R1".into(),
                description: None,
                storage: StorageSpec::Local {
                    path: dir.to_path_buf(),
                },
                sync: SyncOptions {
                    enabled: true,
                    target: SyncTarget::Folder,
                    interval_seconds: 0,
                },
                orphan_policy: Default::default(),
            },
        )
    }

    #[test]
    fn failed_status_is_terminal() {
        let status = failed_status("job cancelled");
        assert_eq!(status.state, JobState::Error);
        assert_eq!(status.errors, vec!["job cancelled".to_string()]);
        assert!(status.finished.is_some());
    }

    #[tokio::test]
    async fn unknown_repository_is_rejected_at_submission() {
        let home = TempDir::new().expect("home");
        let engine = Engine::start(EngineConfig::new(home.path(), Settings::default()));
        let err = engine
            .submit(&Namespace::default(), JobSpec::pull("ghost", PullOptions::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Registry(_)), "{err}");
        assert!(engine.active_jobs().is_empty());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn create_repository_computes_status() {
        let home = TempDir::new().expect("home");
        let files = TempDir::new().expect("files");
        let engine = Engine::start(EngineConfig::new(home.path(), Settings::default()));
        let repo = engine
            .create_repository(local_repo(files.path()))
            .expect("create");
        assert!(repo.status.health.healthy);
        assert_eq!(
            repo.status.condition("Quota").expect("quota").reason,
            "Unlimited"
        );
        let stored = registry::load_repository_at(home.path(), &repo.namespace, &repo.name)
            .expect("load");
        assert!(stored.status.health.healthy);
        engine.shutdown().await;
    }
}
