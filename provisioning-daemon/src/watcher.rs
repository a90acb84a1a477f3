//! Pull local repositories when their directory changes.
//!
//! Only local repositories with sync enabled are watched. Events are
//! debounced per repository: a pull is submitted once the directory has been
//! quiet for `settings.debounce_ms`.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::Instant;

use provisioning_core::{JobSpec, Namespace, PullOptions, RepositoryName, StorageSpec};

use crate::error::EngineError;
use crate::runtime::Engine;

/// How often the registry is re-read for repositories to watch.
const RESCAN_INTERVAL: Duration = Duration::from_secs(30);

type Key = (Namespace, RepositoryName);

/// Trailing-edge debounce: a key is due once no event touched it for
/// `window`.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    pending: HashMap<Key, Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    pub fn touch(&mut self, key: Key, now: Instant) {
        self.pending.insert(key, now + self.window);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().min().copied()
    }

    /// Remove and return every key whose deadline has passed.
    pub fn take_due(&mut self, now: Instant) -> Vec<Key> {
        let due: Vec<Key> = self
            .pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &due {
            self.pending.remove(key);
        }
        due
    }
}

/// Watched repository roots, canonicalized.
fn watch_targets(engine: &Engine) -> Result<HashMap<PathBuf, Key>, EngineError> {
    let mut targets = HashMap::new();
    for repo in engine.repositories()? {
        if !repo.spec.sync.enabled {
            continue;
        }
        let StorageSpec::Local { path } = &repo.spec.storage else {
            continue;
        };
        if !path.is_dir() {
            tracing::warn!(repository = %repo.name, path = %path.display(), "not watching missing directory");
            continue;
        }
        let root = fs::canonicalize(path).unwrap_or_else(|_| path.clone());
        targets.insert(root, (repo.namespace.clone(), repo.name.clone()));
    }
    Ok(targets)
}

/// Temp files from atomic writes and hidden entries never trigger a sync.
fn is_relevant_path(path: &Path, root: &Path) -> bool {
    let Ok(rel) = path.strip_prefix(root) else {
        return false;
    };
    if rel.as_os_str().is_empty() {
        return false;
    }
    let hidden = rel
        .components()
        .any(|c| c.as_os_str().to_string_lossy().starts_with('.'));
    let tmp = path.extension().and_then(|e| e.to_str()) == Some("tmp");
    !hidden && !tmp
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

fn key_for<'a>(targets: &'a HashMap<PathBuf, Key>, path: &Path) -> Option<&'a Key> {
    targets
        .iter()
        .find(|(root, _)| is_relevant_path(path, root))
        .map(|(_, key)| key)
}

fn sync_watches(
    watcher: &mut RecommendedWatcher,
    watched: &mut HashSet<PathBuf>,
    targets: &HashMap<PathBuf, Key>,
) {
    for root in watched.clone() {
        if !targets.contains_key(&root) {
            if let Err(err) = watcher.unwatch(&root) {
                tracing::debug!(path = %root.display(), error = %err, "unwatch failed");
            }
            watched.remove(&root);
        }
    }
    for root in targets.keys() {
        if watched.contains(root) {
            continue;
        }
        match watcher.watch(root, RecursiveMode::Recursive) {
            Ok(()) => {
                tracing::info!(path = %root.display(), "watching repository");
                watched.insert(root.clone());
            }
            Err(err) => tracing::warn!(path = %root.display(), error = %err, "watch failed"),
        }
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Submit a full pull; a job already in flight makes this a no-op.
pub(crate) async fn trigger_pull(engine: &Engine, key: &Key, source: &'static str) {
    let (namespace, repository) = key;
    let spec = JobSpec::pull(repository.clone(), PullOptions::default());
    match engine.submit(namespace, spec).await {
        Ok(job) => tracing::info!(job = %job.name, repository = %repository, source, "sync triggered"),
        Err(err) if err.is_in_progress() => {
            tracing::debug!(repository = %repository, source, "sync already in progress")
        }
        Err(err) => tracing::error!(repository = %repository, source, error = %err, "sync trigger failed"),
    }
}

/// Run until engine shutdown.
pub async fn watch(engine: Engine) -> Result<(), EngineError> {
    let shutdown = engine.shutdown_token();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher: RecommendedWatcher = recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })?;

    let mut watched = HashSet::new();
    let mut targets = watch_targets(&engine)?;
    sync_watches(&mut watcher, &mut watched, &targets);

    let mut debounce = Debouncer::new(Duration::from_millis(engine.settings().debounce_ms));
    let mut rescan = tokio::time::interval_at(Instant::now() + RESCAN_INTERVAL, RESCAN_INTERVAL);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = rescan.tick() => {
                match watch_targets(&engine) {
                    Ok(fresh) => {
                        targets = fresh;
                        sync_watches(&mut watcher, &mut watched, &targets);
                    }
                    Err(err) => tracing::warn!(error = %err, "repository rescan failed"),
                }
            }
            _ = until(debounce.next_deadline()) => {
                for key in debounce.take_due(Instant::now()) {
                    trigger_pull(&engine, &key, "watcher").await;
                }
            }
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(error = %err, "watcher event error");
                        continue;
                    }
                };
                if !is_relevant_event_kind(&event.kind) {
                    continue;
                }
                for path in &event.paths {
                    if let Some(key) = key_for(&targets, path) {
                        debounce.touch(key.clone(), Instant::now());
                    }
                }
            }
        }
    }
    Ok(())
}
