//! Scheduled pulls for repositories with a sync interval.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use provisioning_core::{JobSpec, Namespace, PullOptions, Repository, RepositoryName};

use crate::error::EngineError;
use crate::paths::TICK_INTERVAL;
use crate::runtime::Engine;

type Key = (Namespace, RepositoryName);

/// Last submission per repository.
#[derive(Debug, Default)]
pub struct Schedule {
    last: HashMap<Key, Instant>,
}

impl Schedule {
    /// `true` when `repo` has an interval and it has elapsed since the last
    /// submission. Never-submitted repositories are due at once.
    pub fn is_due(&self, repo: &Repository, now: Instant) -> bool {
        let sync = &repo.spec.sync;
        if !sync.enabled || sync.interval_seconds == 0 {
            return false;
        }
        let key = (repo.namespace.clone(), repo.name.clone());
        match self.last.get(&key) {
            Some(last) => now.duration_since(*last) >= Duration::from_secs(sync.interval_seconds),
            None => true,
        }
    }

    pub fn mark(&mut self, repo: &Repository, now: Instant) {
        self.last
            .insert((repo.namespace.clone(), repo.name.clone()), now);
    }
}

/// Run until engine shutdown.
pub async fn run(engine: Engine) -> Result<(), EngineError> {
    let shutdown = engine.shutdown_token();
    let mut schedule = Schedule::default();
    let mut interval = tokio::time::interval(TICK_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let repos = match engine.repositories() {
                    Ok(repos) => repos,
                    Err(err) => {
                        tracing::warn!(error = %err, "listing repositories failed");
                        continue;
                    }
                };
                let now = Instant::now();
                let due: Vec<&Repository> = repos.iter().filter(|r| schedule.is_due(r, now)).collect();
                for repo in due {
                    let spec = JobSpec::pull(
                        repo.name.clone(),
                        PullOptions {
                            incremental: true,
                            path: None,
                        },
                    );
                    match engine.submit(&repo.namespace, spec).await {
                        Ok(job) => {
                            tracing::info!(job = %job.name, repository = %repo.name, "scheduled sync");
                            schedule.mark(repo, now);
                        }
                        Err(err) if err.is_in_progress() => {
                            tracing::debug!(repository = %repo.name, "scheduled sync skipped, job in progress");
                            schedule.mark(repo, now);
                        }
                        Err(err) => tracing::error!(repository = %repo.name, error = %err, "scheduled sync failed"),
                    }
                }
            }
        }
    }
    Ok(())
}
