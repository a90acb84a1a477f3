//! Finished-job history.
//!
//! ```text
//! <dir>/
//!   <repository>/
//!     <job>.json   (write-once, mode 0600)
//! ```

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use provisioning_core::{Job, JobName, RepositoryName};

use crate::error::{io_err, EngineError};

#[derive(Debug, Clone)]
pub struct HistoryStore {
    dir: PathBuf,
}

impl HistoryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn repository_dir(&self, repository: &RepositoryName) -> PathBuf {
        self.dir.join(&repository.0)
    }

    fn job_path(&self, repository: &RepositoryName, name: &JobName) -> PathBuf {
        self.repository_dir(repository).join(format!("{}.json", name.0))
    }

    /// Archive a finished job. A job name is only ever written once.
    pub fn record(&self, job: &Job) -> Result<(), EngineError> {
        let dir = self.repository_dir(job.repository());
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
            set_dir_permissions(&dir)?;
        }
        let path = self.job_path(job.repository(), &job.name);
        if path.exists() {
            return Err(EngineError::AlreadyExists(job.name.clone()));
        }
        let tmp = dir.join(format!("{}.json.tmp", job.name.0));
        let json = serde_json::to_vec_pretty(job)?;
        fs::write(&tmp, json).map_err(|e| io_err(&tmp, e))?;
        set_file_permissions(&tmp)?;
        fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))?;
        tracing::debug!(job = %job.name, path = %path.display(), "archived job");
        Ok(())
    }

    pub fn get(&self, repository: &RepositoryName, name: &JobName) -> Result<Job, EngineError> {
        let path = self.job_path(repository, name);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(EngineError::JobNotFound(name.clone()))
            }
            Err(e) => return Err(io_err(&path, e)),
        };
        Ok(serde_json::from_slice(&data)?)
    }

    /// Every archived job of `repository`, oldest finish first.
    ///
    /// Unreadable entries are skipped with a warning.
    pub fn list(&self, repository: &RepositoryName) -> Result<Vec<Job>, EngineError> {
        let dir = self.repository_dir(repository);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(io_err(&dir, e)),
        };
        let mut jobs = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = fs::read(&path)
                .map_err(|e| io_err(&path, e))
                .and_then(|data| serde_json::from_slice::<Job>(&data).map_err(EngineError::from));
            match parsed {
                Ok(job) => jobs.push(job),
                Err(err) => tracing::warn!(path = %path.display(), error = %err, "skipping unreadable job record"),
            }
        }
        jobs.sort_by(|a, b| {
            (a.status.finished, &a.name).cmp(&(b.status.finished, &b.name))
        });
        Ok(jobs)
    }

    /// Keep the newest `limit` jobs of `repository`; 0 keeps everything.
    /// Returns how many were removed.
    pub fn trim(&self, repository: &RepositoryName, limit: usize) -> Result<usize, EngineError> {
        if limit == 0 {
            return Ok(0);
        }
        let jobs = self.list(repository)?;
        let excess = jobs.len().saturating_sub(limit);
        for job in &jobs[..excess] {
            let path = self.job_path(repository, &job.name);
            fs::remove_file(&path).map_err(|e| io_err(&path, e))?;
        }
        Ok(excess)
    }

    /// Forget everything recorded for `repository`.
    pub fn remove_repository(&self, repository: &RepositoryName) -> Result<(), EngineError> {
        let dir = self.repository_dir(repository);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&dir, e)),
        }
    }
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), EngineError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), EngineError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), EngineError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), EngineError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use provisioning_core::{JobSpec, JobState, JobStatus, PullOptions};
    use tempfile::TempDir;

    fn finished(name: &str, minute: i64) -> Job {
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().expect("date");
        Job {
            name: name.into(),
            namespace: Default::default(),
            resource_version: 4,
            spec: JobSpec::pull("r1", PullOptions::default()),
            status: JobStatus {
                state: JobState::Success,
                message: "completed".into(),
                finished: Some(base + Duration::minutes(minute)),
                ..JobStatus::default()
            },
            created_at: base,
        }
    }

    #[test]
    fn record_then_get() {
        let dir = TempDir::new().expect("tmp");
        let history = HistoryStore::new(dir.path());
        let job = finished("r1-pull-1", 0);
        history.record(&job).expect("record");
        assert_eq!(history.get(&"r1".into(), &job.name).expect("get"), job);
        assert!(!dir.path().join("r1/r1-pull-1.json.tmp").exists());
    }

    #[test]
    fn records_are_write_once() {
        let dir = TempDir::new().expect("tmp");
        let history = HistoryStore::new(dir.path());
        let job = finished("r1-pull-1", 0);
        history.record(&job).expect("record");
        assert!(matches!(
            history.record(&job),
            Err(EngineError::AlreadyExists(_))
        ));
    }

    #[test]
    fn list_is_ordered_and_trim_keeps_newest() {
        let dir = TempDir::new().expect("tmp");
        let history = HistoryStore::new(dir.path());
        for (name, minute) in [("c", 3), ("a", 1), ("b", 2)] {
            history.record(&finished(name, minute)).expect("record");
        }
        fs::write(dir.path().join("r1/garbage.json"), "{").expect("write");

        let names: Vec<String> = history
            .list(&"r1".into())
            .expect("list")
            .into_iter()
            .map(|j| j.name.0)
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);

        assert_eq!(history.trim(&"r1".into(), 2).expect("trim"), 1);
        assert!(history.get(&"r1".into(), &"a".into()).is_err());
        assert!(history.get(&"r1".into(), &"c".into()).is_ok());
    }

    #[test]
    fn unknown_repository_is_empty() {
        let dir = TempDir::new().expect("tmp");
        let history = HistoryStore::new(dir.path());
        assert!(history.list(&"nope".into()).expect("list").is_empty());
        assert!(matches!(
            history.get(&"nope".into(), &"x".into()),
            Err(EngineError::JobNotFound(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn records_are_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().expect("tmp");
        let history = HistoryStore::new(dir.path());
        history.record(&finished("j", 0)).expect("record");
        let mode = fs::metadata(dir.path().join("r1/j.json"))
            .expect("meta")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
