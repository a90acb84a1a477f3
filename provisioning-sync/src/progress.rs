//! Per-job progress: item results, error budget, cancellation and the
//! terminal status.

use std::collections::BTreeMap;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use provisioning_core::{path, JobResourceSummary, JobState, JobStatus, ResourceKind};

use crate::diff::FileAction;
use crate::error::SyncError;

/// Outcome of one planned change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResourceResult {
    pub path: String,
    pub action: FileAction,
    pub kind: ResourceKind,
    pub name: Option<String>,
    pub error: Option<String>,
    pub warning: Option<String>,
}

impl JobResourceResult {
    pub fn new(path: impl Into<String>, action: FileAction, kind: ResourceKind) -> Self {
        Self {
            path: path.into(),
            action,
            kind,
            name: None,
            error: None,
            warning: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn failed(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub fn warn(mut self, warning: impl Into<String>) -> Self {
        self.warning = Some(warning.into());
        self
    }
}

pub struct JobProgress {
    max_errors: usize,
    /// Errors recorded before the current budget started.
    budget_start: usize,
    cancel: CancellationToken,
    errors: Vec<String>,
    warnings: Vec<String>,
    succeeded: usize,
    summaries: BTreeMap<ResourceKind, JobResourceSummary>,
    failed_creations: Vec<String>,
    failed_deletions: Vec<String>,
    message: Option<String>,
    started: chrono::DateTime<Utc>,
    git_ref: Option<String>,
}

impl JobProgress {
    /// `max_errors` of 0 disables the budget.
    pub fn new(max_errors: usize, cancel: CancellationToken) -> Self {
        Self {
            max_errors,
            budget_start: 0,
            cancel,
            errors: Vec::new(),
            warnings: Vec::new(),
            succeeded: 0,
            summaries: BTreeMap::new(),
            failed_creations: Vec::new(),
            failed_deletions: Vec::new(),
            message: None,
            started: Utc::now(),
            git_ref: None,
        }
    }

    /// Switch to a budget of one error.
    pub fn strict(&mut self) {
        self.max_errors = 1;
    }

    /// Fresh budget for a follow-up phase. Earlier errors stay recorded.
    pub fn restart_budget(&mut self, max_errors: usize) {
        self.max_errors = max_errors;
        self.budget_start = self.errors.len();
    }

    pub fn set_message(&mut self, message: impl Into<String>) {
        self.message = Some(message.into());
    }

    pub fn set_ref(&mut self, git_ref: Option<String>) {
        self.git_ref = git_ref;
    }

    /// Job-level warning not tied to an item.
    pub fn warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn record(&mut self, result: JobResourceResult) {
        let summary = self
            .summaries
            .entry(result.kind)
            .or_insert_with(|| JobResourceSummary {
                group: result.kind.group().to_owned(),
                kind: result.kind.to_string(),
                ..JobResourceSummary::default()
            });

        if let Some(error) = &result.error {
            summary.error += 1;
            tracing::warn!(path = %result.path, action = %result.action, error = %error, "item failed");
            match result.action {
                FileAction::Created if path::is_dir(&result.path) => {
                    self.failed_creations.push(result.path.clone());
                }
                FileAction::Deleted => self.failed_deletions.push(result.path.clone()),
                _ => {}
            }
            self.errors.push(error.clone());
            return;
        }

        match result.action {
            FileAction::Created => summary.create += 1,
            FileAction::Updated | FileAction::Renamed => summary.update += 1,
            FileAction::Deleted => summary.delete += 1,
            FileAction::Ignored => summary.noop += 1,
        }
        match result.warning {
            Some(warning) => {
                summary.warning += 1;
                tracing::debug!(path = %result.path, warning = %warning, "item skipped");
                if result.action != FileAction::Ignored {
                    self.succeeded += 1;
                }
                self.warnings.push(warning);
            }
            None => self.succeeded += 1,
        }
    }

    pub fn too_many_errors(&self) -> Result<(), SyncError> {
        if self.max_errors > 0 && self.errors.len() - self.budget_start >= self.max_errors {
            return Err(SyncError::TooManyErrors);
        }
        Ok(())
    }

    pub fn check_cancelled(&self) -> Result<(), SyncError> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }

    /// `true` when a folder creation above `p` failed earlier in the job.
    pub fn is_nested_under_failed_creation(&self, p: &str) -> bool {
        self.failed_creations
            .iter()
            .any(|dir| p != dir && path::is_under(p, dir))
    }

    /// `true` when a deletion below `dir` failed earlier in the job.
    pub fn has_failed_deletions_under(&self, dir: &str) -> bool {
        self.failed_deletions
            .iter()
            .any(|p| p != dir && path::is_under(p, dir))
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Terminal status for the job.
    pub fn complete(self, result: Result<(), SyncError>) -> JobStatus {
        let summary: Vec<JobResourceSummary> = self.summaries.into_values().collect();
        let (state, message, mut errors) = match result {
            Err(e) => {
                let message = e.to_string();
                let mut errors = self.errors;
                if errors.is_empty() {
                    errors.push(message.clone());
                }
                (JobState::Error, message, errors)
            }
            Ok(()) if !self.errors.is_empty() => {
                let state = if self.succeeded > 0 {
                    JobState::Warning
                } else {
                    JobState::Error
                };
                (state, "completed with errors".to_owned(), self.errors)
            }
            Ok(()) if !self.warnings.is_empty() => (
                JobState::Warning,
                self.message
                    .unwrap_or_else(|| "completed with warnings".to_owned()),
                Vec::new(),
            ),
            Ok(()) => (
                JobState::Success,
                self.message.unwrap_or_else(|| "completed".to_owned()),
                Vec::new(),
            ),
        };
        errors.dedup();
        JobStatus {
            state,
            message,
            errors,
            warnings: self.warnings,
            started: Some(self.started),
            finished: Some(Utc::now()),
            summary,
            git_ref: self.git_ref,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress() -> JobProgress {
        JobProgress::new(20, CancellationToken::new())
    }

    fn ok(p: &str, action: FileAction) -> JobResourceResult {
        JobResourceResult::new(p, action, ResourceKind::Dashboard)
    }

    #[test]
    fn clean_run_is_success_with_message() {
        let mut progress = progress();
        progress.record(ok("a.json", FileAction::Created));
        progress.set_message("no changes to sync");
        let status = progress.complete(Ok(()));
        assert_eq!(status.state, JobState::Success);
        assert_eq!(status.message, "no changes to sync");
        assert_eq!(status.summary[0].create, 1);
    }

    #[test]
    fn partial_failure_is_warning() {
        let mut progress = progress();
        progress.record(ok("a.json", FileAction::Created));
        progress.record(ok("b.json", FileAction::Created).failed("bad"));
        let status = progress.complete(Ok(()));
        assert_eq!(status.state, JobState::Warning);
        assert_eq!(status.errors, vec!["bad".to_string()]);
    }

    #[test]
    fn total_failure_is_error() {
        let mut progress = progress();
        progress.record(ok("b.json", FileAction::Created).failed("bad"));
        let status = progress.complete(Ok(()));
        assert_eq!(status.state, JobState::Error);
        assert_eq!(status.message, "completed with errors");
    }

    #[test]
    fn job_error_wins() {
        let mut progress = progress();
        progress.record(ok("a.json", FileAction::Created));
        let status = progress.complete(Err(SyncError::Quota(
            "sync would exceed quota: 3/2 resources".into(),
        )));
        assert_eq!(status.state, JobState::Error);
        assert_eq!(status.errors, vec![status.message.clone()]);
    }

    #[test]
    fn strict_budget_trips_on_first_error() {
        let mut progress = progress();
        progress.strict();
        assert!(progress.too_many_errors().is_ok());
        progress.record(ok("a.json", FileAction::Deleted).failed("gone"));
        assert!(matches!(progress.too_many_errors(), Err(SyncError::TooManyErrors)));
        progress.restart_budget(20);
        assert!(progress.too_many_errors().is_ok());
        assert_eq!(progress.error_count(), 1);
    }

    #[test]
    fn tracks_failed_folders_and_deletions() {
        let mut progress = progress();
        progress.record(
            JobResourceResult::new("team/", FileAction::Created, ResourceKind::Folder)
                .failed("forbidden"),
        );
        progress.record(ok("old/x.json", FileAction::Deleted).failed("boom"));
        assert!(progress.is_nested_under_failed_creation("team/a.json"));
        assert!(!progress.is_nested_under_failed_creation("team/"));
        assert!(progress.has_failed_deletions_under("old/"));
        assert!(!progress.has_failed_deletions_under("team/"));
    }

    #[test]
    fn cancellation_is_observed() {
        let token = CancellationToken::new();
        let progress = JobProgress::new(0, token.clone());
        assert!(progress.check_cancelled().is_ok());
        token.cancel();
        assert!(matches!(progress.check_cancelled(), Err(SyncError::Cancelled)));
    }
}
