//! Managed-resource quota.
//!
//! Quota state is derived from live counts on every pass and never stored
//! as a source of truth.

use std::fmt;

use chrono::Utc;

use provisioning_core::{Condition, ConditionStatus, RepositoryName, ResourceKind};

use crate::error::StoreError;
use crate::resources::{ResourceObject, ResourceStore, Selector};

pub const CONDITION_QUOTA: &str = "Quota";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaReason {
    /// No limit configured.
    Unlimited,
    /// Below the limit.
    WithinQuota,
    /// At the limit: creates are blocked.
    QuotaReached,
    /// Above the limit: creates and updates are blocked.
    QuotaExceeded,
}

impl fmt::Display for QuotaReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaReason::Unlimited => write!(f, "Unlimited"),
            QuotaReason::WithinQuota => write!(f, "WithinQuota"),
            QuotaReason::QuotaReached => write!(f, "QuotaReached"),
            QuotaReason::QuotaExceeded => write!(f, "QuotaExceeded"),
        }
    }
}

/// Managed dashboards + folders against the configured maximum (0 = unlimited).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaUsage {
    pub count: u64,
    pub max: u64,
}

impl QuotaUsage {
    pub fn new(count: u64, max: u64) -> Self {
        Self { count, max }
    }

    pub fn reason(&self) -> QuotaReason {
        if self.max == 0 {
            QuotaReason::Unlimited
        } else if self.count < self.max {
            QuotaReason::WithinQuota
        } else if self.count == self.max {
            QuotaReason::QuotaReached
        } else {
            QuotaReason::QuotaExceeded
        }
    }

    /// Admit a pull by its net change. A net decrease is always admitted.
    pub fn admit_pull(&self, creates: u64, deletes: u64) -> Result<(), String> {
        if self.max == 0 || deletes > creates {
            return Ok(());
        }
        let projected = self.count + (creates - deletes);
        if projected > self.max {
            return Err(format!(
                "sync would exceed quota: {projected}/{} resources",
                self.max
            ));
        }
        Ok(())
    }

    /// Admit an export of `new` resources not yet managed.
    pub fn admit_export(&self, new: u64) -> Result<(), String> {
        let total = self.count + new;
        if self.max != 0 && total > self.max {
            return Err(format!(
                "export would exceed quota: {total}/{} resources",
                self.max
            ));
        }
        Ok(())
    }

    pub fn message(&self) -> String {
        match self.reason() {
            QuotaReason::Unlimited => format!("{} resources, no limit", self.count),
            _ => format!("{}/{} resources", self.count, self.max),
        }
    }

    /// `{type: Quota}` condition; `False` only when the quota is exceeded.
    pub fn condition(&self) -> Condition {
        let reason = self.reason();
        Condition {
            kind: CONDITION_QUOTA.to_owned(),
            status: if reason == QuotaReason::QuotaExceeded {
                ConditionStatus::False
            } else {
                ConditionStatus::True
            },
            reason: reason.to_string(),
            message: self.message(),
            last_transition: Utc::now(),
        }
    }
}

/// Live count of dashboards and folders managed by `repository`.
///
/// The root folder of a folder-target repository has no file behind it and
/// is not counted.
pub fn count_managed(
    store: &dyn ResourceStore,
    repository: &RepositoryName,
) -> Result<u64, StoreError> {
    let selector = Selector::ManagedBy(repository.clone());
    let mut count = 0;
    for kind in ResourceKind::all() {
        count += store
            .list(*kind, &selector)?
            .iter()
            .filter(|obj| !is_repository_root(obj))
            .count() as u64;
    }
    Ok(count)
}

fn is_repository_root(obj: &ResourceObject) -> bool {
    obj.kind() == ResourceKind::Folder
        && obj.meta.source().is_some_and(|s| s.path.is_empty())
}
