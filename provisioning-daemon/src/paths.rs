use std::path::{Path, PathBuf};
use std::time::Duration;

use provisioning_core::Namespace;

/// How often scheduled repositories are checked for a due sync.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Capacity of the job queue between submission and the worker pool.
pub const QUEUE_CAPACITY: usize = 64;

pub fn provisioning_root(home: &Path) -> PathBuf {
    home.join(".provisioning")
}

/// `<home>/.provisioning/history/<namespace>/`
pub fn history_dir(home: &Path, namespace: &Namespace) -> PathBuf {
    provisioning_root(home).join("history").join(&namespace.0)
}
