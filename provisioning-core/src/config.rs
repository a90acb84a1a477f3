//! Engine settings.
//!
//! Read from `<home>/.provisioning/config.yaml`. Every field has a default,
//! so a missing file yields [`Settings::default`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Repositories allowed per namespace.
    pub max_repositories: u32,
    /// Managed dashboards + folders per repository; 0 means unlimited.
    pub max_resources_per_repository: u64,
    /// Concurrent job workers.
    pub workers: usize,
    /// Item errors tolerated before a job aborts with `too many errors`.
    pub max_errors: usize,
    /// Finished jobs kept per repository; 0 keeps all.
    pub history_limit: usize,
    /// Watcher debounce window.
    pub debounce_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_repositories: 10,
            max_resources_per_repository: 0,
            workers: 4,
            max_errors: 20,
            history_limit: 0,
            debounce_ms: 500,
        }
    }
}

impl Settings {
    fn validate(self) -> Result<Self, ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid {
                key: "workers",
                message: "must be at least 1".into(),
            });
        }
        if self.max_repositories == 0 {
            return Err(ConfigError::Invalid {
                key: "max_repositories",
                message: "must be at least 1".into(),
            });
        }
        Ok(self)
    }
}

/// `<home>/.provisioning/config.yaml`: pure, no I/O.
pub fn settings_path_at(home: &Path) -> PathBuf {
    home.join(".provisioning").join("config.yaml")
}

/// Load settings, falling back to defaults when the file is absent.
pub fn load_at(home: &Path) -> Result<Settings, ConfigError> {
    let path = settings_path_at(home);
    if !path.exists() {
        return Ok(Settings::default());
    }
    let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
        path: path.clone(),
        source,
    })?;
    if contents.trim().is_empty() {
        return Ok(Settings::default());
    }
    let settings: Settings =
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse { path, source })?;
    settings.validate()
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<Settings, ConfigError> {
    let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
    load_at(&home)
}
