use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use pagegraph_core::LoadConfig;
use serde::{Deserialize, Serialize};

/// Everything a process needs to serve loads, built once at startup and
/// handed to [`crate::PageGraphApi::new`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// How long a writer waits on a locked database, in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// How long `lock_page` holds the edit lock.
    #[serde(default = "default_edit_lock_minutes")]
    pub edit_lock_minutes: i64,
    #[serde(default)]
    pub load: LoadConfig,
    /// `tracing` filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./pagegraph.sqlite3")
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_edit_lock_minutes() -> i64 {
    30
}

fn default_log_filter() -> String {
    "warn".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            edit_lock_minutes: default_edit_lock_minutes(),
            load: LoadConfig::default(),
            log_filter: default_log_filter(),
        }
    }
}

impl ApiConfig {
    #[must_use]
    pub fn with_db_path(db_path: PathBuf) -> Self {
        Self {
            db_path,
            ..Self::default()
        }
    }

    /// Parse a YAML document. Missing keys take their defaults.
    ///
    /// # Errors
    /// Returns an error when the document is not valid YAML for this shape.
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// # Errors
    /// Returns an error when the file cannot be read or parsed.
    pub fn from_yaml_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("invalid config file {}", path.display()))
    }

    /// # Errors
    /// Returns an error when serialization fails.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    #[must_use]
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    #[must_use]
    pub fn edit_lock_duration(&self) -> time::Duration {
        time::Duration::minutes(self.edit_lock_minutes)
    }
}
