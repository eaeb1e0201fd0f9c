use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use tracing::info;

use super::section::{scalar_string, StepSection};
use crate::constants::{
    DATABASE_ENV_VAR, DEFAULT_BUSY_TIMEOUT_MS, DEFAULT_DATABASE_PATH, DEFAULT_JOURNAL_MODE,
};
use crate::error::{PipelineError, Result};

const JOURNAL_MODES: [&str; 6] = ["DELETE", "TRUNCATE", "PERSIST", "MEMORY", "WAL", "OFF"];

/// Connection parameters for the SQLite database the steps write into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub busy_timeout_ms: u64,
    pub journal_mode: String,
}

/// The `database` section as written in the settings document.
#[derive(Debug, Default, Deserialize)]
struct DatabaseSection {
    #[serde(default, deserialize_with = "scalar_string")]
    path: Option<String>,
    busy_timeout_ms: Option<u64>,
    #[serde(default, deserialize_with = "scalar_string")]
    journal_mode: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_DATABASE_PATH),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            journal_mode: DEFAULT_JOURNAL_MODE.to_string(),
        }
    }
}

impl DatabaseConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Build from the `database` section, or defaults when it is absent.
    ///
    /// Relative paths are resolved against `base_path`.
    pub fn from_section(section: Option<&StepSection>, base_path: &Path) -> Result<Self> {
        let raw: DatabaseSection = match section {
            Some(section) => section.deserialize()?,
            None => DatabaseSection::default(),
        };
        let mut config = Self::default();

        let path = match raw.path {
            Some(path) => path,
            None => match env::var(DATABASE_ENV_VAR) {
                Ok(path) if !path.trim().is_empty() => {
                    info!("Using database path from {}", DATABASE_ENV_VAR);
                    path
                }
                _ => {
                    info!("defaulting database path to '{}'", DEFAULT_DATABASE_PATH);
                    DEFAULT_DATABASE_PATH.to_string()
                }
            },
        };
        let path = PathBuf::from(path);
        config.path = if path.is_absolute() {
            path
        } else {
            base_path.join(path)
        };

        if let Some(timeout) = raw.busy_timeout_ms {
            config.busy_timeout_ms = timeout;
        }
        if let Some(mode) = raw.journal_mode {
            let mode = mode.to_ascii_uppercase();
            if !JOURNAL_MODES.contains(&mode.as_str()) {
                return Err(PipelineError::config(format!(
                    "journal_mode: {} is not one of the allowed values: {}",
                    mode,
                    JOURNAL_MODES.join(" ")
                )));
            }
            config.journal_mode = mode;
        }

        info!("Using database at {}", config.path.display());
        Ok(config)
    }
}
