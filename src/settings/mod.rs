//! Typed view of the settings document.
//!
//! All sanitization (SRID, case id, database defaults) happens while loading; the
//! resulting [`SettingsDocument`] is never mutated afterwards.

pub mod database;
pub mod global;
pub mod section;

pub use database::DatabaseConfig;
pub use global::{sanitize_case_id, sanitize_srid, GlobalConfig};
pub use section::{require_keys, resolve_on_existing, OnExistingPolicy, StepSection};

use serde_yaml::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::constants::{DATABASE_SECTION, GLOBAL_SECTION, KNOWN_SECTIONS};
use crate::error::{PipelineError, Result};
use section::{describe, scalar_to_string};

/// The loaded settings document.
#[derive(Debug, Clone)]
pub struct SettingsDocument {
    base_path: PathBuf,
    global: GlobalConfig,
    database: DatabaseConfig,
    sections: BTreeMap<String, StepSection>,
}

impl SettingsDocument {
    /// Read and parse a settings file; its directory becomes the base path.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("loading {}", path.display());

        let raw = fs::read_to_string(path).map_err(|e| {
            PipelineError::config(format!(
                "Failed to read settings file '{}': {}",
                path.display(),
                e
            ))
        })?;

        let base_path = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Self::load(&raw, base_path)
    }

    /// Parse a settings document held in memory.
    pub fn load(raw: &str, base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        let document: Value = serde_yaml::from_str(raw)
            .map_err(|e| PipelineError::config(format!("Failed to parse settings: {}", e)))?;

        let root = match document {
            Value::Mapping(root) => root,
            other => {
                return Err(PipelineError::config(format!(
                    "settings document must be a mapping, found {}",
                    describe(&other)
                )))
            }
        };

        let mut sections = BTreeMap::new();
        for (key, value) in root {
            let Some(name) = scalar_to_string(&key) else {
                return Err(PipelineError::config("settings document keys must be strings"));
            };
            if !KNOWN_SECTIONS.contains(&name.as_str()) {
                warn!("ignoring unknown settings section '{}'", name);
                continue;
            }
            let section = StepSection::from_value(name.clone(), value)?;
            info!("found section '{}' ({} keys)", name, section.len());
            sections.insert(name, section);
        }

        let global = GlobalConfig::from_section(sections.get(GLOBAL_SECTION))?;
        let database = DatabaseConfig::from_section(sections.get(DATABASE_SECTION), &base_path)?;

        Ok(Self {
            base_path,
            global,
            database,
            sections,
        })
    }

    /// Directory relative file references are resolved against.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn global(&self) -> &GlobalConfig {
        &self.global
    }

    pub fn database(&self) -> &DatabaseConfig {
        &self.database
    }

    pub fn has_section(&self, name: &str) -> bool {
        self.sections.contains_key(name)
    }

    pub fn section(&self, name: &str) -> Option<&StepSection> {
        self.sections.get(name)
    }

    /// Like [`section`](Self::section) but a missing section is a `ConfigError`.
    pub fn require_section(&self, name: &str) -> Result<&StepSection> {
        self.section(name).ok_or_else(|| {
            PipelineError::config(format!("error: section missing: {}", name))
        })
    }
}
