use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::constants::ON_EXISTING_KEY;
use crate::db::Database;
use crate::error::{PipelineError, Result, StepError};
use crate::settings::{DatabaseConfig, GlobalConfig, OnExistingPolicy, StepSection};

/// Common trait for all database-writing pipeline steps
#[async_trait]
pub trait DbStep: Send + Sync {
    /// Execute this step with its configuration section
    async fn run_step(&self, config: &StepSection) -> Result<StepResult>;

    /// Get the name of this step, used in logs and errors
    fn step_name(&self) -> &'static str;
}

/// Kinds of steps the factory knows how to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StepKind {
    Import,
    Optional,
    Network,
    Attributes,
    Export,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Import => "import",
            StepKind::Optional => "optional",
            StepKind::Network => "network",
            StepKind::Attributes => "attributes",
            StepKind::Export => "export",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of executing a step
#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    pub processed_count: usize,
    pub failed_count: usize,
    /// The target already existed and was left untouched (`on_existing: skip`)
    pub kept_existing: bool,
    pub message: String,
}

impl StepResult {
    pub fn success(processed: usize, message: String) -> Self {
        Self {
            processed_count: processed,
            failed_count: 0,
            kept_existing: false,
            message,
        }
    }

    pub fn with_failures(processed: usize, failed: usize, message: String) -> Self {
        Self {
            processed_count: processed,
            failed_count: failed,
            kept_existing: false,
            message,
        }
    }

    pub fn kept(message: String) -> Self {
        Self {
            processed_count: 0,
            failed_count: 0,
            kept_existing: true,
            message,
        }
    }
}

/// Everything a step is constructed with. Building one performs no I/O.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub database: DatabaseConfig,
    pub global: GlobalConfig,
    pub base_path: PathBuf,
}

impl StepContext {
    pub fn new(database: &DatabaseConfig, global: &GlobalConfig, base_path: &Path) -> Self {
        Self {
            database: database.clone(),
            global: global.clone(),
            base_path: base_path.to_path_buf(),
        }
    }

    /// Resolve a file reference from a settings section against the base path.
    pub fn resolve_path(&self, raw: &str) -> PathBuf {
        let path = PathBuf::from(raw);
        if path.is_absolute() {
            path
        } else {
            self.base_path.join(path)
        }
    }

    pub fn open_database(&self) -> std::result::Result<Database, StepError> {
        Database::open(&self.database)
    }

    pub fn table(&self, base: &str) -> String {
        self.global.table_name(base)
    }
}

/// Policy already resolved on `config` by the orchestrator; `skip` when absent.
pub(crate) fn policy_of(config: &StepSection) -> Result<OnExistingPolicy> {
    match config.get_str(ON_EXISTING_KEY) {
        Some(raw) => raw.parse(),
        None => Ok(OnExistingPolicy::Skip),
    }
}

/// Settings problems found while a step runs fail that step, not the settings load.
pub(crate) fn invalid_settings(step: &str) -> impl FnOnce(PipelineError) -> PipelineError + '_ {
    move |error| match error {
        PipelineError::Config(message) => PipelineError::step(step, StepError::Settings(message)),
        other => other,
    }
}

/// Wrap a step-internal failure with the step's name.
pub(crate) fn step_failed(step: &str) -> impl FnOnce(StepError) -> PipelineError + '_ {
    move |source| PipelineError::step(step, source)
}

pub mod attributes;
pub mod export;
pub mod import;
pub mod network;
pub mod optional;

pub use attributes::AttributesStep;
pub use export::{CsvExporter, GeoJsonExporter};
pub use import::{CsvImporter, GeoJsonImporter};
pub use network::NetworkStep;
pub use optional::OptionalImporterSet;
