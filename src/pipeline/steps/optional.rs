use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::import::target_table;
use super::{DbStep, StepContext, StepKind, StepResult};
use crate::constants::{PIPELINE_TABLES, TYPE_KEY};
use crate::error::{PipelineError, Result, StepError};
use crate::pipeline::factory::StepRegistry;
use crate::settings::{resolve_on_existing, sanitize_case_id, StepSection};

/// Runs every entry of the `optional` section as an independent importer.
///
/// Each entry is a mapping with its own `type`, importing into a table named after
/// the entry. A failing entry is logged and counted; the remaining entries still run.
pub struct OptionalImporterSet {
    ctx: StepContext,
    registry: Arc<StepRegistry>,
}

impl OptionalImporterSet {
    pub fn new(ctx: StepContext, registry: Arc<StepRegistry>) -> Self {
        Self { ctx, registry }
    }

    async fn run_entry(&self, name: &str, value: &serde_yaml::Value) -> Result<StepResult> {
        let mut section = StepSection::from_value(format!("optional.{}", name), value.clone())?;
        let step_type = section.require_str(TYPE_KEY)?;
        resolve_on_existing(&mut section)?;
        if !section.contains_key("table") {
            section.insert("table", sanitize_case_id(name));
        }
        // SQLite table names compare case-insensitively
        let table = target_table(&section);
        if PIPELINE_TABLES
            .iter()
            .any(|reserved| reserved.eq_ignore_ascii_case(&table))
        {
            return Err(PipelineError::step(
                self.step_name(),
                StepError::Settings(format!(
                    "optional.{}: table '{}' belongs to the pipeline and cannot be an import target",
                    name, table
                )),
            ));
        }

        let importer = self.registry.create(StepKind::Import, &step_type, &self.ctx)?;
        importer.run_step(&section).await
    }
}

#[async_trait]
impl DbStep for OptionalImporterSet {
    async fn run_step(&self, config: &StepSection) -> Result<StepResult> {
        let mut succeeded = 0;
        let mut failed = 0;

        for (name, value) in config.entries() {
            info!("running optional importer '{}'", name);
            match self.run_entry(&name, value).await {
                Ok(result) => {
                    info!("optional importer '{}': {}", name, result.message);
                    succeeded += 1;
                }
                Err(e) => {
                    error!("optional importer '{}' failed: {}", name, e);
                    failed += 1;
                }
            }
        }

        let message = format!(
            "optional importers: {} succeeded, {} failed",
            succeeded, failed
        );
        if failed > 0 {
            warn!("{}", message);
        }
        Ok(StepResult::with_failures(succeeded, failed, message))
    }

    fn step_name(&self) -> &'static str {
        "optional_importers"
    }
}
