use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::index::{IndexGenerator, SqliteIndexGenerator};
use super::steps::{
    AttributesStep, CsvExporter, CsvImporter, DbStep, GeoJsonExporter, GeoJsonImporter,
    NetworkStep, OptionalImporterSet, StepContext, StepKind,
};
use crate::constants::{CSV_TYPE, GEOJSON_TYPE, OPTIONAL_IMPORTERS_TYPE};
use crate::error::{PipelineError, Result};
use crate::settings::{DatabaseConfig, GlobalConfig};

/// Builds a step from its context. Must not perform I/O.
pub type StepConstructor = fn(StepContext) -> Box<dyn DbStep>;

/// Builds step instances for the orchestrator.
pub trait StepFactory: Send + Sync {
    /// Create the step of `kind` selected by the section's `type` discriminator
    fn create_step(
        &self,
        kind: StepKind,
        database: &DatabaseConfig,
        global: &GlobalConfig,
        step_type: &str,
    ) -> Result<Box<dyn DbStep>>;

    /// Create the index generator used by the index stage
    fn create_index_generator(
        &self,
        database: &DatabaseConfig,
        global: &GlobalConfig,
    ) -> Result<Box<dyn IndexGenerator>>;
}

/// Maps `(kind, type)` to a constructor. Unknown pairs are an `UnsupportedType` error.
#[derive(Clone, Default)]
pub struct StepRegistry {
    constructors: BTreeMap<(StepKind, String), StepConstructor>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in step implementation.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(StepKind::Import, CSV_TYPE, |ctx| Box::new(CsvImporter::new(ctx)));
        registry.register(StepKind::Import, GEOJSON_TYPE, |ctx| {
            Box::new(GeoJsonImporter::new(ctx))
        });

        // Network and attributes derive from point features regardless of the import format
        for step_type in [CSV_TYPE, GEOJSON_TYPE] {
            registry.register(StepKind::Network, step_type, |ctx| Box::new(NetworkStep::new(ctx)));
            registry.register(StepKind::Attributes, step_type, |ctx| {
                Box::new(AttributesStep::new(ctx))
            });
        }

        registry.register(StepKind::Export, CSV_TYPE, |ctx| Box::new(CsvExporter::new(ctx)));
        registry.register(StepKind::Export, GEOJSON_TYPE, |ctx| {
            Box::new(GeoJsonExporter::new(ctx))
        });
        registry
    }

    pub fn register(&mut self, kind: StepKind, step_type: &str, constructor: StepConstructor) {
        self.constructors
            .insert((kind, step_type.to_string()), constructor);
    }

    pub fn supports(&self, kind: StepKind, step_type: &str) -> bool {
        self.constructors
            .contains_key(&(kind, step_type.to_string()))
    }

    /// Registered types for `kind`, sorted.
    pub fn types(&self, kind: StepKind) -> Vec<&str> {
        self.constructors
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, t)| t.as_str())
            .collect()
    }

    pub fn create(
        &self,
        kind: StepKind,
        step_type: &str,
        ctx: &StepContext,
    ) -> Result<Box<dyn DbStep>> {
        let constructor = self
            .constructors
            .get(&(kind, step_type.to_string()))
            .ok_or_else(|| PipelineError::unsupported(kind.as_str(), step_type))?;
        Ok(constructor(ctx.clone()))
    }
}

/// Factory backed by a [`StepRegistry`] and the SQLite index generator.
pub struct DefaultStepFactory {
    registry: Arc<StepRegistry>,
    base_path: PathBuf,
}

impl DefaultStepFactory {
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self::with_registry(StepRegistry::with_defaults(), base_path)
    }

    pub fn with_registry(registry: StepRegistry, base_path: impl AsRef<Path>) -> Self {
        Self {
            registry: Arc::new(registry),
            base_path: base_path.as_ref().to_path_buf(),
        }
    }
}

impl StepFactory for DefaultStepFactory {
    fn create_step(
        &self,
        kind: StepKind,
        database: &DatabaseConfig,
        global: &GlobalConfig,
        step_type: &str,
    ) -> Result<Box<dyn DbStep>> {
        let ctx = StepContext::new(database, global, &self.base_path);
        match kind {
            StepKind::Optional if step_type == OPTIONAL_IMPORTERS_TYPE => Ok(Box::new(
                OptionalImporterSet::new(ctx, Arc::clone(&self.registry)),
            )),
            StepKind::Optional => Err(PipelineError::unsupported(kind.as_str(), step_type)),
            _ => self.registry.create(kind, step_type, &ctx),
        }
    }

    fn create_index_generator(
        &self,
        database: &DatabaseConfig,
        global: &GlobalConfig,
    ) -> Result<Box<dyn IndexGenerator>> {
        let ctx = StepContext::new(database, global, &self.base_path);
        Ok(Box::new(SqliteIndexGenerator::new(ctx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_covers_builtin_types() {
        let registry = StepRegistry::with_defaults();
        assert_eq!(registry.types(StepKind::Import), vec!["csv", "geojson"]);
        assert_eq!(registry.types(StepKind::Export), vec!["csv", "geojson"]);
        assert!(registry.supports(StepKind::Network, "geojson"));
        assert!(registry.supports(StepKind::Attributes, "csv"));
        assert!(!registry.supports(StepKind::Import, "shapefile"));
    }

    #[test]
    fn unknown_type_is_unsupported() {
        let factory = DefaultStepFactory::new("/tmp");
        let result = factory.create_step(
            StepKind::Import,
            &DatabaseConfig::default(),
            &GlobalConfig::default(),
            "shapefile",
        );
        match result {
            Err(PipelineError::UnsupportedType { stage, step_type }) => {
                assert_eq!(stage, "import");
                assert_eq!(step_type, "shapefile");
            }
            _ => panic!("expected UnsupportedType"),
        }
    }

    #[test]
    fn construction_does_not_touch_the_database() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("never.db");
        let factory = DefaultStepFactory::new(dir.path());
        let database = DatabaseConfig::at(&db_path);
        let global = GlobalConfig::default();

        for kind in [StepKind::Import, StepKind::Network, StepKind::Attributes, StepKind::Export] {
            let step = factory.create_step(kind, &database, &global, "csv").unwrap();
            assert!(!step.step_name().is_empty());
        }
        factory
            .create_step(StepKind::Optional, &database, &global, OPTIONAL_IMPORTERS_TYPE)
            .unwrap();
        factory.create_index_generator(&database, &global).unwrap();

        assert!(!db_path.exists());
    }

    #[test]
    fn optional_set_requires_its_own_discriminator() {
        let factory = DefaultStepFactory::new("/tmp");
        let result = factory.create_step(
            StepKind::Optional,
            &DatabaseConfig::default(),
            &GlobalConfig::default(),
            "csv",
        );
        assert!(matches!(result, Err(PipelineError::UnsupportedType { .. })));
    }
}
