use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use super::factory::{DefaultStepFactory, StepFactory};
use super::index::load_weights;
use super::stage::{SkipSet, Stage};
use super::steps::{StepKind, StepResult};
use crate::constants::{
    EXPORT_SECTION, IMPORT_SECTION, OPTIONAL_IMPORTERS_TYPE, OPTIONAL_SECTION, TYPE_KEY,
    WEIGHTS_SECTION,
};
use crate::error::Result;
use crate::major_info;
use crate::settings::{require_keys, resolve_on_existing, SettingsDocument, StepSection};

/// Why a stage did not run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Listed in the skip set
    Requested,
    /// The section the stage reads is absent
    SectionAbsent(&'static str),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Requested => f.write_str("listed in skip steps"),
            SkipReason::SectionAbsent(section) => write!(f, "no '{}' section", section),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageStatus {
    Ran(StepResult),
    Skipped(SkipReason),
}

/// Result of a complete pipeline run
#[derive(Debug, Clone)]
pub struct PipelineRunReport {
    pub run_id: Uuid,
    pub stages: Vec<(Stage, StageStatus)>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PipelineRunReport {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            stages: Vec::with_capacity(Stage::ALL.len()),
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    fn ran(&mut self, stage: Stage, result: StepResult) {
        self.stages.push((stage, StageStatus::Ran(result)));
    }

    fn skipped(&mut self, stage: Stage, reason: SkipReason) {
        self.stages.push((stage, StageStatus::Skipped(reason)));
    }

    /// Stages that ran, in execution order.
    pub fn ran_stages(&self) -> Vec<Stage> {
        self.stages
            .iter()
            .filter(|(_, status)| matches!(status, StageStatus::Ran(_)))
            .map(|(stage, _)| *stage)
            .collect()
    }

    pub fn status(&self, stage: Stage) -> Option<&StageStatus> {
        self.stages
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, status)| status)
    }

    pub fn complete(&mut self) {
        self.completed_at = Some(Utc::now());
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.completed_at.map(|end| end - self.started_at)
    }
}

impl Default for PipelineRunReport {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs the fixed stage sequence against a loaded settings document.
///
/// Stages run strictly in order: import, optional, network, attributes, index, export.
/// Required sections of every unskipped stage are checked before anything runs, and
/// the first failure aborts the run.
pub struct PipelineOrchestrator {
    settings: SettingsDocument,
    skip: SkipSet,
    factory: Arc<dyn StepFactory>,
}

impl PipelineOrchestrator {
    pub fn new(settings: SettingsDocument, skip: SkipSet, factory: Arc<dyn StepFactory>) -> Self {
        Self {
            settings,
            skip,
            factory,
        }
    }

    /// Orchestrator using the built-in step implementations.
    pub fn with_default_factory(settings: SettingsDocument, skip: SkipSet) -> Self {
        let factory = Arc::new(DefaultStepFactory::new(settings.base_path()));
        Self::new(settings, skip, factory)
    }

    pub fn settings(&self) -> &SettingsDocument {
        &self.settings
    }

    /// Run every stage not in the skip set.
    ///
    /// Failures are returned to the caller unlogged.
    pub async fn run(&self) -> Result<PipelineRunReport> {
        let mut report = PipelineRunReport::new();
        let span = info_span!("pipeline", run_id = %report.run_id);

        match self.run_stages(&mut report).instrument(span).await {
            Ok(()) => {
                report.complete();
                major_info!(" === done ===");
                Ok(report)
            }
            Err(e) => {
                major_info!(" === stopped ===");
                Err(e)
            }
        }
    }

    async fn run_stages(&self, report: &mut PipelineRunReport) -> Result<()> {
        info!("skip steps: {}", self.skip);
        self.validate()?;

        self.run_import(report).await?;
        self.run_optional(report).await?;
        self.run_network(report).await?;
        self.run_attributes(report).await?;
        self.run_index(report).await?;
        self.run_export(report).await?;
        Ok(())
    }

    /// Check that every unskipped stage has its required section.
    pub fn validate(&self) -> Result<()> {
        let required = [
            (Stage::Import, IMPORT_SECTION),
            (Stage::Export, EXPORT_SECTION),
            (Stage::Index, WEIGHTS_SECTION),
        ];
        for (stage, section) in required {
            if !self.skip.contains(stage) {
                self.settings.require_section(section)?;
            }
        }
        Ok(())
    }

    /// The `import` section with `type` required and `on_existing` resolved.
    ///
    /// Import, network and attributes each call this on their own so skipping one
    /// never weakens another's checks.
    fn prepared_import_section(&self) -> Result<(StepSection, String)> {
        let mut section = self.settings.require_section(IMPORT_SECTION)?.clone();
        require_keys(&section, &[TYPE_KEY])?;
        let step_type = section.require_str(TYPE_KEY)?;
        resolve_on_existing(&mut section)?;
        Ok((section, step_type))
    }

    async fn run_import(&self, report: &mut PipelineRunReport) -> Result<()> {
        if self.skip.contains(Stage::Import) {
            major_info!(" === skipping import ===");
            report.skipped(Stage::Import, SkipReason::Requested);
            return Ok(());
        }

        major_info!(" === importing ===");
        let (section, step_type) = self.prepared_import_section()?;
        let result = self.run_kind(StepKind::Import, &step_type, &section).await?;
        report.ran(Stage::Import, result);
        Ok(())
    }

    async fn run_optional(&self, report: &mut PipelineRunReport) -> Result<()> {
        if self.skip.contains(Stage::Optional) {
            info!("skipping optional importers (as listed in skip steps)");
            report.skipped(Stage::Optional, SkipReason::Requested);
            return Ok(());
        }
        let Some(section) = self.settings.section(OPTIONAL_SECTION) else {
            info!("no optional section, skipping optional importers");
            report.skipped(Stage::Optional, SkipReason::SectionAbsent(OPTIONAL_SECTION));
            return Ok(());
        };

        major_info!(" === running optional importers ===");
        let result = self
            .run_kind(StepKind::Optional, OPTIONAL_IMPORTERS_TYPE, section)
            .await?;
        if result.failed_count > 0 {
            warn!("{}", result.message);
        }
        report.ran(Stage::Optional, result);
        Ok(())
    }

    async fn run_network(&self, report: &mut PipelineRunReport) -> Result<()> {
        self.run_derived(report, Stage::Network, StepKind::Network, " === running network step ===")
            .await
    }

    async fn run_attributes(&self, report: &mut PipelineRunReport) -> Result<()> {
        self.run_derived(
            report,
            Stage::Attributes,
            StepKind::Attributes,
            " === running attributes step ===",
        )
        .await
    }

    /// Network and attributes: configured entirely from the `import` section.
    async fn run_derived(
        &self,
        report: &mut PipelineRunReport,
        stage: Stage,
        kind: StepKind,
        banner: &str,
    ) -> Result<()> {
        if self.skip.contains(stage) {
            info!("skipping {} step (as listed in skip steps)", stage);
            report.skipped(stage, SkipReason::Requested);
            return Ok(());
        }
        if !self.settings.has_section(IMPORT_SECTION) {
            info!("no import section, skipping {} step", stage);
            report.skipped(stage, SkipReason::SectionAbsent(IMPORT_SECTION));
            return Ok(());
        }

        major_info!("{}", banner);
        let (section, step_type) = self.prepared_import_section()?;
        let result = self.run_kind(kind, &step_type, &section).await?;
        report.ran(stage, result);
        Ok(())
    }

    async fn run_index(&self, report: &mut PipelineRunReport) -> Result<()> {
        if self.skip.contains(Stage::Index) {
            info!("skipping index generation (as listed in skip steps)");
            report.skipped(Stage::Index, SkipReason::Requested);
            return Ok(());
        }

        major_info!(" === generating index ===");
        let definitions = self.settings.require_section(WEIGHTS_SECTION)?;
        let weights = load_weights(self.settings.base_path(), definitions)?;
        let generator = self
            .factory
            .create_index_generator(self.settings.database(), self.settings.global())?;
        let result = generator.generate_index(&weights).await?;
        info!("index: {}", result.message);
        report.ran(Stage::Index, result);
        Ok(())
    }

    async fn run_export(&self, report: &mut PipelineRunReport) -> Result<()> {
        if self.skip.contains(Stage::Export) {
            major_info!("skipping export (as listed in skip steps)");
            report.skipped(Stage::Export, SkipReason::Requested);
            return Ok(());
        }

        major_info!(" === exporting ===");
        let section = self.settings.require_section(EXPORT_SECTION)?;
        require_keys(section, &[TYPE_KEY])?;
        let step_type = section.require_str(TYPE_KEY)?;
        let result = self.run_kind(StepKind::Export, &step_type, section).await?;
        report.ran(Stage::Export, result);
        Ok(())
    }

    async fn run_kind(
        &self,
        kind: StepKind,
        step_type: &str,
        section: &StepSection,
    ) -> Result<StepResult> {
        let step = self.factory.create_step(
            kind,
            self.settings.database(),
            self.settings.global(),
            step_type,
        )?;
        info!("running {} step '{}'", kind, step.step_name());
        let result = step.run_step(section).await?;
        info!("{}: {}", step.step_name(), result.message);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PipelineError, StepError};
    use crate::pipeline::index::{IndexGenerator, ResolvedWeights};
    use crate::pipeline::steps::DbStep;
    use crate::settings::{DatabaseConfig, GlobalConfig};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Created(StepKind, String),
        Ran(StepKind, StepSection),
        IndexCreated,
        Indexed(usize),
    }

    /// Records constructions and runs; fails runs of `fail_kind` when set.
    #[derive(Default)]
    struct SpyFactory {
        events: Arc<Mutex<Vec<Event>>>,
        fail_kind: Option<StepKind>,
    }

    impl SpyFactory {
        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        fn constructions(&self) -> usize {
            self.events()
                .iter()
                .filter(|e| matches!(e, Event::Created(..) | Event::IndexCreated))
                .count()
        }

        fn ran_kinds(&self) -> Vec<String> {
            self.events()
                .iter()
                .filter_map(|e| match e {
                    Event::Ran(kind, _) => Some(kind.to_string()),
                    Event::Indexed(_) => Some("index".to_string()),
                    _ => None,
                })
                .collect()
        }
    }

    struct SpyStep {
        kind: StepKind,
        events: Arc<Mutex<Vec<Event>>>,
        fail: bool,
    }

    #[async_trait]
    impl DbStep for SpyStep {
        async fn run_step(&self, config: &StepSection) -> Result<StepResult> {
            self.events
                .lock()
                .unwrap()
                .push(Event::Ran(self.kind, config.clone()));
            if self.fail {
                return Err(PipelineError::step(
                    self.kind.as_str(),
                    StepError::InvalidData("spy failure".into()),
                ));
            }
            Ok(StepResult::success(1, format!("{} ok", self.kind)))
        }

        fn step_name(&self) -> &'static str {
            self.kind.as_str()
        }
    }

    struct SpyIndex {
        events: Arc<Mutex<Vec<Event>>>,
    }

    #[async_trait]
    impl IndexGenerator for SpyIndex {
        async fn generate_index(&self, weights: &ResolvedWeights) -> Result<StepResult> {
            self.events.lock().unwrap().push(Event::Indexed(weights.len()));
            Ok(StepResult::success(weights.len(), "indexed".into()))
        }
    }

    impl StepFactory for SpyFactory {
        fn create_step(
            &self,
            kind: StepKind,
            _database: &DatabaseConfig,
            _global: &GlobalConfig,
            step_type: &str,
        ) -> Result<Box<dyn DbStep>> {
            if step_type == "unknown" {
                return Err(PipelineError::unsupported(kind.as_str(), step_type));
            }
            self.events
                .lock()
                .unwrap()
                .push(Event::Created(kind, step_type.to_string()));
            Ok(Box::new(SpyStep {
                kind,
                events: Arc::clone(&self.events),
                fail: self.fail_kind == Some(kind),
            }))
        }

        fn create_index_generator(
            &self,
            _database: &DatabaseConfig,
            _global: &GlobalConfig,
        ) -> Result<Box<dyn IndexGenerator>> {
            self.events.lock().unwrap().push(Event::IndexCreated);
            Ok(Box::new(SpyIndex {
                events: Arc::clone(&self.events),
            }))
        }
    }

    fn settings(yaml: &str) -> SettingsDocument {
        SettingsDocument::load(yaml, "/nonexistent").unwrap()
    }

    fn orchestrator(yaml: &str, skip: &[&str], factory: Arc<SpyFactory>) -> PipelineOrchestrator {
        PipelineOrchestrator::new(settings(yaml), SkipSet::parse(skip).unwrap(), factory)
    }

    const FULL: &str = r#"
database: {path: geo.db}
import: {type: csv, on_existing: delete}
optional:
  parks: {type: csv, file: parks.csv}
export: {type: geojson}
weights:
  w1: {degree: 1}
"#;

    #[tokio::test]
    async fn all_stages_run_in_order() {
        let spy = Arc::new(SpyFactory::default());
        let report = orchestrator(FULL, &[], spy.clone()).run().await.unwrap();

        assert_eq!(report.ran_stages(), Stage::ALL.to_vec());
        assert_eq!(
            spy.ran_kinds(),
            vec!["import", "optional", "network", "attributes", "index", "export"]
        );
        assert!(report.completed_at.is_some());
    }

    #[tokio::test]
    async fn csv_to_geojson_run_with_derived_stages_skipped() {
        let yaml = r#"
import: {type: csv, on_existing: delete}
export: {type: geojson}
weights: {w1: weights/w1.yaml}
"#;
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("weights")).unwrap();
        std::fs::write(dir.path().join("weights/w1.yaml"), "degree: 1\n").unwrap();
        let spy = Arc::new(SpyFactory::default());
        let report = PipelineOrchestrator::new(
            SettingsDocument::load(yaml, dir.path()).unwrap(),
            SkipSet::parse(&["optional", "network", "attributes"]).unwrap(),
            spy.clone(),
        )
        .run()
        .await
        .unwrap();

        assert_eq!(
            report.ran_stages(),
            vec![Stage::Import, Stage::Index, Stage::Export]
        );
        for stage in [Stage::Optional, Stage::Network, Stage::Attributes] {
            assert_eq!(
                report.status(stage),
                Some(&StageStatus::Skipped(SkipReason::Requested))
            );
        }
        assert_eq!(spy.ran_kinds(), vec!["import", "index", "export"]);
        assert!(spy.events().contains(&Event::Indexed(1)));
    }

    #[tokio::test]
    async fn failed_run_is_returned_without_error_events() {
        use tracing_subscriber::layer::{Context, SubscriberExt};

        struct ErrorCounter(Arc<Mutex<usize>>);

        impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for ErrorCounter {
            fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
                if *event.metadata().level() == tracing::Level::ERROR {
                    *self.0.lock().unwrap() += 1;
                }
            }
        }

        let errors = Arc::new(Mutex::new(0));
        let subscriber = tracing_subscriber::registry().with(ErrorCounter(Arc::clone(&errors)));
        let _guard = tracing::subscriber::set_default(subscriber);

        let spy = Arc::new(SpyFactory {
            fail_kind: Some(StepKind::Import),
            ..SpyFactory::default()
        });
        let err = orchestrator(FULL, &[], spy).run().await.unwrap_err();

        assert!(matches!(err, PipelineError::StepExecution { .. }));
        assert_eq!(*errors.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_required_section_aborts_before_any_construction() {
        let cases = [
            ("import: {type: csv}\nweights: {w: {a: 1}}\n", "export"),
            ("export: {type: csv}\nweights: {w: {a: 1}}\n", "import"),
            ("import: {type: csv}\nexport: {type: csv}\n", "weights"),
        ];
        for (yaml, missing) in cases {
            let spy = Arc::new(SpyFactory::default());
            let err = orchestrator(yaml, &[], spy.clone()).run().await.unwrap_err();

            assert!(matches!(err, PipelineError::Config(_)));
            assert!(err.to_string().contains(missing), "{}", err);
            assert_eq!(spy.constructions(), 0);
        }
    }

    #[tokio::test]
    async fn only_index_and_export_run_when_others_skipped() {
        let spy = Arc::new(SpyFactory::default());
        let yaml = "export: {type: geojson}\nweights: {w1: {degree: 1}}\n";
        let report = orchestrator(yaml, &["import", "network", "attributes"], spy.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(report.ran_stages(), vec![Stage::Index, Stage::Export]);
        assert_eq!(spy.ran_kinds(), vec!["index", "export"]);
        assert_eq!(
            report.status(Stage::Optional),
            Some(&StageStatus::Skipped(SkipReason::SectionAbsent("optional")))
        );
    }

    #[tokio::test]
    async fn absent_optional_section_is_a_silent_skip() {
        let spy = Arc::new(SpyFactory::default());
        let yaml = "import: {type: csv}\nexport: {type: csv}\nweights: {w: {a: 1}}\n";
        let report = orchestrator(yaml, &[], spy.clone()).run().await.unwrap();

        assert_eq!(
            report.status(Stage::Optional),
            Some(&StageStatus::Skipped(SkipReason::SectionAbsent("optional")))
        );
        assert!(!spy
            .events()
            .iter()
            .any(|e| matches!(e, Event::Created(StepKind::Optional, _))));
    }

    #[tokio::test]
    async fn skipped_index_does_not_require_weights() {
        let spy = Arc::new(SpyFactory::default());
        let yaml = "import: {type: csv}\nexport: {type: csv}\n";
        let report = orchestrator(yaml, &["index"], spy.clone()).run().await.unwrap();

        assert_eq!(
            report.status(Stage::Index),
            Some(&StageStatus::Skipped(SkipReason::Requested))
        );
        assert_eq!(
            report.ran_stages(),
            vec![Stage::Import, Stage::Network, Stage::Attributes, Stage::Export]
        );
    }

    #[tokio::test]
    async fn skipped_import_still_runs_index() {
        let spy = Arc::new(SpyFactory::default());
        let yaml = "export: {type: csv}\nweights: {w: {a: 1}}\n";
        let report = orchestrator(yaml, &["import", "export"], spy.clone())
            .run()
            .await
            .unwrap();

        // No import section: network and attributes are skipped, index still runs
        assert_eq!(report.ran_stages(), vec![Stage::Index]);
        assert_eq!(
            report.status(Stage::Network),
            Some(&StageStatus::Skipped(SkipReason::SectionAbsent("import")))
        );
    }

    #[tokio::test]
    async fn derived_stages_reuse_import_section_with_default_policy() {
        let spy = Arc::new(SpyFactory::default());
        let yaml = "import: {type: geojson, file: a.json}\nexport: {type: csv}\n";
        orchestrator(yaml, &["import", "index", "export"], spy.clone())
            .run()
            .await
            .unwrap();

        let runs: Vec<(StepKind, StepSection)> = spy
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Ran(kind, section) => Some((kind, section)),
                _ => None,
            })
            .collect();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].0, StepKind::Network);
        assert_eq!(runs[1].0, StepKind::Attributes);
        for (_, section) in &runs {
            assert_eq!(section.get_str("on_existing").as_deref(), Some("skip"));
            assert_eq!(section.get_str("type").as_deref(), Some("geojson"));
        }
        assert!(spy
            .events()
            .contains(&Event::Created(StepKind::Network, "geojson".into())));
    }

    #[tokio::test]
    async fn invalid_on_existing_aborts_before_construction() {
        let spy = Arc::new(SpyFactory::default());
        let yaml = "import: {type: csv, on_existing: overwrite}\nexport: {type: csv}\n";
        let err = orchestrator(yaml, &["index"], spy.clone())
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Config(_)));
        assert_eq!(spy.constructions(), 0);
    }

    #[tokio::test]
    async fn missing_type_key_is_a_config_error() {
        let spy = Arc::new(SpyFactory::default());
        let yaml = "import: {type: csv}\nexport: {path: out.csv}\n";
        let err = orchestrator(yaml, &["index"], spy.clone())
            .run()
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "Configuration error: error: export section is missing: type"
        );
        // Earlier stages already ran; the export check happens when its stage is reached
        assert_eq!(spy.ran_kinds(), vec!["import", "network", "attributes"]);
    }

    #[tokio::test]
    async fn unsupported_type_stops_the_run() {
        let spy = Arc::new(SpyFactory::default());
        let yaml = "import: {type: unknown}\nexport: {type: csv}\n";
        let err = orchestrator(yaml, &["index"], spy.clone())
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::UnsupportedType { .. }));
        assert!(spy.ran_kinds().is_empty());
    }

    #[tokio::test]
    async fn step_failure_stops_later_stages() {
        let spy = Arc::new(SpyFactory {
            fail_kind: Some(StepKind::Network),
            ..SpyFactory::default()
        });
        let err = orchestrator(FULL, &[], spy.clone()).run().await.unwrap_err();

        assert!(matches!(err, PipelineError::StepExecution { .. }));
        assert_eq!(spy.ran_kinds(), vec!["import", "optional", "network"]);
    }

    #[tokio::test]
    async fn export_section_is_passed_without_on_existing() {
        let spy = Arc::new(SpyFactory::default());
        let yaml = "export: {type: geojson, path: out.geojson}\n";
        orchestrator(yaml, &["import", "index"], spy.clone())
            .run()
            .await
            .unwrap();

        let export_section = spy
            .events()
            .into_iter()
            .find_map(|e| match e {
                Event::Ran(StepKind::Export, section) => Some(section),
                _ => None,
            })
            .unwrap();
        assert!(!export_section.contains_key("on_existing"));
    }
}
