// Pipeline: stage sequencing, step construction and the index builder

pub mod factory;
pub mod index;
pub mod orchestrator;
pub mod stage;
pub mod steps;

// Re-export key types
pub use factory::{DefaultStepFactory, StepFactory, StepRegistry};
pub use index::{load_weights, IndexGenerator, ResolvedWeights, SqliteIndexGenerator};
pub use orchestrator::{PipelineOrchestrator, PipelineRunReport, SkipReason, StageStatus};
pub use stage::{SkipSet, Stage};
pub use steps::{DbStep, StepContext, StepKind, StepResult};
