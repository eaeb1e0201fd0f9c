pub mod constants;
pub mod db;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod settings;

pub use error::{PipelineError, Result, StepError};
pub use pipeline::{PipelineOrchestrator, PipelineRunReport, SkipSet, Stage};
pub use settings::SettingsDocument;
