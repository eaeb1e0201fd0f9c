use thiserror::Error;

/// Fatal pipeline failures. Every variant aborts the run.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unsupported {stage} type: '{step_type}'")]
    UnsupportedType { stage: String, step_type: String },

    #[error("Step '{step}' failed: {source}")]
    StepExecution {
        step: String,
        #[source]
        source: StepError,
    },
}

/// Failures raised while a step is running against the database or the filesystem.
#[derive(Error, Debug)]
pub enum StepError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Target table '{0}' already exists and on_existing is 'abort'")]
    TargetExists(String),

    #[error("Invalid input data: {0}")]
    InvalidData(String),

    #[error("Invalid step settings: {0}")]
    Settings(String),
}

impl PipelineError {
    pub fn config(message: impl Into<String>) -> Self {
        PipelineError::Config(message.into())
    }

    pub fn unsupported(stage: impl Into<String>, step_type: impl Into<String>) -> Self {
        PipelineError::UnsupportedType {
            stage: stage.into(),
            step_type: step_type.into(),
        }
    }

    pub fn step(step: impl Into<String>, source: impl Into<StepError>) -> Self {
        PipelineError::StepExecution {
            step: step.into(),
            source: source.into(),
        }
    }

    /// Process exit status reported for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            PipelineError::Config(_) => 2,
            PipelineError::UnsupportedType { .. } => 3,
            PipelineError::StepExecution { .. } => 4,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
