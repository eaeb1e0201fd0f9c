use std::fs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::{PipelineError, Result};

/// Tracing target for stage banners and other messages shown at every verbosity.
pub const MAJOR: &str = "major";

/// Log a message that must be visible even at `Verbosity::MajorInfo`.
#[macro_export]
macro_rules! major_info {
    ($($arg:tt)*) => {
        tracing::info!(target: $crate::logging::MAJOR, $($arg)*)
    };
}

/// Console verbosity selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    MajorInfo = 1,
    Info = 2,
    Detailed = 3,
    Debug = 4,
}

impl Verbosity {
    pub fn from_level(level: u8) -> Result<Self> {
        match level {
            1 => Ok(Verbosity::MajorInfo),
            2 => Ok(Verbosity::Info),
            3 => Ok(Verbosity::Detailed),
            4 => Ok(Verbosity::Debug),
            other => Err(PipelineError::config(format!(
                "log level {} is not one of the allowed values: 1 2 3 4",
                other
            ))),
        }
    }

    /// `EnvFilter` directives for this verbosity.
    pub fn filter_directives(self) -> &'static str {
        match self {
            Verbosity::MajorInfo => "warn,major=info",
            Verbosity::Info => "info",
            Verbosity::Detailed => "debug",
            Verbosity::Debug => "trace",
        }
    }
}

impl Default for Verbosity {
    fn default() -> Self {
        Verbosity::Info
    }
}

/// Initializes the logging system with both console and file output.
///
/// The returned guard must be kept alive until exit so the file writer flushes.
pub fn init_logging(verbosity: Verbosity) -> WorkerGuard {
    // Ensure logs directory exists
    let _ = fs::create_dir_all("logs");

    // Create a non-blocking file appender for daily log rotation
    let file_appender = tracing_appender::rolling::daily("logs", "geopipe.log");
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Create a JSON layer for file logging
    let file_layer = fmt::layer().json().with_writer(non_blocking_writer);

    // Create a formatted layer for console logging
    let console_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stdout);

    // Respect RUST_LOG if set; otherwise use the selected verbosity
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity.filter_directives()));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .init();

    guard
}
