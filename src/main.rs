use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

use geopipe::logging::{self, Verbosity};
use geopipe::pipeline::{PipelineOrchestrator, SkipSet, Stage, StageStatus};
use geopipe::settings::SettingsDocument;
use geopipe::{PipelineRunReport, Result};

#[derive(Parser)]
#[command(name = "geopipe")]
#[command(about = "Import, enrich, index and export geospatial data from a settings file")]
#[command(version)]
struct Cli {
    /// YAML settings document; relative paths inside it resolve against its directory
    settings_file: PathBuf,

    /// Stages to leave out of this run
    #[arg(long, value_enum, num_args = 1..)]
    skip: Vec<Stage>,

    /// 1: major messages only, 2: info, 3: detailed, 4: debug
    #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u8).range(1..=4))]
    loglevel: u8,
}

async fn run(cli: &Cli) -> Result<PipelineRunReport> {
    let settings = SettingsDocument::from_path(&cli.settings_file)?;
    let skip: SkipSet = cli.skip.iter().copied().collect();
    info!(
        "loaded settings from {} (base path {})",
        cli.settings_file.display(),
        settings.base_path().display()
    );

    PipelineOrchestrator::with_default_factory(settings, skip)
        .run()
        .await
}

fn print_summary(report: &PipelineRunReport) {
    println!("\n📊 Pipeline run {}:", report.run_id);
    for (stage, status) in &report.stages {
        match status {
            StageStatus::Ran(result) => println!("   {:<10} {}", stage, result.message),
            StageStatus::Skipped(reason) => println!("   {:<10} skipped ({})", stage, reason),
        }
    }
    if let Some(duration) = report.duration() {
        println!("   Duration: {} ms", duration.num_milliseconds());
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load environment variables from .env if present
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    let verbosity = Verbosity::from_level(cli.loglevel).unwrap_or_default();
    let _guard = logging::init_logging(verbosity);

    match run(&cli).await {
        Ok(report) => {
            print_summary(&report);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("geopipe failed: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}
