//! Deep-learning benchmark harness CLI
//!
//! Runs a test matrix sequentially and appends one result row per run.

use std::{path::PathBuf, sync::Arc};

use clap::{Parser, Subcommand};
use dlbench_harness::{
    config::HarnessConfig,
    guard::AffinityQuota,
    matrix::{load_matrix, write_sample_matrix},
    nvidia::NvidiaSmi,
    runner::TokioProcessRunner,
    scheduler::{BatchPaths, Orchestrator},
};
use indicatif::ProgressBar;
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "dlbench", about = "Deep-learning training benchmark harness")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every enabled entry of a test matrix
    Run {
        /// Path to the test matrix CSV
        #[arg(short, long, default_value = "test-matrix.csv")]
        config: PathBuf,

        /// Log directory (default: GpuBenchmarkLog_<timestamp>); replaced if it exists
        #[arg(short, long)]
        log_dir: Option<PathBuf>,

        /// Result file (default: <log_dir>/all_results.csv)
        #[arg(short, long)]
        result_file: Option<PathBuf>,

        /// Harness settings TOML
        #[arg(short, long)]
        settings: Option<PathBuf>,
    },

    /// Resolve every enabled entry without running anything
    Plan {
        /// Path to the test matrix CSV
        #[arg(short, long, default_value = "test-matrix.csv")]
        config: PathBuf,

        /// Harness settings TOML
        #[arg(short, long)]
        settings: Option<PathBuf>,
    },

    /// Write an example test matrix and settings file
    Init {
        /// Where to write the matrix
        #[arg(short, long, default_value = "test-matrix.csv")]
        config: PathBuf,

        /// Where to write the settings
        #[arg(short, long, default_value = "dlbench.toml")]
        settings: PathBuf,
    },
}

// Current-thread runtime: the CPU quota pins the thread that spawns children.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // tracing needs to be initialized with indicatif_layer to not clobber progress bars
    let indicatif_layer = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .with(indicatif_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            log_dir,
            result_file,
            settings,
        } => {
            let harness_config = HarnessConfig::load_or_default(settings.as_ref())?;
            let entries = load_matrix(&config)?;
            let paths = BatchPaths::resolve(log_dir, result_file);

            println!("Starting benchmark with matrix: {}", config.display());
            println!("Logs: {}", paths.log_dir.display());

            let runner = TokioProcessRunner::new(harness_config.harness.run_timeout());
            let orchestrator = Orchestrator::new(
                harness_config,
                Arc::new(NvidiaSmi::default()),
                runner,
                AffinityQuota::new(),
            )?
            .with_progress(ProgressBar::new(0));

            let summary = orchestrator.run_batch(&entries, &paths).await?;

            println!();
            println!("=== Benchmark Complete ===");
            println!("Attempted: {}", summary.attempted);
            println!("Succeeded: {}", summary.succeeded);
            println!("Failed: {}", summary.failed);
            println!("Disabled: {}", summary.skipped);
            println!("Results: {}", paths.result_file.display());
        }

        Commands::Plan { config, settings } => {
            let harness_config = HarnessConfig::load_or_default(settings.as_ref())?;
            let entries = load_matrix(&config)?;
            let orchestrator = Orchestrator::new(
                harness_config,
                Arc::new(NvidiaSmi::default()),
                TokioProcessRunner::default(),
                AffinityQuota::new(),
            )?;

            let planned = orchestrator.plan(&entries);
            println!("=== Plan ===");
            println!(
                "{} enabled of {} entries",
                planned.len(),
                entries.len()
            );
            println!();

            let mut missing = 0;
            for run in &planned {
                match &run.script {
                    Ok(script) => println!(
                        "  - {} (epoch size {}, {} cores): {}",
                        run.label,
                        run.epoch_size,
                        run.cores,
                        script.wrapper.display()
                    ),
                    Err(e) => {
                        missing += 1;
                        println!("  ! {}: {e}", run.label);
                    }
                }
            }

            if missing > 0 {
                println!();
                println!("{missing} entries would be recorded as missing scripts");
            }
        }

        Commands::Init { config, settings } => {
            write_sample_matrix(&config)?;
            println!("Wrote {}", config.display());

            if settings.exists() {
                println!("Keeping existing {}", settings.display());
            } else {
                std::fs::write(&settings, toml::to_string_pretty(&HarnessConfig::default())?)?;
                println!("Wrote {}", settings.display());
            }
        }
    }

    Ok(())
}
