//! geoload: concurrent CityGML bulk importer

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use geoload::{
    concurrent::InterruptKind,
    config::Config,
    database::{DatabaseAdapter, MemoryDatabase},
    import::{ConsoleProgress, ImportOutcome, ImporterBuilder},
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "geoload")]
#[command(about = "Concurrent CityGML bulk importer")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "geoload.toml")]
    config: PathBuf,

    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import CityGML files or directories
    Import {
        /// Files or directories to import
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Worker threads per pool (sets both minimum and maximum)
        #[arg(short, long)]
        threads: Option<usize>,

        /// First element to import (1-based, across all files)
        #[arg(long)]
        first_element: Option<u64>,

        /// Last element to import (1-based, across all files)
        #[arg(long)]
        last_element: Option<u64>,

        /// Workspace to import into
        #[arg(short, long)]
        workspace: Option<String>,

        /// Write a JSON report of the run to this file
        #[arg(long)]
        report: Option<PathBuf>,

        /// Quiet mode (no progress output)
        #[arg(short, long)]
        quiet: bool,
    },

    /// Write a default configuration file
    Init {
        /// Output directory
        #[arg(default_value = ".")]
        path: PathBuf,
    },
}

/// JSON report written after a run
#[derive(Serialize)]
struct ImportReport<'a> {
    finished_at: DateTime<Utc>,
    interrupted_by: Option<String>,
    #[serde(flatten)]
    outcome: &'a ImportOutcome,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = if cli.config.exists() {
        Config::load(&cli.config)?
    } else {
        Config::default()
    };
    config.logging.init(cli.verbose)?;

    match cli.command {
        Commands::Import {
            paths,
            threads,
            first_element,
            last_element,
            workspace,
            report,
            quiet,
        } => {
            let mut config = config;
            if let Some(threads) = threads {
                config.import.thread_pool.min_threads = threads;
                config.import.thread_pool.max_threads = threads;
            }
            if first_element.is_some() {
                config.import.filter.first_element = first_element;
            }
            if last_element.is_some() {
                config.import.filter.last_element = last_element;
            }
            if let Some(workspace) = workspace {
                config.database.workspace = workspace;
            }
            config.validate()?;

            import_files(config, paths, report, quiet).await
        }
        Commands::Init { path } => init_config(path),
    }
}

async fn import_files(
    config: Config,
    paths: Vec<PathBuf>,
    report: Option<PathBuf>,
    quiet: bool,
) -> Result<()> {
    // No SQL adapter is linked into the binary; runs are dry runs
    info!("Running against the in-memory database");
    let database: Arc<dyn DatabaseAdapter> =
        Arc::new(MemoryDatabase::new().with_max_connections(config.database.max_connections));

    let progress = Arc::new(ConsoleProgress::new(quiet));
    let importer = ImporterBuilder::new(database)
        .with_config(config.import.clone())
        .with_database_config(config.database.clone())
        .with_observer(progress.clone())
        .build()?;
    let handle = importer.interrupt_handle();

    let mut task = tokio::task::spawn_blocking(move || importer.run(&paths));
    let result = tokio::select! {
        result = &mut task => result?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupt received, stopping import...");
            handle.interrupt(InterruptKind::UserAbort, Some("Import aborted by user".to_string()));
            task.await?
        }
    };
    let outcome = result?;

    progress.finish(&outcome);
    if !quiet {
        progress.print_summary(&outcome);
    }

    if let Some(path) = report {
        let report = ImportReport {
            finished_at: Utc::now(),
            interrupted_by: outcome.interrupt.as_ref().map(|i| i.kind.to_string()),
            outcome: &outcome,
        };
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        info!("Report written to {}", path.display());
    }

    match outcome.interrupt {
        Some(ref interrupt) if interrupt.kind != InterruptKind::UserAbort => anyhow::bail!(
            "Import aborted: {}",
            interrupt.message.as_deref().unwrap_or("unknown cause")
        ),
        _ => Ok(()),
    }
}

fn init_config(path: PathBuf) -> Result<()> {
    let config_path = path.join("geoload.toml");
    if config_path.exists() {
        anyhow::bail!("Config file already exists: {}", config_path.display());
    }

    std::fs::create_dir_all(&path)?;
    let content = format!("# geoload configuration\n\n{}", Config::default().to_toml()?);
    std::fs::write(&config_path, content)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;

    println!("Created config file: {}", config_path.display());
    Ok(())
}
