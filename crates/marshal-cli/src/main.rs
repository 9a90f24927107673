use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use marshal_pipeline::{maybe_build_scheduler, Pipeline, PipelineConfig};
use marshal_store::PgStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "marshal")]
#[command(about = "Market Marshal - prediction-market intake & staged approval")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the database schema.
    Migrate,
    /// Fetch, canonicalize, and post new markets for review.
    Ingest,
    /// Apply stage-1 (market) approval decisions.
    Stage1,
    /// Apply stage-2 (banner) approval decisions.
    Stage2,
    /// Auto-reject records older than the approval window.
    Sweep,
    /// Submit approved markets downstream.
    Deploy,
    /// Run every pass on the configured cron schedule.
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();
    let store = Arc::new(PgStore::connect(&config.database_url).await?);

    match cli.command.unwrap_or(Commands::Ingest) {
        Commands::Migrate => {
            store.init().await?;
            println!("schema ready");
        }
        Commands::Ingest => {
            let pipeline = Pipeline::production(config, store)?;
            let summary = pipeline.run_ingest().await?;
            println!(
                "ingest complete: run_id={} fetched={} ingested={} duplicates={} discarded={}",
                summary.run_id, summary.fetched, summary.ingested, summary.duplicates,
                summary.discarded
            );
        }
        Commands::Stage1 => {
            let pipeline = Pipeline::production(config, store)?;
            let summary = pipeline.run_market_decisions().await?;
            println!(
                "stage-1 complete: run_id={} checked={} approved={} rejected={} pending={}",
                summary.run_id, summary.checked, summary.approved, summary.rejected,
                summary.still_pending
            );
        }
        Commands::Stage2 => {
            let pipeline = Pipeline::production(config, store)?;
            let summary = pipeline.run_image_decisions().await?;
            println!(
                "stage-2 complete: run_id={} checked={} approved={} rejected={} pending={}",
                summary.run_id, summary.checked, summary.approved, summary.rejected,
                summary.still_pending
            );
        }
        Commands::Sweep => {
            let pipeline = Pipeline::production(config, store)?;
            let summary = pipeline.run_timeout_sweep().await?;
            println!(
                "sweep complete: run_id={} timed_out={}",
                summary.run_id, summary.timed_out
            );
        }
        Commands::Deploy => {
            let pipeline = Pipeline::production(config, store)?;
            let summary = pipeline.run_deploy().await?;
            println!(
                "deploy complete: run_id={} deployed={} failed={}",
                summary.run_id, summary.deployed, summary.failed
            );
        }
        Commands::Run => {
            let pipeline = Arc::new(Pipeline::production(config, store)?);
            match maybe_build_scheduler(pipeline).await? {
                Some(mut scheduler) => {
                    scheduler.start().await.context("starting scheduler")?;
                    info!("scheduler running; press ctrl-c to stop");
                    tokio::signal::ctrl_c()
                        .await
                        .context("waiting for shutdown signal")?;
                    scheduler
                        .shutdown()
                        .await
                        .context("stopping scheduler")?;
                }
                None => {
                    eprintln!("scheduler disabled; set MARSHAL_SCHEDULER_ENABLED=1 to enable");
                }
            }
        }
    }

    Ok(())
}
