use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mkt_core::{MarketStore, MemoryStore};
use mkt_storage::PgStore;
use mkt_worker::{RunSummary, WorkerConfig, WorkerPipeline};
use tracing::level_filters::LevelFilter;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mkt-cli")]
#[command(about = "Market data ingestion and alerting worker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every ingestion task once and record a summary.
    Run {
        /// Use an in-memory store instead of Postgres.
        #[arg(long)]
        dry_run: bool,
    },
    /// Create tables and indexes, then exit.
    InitSchema,
    /// Print the most recent alert record as JSON.
    LastAlert,
}

async fn connect(config: &WorkerConfig) -> Result<PgStore> {
    let url = config.database_url()?;
    PgStore::connect(url).await.context("connecting to postgres")
}

fn print_summary(summary: &RunSummary) {
    println!(
        "worker run {} finished in {:.1} s ({} of {} tasks failed)",
        summary.run_id,
        summary.duration,
        summary.failed(),
        summary.results.len()
    );
    for outcome in &summary.results {
        let mark = if outcome.ok { "ok  " } else { "FAIL" };
        println!("  [{mark}] {}", outcome.message);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    let config = WorkerConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Run { dry_run: false }) {
        Commands::Run { dry_run } => {
            let store: Arc<dyn MarketStore> = if dry_run {
                info!("dry run: writing to an in-memory store");
                Arc::new(MemoryStore::new())
            } else {
                Arc::new(connect(&config).await?)
            };
            let pipeline = WorkerPipeline::new(&config, store)?;
            let summary = pipeline
                .run_once()
                .await
                .context("initializing schema")?;
            print_summary(&summary);
        }
        Commands::InitSchema => {
            let store = connect(&config).await?;
            store.init_schema().await.context("initializing schema")?;
            println!("schema ready");
        }
        Commands::LastAlert => {
            let store = connect(&config).await?;
            match store.latest_alert().await.context("reading alerts")? {
                Some(alert) => println!("{}", serde_json::to_string_pretty(&alert)?),
                None => println!("no alerts recorded"),
            }
        }
    }

    Ok(())
}
