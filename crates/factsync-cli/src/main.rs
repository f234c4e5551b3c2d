use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use factsync_storage::PgFactStore;
use factsync_sync::{build_pipeline_from_env, build_scheduler, report_recent_runs_markdown, SyncConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "factsync")]
#[command(about = "Reconcile a remote fact feed into the stored fact corpus")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the feed and apply the reconciliation batch.
    Sync,
    /// Fetch the feed and print the batch a sync would apply.
    Plan,
    /// Create or upgrade the facts table.
    Migrate,
    /// Run sync on the configured cron until interrupted.
    Schedule,
    /// Summarize recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let pipeline = match build_pipeline_from_env().await {
                Ok(pipeline) => pipeline,
                Err(err) => {
                    error!(stage = "setup", error = ?err, "sync run aborted");
                    return Ok(());
                }
            };
            if let Some(summary) = pipeline.run_logged().await {
                println!(
                    "sync complete: run_id={} incoming={} inserts={} updates={} soft_deletes={}",
                    summary.run_id,
                    summary.incoming_facts,
                    summary.planned_inserts,
                    summary.planned_updates,
                    summary.planned_soft_deletes
                );
            }
        }
        Commands::Plan => {
            let pipeline = match build_pipeline_from_env().await {
                Ok(pipeline) => pipeline,
                Err(err) => {
                    error!(stage = "setup", error = ?err, "plan aborted");
                    return Ok(());
                }
            };
            match pipeline.plan().await {
                Ok(planned) => {
                    for update in &planned.batch.updates {
                        println!(
                            "would update: {:?} -> {:?} (similarity {:.2})",
                            update.matched_text, update.text, update.similarity
                        );
                    }
                    for insert in &planned.batch.inserts {
                        println!("would insert: {:?}", insert.text);
                    }
                    for text in &planned.batch.soft_deletes {
                        println!("would soft delete: {text:?}");
                    }
                }
                Err(err) => error!(stage = err.stage(), error = %err, "plan aborted"),
            }
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = PgFactStore::connect(&config.database_url)
                .await
                .context("connecting to fact store")?;
            store.migrate().await.context("running migrations")?;
        }
        Commands::Schedule => {
            let pipeline = match build_pipeline_from_env().await {
                Ok(pipeline) => Arc::new(pipeline),
                Err(err) => {
                    error!(stage = "setup", error = ?err, "scheduler not started");
                    return Ok(());
                }
            };
            let cron = pipeline.config().sync_cron.clone();
            let mut sched = build_scheduler(pipeline).await?;
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Report { runs } => {
            let reports_dir = SyncConfig::from_env()
                .reports_dir
                .unwrap_or_else(|| PathBuf::from("./reports"));
            println!("{}", report_recent_runs_markdown(runs, &reports_dir)?);
        }
    }

    Ok(())
}
