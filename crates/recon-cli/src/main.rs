use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use recon_core::MatchType;
use recon_sync::{
    load_field_map, run_compare, run_compare_from_env, run_sync, run_sync_from_env, CompareRun,
    ReconcilePipeline, RunReporter, SyncConfig, SyncRun,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "recon")]
#[command(about = "Reconcile portal deals against CRM opportunities")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch both sides and report differences. Read-only.
    Compare {
        /// Read portal_records.json / remote_records.json from this directory
        /// instead of calling the live APIs.
        #[arg(long)]
        fixtures: Option<PathBuf>,
        /// Print the full comparison as JSON on stdout.
        #[arg(long)]
        json: bool,
    },
    /// Push CRM values onto every matched portal record that differs.
    Sync {
        #[arg(long)]
        fixtures: Option<PathBuf>,
    },
    /// Sync a single portal record by id.
    SyncOne {
        #[arg(long)]
        record: String,
        #[arg(long)]
        fixtures: Option<PathBuf>,
    },
    /// Load and validate the field map without touching either system.
    ValidateMapping {
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn pipeline(config: SyncConfig, fixtures: Option<PathBuf>) -> Result<ReconcilePipeline> {
    match fixtures {
        Some(dir) => ReconcilePipeline::from_fixtures(config, dir),
        None => ReconcilePipeline::from_config(config),
    }
}

fn print_compare(run: &CompareRun) {
    println!(
        "compare complete: run_id={} records={} id_match={} contact_match={} no_match={} needing_sync={}",
        run.run_id,
        run.results.len(),
        run.count(MatchType::IdMatch),
        run.count(MatchType::ContactMatch),
        run.count(MatchType::NoMatch),
        run.needing_sync()
    );
}

fn print_sync(run: &SyncRun) {
    let summary = &run.summary;
    let remaining = run
        .remaining_differences
        .map_or_else(|| "unknown".to_string(), |n| n.to_string());
    println!(
        "sync complete: run_id={} attempted={} succeeded={} failed={} skipped={} remaining={}",
        run.run_id,
        summary.total,
        summary.succeeded,
        summary.failed,
        summary.skipped,
        remaining
    );
    if let Some(err) = &run.convergence_error {
        println!("  post-sync re-fetch failed: {err}");
    }
    for failure in &summary.failures {
        println!("  failed {}: {}", failure.record_id, failure.error);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Compare {
        fixtures: None,
        json: false,
    }) {
        Commands::Compare { fixtures, json } => {
            let (run, dir) = match fixtures {
                Some(dir) => run_compare(&ReconcilePipeline::from_fixtures(config, dir)?).await?,
                None => run_compare_from_env().await?,
            };
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&run.results).context("serializing results")?
                );
            } else {
                print_compare(&run);
            }
            info!(reports = %dir.display(), "reports written");
        }
        Commands::Sync { fixtures } => {
            let mut reporter = RunReporter::new();
            let mut progress = reporter.subscribe();
            tokio::spawn(async move {
                while progress.changed().await.is_ok() {
                    let p = progress.borrow_and_update().clone();
                    if p.current > 0 {
                        eprintln!("[{}/{}] {}", p.current, p.total, p.current_record_label);
                    }
                }
            });

            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; stopping after the current record");
                    on_interrupt.cancel();
                }
            });

            let (run, dir) = match fixtures {
                Some(dir) => {
                    let pipeline = ReconcilePipeline::from_fixtures(config, dir)?;
                    run_sync(&pipeline, &mut reporter, &cancel).await?
                }
                None => run_sync_from_env(&mut reporter, &cancel).await?,
            };
            print_sync(&run);
            info!(reports = %dir.display(), "reports written");
            if run.summary.failed > 0 {
                bail!("{} record(s) failed to sync", run.summary.failed);
            }
        }
        Commands::SyncOne { record, fixtures } => {
            let pipeline = pipeline(config, fixtures)?;
            let outcome = pipeline.sync_one(&record).await?;
            match (outcome.success, outcome.error) {
                (true, _) if outcome.applied_fields.is_empty() => {
                    println!("{record}: already in sync");
                }
                (true, _) => {
                    println!("{record}: updated {}", outcome.applied_fields.join(", "));
                }
                (false, error) => {
                    bail!(
                        "{record}: update failed: {}",
                        error.unwrap_or_else(|| "unknown error".to_string())
                    );
                }
            }
        }
        Commands::ValidateMapping { path } => {
            let path = path.unwrap_or(config.field_map_path);
            let map = load_field_map(&path)?;
            println!(
                "{}: {} mappings, label field {}",
                path.display(),
                map.mappings.len(),
                map.label_field().unwrap_or("(record id)")
            );
        }
    }

    Ok(())
}
