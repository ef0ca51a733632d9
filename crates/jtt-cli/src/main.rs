use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use jtt_sync::{RunRequest, SyncConfig, TargetRegistry, TargetStatus};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "jtt")]
#[command(about = "Harvest JailTracker portals into run files and a record sink")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl every usable target (the default).
    Run {
        /// Crawl even when today's run file already exists.
        #[arg(long)]
        refresh: bool,
        /// Only run this target; repeatable.
        #[arg(long = "target", value_name = "NAME")]
        targets: Vec<String>,
    },
    /// Stream a saved results.json into the sink.
    Replay { path: PathBuf },
    /// List the configured targets.
    Targets,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,jtt=debug")))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    let command = cli.command.unwrap_or(Commands::Run {
        refresh: false,
        targets: Vec::new(),
    });
    match command {
        Commands::Run { refresh, targets } => {
            let request = RunRequest {
                refresh,
                only: targets,
            };
            let summary = jtt_sync::run_from_config(&config, &request).await?;
            for target in &summary.report.targets {
                let status = match &target.status {
                    TargetStatus::Completed => "completed".to_string(),
                    TargetStatus::Cached => "cached".to_string(),
                    TargetStatus::Aborted { reason } => format!("aborted: {reason}"),
                };
                println!(
                    "{}: listed={} succeeded={} skipped={} ({status})",
                    target.target,
                    target.listed,
                    target.succeeded,
                    target.skipped.len()
                );
            }
            println!(
                "run complete: run_id={} records={} delivered={} failed={} reports={}",
                summary.report.run_id,
                summary.report.output.record_count(),
                summary.delivery.delivered,
                summary.delivery.failed,
                summary.reports_dir.display()
            );
        }
        Commands::Replay { path } => {
            let stats = jtt_sync::replay_from_config(&config, &path).await?;
            println!(
                "replay complete: delivered={} inserted={} updated={} failed={}",
                stats.delivered, stats.inserted, stats.updated, stats.failed
            );
        }
        Commands::Targets => {
            let registry = TargetRegistry::load(&config.config_path).await?;
            for target in &registry.targets {
                println!(
                    "{}\t{}\t{:?}\t{}\t{}",
                    target.name,
                    target.display_title(),
                    target.strategy,
                    target.spec(config.page_size).base_url,
                    if target.usable { "usable" } else { "unusable" }
                );
            }
        }
    }

    Ok(())
}
