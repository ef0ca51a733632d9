//! Run orchestration for JTT: configuration, the ingestion pipeline, the
//! delivery worker and run reports.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use jtt_portal::{ChallengeSolver, HttpConnector, OpenAiSolver, TargetSpec};
use jtt_storage::{AirtableSink, JsonClient, MemorySink, RecordSink, RunOutputStore};
use tracing::{info, warn};

mod config;
mod delivery;
mod pipeline;
mod report;

pub use config::{SyncConfig, TargetConfig, TargetRegistry};
pub use delivery::{
    upsert_merge, DeliveryCommand, DeliveryError, DeliveryStats, DeliveryWorker, UpsertOutcome,
};
pub use pipeline::{
    IngestionPipeline, RunReport, SkippedEntity, TargetReport, TargetRun, TargetStatus, ABORTED_REASON,
};
pub use report::{render_summary, write_run_reports};

pub const CRATE_NAME: &str = "jtt-sync";

#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub refresh: bool,
    /// Restrict the run to these target names; empty means every usable target.
    pub only: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub report: RunReport,
    pub delivery: DeliveryStats,
    pub reports_dir: PathBuf,
}

/// Airtable when both credentials are present, otherwise an in-process sink.
pub fn build_sink(config: &SyncConfig) -> Result<Arc<dyn RecordSink>> {
    match config.airtable_config() {
        Some(airtable) => {
            let http = JsonClient::new(&jtt_storage::HttpClientConfig {
                cookie_store: false,
                xhr_headers: false,
                ..config.http_config()
            })?;
            Ok(Arc::new(AirtableSink::new(airtable, http)))
        }
        None => {
            warn!("Airtable credentials not set; records are only written to run files");
            Ok(Arc::new(MemorySink::new()))
        }
    }
}

pub async fn run_from_config(config: &SyncConfig, request: &RunRequest) -> Result<RunSummary> {
    let registry = TargetRegistry::load(&config.config_path).await?;
    let selected = registry.select(&request.only);
    config.validate(&selected)?;
    let specs: Vec<TargetSpec> = selected.iter().map(|t| t.spec(config.page_size)).collect();
    info!(targets = specs.len(), refresh = request.refresh, "run starting");

    let solver: Arc<dyn ChallengeSolver> =
        Arc::new(OpenAiSolver::new(config.openai_config(), &config.http_config())?);
    let connector = Arc::new(HttpConnector::new(config.http_config(), solver));
    let pipeline = IngestionPipeline::new(
        connector,
        RunOutputStore::new(config.output_dir.clone()),
        config.entity_delay,
    )
    .with_refresh(request.refresh);

    let delivery = DeliveryWorker::spawn(build_sink(config)?, config.sink_delay);
    let report = pipeline
        .run(&specs, Utc::now().date_naive(), &delivery)
        .await
        .context("streaming records to delivery")?;
    let stats = delivery.drain().await.context("draining delivery")?;
    let reports_dir = write_run_reports(&config.reports_dir, &report, Some(&stats)).await?;

    Ok(RunSummary {
        report,
        delivery: stats,
        reports_dir,
    })
}

/// Streams a saved `results.json` into the configured sink.
pub async fn replay_from_config(config: &SyncConfig, path: &Path) -> Result<DeliveryStats> {
    if config.airtable_config().is_none() {
        bail!("replay needs JTT_AIRTABLE_API_KEY and JTT_AIRTABLE_BASE_KEY");
    }
    let output = RunOutputStore::load_run_output(path).await?;
    info!(records = output.record_count(), path = %path.display(), "replaying run output");
    replay(output.records(), build_sink(config)?, config.sink_delay).await
}

pub async fn replay<'a>(
    records: impl IntoIterator<Item = &'a jtt_core::IngestionRecord>,
    sink: Arc<dyn RecordSink>,
    pacing: std::time::Duration,
) -> Result<DeliveryStats> {
    let delivery = DeliveryWorker::spawn(sink, pacing);
    for record in records {
        delivery.enqueue(record.clone())?;
    }
    Ok(delivery.drain().await?)
}
