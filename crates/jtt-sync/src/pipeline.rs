use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use jtt_core::{IngestionRecord, RunOutput};
use jtt_portal::{EntityFetcher, SessionConnector, TargetSpec};
use jtt_storage::RunOutputStore;
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::delivery::{DeliveryError, DeliveryWorker};

pub const ABORTED_REASON: &str = "target aborted";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TargetStatus {
    Completed,
    /// Served from a same-day run file; the portal was not contacted.
    Cached,
    Aborted { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedEntity {
    pub identifier: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetReport {
    pub target: String,
    #[serde(flatten)]
    pub status: TargetStatus,
    pub listed: usize,
    /// Detail fetches actually issued.
    pub attempted: usize,
    pub succeeded: usize,
    pub skipped: Vec<SkippedEntity>,
    pub output_path: Option<PathBuf>,
}

impl TargetReport {
    fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            status: TargetStatus::Completed,
            listed: 0,
            attempted: 0,
            succeeded: 0,
            skipped: Vec::new(),
            output_path: None,
        }
    }

    fn aborted(mut self, reason: impl Into<String>) -> Self {
        self.status = TargetStatus::Aborted {
            reason: reason.into(),
        };
        self
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self.status, TargetStatus::Aborted { .. })
    }
}

#[derive(Debug, Clone)]
pub struct TargetRun {
    pub report: TargetReport,
    pub records: Vec<IngestionRecord>,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub targets: Vec<TargetReport>,
    pub output: RunOutput,
}

/// Walks each target's listing, one entity at a time, streaming finished
/// records to delivery.
pub struct IngestionPipeline {
    connector: Arc<dyn SessionConnector>,
    fetcher: EntityFetcher,
    store: RunOutputStore,
    entity_delay: Duration,
    refresh: bool,
}

impl IngestionPipeline {
    pub fn new(connector: Arc<dyn SessionConnector>, store: RunOutputStore, entity_delay: Duration) -> Self {
        Self {
            connector,
            fetcher: EntityFetcher::new(),
            store,
            entity_delay,
            refresh: false,
        }
    }

    /// Crawl even when a same-day run file exists.
    pub fn with_refresh(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }

    pub fn with_fetcher(mut self, fetcher: EntityFetcher) -> Self {
        self.fetcher = fetcher;
        self
    }

    /// Runs targets one after another. A session-fatal error only ends its own target.
    pub async fn run(
        &self,
        targets: &[TargetSpec],
        run_date: NaiveDate,
        delivery: &DeliveryWorker,
    ) -> Result<RunReport, DeliveryError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut output = RunOutput::default();
        let mut reports = Vec::with_capacity(targets.len());

        for target in targets {
            let run = self.run_target(target, run_date, delivery).await?;
            output.insert(target.name.clone(), run.records);
            reports.push(run.report);
        }

        Ok(RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            targets: reports,
            output,
        })
    }

    pub async fn run_target(
        &self,
        target: &TargetSpec,
        run_date: NaiveDate,
        delivery: &DeliveryWorker,
    ) -> Result<TargetRun, DeliveryError> {
        let span = info_span!("target_run", jail = %target.name, strategy = ?target.strategy);
        async move {
            if !self.refresh {
                if let Some(run) = self.from_cache(target, run_date, delivery).await? {
                    return Ok(run);
                }
            }
            let mut run = self.crawl(target, delivery).await?;
            if !run.report.is_aborted() {
                match self.store.save_target(&target.name, run_date, &run.records).await {
                    Ok(path) => run.report.output_path = Some(path),
                    Err(err) => warn!(error = %format!("{err:#}"), "could not save run file"),
                }
            }
            info!(
                listed = run.report.listed,
                succeeded = run.report.succeeded,
                skipped = run.report.skipped.len(),
                aborted = run.report.is_aborted(),
                "target finished"
            );
            Ok(run)
        }
        .instrument(span)
        .await
    }

    async fn from_cache(
        &self,
        target: &TargetSpec,
        run_date: NaiveDate,
        delivery: &DeliveryWorker,
    ) -> Result<Option<TargetRun>, DeliveryError> {
        let records = match self.store.load_cached(&target.name, run_date).await {
            Ok(Some(records)) => records,
            Ok(None) => return Ok(None),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "unreadable run file; crawling instead");
                return Ok(None);
            }
        };
        info!(records = records.len(), "cache hit; portal not contacted");
        for record in &records {
            delivery.enqueue(record.clone())?;
        }
        let mut report = TargetReport::new(&target.name);
        report.status = TargetStatus::Cached;
        report.listed = records.len();
        report.succeeded = records.len();
        report.output_path = Some(self.store.target_path(&target.name, run_date));
        Ok(Some(TargetRun { report, records }))
    }

    async fn crawl(&self, target: &TargetSpec, delivery: &DeliveryWorker) -> Result<TargetRun, DeliveryError> {
        let mut report = TargetReport::new(&target.name);
        let mut records = Vec::new();

        let mut session = match self.connector.connect(target).await {
            Ok(session) => session,
            Err(err) => {
                warn!(error = %err, "could not open session; target aborted");
                return Ok(TargetRun {
                    report: report.aborted(err.to_string()),
                    records,
                });
            }
        };
        let listing = match self.fetcher.listing(session.as_mut()).await {
            Ok(listing) => listing,
            Err(err) => {
                warn!(error = %err, "listing unavailable; target aborted");
                session.terminate();
                return Ok(TargetRun {
                    report: report.aborted(err.to_string()),
                    records,
                });
            }
        };
        report.listed = listing.entities.len();

        let mut abort_reason = None;
        let mut remaining = listing.entities.iter();
        for summary in remaining.by_ref() {
            report.attempted += 1;
            match self.fetcher.fetch(session.as_mut(), summary).await {
                Ok(record) => {
                    delivery.enqueue(record.clone())?;
                    records.push(record);
                    report.succeeded += 1;
                }
                Err(err) => {
                    warn!(identifier = %err.identifier, reason = %err.source, "entity skipped");
                    report.skipped.push(SkippedEntity {
                        identifier: err.identifier.clone(),
                        reason: err.source.to_string(),
                    });
                    if err.is_session_fatal() {
                        abort_reason = Some(err.source.to_string());
                        break;
                    }
                }
            }
            tokio::time::sleep(self.entity_delay).await;
        }

        if let Some(reason) = abort_reason {
            let rest: Vec<_> = remaining
                .map(|summary| SkippedEntity {
                    identifier: summary.identifier.clone(),
                    reason: ABORTED_REASON.to_string(),
                })
                .collect();
            if !rest.is_empty() {
                warn!(count = rest.len(), "remaining entities skipped after session failure");
            }
            report.skipped.extend(rest);
            report = report.aborted(reason);
        }
        session.terminate();
        Ok(TargetRun { report, records })
    }
}
