//! Delivery worker: a FIFO queue in front of the record sink, drained by one
//! task at the sink's own pace.

use std::sync::Arc;
use std::time::Duration;

use jtt_core::{non_empty_fields, IngestionRecord, SinkRow};
use jtt_storage::{RecordSink, SinkError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Messages accepted by the consumption task.
#[derive(Debug)]
pub enum DeliveryCommand {
    Record(Box<IngestionRecord>),
    /// Acknowledged once every command queued before it has been handled.
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryStats {
    /// Records whose every row reached the sink.
    pub delivered: usize,
    pub inserted: usize,
    pub updated: usize,
    /// Records with at least one dropped row.
    pub failed: usize,
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("delivery worker has stopped")]
    Stopped,
    #[error("delivery worker crashed: {0}")]
    Crashed(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// The queue is unbounded: the producer never waits on the sink, and the
/// consumer drains as fast as its pacing allows.
#[derive(Debug)]
pub struct DeliveryWorker {
    tx: mpsc::UnboundedSender<DeliveryCommand>,
    handle: JoinHandle<DeliveryStats>,
}

impl DeliveryWorker {
    /// Spawns the consumption task; `pacing` precedes every sink call.
    pub fn spawn(sink: Arc<dyn RecordSink>, pacing: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(consume(rx, sink, pacing));
        Self { tx, handle }
    }

    pub fn enqueue(&self, record: IngestionRecord) -> Result<(), DeliveryError> {
        self.tx
            .send(DeliveryCommand::Record(Box::new(record)))
            .map_err(|_| DeliveryError::Stopped)
    }

    /// Waits until everything enqueued so far has been written or dropped.
    pub async fn flush(&self) -> Result<(), DeliveryError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(DeliveryCommand::Flush(done_tx))
            .map_err(|_| DeliveryError::Stopped)?;
        done_rx.await.map_err(|_| DeliveryError::Stopped)
    }

    /// Closes the queue and waits for the consumer to finish the backlog.
    pub async fn drain(self) -> Result<DeliveryStats, DeliveryError> {
        drop(self.tx);
        let stats = self.handle.await?;
        info!(
            delivered = stats.delivered,
            inserted = stats.inserted,
            updated = stats.updated,
            failed = stats.failed,
            "delivery drained"
        );
        Ok(stats)
    }
}

async fn consume(
    mut rx: mpsc::UnboundedReceiver<DeliveryCommand>,
    sink: Arc<dyn RecordSink>,
    pacing: Duration,
) -> DeliveryStats {
    let mut stats = DeliveryStats::default();
    while let Some(command) = rx.recv().await {
        match command {
            DeliveryCommand::Record(record) => deliver(sink.as_ref(), pacing, &record, &mut stats).await,
            DeliveryCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    stats
}

async fn deliver(
    sink: &dyn RecordSink,
    pacing: Duration,
    record: &IngestionRecord,
    stats: &mut DeliveryStats,
) {
    let mut dropped = 0usize;
    for row in record.sink_rows() {
        let key = row.key.clone();
        match upsert_merge(sink, pacing, row).await {
            Ok(UpsertOutcome::Inserted) => stats.inserted += 1,
            Ok(UpsertOutcome::Updated) => stats.updated += 1,
            Err(err) => {
                dropped += 1;
                warn!(key = %key, error = %err, "sink write failed; row dropped");
            }
        }
    }
    if dropped == 0 {
        stats.delivered += 1;
        debug!(key = %record.sink_key(), "record delivered");
    } else {
        stats.failed += 1;
    }
}

/// Insert when the key is new; otherwise update with the non-empty incoming
/// fields only, so stored values are never blanked.
pub async fn upsert_merge(
    sink: &dyn RecordSink,
    pacing: Duration,
    row: SinkRow,
) -> Result<UpsertOutcome, SinkError> {
    tokio::time::sleep(pacing).await;
    let existing = sink.find_by_key(row.table, &row.key).await?;
    tokio::time::sleep(pacing).await;
    match existing {
        None => {
            sink.insert(row.table, row.fields).await?;
            Ok(UpsertOutcome::Inserted)
        }
        Some(entry) => {
            sink.update(row.table, &entry.id, non_empty_fields(&row.fields))
                .await?;
            Ok(UpsertOutcome::Updated)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use jtt_core::{EntityDetail, EntitySummary, FieldMap, SinkTable, KEY_FIELD};
    use jtt_storage::{MemorySink, SinkEntry, TransportError};
    use serde_json::json;

    fn record(id: &str, detail: &[(&str, &str)]) -> IngestionRecord {
        IngestionRecord {
            target: "Hancock_County_MS".into(),
            identifier: id.into(),
            fetched_at: Utc::now(),
            detail: EntityDetail::from_pairs(detail.iter().copied()),
            cases: vec![],
            charges: vec![],
            holds: vec![],
            summary: EntitySummary::new(id),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn merge_never_blanks_stored_fields() {
        let sink = Arc::new(MemorySink::new());
        let mut seeded = FieldMap::new();
        seeded.insert(KEY_FIELD.into(), json!("Hancock_County_MS/A1"));
        seeded.insert("phone".into(), json!("555-0001"));
        seeded.insert("address".into(), json!(""));
        sink.insert(SinkTable::Intakes, seeded).await.unwrap();

        let worker = DeliveryWorker::spawn(sink.clone(), Duration::from_millis(200));
        worker
            .enqueue(record("A1", &[("phone", ""), ("address", "123 Main")]))
            .unwrap();
        let stats = worker.drain().await.unwrap();

        assert_eq!(stats.updated, 1);
        assert_eq!(stats.inserted, 0);
        let stored = sink
            .get(SinkTable::Intakes, "Hancock_County_MS/A1")
            .await
            .unwrap();
        assert_eq!(stored.fields["phone"], json!("555-0001"));
        assert_eq!(stored.fields["address"], json!("123 Main"));
        assert_eq!(sink.entries(SinkTable::Intakes).await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn applying_a_record_twice_is_idempotent() {
        let sink = Arc::new(MemorySink::new());
        let worker = DeliveryWorker::spawn(sink.clone(), Duration::from_millis(200));
        let mut rec = record("A1", &[("phone", "555-0001"), ("address", "")]);
        rec.cases.push(FieldMap::from([("caseNo".to_string(), json!("24-001"))]));

        worker.enqueue(rec.clone()).unwrap();
        worker.flush().await.unwrap();
        let once = (
            sink.entries(SinkTable::Intakes).await,
            sink.entries(SinkTable::Cases).await,
        );

        worker.enqueue(rec).unwrap();
        let stats = worker.drain().await.unwrap();
        let twice = (
            sink.entries(SinkTable::Intakes).await,
            sink.entries(SinkTable::Cases).await,
        );

        assert_eq!(once, twice);
        assert_eq!(stats.inserted, 2);
        assert_eq!(stats.updated, 2);
        assert_eq!(stats.delivered, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reordered_cases_update_their_own_rows() {
        let sink = Arc::new(MemorySink::new());
        let worker = DeliveryWorker::spawn(sink.clone(), Duration::from_millis(200));
        let case_x = FieldMap::from([
            ("caseNo".to_string(), json!("X-1")),
            ("bondAmount".to_string(), json!(500)),
        ]);
        let case_y = FieldMap::from([("caseNo".to_string(), json!("Y-2"))]);

        let mut first = record("A1", &[]);
        first.cases = vec![case_x.clone()];
        worker.enqueue(first).unwrap();
        worker.flush().await.unwrap();
        let stored_x = sink
            .get(SinkTable::Cases, "Hancock_County_MS/A1/case/X-1")
            .await
            .unwrap();

        let mut second = record("A1", &[]);
        second.cases = vec![case_y, case_x];
        worker.enqueue(second).unwrap();
        worker.drain().await.unwrap();

        let x = sink
            .get(SinkTable::Cases, "Hancock_County_MS/A1/case/X-1")
            .await
            .unwrap();
        assert_eq!(x.fields, stored_x.fields);
        assert_eq!(x.fields["caseNo"], json!("X-1"));
        let y = sink
            .get(SinkTable::Cases, "Hancock_County_MS/A1/case/Y-2")
            .await
            .unwrap();
        assert!(!y.fields.contains_key("bondAmount"));
        assert_eq!(sink.entries(SinkTable::Cases).await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn records_reach_the_sink_in_queue_order() {
        let sink = Arc::new(MemorySink::new());
        let worker = DeliveryWorker::spawn(sink.clone(), Duration::from_millis(200));
        for id in ["A3", "A1", "A2"] {
            worker.enqueue(record(id, &[("name", id)])).unwrap();
        }
        worker.drain().await.unwrap();

        let keys: Vec<String> = sink.write_log().await.into_iter().map(|(_, k)| k).collect();
        assert_eq!(
            keys,
            vec![
                "Hancock_County_MS/A3",
                "Hancock_County_MS/A1",
                "Hancock_County_MS/A2"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn flush_is_a_barrier() {
        let sink = Arc::new(MemorySink::new());
        let worker = DeliveryWorker::spawn(sink.clone(), Duration::from_secs(1));
        for id in ["A1", "A2", "A3"] {
            worker.enqueue(record(id, &[])).unwrap();
        }
        let before = tokio::time::Instant::now();
        worker.flush().await.unwrap();

        assert_eq!(sink.entries(SinkTable::Intakes).await.len(), 3);
        // two paced calls per row: lookup, then write
        assert!(before.elapsed() >= Duration::from_secs(6));
        worker.drain().await.unwrap();
    }

    /// Fails every insert for one table, succeeds elsewhere.
    struct FailingCases(MemorySink);

    #[async_trait]
    impl RecordSink for FailingCases {
        async fn find_by_key(&self, table: SinkTable, key: &str) -> Result<Option<SinkEntry>, SinkError> {
            self.0.find_by_key(table, key).await
        }

        async fn insert(&self, table: SinkTable, fields: FieldMap) -> Result<SinkEntry, SinkError> {
            if table == SinkTable::Cases {
                return Err(TransportError::HttpStatus {
                    status: 429,
                    url: "https://api.airtable.com/v0/app/cases".into(),
                }
                .into());
            }
            self.0.insert(table, fields).await
        }

        async fn update(&self, table: SinkTable, id: &str, fields: FieldMap) -> Result<SinkEntry, SinkError> {
            self.0.update(table, id, fields).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_rows_are_dropped_and_the_rest_still_written() {
        let sink = Arc::new(FailingCases(MemorySink::new()));
        let worker = DeliveryWorker::spawn(sink.clone(), Duration::from_millis(200));
        let mut rec = record("A1", &[("name", "DOE")]);
        rec.cases.push(FieldMap::new());
        rec.charges.push(FieldMap::from([("chargeDescription".to_string(), json!("DUI"))]));
        worker.enqueue(rec).unwrap();
        worker.enqueue(record("A2", &[])).unwrap();
        let stats = worker.drain().await.unwrap();

        assert_eq!(stats.failed, 1);
        assert_eq!(stats.delivered, 1);
        assert_eq!(sink.0.entries(SinkTable::Charges).await.len(), 1);
        assert_eq!(sink.0.entries(SinkTable::Intakes).await.len(), 2);
    }
}
