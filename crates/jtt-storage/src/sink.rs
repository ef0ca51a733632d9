//! Durable record sinks. Every sink upserts by the `jtt_id` key field.

use std::collections::BTreeMap;

use async_trait::async_trait;
use jtt_core::{FieldMap, SinkTable, KEY_FIELD};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::{join_url, with_query, JsonClient, TransportError};

/// A row as the sink stores it, addressed by a sink-assigned id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkEntry {
    pub id: String,
    #[serde(default)]
    pub fields: FieldMap,
}

impl SinkEntry {
    pub fn key(&self) -> Option<&str> {
        self.fields.get(KEY_FIELD).and_then(JsonValue::as_str)
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink request failed: {0}")]
    Transport(#[from] TransportError),
    #[error("no {table} entry with id {id}")]
    UnknownEntry { table: &'static str, id: String },
}

#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn find_by_key(&self, table: SinkTable, key: &str) -> Result<Option<SinkEntry>, SinkError>;

    async fn insert(&self, table: SinkTable, fields: FieldMap) -> Result<SinkEntry, SinkError>;

    /// Only the given fields change; everything else on the entry is kept.
    async fn update(&self, table: SinkTable, id: &str, fields: FieldMap) -> Result<SinkEntry, SinkError>;
}

/// In-process sink, also used to stand in for the remote store in tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: u64,
    tables: BTreeMap<SinkTable, Vec<SinkEntry>>,
    write_log: Vec<(SinkTable, String)>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self, table: SinkTable) -> Vec<SinkEntry> {
        let state = self.state.lock().await;
        state.tables.get(&table).cloned().unwrap_or_default()
    }

    pub async fn get(&self, table: SinkTable, key: &str) -> Option<SinkEntry> {
        let state = self.state.lock().await;
        state
            .tables
            .get(&table)
            .and_then(|rows| rows.iter().find(|e| e.key() == Some(key)).cloned())
    }

    /// Keys in the order they were inserted or updated.
    pub async fn write_log(&self) -> Vec<(SinkTable, String)> {
        self.state.lock().await.write_log.clone()
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn find_by_key(&self, table: SinkTable, key: &str) -> Result<Option<SinkEntry>, SinkError> {
        Ok(self.get(table, key).await)
    }

    async fn insert(&self, table: SinkTable, fields: FieldMap) -> Result<SinkEntry, SinkError> {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let entry = SinkEntry {
            id: format!("rec{:05}", state.next_id),
            fields,
        };
        let key = entry.key().unwrap_or_default().to_string();
        state.tables.entry(table).or_default().push(entry.clone());
        state.write_log.push((table, key));
        Ok(entry)
    }

    async fn update(&self, table: SinkTable, id: &str, fields: FieldMap) -> Result<SinkEntry, SinkError> {
        let mut state = self.state.lock().await;
        let entry = state
            .tables
            .get_mut(&table)
            .and_then(|rows| rows.iter_mut().find(|e| e.id == id))
            .ok_or_else(|| SinkError::UnknownEntry {
                table: table.table_name(),
                id: id.to_string(),
            })?;
        entry.fields.extend(fields);
        let entry = entry.clone();
        let key = entry.key().unwrap_or_default().to_string();
        state.write_log.push((table, key));
        Ok(entry)
    }
}

#[derive(Debug, Clone)]
pub struct AirtableConfig {
    pub api_key: String,
    pub base_key: String,
    pub api_url: String,
}

impl AirtableConfig {
    pub const DEFAULT_API_URL: &'static str = "https://api.airtable.com/v0";

    pub fn new(api_key: impl Into<String>, base_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_key: base_key.into(),
            api_url: Self::DEFAULT_API_URL.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AirtableList {
    #[serde(default)]
    records: Vec<SinkEntry>,
}

#[derive(Debug, Serialize)]
struct AirtableWrite<'a> {
    fields: &'a FieldMap,
    typecast: bool,
}

/// Airtable REST sink: one table per `SinkTable`, matched on the key field.
#[derive(Debug, Clone)]
pub struct AirtableSink {
    config: AirtableConfig,
    http: JsonClient,
}

impl AirtableSink {
    pub fn new(config: AirtableConfig, http: JsonClient) -> Self {
        Self { config, http }
    }

    fn table_url(&self, table: SinkTable) -> String {
        join_url(
            &join_url(&self.config.api_url, &self.config.base_key),
            table.table_name(),
        )
    }

    fn auth(&self) -> [(&'static str, String); 1] {
        [("Authorization", format!("Bearer {}", self.config.api_key))]
    }
}

/// Airtable formula matching the key field, with quotes escaped.
pub(crate) fn key_formula(key: &str) -> String {
    let escaped = key.replace('\\', "\\\\").replace('\'', "\\'");
    format!("{{{KEY_FIELD}}}='{escaped}'")
}

#[async_trait]
impl RecordSink for AirtableSink {
    async fn find_by_key(&self, table: SinkTable, key: &str) -> Result<Option<SinkEntry>, SinkError> {
        let formula = key_formula(key);
        let url = with_query(
            &self.table_url(table),
            &[("filterByFormula", formula.as_str()), ("maxRecords", "1")],
        )?;
        let list: AirtableList = self.http.get_json(&url, &self.auth()).await?;
        Ok(list.records.into_iter().next())
    }

    async fn insert(&self, table: SinkTable, fields: FieldMap) -> Result<SinkEntry, SinkError> {
        let body = AirtableWrite {
            fields: &fields,
            typecast: true,
        };
        Ok(self
            .http
            .post_json(&self.table_url(table), &self.auth(), &body)
            .await?)
    }

    async fn update(&self, table: SinkTable, id: &str, fields: FieldMap) -> Result<SinkEntry, SinkError> {
        let body = AirtableWrite {
            fields: &fields,
            typecast: true,
        };
        let url = join_url(&self.table_url(table), id);
        Ok(self.http.patch_json(&url, &self.auth(), &body).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(pairs: &[(&str, JsonValue)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn memory_sink_update_overlays_fields() {
        let sink = MemorySink::new();
        let inserted = sink
            .insert(
                SinkTable::Intakes,
                fields(&[(KEY_FIELD, json!("t/A1")), ("phone", json!("555-0001"))]),
            )
            .await
            .unwrap();
        sink.update(
            SinkTable::Intakes,
            &inserted.id,
            fields(&[("address", json!("123 Main"))]),
        )
        .await
        .unwrap();

        let stored = sink.get(SinkTable::Intakes, "t/A1").await.unwrap();
        assert_eq!(stored.fields["phone"], json!("555-0001"));
        assert_eq!(stored.fields["address"], json!("123 Main"));
        assert_eq!(sink.write_log().await.len(), 2);
    }

    #[tokio::test]
    async fn memory_sink_tables_are_separate() {
        let sink = MemorySink::new();
        sink.insert(SinkTable::Cases, fields(&[(KEY_FIELD, json!("k"))]))
            .await
            .unwrap();
        assert!(sink
            .find_by_key(SinkTable::Intakes, "k")
            .await
            .unwrap()
            .is_none());
        assert!(sink.find_by_key(SinkTable::Cases, "k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn memory_sink_rejects_unknown_ids() {
        let sink = MemorySink::new();
        let err = sink
            .update(SinkTable::Charges, "rec99", FieldMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::UnknownEntry { .. }));
    }

    #[test]
    fn key_formula_escapes_quotes() {
        assert_eq!(key_formula("t/A1"), "{jtt_id}='t/A1'");
        assert_eq!(key_formula("O'Neil"), "{jtt_id}='O\\'Neil'");
    }
}
