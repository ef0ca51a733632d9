//! Core domain model for JTT: listing rows, entity detail, sub-resources and the
//! records handed from the ingestion pipeline to delivery.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "jtt-core";

/// Field every sink row is matched on across runs.
pub const KEY_FIELD: &str = "jtt_id";

/// Field linking case/charge rows back to their intake row.
pub const INTAKE_LINK_FIELD: &str = "intake";

/// Loosely typed portal object, kept in the shape the portal returned it.
pub type FieldMap = BTreeMap<String, JsonValue>;

/// Lightweight listing row. The identifier names one intake event, not one person:
/// the same person can show up again under a later identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySummary {
    pub identifier: String,
    #[serde(default)]
    pub fields: FieldMap,
}

impl EntitySummary {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            fields: FieldMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// Flat key/value view of one entity, built from the portal's `{field, value}` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityDetail {
    fields: BTreeMap<String, String>,
}

impl EntityDetail {
    pub fn new() -> Self {
        Self::default()
    }

    /// Later pairs win when a label repeats.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut detail = Self::new();
        for (k, v) in pairs {
            detail.insert(k, v);
        }
        detail
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let key = key.trim();
        if key.is_empty() {
            return;
        }
        self.fields.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubResourceKind {
    Cases,
    Charges,
}

impl SubResourceKind {
    pub const ALL: [SubResourceKind; 2] = [SubResourceKind::Cases, SubResourceKind::Charges];

    pub fn as_str(self) -> &'static str {
        match self {
            SubResourceKind::Cases => "cases",
            SubResourceKind::Charges => "charges",
        }
    }

    /// Singular segment used when building per-row sink keys.
    fn row_segment(self) -> &'static str {
        match self {
            SubResourceKind::Cases => "case",
            SubResourceKind::Charges => "charge",
        }
    }

    /// Natural id of one row, so a row keeps its sink key when the portal
    /// reorders or extends the collection between runs.
    fn natural_row_id(self, item: &FieldMap) -> Option<String> {
        match self {
            SubResourceKind::Cases => field_text(item, &["caseNo", "CaseNo"]),
            SubResourceKind::Charges => field_text(
                item,
                &[
                    "chargeId",
                    "ChargeId",
                    "controlNumber",
                    "ControlNumber",
                    "warrantNumber",
                    "WarrantNumber",
                ],
            )
            .or_else(|| {
                let parts: Vec<String> = [
                    field_text(item, &["caseNo", "CaseNo"]),
                    field_text(item, &["chargeDescription", "ChargeDescription"]),
                ]
                .into_iter()
                .flatten()
                .collect();
                (!parts.is_empty()).then(|| parts.join(":"))
            }),
        }
    }
}

impl std::fmt::Display for SubResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One fully assembled entity. Immutable once it is handed to delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionRecord {
    pub target: String,
    pub identifier: String,
    pub fetched_at: DateTime<Utc>,
    pub detail: EntityDetail,
    #[serde(default)]
    pub cases: Vec<FieldMap>,
    #[serde(default)]
    pub charges: Vec<FieldMap>,
    /// Kept with the run output; not written to the sink.
    #[serde(default)]
    pub holds: Vec<FieldMap>,
    pub summary: EntitySummary,
}

impl IngestionRecord {
    /// Stable cross-run key. Identifiers are only unique within one target.
    pub fn sink_key(&self) -> String {
        format!("{}/{}", self.target, self.identifier)
    }

    pub fn collection(&self, kind: SubResourceKind) -> &[FieldMap] {
        match kind {
            SubResourceKind::Cases => &self.cases,
            SubResourceKind::Charges => &self.charges,
        }
    }

    /// Rows in write order: the intake first, then cases, then charges.
    pub fn sink_rows(&self) -> Vec<SinkRow> {
        let key = self.sink_key();
        let mut rows = Vec::with_capacity(1 + self.cases.len() + self.charges.len());

        let mut intake = self.summary.fields.clone();
        for (k, v) in self.detail.iter() {
            intake.insert(k.to_string(), JsonValue::String(v.to_string()));
        }
        intake.insert("target".into(), JsonValue::String(self.target.clone()));
        intake.insert("identifier".into(), JsonValue::String(self.identifier.clone()));
        intake.insert(KEY_FIELD.into(), JsonValue::String(key.clone()));
        rows.push(SinkRow {
            table: SinkTable::Intakes,
            key: key.clone(),
            fields: intake,
        });

        for kind in SubResourceKind::ALL {
            let mut used = HashSet::new();
            for (n, item) in self.collection(kind).iter().enumerate() {
                let id = kind.natural_row_id(item).unwrap_or_else(|| n.to_string());
                let mut row_key = format!("{key}/{}/{id}", kind.row_segment());
                // repeated ids are told apart by occurrence
                let mut occurrence = 1;
                while !used.insert(row_key.clone()) {
                    occurrence += 1;
                    row_key = format!("{key}/{}/{id}~{occurrence}", kind.row_segment());
                }
                let mut fields = item.clone();
                fields.insert(INTAKE_LINK_FIELD.into(), JsonValue::String(key.clone()));
                fields.insert(KEY_FIELD.into(), JsonValue::String(row_key.clone()));
                rows.push(SinkRow {
                    table: SinkTable::from(kind),
                    key: row_key,
                    fields,
                });
            }
        }

        rows
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkTable {
    Intakes,
    Cases,
    Charges,
}

impl SinkTable {
    pub fn table_name(self) -> &'static str {
        match self {
            SinkTable::Intakes => "intakes",
            SinkTable::Cases => "cases",
            SinkTable::Charges => "charges",
        }
    }
}

impl From<SubResourceKind> for SinkTable {
    fn from(kind: SubResourceKind) -> Self {
        match kind {
            SubResourceKind::Cases => SinkTable::Cases,
            SubResourceKind::Charges => SinkTable::Charges,
        }
    }
}

/// One row headed for the record sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkRow {
    pub table: SinkTable,
    pub key: String,
    pub fields: FieldMap,
}

/// First of `names` holding a non-blank string or a number.
fn field_text(item: &FieldMap, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| match item.get(*name)? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// `null` and `""` carry no information and must never overwrite stored data.
pub fn is_empty_value(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::String(s) => s.is_empty(),
        _ => false,
    }
}

pub fn non_empty_fields(fields: &FieldMap) -> FieldMap {
    fields
        .iter()
        .filter(|(_, v)| !is_empty_value(v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Persisted output of one run: target name to records in listing order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunOutput {
    pub targets: BTreeMap<String, Vec<IngestionRecord>>,
}

impl RunOutput {
    pub fn insert(&mut self, target: impl Into<String>, records: Vec<IngestionRecord>) {
        self.targets.insert(target.into(), records);
    }

    pub fn record_count(&self) -> usize {
        self.targets.values().map(Vec::len).sum()
    }

    /// Records in replay order: targets by name, records in listing order.
    pub fn records(&self) -> impl Iterator<Item = &IngestionRecord> {
        self.targets.values().flatten()
    }
}
