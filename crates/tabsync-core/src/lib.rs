//! Core data model and run provenance types for tabsync.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tabsync-core";

/// Hard upper bound on rows per upsert batch, for both script and network sinks.
pub const MAX_BATCH_SIZE: usize = 1000;

static NULL: Value = Value::Null;

/// Typed cell value carried from normalization through to the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Integer(i64),
    Decimal(f64),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn text(value: impl Into<String>) -> Self {
        Value::Text(value.into())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Decimal(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Decimal(f) => Some(*f),
            _ => None,
        }
    }

    /// Plain-text rendering used for pattern matching; `None` for null.
    pub fn render(&self) -> Option<String> {
        match self {
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Decimal(d) => write!(f, "{d}"),
            Value::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Decimal(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Ordered column-label -> cell mapping exactly as a source produced it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    fields: Vec<(String, Option<String>)>,
}

impl RawRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, label: impl Into<String>, value: Option<String>) {
        self.fields.push((label.into(), value));
    }

    pub fn with(mut self, label: impl Into<String>, value: Option<&str>) -> Self {
        self.push(label, value.map(ToString::to_string));
        self
    }

    /// Value under an exact label; absent and empty cells both read as `None`.
    pub fn get(&self, label: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(l, _)| l == label)
            .and_then(|(_, v)| v.as_deref())
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(l, _)| l.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.fields.iter().map(|(l, v)| (l.as_str(), v.as_deref()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Rows from one source plus the header row it declared, which survives an empty body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<RawRecord>,
}

impl RawTable {
    pub fn new(headers: Vec<String>, rows: Vec<RawRecord>) -> Self {
        Self { headers, rows }
    }

    /// For sources without a header row: headers are every label seen, first occurrence order.
    pub fn from_rows(rows: Vec<RawRecord>) -> Self {
        let mut headers: Vec<String> = Vec::new();
        for label in rows.iter().flat_map(RawRecord::labels) {
            if !headers.iter().any(|h| h == label) {
                headers.push(label.to_string());
            }
        }
        Self { headers, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl FromIterator<(String, Option<String>)> for RawRecord {
    fn from_iter<I: IntoIterator<Item = (String, Option<String>)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// Record with a fixed field set: a non-null key plus every declared field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub key: String,
    pub fields: BTreeMap<String, Value>,
}

impl NormalizedRecord {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn get(&self, field: &str) -> &Value {
        self.fields.get(field).unwrap_or(&NULL)
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(field.into(), value.into());
    }
}

/// Output of the normalizer for one source dataset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedDataset {
    pub name: String,
    pub key_field: String,
    /// Declared non-key fields; every record carries each of them.
    pub fields: Vec<String>,
    pub records: Vec<NormalizedRecord>,
    pub duplicates_dropped: usize,
    pub missing_keys: usize,
    /// Output field -> source header it was read from.
    pub resolved_columns: BTreeMap<String, String>,
}

impl NormalizedDataset {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Left join of one primary dataset against zero or more secondaries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedDataset {
    pub key_field: String,
    pub fields: Vec<String>,
    pub records: Vec<NormalizedRecord>,
    /// Secondary dataset name -> primary rows that found a populated match.
    pub match_counts: BTreeMap<String, usize>,
}

impl MergedDataset {
    pub fn total_rows(&self) -> usize {
        self.records.len()
    }

    /// Rows whose `field` is non-null.
    pub fn populated(&self, field: &str) -> usize {
        if field == self.key_field {
            return self.records.len();
        }
        self.records
            .iter()
            .filter(|r| !r.get(field).is_null())
            .count()
    }
}

/// Whether persisted rows came from real sources or the fallback generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Real,
    Synthetic,
}

/// Run-level attribute that a table can persist alongside every row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunAttribute {
    RunId,
    VersionLabel,
    PulledAt,
    SourceUrls,
    IsMock,
}

/// Process-scoped metadata for one pipeline invocation. Built once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncRun {
    pub run_id: Uuid,
    pub job_id: String,
    pub version_label: String,
    pub started_at: DateTime<Utc>,
    pub source_urls: BTreeMap<String, String>,
    pub provenance: Provenance,
}

impl SyncRun {
    pub fn new(
        job_id: impl Into<String>,
        version_label: impl Into<String>,
        source_urls: BTreeMap<String, String>,
        provenance: Provenance,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            job_id: job_id.into(),
            version_label: version_label.into(),
            started_at: Utc::now(),
            source_urls,
            provenance,
        }
    }

    /// Copy of this run flagged as synthetic; keeps id and timestamp.
    pub fn as_synthetic(&self) -> Self {
        Self {
            provenance: Provenance::Synthetic,
            ..self.clone()
        }
    }

    pub fn is_synthetic(&self) -> bool {
        self.provenance == Provenance::Synthetic
    }

    pub fn attribute(&self, attribute: RunAttribute) -> Value {
        match attribute {
            RunAttribute::RunId => Value::Text(self.run_id.to_string()),
            RunAttribute::VersionLabel => Value::Text(self.version_label.clone()),
            RunAttribute::PulledAt => {
                Value::Text(self.started_at.to_rfc3339_opts(SecondsFormat::Micros, true))
            }
            RunAttribute::SourceUrls => Value::Text(
                serde_json::to_string(&self.source_urls).unwrap_or_else(|_| "{}".to_string()),
            ),
            RunAttribute::IsMock => Value::Bool(self.is_synthetic()),
        }
    }
}

/// One destination row, restricted to the table's allow-listed columns.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct UpsertRecord {
    pub columns: BTreeMap<String, Value>,
}

impl UpsertRecord {
    pub fn get(&self, column: &str) -> &Value {
        self.columns.get(column).unwrap_or(&NULL)
    }
}

/// Bounded, ordered unit of work for a sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpsertBatch {
    pub index: usize,
    pub table: String,
    pub conflict_key: String,
    pub rows: Vec<UpsertRecord>,
}

impl UpsertBatch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Value> {
        self.rows.iter().map(|r| r.get(&self.conflict_key))
    }
}
