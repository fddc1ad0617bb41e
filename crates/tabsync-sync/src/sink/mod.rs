//! Idempotent Sink: plan construction plus the script, network and in-memory backends.

mod network;
mod script;

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Serialize;
use tabsync_core::{MergedDataset, SyncRun, UpsertBatch, UpsertRecord, Value, MAX_BATCH_SIZE};
use tracing::{debug, info, warn};

use crate::config::TableSpec;
use crate::error::UpsertBatchError;

pub use network::{BatchOutcome, CancelFlag, NetworkSink};
pub use script::{render_script, sql_literal, ScriptSink};

/// Everything a sink needs for one run: validated rows already cut into batches.
#[derive(Debug, Clone)]
pub struct UpsertPlan {
    pub run: SyncRun,
    pub table: TableSpec,
    /// Columns present on every row, conflict key first.
    pub columns: Vec<String>,
    pub batches: Vec<UpsertBatch>,
    pub rows_total: usize,
    pub skipped_missing_key: usize,
    pub duplicate_keys: usize,
}

/// Restrict rows to the table's allow-list, attach run metadata, and chunk.
///
/// Rows without a usable key are skipped and counted. Keys are unique across the
/// whole plan so no two batches ever touch the same row.
pub fn prepare_plan(
    run: &SyncRun,
    table: &TableSpec,
    merged: MergedDataset,
    batch_size: usize,
) -> UpsertPlan {
    let batch_size = batch_size.clamp(1, MAX_BATCH_SIZE);
    let available: HashSet<&str> = merged.fields.iter().map(String::as_str).collect();

    let mut columns = vec![table.conflict_key.clone()];
    for column in &table.columns {
        if column.name == table.conflict_key {
            continue;
        }
        if available.contains(column.name.as_str()) {
            columns.push(column.name.clone());
        } else {
            debug!(column = %column.name, "table column not produced by this job; left untouched");
        }
    }
    let dropped: Vec<&str> = merged
        .fields
        .iter()
        .map(String::as_str)
        .filter(|f| !columns.iter().any(|c| c == f))
        .collect();
    if !dropped.is_empty() {
        debug!(fields = ?dropped, "fields outside the table allow-list are not written");
    }

    let metadata: Vec<(String, Value)> = table
        .metadata
        .iter()
        .map(|m| (m.name.clone(), run.attribute(m.attribute)))
        .collect();
    columns.extend(metadata.iter().map(|(name, _)| name.clone()));

    let mut skipped_missing_key = 0;
    let mut duplicate_keys = 0;
    let mut seen = HashSet::with_capacity(merged.records.len());
    let mut rows = Vec::with_capacity(merged.records.len());
    for record in merged.records {
        let key = record.key.trim().to_string();
        if key.is_empty() {
            skipped_missing_key += 1;
            continue;
        }
        if !seen.insert(key.clone()) {
            duplicate_keys += 1;
            continue;
        }
        let mut row = BTreeMap::new();
        row.insert(table.conflict_key.clone(), Value::Text(key));
        for column in columns.iter().skip(1) {
            if let Some(value) = record.fields.get(column) {
                row.insert(column.clone(), value.clone());
            }
        }
        for (name, value) in &metadata {
            row.insert(name.clone(), value.clone());
        }
        for column in &columns {
            row.entry(column.clone()).or_default();
        }
        rows.push(UpsertRecord { columns: row });
    }

    if skipped_missing_key > 0 {
        warn!(skipped_missing_key, "rows without a key were skipped");
    }

    let rows_total = rows.len();
    let mut batches = Vec::with_capacity(rows_total.div_ceil(batch_size));
    let mut rows = rows.into_iter().peekable();
    while rows.peek().is_some() {
        let chunk: Vec<UpsertRecord> = rows.by_ref().take(batch_size).collect();
        batches.push(UpsertBatch {
            index: batches.len(),
            table: table.name.clone(),
            conflict_key: table.conflict_key.clone(),
            rows: chunk,
        });
    }

    info!(
        table = %table.name,
        rows = rows_total,
        batches = batches.len(),
        batch_size,
        "prepared upsert plan"
    );
    UpsertPlan {
        run: run.clone(),
        table: table.clone(),
        columns,
        batches,
        rows_total,
        skipped_missing_key,
        duplicate_keys,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SinkReport {
    pub sink: String,
    pub batches_total: usize,
    pub batches_succeeded: usize,
    pub rows_written: usize,
    pub rows_skipped_missing_key: usize,
    #[serde(skip)]
    pub failures: Vec<UpsertBatchError>,
    pub cancelled_batches: usize,
    pub output: Option<PathBuf>,
}

impl SinkReport {
    fn completed(sink: &str, plan: &UpsertPlan, output: Option<PathBuf>) -> Self {
        Self {
            sink: sink.to_string(),
            batches_total: plan.batches.len(),
            batches_succeeded: plan.batches.len(),
            rows_written: plan.rows_total,
            rows_skipped_missing_key: plan.skipped_missing_key,
            failures: Vec::new(),
            cancelled_batches: 0,
            output,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.cancelled_batches == 0
    }
}

#[async_trait]
pub trait IdempotentSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn write(&self, plan: &UpsertPlan) -> Result<SinkReport>;
}

type Table = BTreeMap<String, UpsertRecord>;

/// Keyed in-memory store with merge-on-conflict semantics. Used for dry runs.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    tables: Arc<Mutex<BTreeMap<String, Table>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_batch(&self, batch: &UpsertBatch) -> Result<()> {
        let mut tables = self
            .tables
            .lock()
            .map_err(|_| anyhow!("memory sink lock poisoned"))?;
        let table = tables.entry(batch.table.clone()).or_default();
        for row in &batch.rows {
            let key = row
                .get(&batch.conflict_key)
                .render()
                .ok_or_else(|| anyhow!("row without conflict key reached the memory sink"))?;
            table
                .entry(key)
                .and_modify(|existing| {
                    for (column, value) in &row.columns {
                        existing.columns.insert(column.clone(), value.clone());
                    }
                })
                .or_insert_with(|| row.clone());
        }
        Ok(())
    }

    pub fn snapshot(&self, table: &str) -> Table {
        self.tables
            .lock()
            .ok()
            .and_then(|tables| tables.get(table).cloned())
            .unwrap_or_default()
    }
}

#[async_trait]
impl IdempotentSink for MemorySink {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn write(&self, plan: &UpsertPlan) -> Result<SinkReport> {
        for batch in &plan.batches {
            self.apply_batch(batch)?;
        }
        Ok(SinkReport::completed(self.name(), plan, None))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{ColumnSpec, MetadataColumn};
    use proptest::prelude::*;
    use tabsync_core::{NormalizedRecord, Provenance, RunAttribute};

    pub(crate) fn table() -> TableSpec {
        TableSpec {
            name: "zip_housing_costs".into(),
            conflict_key: "zip".into(),
            columns: vec![
                ColumnSpec { name: "zip".into(), sql_type: "TEXT".into(), optional: false },
                ColumnSpec { name: "fmr_1br".into(), sql_type: "INTEGER".into(), optional: false },
                ColumnSpec { name: "zori_rent".into(), sql_type: "NUMERIC".into(), optional: true },
            ],
            metadata: vec![
                MetadataColumn {
                    name: "is_mock".into(),
                    sql_type: "BOOLEAN".into(),
                    attribute: RunAttribute::IsMock,
                    default_sql: Some("FALSE".into()),
                },
                MetadataColumn {
                    name: "version_label".into(),
                    sql_type: "TEXT".into(),
                    attribute: RunAttribute::VersionLabel,
                    default_sql: None,
                },
            ],
        }
    }

    pub(crate) fn run() -> SyncRun {
        SyncRun::new("zip_housing", "FY2026", BTreeMap::new(), Provenance::Real)
    }

    pub(crate) fn merged(rows: &[(&str, Option<i64>)]) -> MergedDataset {
        MergedDataset {
            key_field: "zip".into(),
            fields: vec!["fmr_1br".into(), "zori_rent".into(), "unexpected".into()],
            records: rows
                .iter()
                .map(|(key, fmr)| {
                    let mut record = NormalizedRecord::new(*key);
                    record.set("fmr_1br", *fmr);
                    record.set("zori_rent", Value::Null);
                    record.set("unexpected", "drift");
                    record
                })
                .collect(),
            match_counts: BTreeMap::new(),
        }
    }

    #[test]
    fn plan_restricts_columns_and_attaches_run_metadata() {
        let plan = prepare_plan(
            &run(),
            &table(),
            merged(&[("00501", Some(1200)), ("", Some(1)), ("00501", Some(9)), ("00601", None)]),
            1000,
        );
        assert_eq!(plan.columns, vec!["zip", "fmr_1br", "zori_rent", "is_mock", "version_label"]);
        assert_eq!(plan.rows_total, 2);
        assert_eq!(plan.skipped_missing_key, 1);
        assert_eq!(plan.duplicate_keys, 1);

        let row = &plan.batches[0].rows[0];
        assert_eq!(row.columns.len(), 5);
        assert_eq!(row.get("zip"), &Value::text("00501"));
        assert_eq!(row.get("fmr_1br"), &Value::Integer(1200));
        assert_eq!(row.get("is_mock"), &Value::Bool(false));
        assert_eq!(row.get("version_label"), &Value::text("FY2026"));
        assert!(!row.columns.contains_key("unexpected"));
    }

    #[test]
    fn batches_never_exceed_the_cap() {
        let keys: Vec<String> = (0..2_501).map(|i| format!("{i:05}")).collect();
        let rows: Vec<(&str, Option<i64>)> = keys.iter().map(|k| (k.as_str(), Some(1))).collect();
        let plan = prepare_plan(&run(), &table(), merged(&rows), 5_000);
        let sizes: Vec<usize> = plan.batches.iter().map(UpsertBatch::len).collect();
        assert_eq!(sizes, vec![1000, 1000, 501]);
        assert_eq!(plan.batches[2].index, 2);
    }

    #[tokio::test]
    async fn memory_sink_merges_on_conflict() {
        let sink = MemorySink::new();
        let plan = prepare_plan(&run(), &table(), merged(&[("00501", Some(1200))]), 10);
        sink.write(&plan).await.expect("write");
        let plan = prepare_plan(&run(), &table(), merged(&[("00501", Some(1300))]), 10);
        let report = sink.write(&plan).await.expect("write");
        assert!(report.is_success());

        let state = sink.snapshot("zip_housing_costs");
        assert_eq!(state.len(), 1);
        assert_eq!(state["00501"].get("fmr_1br"), &Value::Integer(1300));
    }

    proptest! {
        #[test]
        fn applying_a_plan_twice_equals_applying_it_once(
            rows in prop::collection::vec((0u32..200, prop::option::of(0i64..5_000)), 0..120),
            batch_size in 1usize..50,
        ) {
            let keys: Vec<(String, Option<i64>)> =
                rows.iter().map(|(k, v)| (format!("{k:05}"), *v)).collect();
            let borrowed: Vec<(&str, Option<i64>)> =
                keys.iter().map(|(k, v)| (k.as_str(), *v)).collect();
            let plan = prepare_plan(&run(), &table(), merged(&borrowed), batch_size);

            let once = MemorySink::new();
            for batch in &plan.batches {
                once.apply_batch(batch).expect("apply");
            }
            let twice = MemorySink::new();
            for _ in 0..2 {
                for batch in &plan.batches {
                    twice.apply_batch(batch).expect("apply");
                }
            }
            prop_assert_eq!(once.snapshot("zip_housing_costs"), twice.snapshot("zip_housing_costs"));
        }
    }
}
