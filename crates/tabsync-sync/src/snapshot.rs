//! Parquet snapshot of a validated merged dataset, plus a hashed manifest.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tabsync_core::{MergedDataset, SyncRun, Value};
use tokio::fs;
use tracing::info;
use uuid::Uuid;

use crate::config::FieldKind;

pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub job_id: String,
    pub is_mock: bool,
    pub files: Vec<SnapshotFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotFile {
    pub name: String,
    pub path: String,
    pub rows: usize,
    pub sha256: String,
    pub bytes: u64,
}

fn column(merged: &MergedDataset, field: &str, kind: Option<FieldKind>) -> (DataType, ArrayRef) {
    let values = merged.records.iter().map(|r| r.get(field));
    match kind {
        Some(FieldKind::Integer) => (
            DataType::Int64,
            Arc::new(Int64Array::from(values.map(Value::as_i64).collect::<Vec<_>>())),
        ),
        Some(FieldKind::Decimal) => (
            DataType::Float64,
            Arc::new(Float64Array::from(values.map(Value::as_f64).collect::<Vec<_>>())),
        ),
        Some(FieldKind::Flag) => (
            DataType::Boolean,
            Arc::new(BooleanArray::from(
                values
                    .map(|v| match v {
                        Value::Bool(b) => Some(*b),
                        _ => None,
                    })
                    .collect::<Vec<_>>(),
            )),
        ),
        Some(FieldKind::Text) | None => (
            DataType::Utf8,
            Arc::new(StringArray::from(values.map(Value::render).collect::<Vec<_>>())),
        ),
    }
}

fn record_batch(
    run: &SyncRun,
    merged: &MergedDataset,
    kinds: &BTreeMap<String, FieldKind>,
) -> Result<RecordBatch> {
    let mut fields = vec![ArrowField::new(&merged.key_field, DataType::Utf8, false)];
    let mut arrays: Vec<ArrayRef> = vec![Arc::new(StringArray::from(
        merged.records.iter().map(|r| r.key.as_str()).collect::<Vec<_>>(),
    ))];

    for field in &merged.fields {
        let (data_type, array) = column(merged, field, kinds.get(field).copied());
        fields.push(ArrowField::new(field, data_type, true));
        arrays.push(array);
    }

    fields.push(ArrowField::new("is_mock", DataType::Boolean, false));
    arrays.push(Arc::new(BooleanArray::from(vec![
        run.is_synthetic();
        merged.records.len()
    ])));

    RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)
        .context("building merged record batch")
}

fn write_parquet(path: &Path, batch: &RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, root: &Path, path: &Path, rows: usize) -> Result<SnapshotFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(SnapshotFile {
        name: name.to_string(),
        path: path
            .strip_prefix(root)
            .unwrap_or(path)
            .display()
            .to_string(),
        rows,
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    })
}

/// Writes `{dir}/{run_id}/merged.parquet` and `manifest.json`; returns the manifest path.
pub async fn write_snapshot(
    dir: &Path,
    run: &SyncRun,
    merged: &MergedDataset,
    kinds: &BTreeMap<String, FieldKind>,
) -> Result<PathBuf> {
    let snapshot_dir = dir.join(run.run_id.to_string());
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let parquet_path = snapshot_dir.join("merged.parquet");
    let batch = record_batch(run, merged, kinds)?;
    write_parquet(&parquet_path, &batch)?;

    let manifest = SnapshotManifest {
        schema_version: SNAPSHOT_SCHEMA_VERSION,
        run_id: run.run_id,
        job_id: run.job_id.clone(),
        is_mock: run.is_synthetic(),
        files: vec![manifest_entry("merged", dir, &parquet_path, batch.num_rows())?],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    info!(path = %manifest_path.display(), rows = batch.num_rows(), "wrote parquet snapshot");
    Ok(manifest_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabsync_core::{NormalizedRecord, Provenance};

    #[tokio::test]
    async fn snapshot_writes_parquet_and_manifest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let run = SyncRun::new("zip_housing", "FY2026", BTreeMap::new(), Provenance::Real);

        let mut a = NormalizedRecord::new("00501");
        a.set("fmr_1br", 1200i64);
        a.set("zori_rent", Value::Decimal(1412.5));
        a.set("zori_as_of_month", "2025-12-31");
        let mut b = NormalizedRecord::new("00601");
        b.set("fmr_1br", Value::Null);
        b.set("zori_rent", Value::Null);
        b.set("zori_as_of_month", Value::Null);
        let merged = MergedDataset {
            key_field: "zip".into(),
            fields: vec!["fmr_1br".into(), "zori_rent".into(), "zori_as_of_month".into()],
            records: vec![a, b],
            match_counts: BTreeMap::new(),
        };
        let kinds = BTreeMap::from([
            ("fmr_1br".to_string(), FieldKind::Integer),
            ("zori_rent".to_string(), FieldKind::Decimal),
        ]);

        let batch = record_batch(&run, &merged, &kinds).expect("batch");
        assert_eq!(batch.num_columns(), 5);
        assert_eq!(batch.schema().field(1).data_type(), &DataType::Int64);
        assert_eq!(batch.schema().field(3).data_type(), &DataType::Utf8);

        let manifest_path = write_snapshot(dir.path(), &run, &merged, &kinds)
            .await
            .expect("snapshot");
        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&manifest_path).expect("read")).expect("json");
        assert_eq!(manifest["schema_version"], 1);
        assert_eq!(manifest["files"][0]["rows"], 2);
        assert_eq!(manifest["files"][0]["sha256"].as_str().map(str::len), Some(64));
        assert!(manifest_path.with_file_name("merged.parquet").exists());
    }
}
