use std::fmt::Write as _;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tabsync_core::{UpsertBatch, Value};
use tabsync_storage::write_atomically;
use tracing::info;

use super::{IdempotentSink, SinkReport, UpsertPlan};

pub fn sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Decimal(d) if d.is_finite() => d.to_string(),
        Value::Decimal(_) => "NULL".to_string(),
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
    }
}

fn render_batch(out: &mut String, batch: &UpsertBatch, columns: &[String]) {
    let _ = writeln!(out, "-- batch {} ({} rows)", batch.index, batch.len());
    let _ = writeln!(
        out,
        "INSERT INTO {} ({}) VALUES",
        batch.table,
        columns.join(", ")
    );
    let rows = batch
        .rows
        .iter()
        .map(|row| {
            let values = columns
                .iter()
                .map(|c| sql_literal(row.get(c)))
                .collect::<Vec<_>>()
                .join(", ");
            format!("    ({values})")
        })
        .collect::<Vec<_>>()
        .join(",\n");
    out.push_str(&rows);
    out.push('\n');

    let updates = columns
        .iter()
        .filter(|c| **c != batch.conflict_key)
        .map(|c| format!("    {c} = EXCLUDED.{c}"))
        .collect::<Vec<_>>();
    if updates.is_empty() {
        let _ = writeln!(out, "ON CONFLICT ({}) DO NOTHING;", batch.conflict_key);
    } else {
        let _ = writeln!(out, "ON CONFLICT ({}) DO UPDATE SET", batch.conflict_key);
        out.push_str(&updates.join(",\n"));
        out.push_str(";\n");
    }
    out.push('\n');
}

/// Render the whole plan as one transaction: header, DDL, batched merge-on-conflict inserts.
pub fn render_script(plan: &UpsertPlan, notice: &[String]) -> String {
    let run = &plan.run;
    let table = &plan.table;
    let mut out = String::new();

    let _ = writeln!(out, "-- tabsync upsert script");
    let _ = writeln!(out, "-- job: {} ({})", run.job_id, run.version_label);
    let _ = writeln!(out, "-- run_id: {}", run.run_id);
    let _ = writeln!(out, "-- generated_at: {}", run.started_at.to_rfc3339());
    if run.is_synthetic() {
        let _ = writeln!(out, "-- provenance: SYNTHETIC (fallback data, not for production use)");
    } else {
        let _ = writeln!(out, "-- provenance: real");
    }
    for (source_id, url) in &run.source_urls {
        let _ = writeln!(out, "-- source {source_id}: {url}");
    }
    for line in notice {
        let _ = writeln!(out, "-- {line}");
    }
    let _ = writeln!(
        out,
        "-- rows: {}, batches: {}, conflict key: {}",
        plan.rows_total,
        plan.batches.len(),
        table.conflict_key
    );
    out.push('\n');
    out.push_str("BEGIN;\n\n");

    let required = table
        .columns
        .iter()
        .filter(|c| !c.optional)
        .map(|c| {
            if c.name == table.conflict_key {
                format!("    {} {} PRIMARY KEY", c.name, c.sql_type)
            } else {
                format!("    {} {}", c.name, c.sql_type)
            }
        })
        .collect::<Vec<_>>();
    let _ = writeln!(out, "CREATE TABLE IF NOT EXISTS {} (", table.name);
    out.push_str(&required.join(",\n"));
    out.push_str("\n);\n\n");

    for column in table.columns.iter().filter(|c| c.optional) {
        let _ = writeln!(
            out,
            "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {};",
            table.name, column.name, column.sql_type
        );
    }
    for column in &table.metadata {
        let default = column
            .default_sql
            .as_deref()
            .map(|d| format!(" DEFAULT {d}"))
            .unwrap_or_default();
        let _ = writeln!(
            out,
            "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}{};",
            table.name, column.name, column.sql_type, default
        );
    }
    out.push('\n');

    for batch in &plan.batches {
        render_batch(&mut out, batch, &plan.columns);
    }

    out.push_str("COMMIT;\n");
    out
}

/// Writes the rendered script to `output` (temp file + rename).
#[derive(Debug, Clone)]
pub struct ScriptSink {
    output: PathBuf,
    notice: Vec<String>,
}

impl ScriptSink {
    pub fn new(output: impl Into<PathBuf>, notice: Vec<String>) -> Self {
        Self {
            output: output.into(),
            notice,
        }
    }

    pub fn output(&self) -> &std::path::Path {
        &self.output
    }
}

#[async_trait]
impl IdempotentSink for ScriptSink {
    fn name(&self) -> &'static str {
        "script"
    }

    async fn write(&self, plan: &UpsertPlan) -> Result<SinkReport> {
        let script = render_script(plan, &self.notice);
        write_atomically(&self.output, script.as_bytes())
            .await
            .with_context(|| format!("writing upsert script {}", self.output.display()))?;
        info!(
            path = %self.output.display(),
            rows = plan.rows_total,
            batches = plan.batches.len(),
            bytes = script.len(),
            "wrote upsert script"
        );
        Ok(SinkReport::completed(self.name(), plan, Some(self.output.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::prepare_plan;
    use crate::sink::tests::{merged, run, table};

    #[test]
    fn literals_are_escaped() {
        assert_eq!(sql_literal(&Value::text("St. Mary's")), "'St. Mary''s'");
        assert_eq!(sql_literal(&Value::Null), "NULL");
        assert_eq!(sql_literal(&Value::Decimal(1412.5)), "1412.5");
        assert_eq!(sql_literal(&Value::Bool(true)), "TRUE");
    }

    #[test]
    fn script_sections_appear_in_order() {
        let plan = prepare_plan(&run(), &table(), merged(&[("00501", Some(1200)), ("00601", None)]), 1);
        let notice = vec!["Source data: HUD and Zillow; see their terms of use.".to_string()];
        let script = render_script(&plan, &notice);

        let positions: Vec<usize> = [
            "-- Source data: HUD",
            "BEGIN;",
            "CREATE TABLE IF NOT EXISTS zip_housing_costs (",
            "ALTER TABLE zip_housing_costs ADD COLUMN IF NOT EXISTS zori_rent NUMERIC;",
            "ALTER TABLE zip_housing_costs ADD COLUMN IF NOT EXISTS is_mock BOOLEAN DEFAULT FALSE;",
            "-- batch 0 (1 rows)",
            "-- batch 1 (1 rows)",
            "COMMIT;",
        ]
        .iter()
        .map(|needle| script.find(needle).unwrap_or_else(|| panic!("missing {needle}")))
        .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{script}");

        assert!(script.contains("    zip TEXT PRIMARY KEY"));
        assert!(!script.contains("zori_rent NUMERIC,"));
        assert!(script.contains("('00501', 1200, NULL, FALSE, 'FY2026')"));
        assert!(script.contains("ON CONFLICT (zip) DO UPDATE SET\n    fmr_1br = EXCLUDED.fmr_1br,"));
        assert_eq!(script.matches("BEGIN;").count(), 1);
        assert_eq!(script.matches("COMMIT;").count(), 1);
    }

    #[test]
    fn rendering_is_deterministic() {
        let plan = prepare_plan(&run(), &table(), merged(&[("00501", Some(1200))]), 10);
        assert_eq!(render_script(&plan, &[]), render_script(&plan, &[]));
    }

    #[tokio::test]
    async fn script_sink_writes_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out").join("upsert.sql");
        let sink = ScriptSink::new(&path, Vec::new());
        let plan = prepare_plan(&run(), &table(), merged(&[("00501", Some(1200))]), 10);
        let report = sink.write(&plan).await.expect("write");
        assert!(report.is_success());
        assert_eq!(report.output.as_deref(), Some(path.as_path()));
        let text = std::fs::read_to_string(&path).expect("read");
        assert!(text.ends_with("COMMIT;\n"));
    }
}
