//! Field Normalizer: raw string rows in, typed, key-padded, de-duplicated records out.
//!
//! Bad or missing cell values become nulls; only a missing *required* column is fatal.

use std::collections::{BTreeMap, HashSet};

use regex::Regex;
use strsim::jaro_winkler;
use tabsync_core::{NormalizedDataset, NormalizedRecord, RawRecord, RawTable, Value};
use tracing::{debug, info, warn};

use crate::config::{ColumnRef, DatasetSpec, FieldKind, FieldPlan, KeySpec, DEFAULT_DECIMAL_SCALE};
use crate::error::SchemaError;

const SUGGESTION_THRESHOLD: f64 = 0.8;

/// Case-fold, collapse `_`/`-`/whitespace runs to one space, drop other punctuation.
pub fn normalize_header(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    let mut pending_space = false;
    for c in label.trim().chars() {
        if c.is_whitespace() || c == '_' || c == '-' {
            pending_space = true;
            continue;
        }
        if !c.is_alphanumeric() {
            continue;
        }
        if pending_space && !out.is_empty() {
            out.push(' ');
        }
        pending_space = false;
        out.extend(c.to_lowercase());
    }
    out
}

fn strip_float_artifact(value: &str) -> &str {
    match value.split_once('.') {
        Some((int, frac))
            if !int.is_empty()
                && !frac.is_empty()
                && int.bytes().all(|b| b.is_ascii_digit())
                && frac.bytes().all(|b| b == b'0') =>
        {
            int
        }
        _ => value,
    }
}

/// `"501"` -> `"00501"`, `"10001.0"` -> `"10001"`. Non-numeric keys are only trimmed.
pub fn coerce_key(raw: &str, width: usize) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let stripped = strip_float_artifact(trimmed);
    if stripped.bytes().all(|b| b.is_ascii_digit()) {
        Some(format!("{stripped:0>width$}"))
    } else {
        Some(stripped.to_string())
    }
}

/// Best-effort numeric parse; currency symbols and thousands separators are ignored.
pub fn coerce_number(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, '$' | ',' | ' '))
        .collect();
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn round_to(value: f64, scale: u32) -> f64 {
    let factor = 10f64.powi(scale as i32);
    (value * factor).round() / factor
}

pub fn coerce_value(plan: &FieldPlan, raw: Option<&str>) -> Value {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Value::Null;
    };
    match plan.kind {
        FieldKind::Integer => coerce_number(raw)
            .map(f64::trunc)
            .filter(|v| *v >= i64::MIN as f64 && *v <= i64::MAX as f64)
            .map(|v| Value::Integer(v as i64))
            .unwrap_or(Value::Null),
        FieldKind::Decimal => coerce_number(raw)
            .map(|v| Value::Decimal(round_to(v, plan.scale.unwrap_or(DEFAULT_DECIMAL_SCALE))))
            .unwrap_or(Value::Null),
        FieldKind::Text => Value::text(raw),
        FieldKind::Flag => Value::Bool(matches!(
            raw.to_ascii_lowercase().as_str(),
            "true" | "1" | "yes" | "y"
        )),
    }
}

/// Raw headers a column reference resolved to, in preference order.
#[derive(Debug, Clone, Default)]
struct Resolved {
    labels: Vec<String>,
}

impl Resolved {
    fn pick<'r>(&self, record: &'r RawRecord) -> Option<&'r str> {
        self.labels
            .iter()
            .filter_map(|label| record.get(label))
            .find(|value| !value.trim().is_empty())
    }
}

pub struct Normalizer<'a> {
    spec: &'a DatasetSpec,
    key: &'a KeySpec,
}

impl<'a> Normalizer<'a> {
    pub fn new(spec: &'a DatasetSpec, key: &'a KeySpec) -> Self {
        Self { spec, key }
    }

    fn resolve(
        &self,
        column: &ColumnRef,
        required: bool,
        headers: &[String],
    ) -> Result<Resolved, SchemaError> {
        let labels = match column {
            ColumnRef::Named(candidates) => candidates
                .iter()
                .map(|c| normalize_header(c))
                .flat_map(|wanted| {
                    headers
                        .iter()
                        .filter(move |h| normalize_header(h) == wanted)
                        .cloned()
                })
                .collect::<Vec<_>>(),
            ColumnRef::LatestMatching(pattern) => {
                let re = Regex::new(pattern).map_err(|_| self.missing(column, headers))?;
                headers
                    .iter()
                    .filter(|h| re.is_match(h.trim()))
                    .max_by(|a, b| a.trim().cmp(b.trim()))
                    .cloned()
                    .into_iter()
                    .collect()
            }
        };
        if labels.is_empty() && required {
            return Err(self.missing(column, headers));
        }
        Ok(Resolved { labels })
    }

    fn missing(&self, column: &ColumnRef, headers: &[String]) -> SchemaError {
        let wanted = match column {
            ColumnRef::Named(candidates) => candidates.first().map(|c| normalize_header(c)),
            ColumnRef::LatestMatching(_) => None,
        };
        let suggestion = wanted.and_then(|wanted| {
            headers
                .iter()
                .map(|h| (h, jaro_winkler(&wanted, &normalize_header(h))))
                .filter(|(_, score)| *score >= SUGGESTION_THRESHOLD)
                .max_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(h, _)| h.trim().to_string())
        });
        SchemaError::MissingColumn {
            dataset: self.spec.name.clone(),
            column: column.describe(),
            suggestion,
        }
    }

    pub fn normalize(&self, raw: RawTable) -> Result<NormalizedDataset, SchemaError> {
        let fields = self.spec.output_fields();
        let mut dataset = NormalizedDataset {
            name: self.spec.name.clone(),
            key_field: self.key.name.clone(),
            fields,
            records: Vec::with_capacity(raw.len()),
            duplicates_dropped: 0,
            missing_keys: 0,
            resolved_columns: BTreeMap::new(),
        };
        let RawTable { headers, rows: raw } = raw;
        if raw.is_empty() {
            warn!(dataset = %self.spec.name, "source produced no rows");
        }
        if headers.is_empty() {
            // Nothing declared a schema (an empty JSON listing); there is nothing to check.
            return Ok(dataset);
        }

        let key_column = self.resolve(&self.spec.key_column, true, &headers)?;
        dataset
            .resolved_columns
            .insert(self.key.name.clone(), key_column.labels.join(" | "));

        let mut plans = Vec::with_capacity(self.spec.fields.len());
        for plan in &self.spec.fields {
            let resolved = self.resolve(&plan.column, plan.required, &headers)?;
            if resolved.labels.is_empty() {
                warn!(dataset = %self.spec.name, field = %plan.name, "optional column absent; field will be null");
            } else {
                dataset
                    .resolved_columns
                    .insert(plan.name.clone(), resolved.labels.join(" | "));
            }
            plans.push((plan, resolved));
        }
        debug!(dataset = %self.spec.name, columns = ?dataset.resolved_columns, "resolved columns");

        let mut keys = HashSet::with_capacity(raw.len());
        for row in &raw {
            let Some(key) = key_column
                .pick(row)
                .and_then(|v| coerce_key(v, self.key.width))
            else {
                dataset.missing_keys += 1;
                continue;
            };
            if !keys.insert(key.clone()) {
                dataset.duplicates_dropped += 1;
                continue;
            }

            let mut record = NormalizedRecord::new(key);
            for (plan, resolved) in &plans {
                let value = coerce_value(plan, resolved.pick(row));
                if let Some(as_of) = &plan.as_of_column {
                    let label = match (&value, resolved.labels.first()) {
                        (Value::Null, _) | (_, None) => Value::Null,
                        (_, Some(label)) => Value::text(label.trim()),
                    };
                    record.set(as_of.clone(), label);
                }
                record.set(plan.name.clone(), value);
            }
            dataset.records.push(record);
        }

        info!(
            dataset = %dataset.name,
            rows = dataset.records.len(),
            duplicates_dropped = dataset.duplicates_dropped,
            missing_keys = dataset.missing_keys,
            "normalized dataset"
        );
        Ok(dataset)
    }
}
