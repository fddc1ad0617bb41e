//! Rule-list enrichment applied to merged rows once the validation gate has passed.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tabsync_core::{MergedDataset, NormalizedRecord, Value};
use tracing::info;

pub trait EnrichmentHook: Send + Sync {
    fn apply(&self, merged: MergedDataset) -> Result<MergedDataset>;
}

#[derive(Default)]
pub struct NoopEnrichmentHook;

impl EnrichmentHook for NoopEnrichmentHook {
    fn apply(&self, merged: MergedDataset) -> Result<MergedDataset> {
        Ok(merged)
    }
}

/// Exception evaluated before the rule table: when `field` contains `contains` and any of
/// `with_any` (or `with_any` is empty), neither rules nor fallbacks apply to the row.
#[derive(Debug, Clone, Deserialize)]
pub struct Guard {
    pub field: String,
    pub contains: String,
    #[serde(default)]
    pub with_any: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Rule {
    pub pattern: String,
    pub set: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Fallback {
    pub field: String,
    #[serde(default)]
    pub when: BTreeMap<String, Value>,
    pub value: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleSet {
    #[allow(dead_code)]
    version: u32,
    pub scan_fields: Vec<String>,
    #[serde(default)]
    pub guards: Vec<Guard>,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub fallbacks: Vec<Fallback>,
}

fn lowered(record: &NormalizedRecord, field: &str) -> String {
    record
        .get(field)
        .render()
        .map(|v| v.to_lowercase())
        .unwrap_or_default()
}

fn same_value(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => match (left.render(), right.render()) {
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(&b),
            (None, None) => true,
            _ => false,
        },
    }
}

impl RuleSet {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing rule set")
    }

    fn guarded(&self, record: &NormalizedRecord) -> bool {
        self.guards.iter().any(|guard| {
            let haystack = lowered(record, &guard.field);
            haystack.contains(&guard.contains.to_lowercase())
                && (guard.with_any.is_empty()
                    || guard
                        .with_any
                        .iter()
                        .any(|companion| haystack.contains(&companion.to_lowercase())))
        })
    }

    /// First rule whose pattern occurs in the scan text.
    pub fn matching_rule(&self, record: &NormalizedRecord) -> Option<&Rule> {
        if self.guarded(record) {
            return None;
        }
        let scan = self
            .scan_fields
            .iter()
            .map(|field| lowered(record, field))
            .collect::<Vec<_>>()
            .join(" ||| ");
        self.rules
            .iter()
            .find(|rule| scan.contains(&rule.pattern.to_lowercase()))
    }

    fn introduced_fields(&self) -> Vec<&str> {
        self.rules
            .iter()
            .flat_map(|rule| rule.set.keys().map(String::as_str))
            .chain(self.fallbacks.iter().map(|f| f.field.as_str()))
            .collect()
    }
}

pub struct RuleSetEnrichmentHook {
    rules: RuleSet,
}

impl RuleSetEnrichmentHook {
    pub fn new(rules: RuleSet) -> Self {
        Self { rules }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let rules = RuleSet::from_yaml(&text).with_context(|| format!("loading {}", path.display()))?;
        Ok(Self::new(rules))
    }
}

impl EnrichmentHook for RuleSetEnrichmentHook {
    fn apply(&self, mut merged: MergedDataset) -> Result<MergedDataset> {
        for field in self.rules.introduced_fields() {
            if !merged.fields.iter().any(|f| f == field) {
                merged.fields.push(field.to_string());
            }
        }

        let mut matched = 0usize;
        let mut guarded = 0usize;
        let mut filled = 0usize;
        for record in &mut merged.records {
            for field in &merged.fields {
                record.fields.entry(field.clone()).or_default();
            }
            // A guarded row is left exactly as the merge produced it.
            if self.rules.guarded(record) {
                guarded += 1;
                continue;
            }
            if let Some(rule) = self.rules.matching_rule(record) {
                matched += 1;
                for (field, value) in &rule.set {
                    record.set(field.clone(), value.clone());
                }
            }
            for fallback in &self.rules.fallbacks {
                if record.get(&fallback.field).is_null()
                    && fallback
                        .when
                        .iter()
                        .all(|(field, expected)| same_value(record.get(field), expected))
                {
                    record.set(fallback.field.clone(), fallback.value.clone());
                    filled += 1;
                }
            }
        }

        info!(rows = merged.records.len(), matched, guarded, filled, "applied rule set");
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RULES: &str = r#"
version: 1
scan_fields: [facility_name, system_name]
guards:
  - field: facility_name
    contains: "children's"
    with_any: ["shriners"]
rules:
  - pattern: "hca"
    set: { ehr_vendor: Epic, ehr_confidence: high }
  - pattern: "health"
    set: { ehr_vendor: Cerner }
fallbacks:
  - field: radius_rule_miles
    when: { hospital_type: "Critical Access Hospitals" }
    value: 35
"#;

    fn merged(rows: Vec<NormalizedRecord>) -> MergedDataset {
        MergedDataset {
            key_field: "facility_id".into(),
            fields: vec!["facility_name".into(), "system_name".into(), "hospital_type".into()],
            records: rows,
            match_counts: BTreeMap::new(),
        }
    }

    fn facility(key: &str, name: &str, system: Option<&str>, kind: &str) -> NormalizedRecord {
        let mut record = NormalizedRecord::new(key);
        record.set("facility_name", name);
        record.set("system_name", system);
        record.set("hospital_type", kind);
        record
    }

    #[test]
    fn first_matching_rule_wins_and_fallbacks_fill_nulls() {
        let hook = RuleSetEnrichmentHook::new(RuleSet::from_yaml(RULES).expect("rules"));
        let out = hook
            .apply(merged(vec![
                facility("010001", "Southeast Health", Some("HCA Healthcare"), "Acute Care Hospitals"),
                facility("010005", "Marshall Medical", None, "Critical Access Hospitals"),
            ]))
            .expect("apply");

        assert!(out.fields.iter().any(|f| f == "ehr_vendor"));
        assert_eq!(out.records[0].get("ehr_vendor"), &Value::text("Epic"));
        assert_eq!(out.records[0].get("ehr_confidence"), &Value::text("high"));
        assert!(out.records[0].get("radius_rule_miles").is_null());
        assert!(out.records[1].get("ehr_vendor").is_null());
        assert!(out.records[1].fields.contains_key("ehr_confidence"));
        assert_eq!(out.records[1].get("radius_rule_miles"), &Value::Integer(35));
    }

    #[test]
    fn guarded_rows_skip_fallbacks_too() {
        let hook = RuleSetEnrichmentHook::new(RuleSet::from_yaml(RULES).expect("rules"));
        let out = hook
            .apply(merged(vec![facility(
                "010012",
                "Shriners Children's Hospital",
                None,
                "Critical Access Hospitals",
            )]))
            .expect("apply");
        assert!(out.records[0].get("radius_rule_miles").is_null());
        assert!(out.records[0].fields.contains_key("radius_rule_miles"));
        assert!(out.records[0].fields.contains_key("ehr_vendor"));
    }

    #[test]
    fn guards_suppress_rules() {
        let rules = RuleSet::from_yaml(RULES).expect("rules");
        let guarded = facility("010010", "Shriners Children's Health", None, "Childrens");
        assert!(rules.matching_rule(&guarded).is_none());
        let plain = facility("010011", "Children's Health", None, "Childrens");
        assert_eq!(
            rules.matching_rule(&plain).map(|r| r.pattern.as_str()),
            Some("health")
        );
    }
}
