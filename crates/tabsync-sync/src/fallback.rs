//! Fallback Synthesizer: seeded mock data, only under an explicit dual opt-in.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use tabsync_core::{MergedDataset, NormalizedRecord, Value};
use tracing::warn;

use crate::config::{FallbackSpec, Generator, JobConfig};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FallbackPolicy {
    /// `CI=true`
    pub non_interactive: bool,
    /// `ALLOW_MOCK_FALLBACK=true`
    pub mock_permitted: bool,
}

impl FallbackPolicy {
    pub fn permits(&self) -> bool {
        self.non_interactive && self.mock_permitted
    }

    pub fn describe(&self) -> String {
        format!(
            "CI={} ALLOW_MOCK_FALLBACK={}",
            self.non_interactive, self.mock_permitted
        )
    }
}

fn generate(generator: &Generator, record: &NormalizedRecord, rng: &mut StdRng) -> Value {
    match generator {
        Generator::Constant(value) => value.clone(),
        Generator::Choice(options) => options
            .choose(rng)
            .map(|o| Value::text(o.as_str()))
            .unwrap_or(Value::Null),
        Generator::IntRange { min, max } if min <= max => Value::Integer(rng.random_range(*min..=*max)),
        Generator::IntRange { .. } => Value::Null,
        Generator::Offset { base, min, max } if min <= max => {
            let offset = rng.random_range(*min..=*max);
            record
                .get(base)
                .as_i64()
                .map(|b| Value::Integer(b + offset))
                .unwrap_or(Value::Null)
        }
        Generator::Offset { .. } => Value::Null,
        Generator::DecimalNear {
            base,
            min,
            max,
            null_probability,
        } if min <= max => {
            if rng.random::<f64>() < *null_probability {
                return Value::Null;
            }
            let offset = rng.random_range(*min..=*max);
            record
                .get(base)
                .as_f64()
                .map(|b| Value::Decimal(((b + offset) * 100.0).round() / 100.0))
                .unwrap_or(Value::Null)
        }
        Generator::DecimalNear { .. } => Value::Null,
    }
}

pub struct FallbackSynthesizer<'a> {
    job: &'a JobConfig,
    spec: &'a FallbackSpec,
}

impl<'a> FallbackSynthesizer<'a> {
    pub fn new(job: &'a JobConfig, spec: &'a FallbackSpec) -> Self {
        Self { job, spec }
    }

    /// Same shape as a real merged dataset over the whole key range. Logs `reason` first.
    pub fn synthesize(&self, reason: &str) -> MergedDataset {
        warn!(
            job = %self.job.job_id,
            %reason,
            seed = self.spec.seed,
            keys = self.spec.key_end.saturating_sub(self.spec.key_start),
            "FALLBACK: generating synthetic dataset; rows will be flagged as mock"
        );

        let mut fields = self.job.declared_fields();
        for synth in &self.spec.fields {
            if !fields.contains(&synth.name) {
                fields.push(synth.name.clone());
            }
        }

        let width = self.job.key.width;
        let mut rng = StdRng::seed_from_u64(self.spec.seed);
        let records: Vec<NormalizedRecord> = (self.spec.key_start..self.spec.key_end)
            .map(|key| {
                let mut record = NormalizedRecord::new(format!("{key:0>width$}"));
                for synth in &self.spec.fields {
                    let value = generate(&synth.generator, &record, &mut rng);
                    record.set(synth.name.clone(), value);
                }
                for field in &fields {
                    record.fields.entry(field.clone()).or_default();
                }
                record
            })
            .collect();

        let match_counts: BTreeMap<String, usize> = self
            .job
            .secondaries
            .iter()
            .map(|secondary| {
                let secondary_fields = secondary.output_fields();
                let matched = records
                    .iter()
                    .filter(|r| secondary_fields.iter().any(|f| !r.get(f).is_null()))
                    .count();
                (secondary.name.clone(), matched)
            })
            .collect();

        MergedDataset {
            key_field: self.job.key.name.clone(),
            fields,
            records,
            match_counts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{JobConfig, SynthField};

    const JOB: &str = r#"
job_id: zip_housing
version_label: FY2026
key: { name: zip, width: 5 }
primary:
  name: hud
  source: { source_id: hud_safmr, kind: spreadsheet, url: ./hud.xlsx }
  key_column: { named: ["zip code"] }
  fields:
    - { name: fmr_1br, column: { named: ["safmr 1br"] }, kind: integer }
secondaries:
  - name: zori
    source: { source_id: zillow_zori, kind: csv, url: ./zori.csv }
    key_column: { named: [RegionName] }
    fields:
      - { name: zori_rent, column: { named: [rent] }, kind: decimal }
gate: { min_total_rows: 1 }
table:
  name: zip_housing_costs
  conflict_key: zip
  columns:
    - { name: zip, sql_type: TEXT }
fallback:
  key_start: 501
  key_end: 1501
  seed: 42
  fields:
    - name: fmr_1br
      generator: { int_range: { min: 800, max: 3000 } }
    - name: fmr_2br
      generator: { offset: { base: fmr_1br, min: 150, max: 500 } }
    - name: zori_rent
      generator: { decimal_near: { base: fmr_1br, min: -200.0, max: 400.0, null_probability: 0.3 } }
    - name: metro
      generator: { choice: [Springfield, Shelbyville] }
"#;

    fn job() -> JobConfig {
        JobConfig::from_yaml(JOB).expect("job")
    }

    #[test]
    fn policy_requires_both_flags() {
        assert!(!FallbackPolicy::default().permits());
        assert!(!FallbackPolicy { non_interactive: true, mock_permitted: false }.permits());
        assert!(!FallbackPolicy { non_interactive: false, mock_permitted: true }.permits());
        assert!(FallbackPolicy { non_interactive: true, mock_permitted: true }.permits());
    }

    #[test]
    fn synthesis_covers_key_space_with_padded_keys() {
        let job = job();
        let spec = job.fallback.clone().expect("fallback");
        let merged = FallbackSynthesizer::new(&job, &spec).synthesize("test");

        assert_eq!(merged.total_rows(), 1000);
        assert_eq!(merged.records[0].key, "00501");
        assert_eq!(merged.records[999].key, "01500");
        assert_eq!(merged.fields, vec!["fmr_1br", "zori_rent", "fmr_2br", "metro"]);
        for record in &merged.records {
            let fmr1 = record.get("fmr_1br").as_i64().expect("fmr_1br");
            let fmr2 = record.get("fmr_2br").as_i64().expect("fmr_2br");
            assert!((800..=3000).contains(&fmr1));
            assert!((fmr1 + 150..=fmr1 + 500).contains(&fmr2));
        }
        let nulls = merged.records.iter().filter(|r| r.get("zori_rent").is_null()).count();
        assert!(nulls > 150 && nulls < 450, "null share {nulls}");
        assert_eq!(merged.match_counts["zori"], 1000 - nulls);
    }

    #[test]
    fn same_seed_same_data() {
        let job = job();
        let spec = job.fallback.clone().expect("fallback");
        let a = FallbackSynthesizer::new(&job, &spec).synthesize("a");
        let b = FallbackSynthesizer::new(&job, &spec).synthesize("b");
        assert_eq!(a, b);

        let reseeded = FallbackSpec { seed: 7, ..spec.clone() };
        let c = FallbackSynthesizer::new(&job, &reseeded).synthesize("c");
        assert_ne!(a.records, c.records);
    }

    #[test]
    fn constant_generator_is_copied_verbatim() {
        let job = job();
        let spec = FallbackSpec {
            key_start: 1,
            key_end: 3,
            seed: 1,
            fields: vec![SynthField {
                name: "metro".into(),
                generator: Generator::Constant(Value::text("Mock Metro")),
            }],
        };
        let merged = FallbackSynthesizer::new(&job, &spec).synthesize("constant");
        assert!(merged.records.iter().all(|r| r.get("metro") == &Value::text("Mock Metro")));
        assert!(merged.records.iter().all(|r| r.get("fmr_1br").is_null()));
    }
}
