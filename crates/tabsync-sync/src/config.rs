//! Process configuration (environment) and per-job pipeline definitions (YAML).

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tabsync_adapters::SourceDescriptor;
use tabsync_core::{RunAttribute, Value, MAX_BATCH_SIZE};

use crate::fallback::FallbackPolicy;

fn env_flag(value: Option<String>) -> bool {
    value
        .map(|v| v.trim().eq_ignore_ascii_case("true") || v.trim() == "1")
        .unwrap_or(false)
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub artifacts_dir: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub upsert_concurrency: usize,
    pub database_url: Option<String>,
    pub upsert_endpoint: Option<String>,
    pub upsert_api_key: Option<String>,
    pub fallback: FallbackPolicy,
    pub scheduler_enabled: bool,
    pub sync_crons: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            workspace_root: non_blank(lookup("TABSYNC_WORKSPACE_ROOT"))
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            artifacts_dir: non_blank(lookup("ARTIFACTS_DIR")).map(PathBuf::from),
            user_agent: non_blank(lookup("TABSYNC_USER_AGENT"))
                .unwrap_or_else(|| "tabsync/0.1".to_string()),
            http_timeout_secs: lookup("TABSYNC_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(60),
            upsert_concurrency: lookup("TABSYNC_UPSERT_CONCURRENCY")
                .and_then(|v| v.trim().parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(4),
            database_url: non_blank(lookup("DATABASE_URL")),
            upsert_endpoint: non_blank(lookup("UPSERT_ENDPOINT_URL")),
            upsert_api_key: non_blank(lookup("UPSERT_API_KEY")),
            fallback: FallbackPolicy {
                non_interactive: env_flag(lookup("CI")),
                mock_permitted: env_flag(lookup("ALLOW_MOCK_FALLBACK")),
            },
            scheduler_enabled: env_flag(lookup("TABSYNC_SCHEDULER_ENABLED")),
            sync_crons: lookup("SYNC_CRON")
                .map(|v| {
                    v.split(',')
                        .map(|c| c.trim().to_string())
                        .filter(|c| !c.is_empty())
                        .collect::<Vec<_>>()
                })
                .filter(|crons| !crons.is_empty())
                .unwrap_or_else(|| vec!["0 6 * * *".to_string()]),
        }
    }

    /// Resolve a job-relative path (rules file, script output) against the workspace root.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        }
    }
}

/// Seed unset environment variables from a `KEY=VALUE` file. Returns how many were set.
pub fn load_dotenv(path: &Path) -> Result<usize> {
    if !path.exists() {
        return Ok(0);
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let mut applied = 0;
    for (key, value) in parse_dotenv(&text) {
        if std::env::var_os(&key).is_none() {
            std::env::set_var(&key, value);
            applied += 1;
        }
    }
    Ok(applied)
}

fn parse_dotenv(text: &str) -> Vec<(String, String)> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| {
            let v = v.trim().trim_matches('"').trim_matches('\'');
            (k.trim().to_string(), v.to_string())
        })
        .filter(|(k, _)| !k.is_empty())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySpec {
    pub name: String,
    /// Zero-pad numeric keys to this many digits.
    pub width: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnRef {
    /// Candidate headers; per row the first non-empty one wins.
    Named(Vec<String>),
    /// Regex over raw headers; the lexicographically greatest match is used.
    LatestMatching(String),
}

impl ColumnRef {
    pub fn describe(&self) -> String {
        match self {
            ColumnRef::Named(candidates) => candidates.join(" | "),
            ColumnRef::LatestMatching(pattern) => format!("/{pattern}/"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Integer,
    Decimal,
    Text,
    Flag,
}

pub const DEFAULT_DECIMAL_SCALE: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldPlan {
    pub name: String,
    pub column: ColumnRef,
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub scale: Option<u32>,
    /// For `latest_matching` columns: record the chosen header here when the value is present.
    #[serde(default)]
    pub as_of_column: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSpec {
    pub name: String,
    pub source: SourceDescriptor,
    pub key_column: ColumnRef,
    #[serde(default)]
    pub fields: Vec<FieldPlan>,
}

impl DatasetSpec {
    /// Output field names in declaration order, `as_of` columns included.
    pub fn output_fields(&self) -> Vec<String> {
        let mut out = Vec::new();
        for plan in &self.fields {
            out.push(plan.name.clone());
            if let Some(as_of) = &plan.as_of_column {
                out.push(as_of.clone());
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Threshold {
    /// Absolute number of rows.
    Rows(usize),
    /// Fraction of total rows, `0.0..=1.0`.
    Ratio(f64),
}

impl Threshold {
    pub fn required_rows(&self, total_rows: usize) -> usize {
        match *self {
            Threshold::Rows(n) => n,
            Threshold::Ratio(r) => {
                let exact = r * total_rows as f64;
                // Products like 0.07 * 100 land a hair above the integer they denote.
                let nearest = exact.round();
                if (exact - nearest).abs() < 1e-9 * exact.max(1.0) {
                    nearest as usize
                } else {
                    exact.ceil() as usize
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchThreshold {
    pub field: String,
    pub minimum: Threshold,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateConfig {
    pub min_total_rows: usize,
    #[serde(default)]
    pub matched: Vec<MatchThreshold>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub sql_type: String,
    /// Added with `ADD COLUMN IF NOT EXISTS` rather than in `CREATE TABLE`.
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataColumn {
    pub name: String,
    pub sql_type: String,
    pub attribute: RunAttribute,
    #[serde(default)]
    pub default_sql: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    pub conflict_key: String,
    pub columns: Vec<ColumnSpec>,
    #[serde(default)]
    pub metadata: Vec<MetadataColumn>,
}

impl TableSpec {
    /// Every column a sink may write, in output order.
    pub fn allowed_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .map(|c| c.name.as_str())
            .chain(self.metadata.iter().map(|m| m.name.as_str()))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    #[default]
    Script,
    Network,
    Memory,
}

impl std::str::FromStr for SinkKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "script" => Ok(SinkKind::Script),
            "network" | "rest" => Ok(SinkKind::Network),
            "memory" | "dry-run" => Ok(SinkKind::Memory),
            other => bail!("unknown sink `{other}` (expected script, network or memory)"),
        }
    }
}

fn default_batch_size() -> usize {
    MAX_BATCH_SIZE
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkDefaults {
    #[serde(default)]
    pub kind: SinkKind,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub output: Option<PathBuf>,
    /// Comment lines written at the top of generated scripts.
    #[serde(default)]
    pub notice: Vec<String>,
}

impl Default for SinkDefaults {
    fn default() -> Self {
        Self {
            kind: SinkKind::default(),
            batch_size: default_batch_size(),
            output: None,
            notice: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Generator {
    Constant(Value),
    Choice(Vec<String>),
    IntRange { min: i64, max: i64 },
    /// Integer field `base` plus a uniform offset in `min..=max`.
    Offset { base: String, min: i64, max: i64 },
    /// Numeric field `base` plus a uniform offset in `min..max`, null with some probability.
    DecimalNear {
        base: String,
        min: f64,
        max: f64,
        #[serde(default)]
        null_probability: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthField {
    pub name: String,
    pub generator: Generator,
}

fn default_seed() -> u64 {
    42
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackSpec {
    pub key_start: u64,
    /// Exclusive.
    pub key_end: u64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub fields: Vec<SynthField>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub job_id: String,
    pub version_label: String,
    pub key: KeySpec,
    pub primary: DatasetSpec,
    #[serde(default)]
    pub secondaries: Vec<DatasetSpec>,
    pub gate: GateConfig,
    pub table: TableSpec,
    #[serde(default)]
    pub sink: SinkDefaults,
    #[serde(default)]
    pub rules_file: Option<PathBuf>,
    #[serde(default)]
    pub fallback: Option<FallbackSpec>,
}

pub fn is_safe_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

impl JobConfig {
    pub fn from_yaml(text: &str) -> Result<Self> {
        // Externally tagged enums (`{ named: [...] }`, `{ rows: 2 }`) are written as one-key maps.
        let job: JobConfig =
            serde_yaml::with::singleton_map_recursive::deserialize(serde_yaml::Deserializer::from_str(text))
                .context("parsing job definition")?;
        job.validate()?;
        Ok(job)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("loading job {}", path.display()))
    }

    pub fn datasets(&self) -> impl Iterator<Item = &DatasetSpec> {
        std::iter::once(&self.primary).chain(self.secondaries.iter())
    }

    /// Merged field set: primary fields first, then unseen secondary fields.
    pub fn declared_fields(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for dataset in self.datasets() {
            for field in dataset.output_fields() {
                if seen.insert(field.clone()) {
                    out.push(field);
                }
            }
        }
        out
    }

    pub fn field_kinds(&self) -> BTreeMap<String, FieldKind> {
        let mut kinds = BTreeMap::new();
        for dataset in self.datasets() {
            for plan in &dataset.fields {
                kinds.entry(plan.name.clone()).or_insert(plan.kind);
            }
        }
        kinds
    }

    pub fn source_urls(&self) -> BTreeMap<String, String> {
        self.datasets()
            .map(|d| (d.source.source_id.clone(), d.source.url.clone()))
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.key.width > 0, "key width must be positive");
        ensure!(
            (1..=MAX_BATCH_SIZE).contains(&self.sink.batch_size),
            "batch_size must be within 1..={MAX_BATCH_SIZE}, got {}",
            self.sink.batch_size
        );

        let mut names = BTreeSet::new();
        for dataset in self.datasets() {
            ensure!(
                names.insert(dataset.name.as_str()),
                "dataset name `{}` is used twice",
                dataset.name
            );
            for plan in &dataset.fields {
                ensure!(
                    plan.name != self.key.name,
                    "{}: field `{}` collides with the key field",
                    dataset.name,
                    plan.name
                );
                if let ColumnRef::LatestMatching(pattern) = &plan.column {
                    Regex::new(pattern).with_context(|| {
                        format!("{}: invalid pattern for `{}`", dataset.name, plan.name)
                    })?;
                }
                ensure!(
                    plan.as_of_column.is_none()
                        || matches!(plan.column, ColumnRef::LatestMatching(_)),
                    "{}: `as_of_column` requires a `latest_matching` column for `{}`",
                    dataset.name,
                    plan.name
                );
            }
        }

        let table = &self.table;
        ensure!(is_safe_identifier(&table.name), "unsafe table name `{}`", table.name);
        for column in table.allowed_columns() {
            ensure!(is_safe_identifier(column), "unsafe column name `{column}`");
        }
        ensure!(
            table.conflict_key == self.key.name,
            "conflict key `{}` must be the job key `{}`",
            table.conflict_key,
            self.key.name
        );
        ensure!(
            table.columns.iter().any(|c| c.name == table.conflict_key && !c.optional),
            "conflict key `{}` must be a non-optional table column",
            table.conflict_key
        );

        for check in &self.gate.matched {
            if let Threshold::Ratio(r) = check.minimum {
                ensure!((0.0..=1.0).contains(&r), "ratio threshold for `{}` out of range", check.field);
            }
        }

        if let Some(fallback) = &self.fallback {
            ensure!(
                fallback.key_start < fallback.key_end,
                "fallback key range is empty"
            );
        }
        Ok(())
    }
}
