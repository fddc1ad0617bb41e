//! One sync run end to end, plus the wiring helpers the CLI and scheduler share.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use tabsync_adapters::{read_source, ByteSource, HttpByteSource};
use tabsync_core::{MergedDataset, NormalizedDataset, Provenance, RawTable, SyncRun};
use tabsync_storage::{ArtifactStore, HttpClientConfig, HttpFetcher, RestUpsertClient, RestUpsertConfig};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{DatasetSpec, JobConfig, SinkKind, SyncConfig};
use crate::enrich::{EnrichmentHook, NoopEnrichmentHook, RuleSetEnrichmentHook};
use crate::error::PipelineError;
use crate::fallback::FallbackSynthesizer;
use crate::gate::{ValidationGate, ValidationReport};
use crate::merge::merge;
use crate::normalize::Normalizer;
use crate::sink::{prepare_plan, CancelFlag, IdempotentSink, MemorySink, NetworkSink, ScriptSink, SinkReport};
use crate::snapshot::write_snapshot;

#[derive(Debug, Clone, Serialize)]
pub struct DatasetSummary {
    pub name: String,
    pub rows: usize,
    pub duplicates_dropped: usize,
    pub missing_keys: usize,
}

impl From<&NormalizedDataset> for DatasetSummary {
    fn from(dataset: &NormalizedDataset) -> Self {
        Self {
            name: dataset.name.clone(),
            rows: dataset.records.len(),
            duplicates_dropped: dataset.duplicates_dropped,
            missing_keys: dataset.missing_keys,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub job_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub provenance: Provenance,
    pub datasets: Vec<DatasetSummary>,
    pub merged_rows: usize,
    pub match_counts: BTreeMap<String, usize>,
    pub validation: Option<ValidationReport>,
    pub rows_planned: usize,
    pub sink: SinkReport,
    pub snapshot_manifest: Option<String>,
}

struct Prepared {
    run: SyncRun,
    merged: MergedDataset,
    datasets: Vec<DatasetSummary>,
    validation: Option<ValidationReport>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    job: JobConfig,
    bytes: Arc<dyn ByteSource>,
    enrichment: Box<dyn EnrichmentHook>,
    sink: Arc<dyn IdempotentSink>,
    snapshot_dir: Option<PathBuf>,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        job: JobConfig,
        bytes: Arc<dyn ByteSource>,
        sink: Arc<dyn IdempotentSink>,
    ) -> Self {
        Self {
            config,
            job,
            bytes,
            enrichment: Box::<NoopEnrichmentHook>::default(),
            sink,
            snapshot_dir: None,
        }
    }

    pub fn with_enrichment(mut self, enrichment: Box<dyn EnrichmentHook>) -> Self {
        self.enrichment = enrichment;
        self
    }

    pub fn with_snapshot_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.snapshot_dir = dir;
        self
    }

    pub fn job(&self) -> &JobConfig {
        &self.job
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary, PipelineError> {
        let run = SyncRun::new(
            self.job.job_id.clone(),
            self.job.version_label.clone(),
            self.job.source_urls(),
            Provenance::Real,
        );
        info!(job = %self.job.job_id, run_id = %run.run_id, sink = self.sink.name(), "starting sync run");

        let fetched = self.fetch_all(&run).await;
        let prepared = match fetched {
            Ok(raw) => self.validate_real(run, raw)?,
            Err(err) if err.is_fetch_failure() => self.fall_back(run, err)?,
            Err(err) => return Err(err),
        };
        let Prepared {
            run,
            merged,
            datasets,
            validation,
        } = prepared;

        let snapshot_manifest = match &self.snapshot_dir {
            Some(dir) => Some(
                write_snapshot(dir, &run, &merged, &self.job.field_kinds())
                    .await
                    .map_err(PipelineError::Sink)?
                    .display()
                    .to_string(),
            ),
            None => None,
        };

        let merged_rows = merged.total_rows();
        let match_counts = merged.match_counts.clone();
        let plan = prepare_plan(&run, &self.job.table, merged, self.job.sink.batch_size);
        let report = self.sink.write(&plan).await.map_err(PipelineError::Sink)?;

        if !report.is_success() {
            for failure in &report.failures {
                error!(batch = failure.batch, error = %failure, "batch not persisted");
            }
            return Err(PipelineError::BatchesFailed {
                failed: report.failures.len() + report.cancelled_batches,
                total: report.batches_total,
                errors: report.failures,
            });
        }

        let summary = SyncRunSummary {
            run_id: run.run_id,
            job_id: run.job_id.clone(),
            started_at: run.started_at,
            finished_at: Utc::now(),
            provenance: run.provenance,
            datasets,
            merged_rows,
            match_counts,
            validation,
            rows_planned: plan.rows_total,
            sink: report,
            snapshot_manifest,
        };
        info!(
            job = %summary.job_id,
            run_id = %summary.run_id,
            rows = summary.sink.rows_written,
            batches = summary.sink.batches_total,
            synthetic = run.is_synthetic(),
            "sync run finished"
        );
        Ok(summary)
    }

    /// Every dataset is read in full before anything is normalized.
    async fn fetch_all(&self, run: &SyncRun) -> Result<Vec<RawTable>, PipelineError> {
        let mut raw = Vec::new();
        for dataset in self.job.datasets() {
            let rows = read_source(self.bytes.as_ref(), run.run_id, &dataset.source)
                .await
                .map_err(|source| PipelineError::Source {
                    dataset: dataset.name.clone(),
                    source,
                })?;
            info!(dataset = %dataset.name, rows = rows.len(), "read source");
            raw.push(rows);
        }
        Ok(raw)
    }

    fn normalize(&self, spec: &DatasetSpec, raw: RawTable) -> Result<NormalizedDataset, PipelineError> {
        Ok(Normalizer::new(spec, &self.job.key).normalize(raw)?)
    }

    fn validate_real(&self, run: SyncRun, raw: Vec<RawTable>) -> Result<Prepared, PipelineError> {
        let mut normalized = self
            .job
            .datasets()
            .zip(raw)
            .map(|(spec, rows)| self.normalize(spec, rows))
            .collect::<Result<Vec<_>, _>>()?;
        let datasets = normalized.iter().map(DatasetSummary::from).collect();

        let secondaries = normalized.split_off(1);
        let Some(primary) = normalized.pop() else {
            return Err(PipelineError::Config(anyhow::anyhow!("job has no primary dataset")));
        };
        let merged = merge(primary, &secondaries)?;
        // Gate on what the join produced; rule-set values must not count as matches.
        let report = ValidationGate::new(self.job.gate.clone()).check(&merged)?;
        let merged = self
            .enrichment
            .apply(merged)
            .context("applying enrichment rules")
            .map_err(PipelineError::Config)?;
        Ok(Prepared {
            run,
            merged,
            datasets,
            validation: Some(report),
        })
    }

    fn fall_back(&self, run: SyncRun, err: PipelineError) -> Result<Prepared, PipelineError> {
        let policy = self.config.fallback;
        let spec = match (&self.job.fallback, policy.permits()) {
            (Some(spec), true) => spec,
            (spec, _) => {
                error!(
                    stage = err.stage(),
                    error = %err,
                    opt_in = %policy.describe(),
                    fallback_configured = spec.is_some(),
                    "FAIL CLOSED: fetch failed and mock fallback is not permitted"
                );
                return Err(err);
            }
        };

        let reason = format!("{err} ({})", policy.describe());
        let merged = FallbackSynthesizer::new(&self.job, spec).synthesize(&reason);
        let merged = self
            .enrichment
            .apply(merged)
            .context("applying enrichment rules")
            .map_err(PipelineError::Config)?;
        Ok(Prepared {
            run: run.as_synthetic(),
            merged,
            datasets: Vec::new(),
            validation: None,
        })
    }
}

pub fn build_byte_source(config: &SyncConfig) -> Result<Arc<dyn ByteSource>> {
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
    })?;
    let mut source = HttpByteSource::new(Arc::new(http));
    if let Some(dir) = &config.artifacts_dir {
        source = source.with_archive(ArtifactStore::new(config.resolve(dir)));
    }
    Ok(Arc::new(source))
}

pub fn build_enrichment(config: &SyncConfig, job: &JobConfig) -> Result<Box<dyn EnrichmentHook>> {
    match &job.rules_file {
        Some(path) => Ok(Box::new(RuleSetEnrichmentHook::from_file(&config.resolve(path))?)),
        None => Ok(Box::<NoopEnrichmentHook>::default()),
    }
}

pub fn default_script_path(config: &SyncConfig, job: &JobConfig) -> PathBuf {
    match &job.sink.output {
        Some(path) => config.resolve(path),
        None => config
            .workspace_root
            .join("out")
            .join(format!("{}_upsert.sql", job.job_id)),
    }
}

/// Credentials are checked here, before any source is fetched.
pub fn build_sink(
    config: &SyncConfig,
    job: &JobConfig,
    kind: SinkKind,
    output: Option<PathBuf>,
    cancel: CancelFlag,
) -> Result<Arc<dyn IdempotentSink>, PipelineError> {
    match kind {
        SinkKind::Script => {
            let path = output.unwrap_or_else(|| default_script_path(config, job));
            Ok(Arc::new(ScriptSink::new(path, job.sink.notice.clone())))
        }
        SinkKind::Memory => Ok(Arc::new(MemorySink::new())),
        SinkKind::Network => {
            let missing: Vec<&str> = [
                ("UPSERT_ENDPOINT_URL", config.upsert_endpoint.is_none()),
                ("UPSERT_API_KEY", config.upsert_api_key.is_none()),
            ]
            .into_iter()
            .filter_map(|(name, absent)| absent.then_some(name))
            .collect();
            let (Some(base_url), Some(api_key)) = (&config.upsert_endpoint, &config.upsert_api_key) else {
                return Err(PipelineError::Credentials(format!(
                    "{} must be set for the network sink",
                    missing.join(" and ")
                )));
            };
            let client = RestUpsertClient::new(RestUpsertConfig {
                base_url: base_url.clone(),
                api_key: api_key.clone(),
                timeout: Duration::from_secs(config.http_timeout_secs),
            })
            .map_err(PipelineError::Config)?;
            Ok(Arc::new(
                NetworkSink::new(client)
                    .with_concurrency(config.upsert_concurrency)
                    .with_cancel_flag(cancel),
            ))
        }
    }
}

pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    pipeline: Arc<SyncPipeline>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for cron in &config.sync_crons {
        let pipeline = Arc::clone(&pipeline);
        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once().await {
                    Ok(summary) => info!(
                        job = %summary.job_id,
                        run_id = %summary.run_id,
                        rows = summary.sink.rows_written,
                        "scheduled sync finished"
                    ),
                    Err(err) => error!(
                        job = %pipeline.job().job_id,
                        stage = err.stage(),
                        error = %err,
                        "scheduled sync failed"
                    ),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(%cron, "scheduled sync job");
    }
    Ok(Some(sched))
}

/// Executes a generated script on one connection; the script's own BEGIN/COMMIT decide atomicity.
pub async fn apply_script(database_url: &str, path: &Path) -> Result<()> {
    let script = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    if !script.contains("BEGIN;") || !script.trim_end().ends_with("COMMIT;") {
        warn!(path = %path.display(), "script is not wrapped in BEGIN/COMMIT");
    }

    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(database_url)
        .await
        .context("connecting to database")?;
    sqlx::raw_sql(&script)
        .execute(&pool)
        .await
        .with_context(|| format!("executing {}", path.display()))?;
    pool.close().await;

    info!(path = %path.display(), bytes = script.len(), "applied upsert script");
    Ok(())
}
