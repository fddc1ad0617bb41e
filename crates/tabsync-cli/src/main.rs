use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tabsync_sync::{
    apply_script, build_byte_source, build_enrichment, build_sink, load_dotenv,
    maybe_build_scheduler, CancelFlag, JobConfig, PipelineError, SinkKind, SyncConfig,
    SyncPipeline,
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "tabsync")]
#[command(about = "Fetch, validate and idempotently persist tabular datasets")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one job end to end.
    Run {
        #[arg(long)]
        job: PathBuf,
        /// script, network or memory; defaults to the job's sink.
        #[arg(long)]
        sink: Option<String>,
        /// Output path for the script sink.
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        snapshot_dir: Option<PathBuf>,
    },
    /// Execute a generated upsert script against DATABASE_URL.
    Apply {
        #[arg(long)]
        script: PathBuf,
        #[arg(long)]
        database_url: Option<String>,
    },
    /// Run a job on the SYNC_CRON schedule until interrupted.
    Schedule {
        #[arg(long)]
        job: PathBuf,
    },
    /// Parse and validate a job file.
    CheckJob {
        #[arg(long)]
        job: PathBuf,
    },
}

fn load_job(path: &Path) -> Result<JobConfig, PipelineError> {
    JobConfig::load(path).map_err(PipelineError::Config)
}

fn build_pipeline(
    config: &SyncConfig,
    job: JobConfig,
    sink: Option<String>,
    out: Option<PathBuf>,
    cancel: CancelFlag,
) -> Result<SyncPipeline, PipelineError> {
    let kind = match sink {
        Some(name) => name.parse::<SinkKind>().map_err(PipelineError::Config)?,
        None => job.sink.kind,
    };
    let sink = build_sink(config, &job, kind, out, cancel)?;
    let bytes = build_byte_source(config).map_err(PipelineError::Config)?;
    let enrichment = build_enrichment(config, &job).map_err(PipelineError::Config)?;
    Ok(SyncPipeline::new(config.clone(), job, bytes, sink).with_enrichment(enrichment))
}

async fn run_job(
    config: SyncConfig,
    job: PathBuf,
    sink: Option<String>,
    out: Option<PathBuf>,
    snapshot_dir: Option<PathBuf>,
) -> Result<()> {
    let job = load_job(&job)?;
    let cancel = CancelFlag::new();
    let pipeline = build_pipeline(&config, job, sink, out, cancel.clone())?
        .with_snapshot_dir(snapshot_dir);

    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; no further batches will be dispatched");
            cancel.cancel();
        }
    });
    let result = pipeline.run_once().await;
    interrupt.abort();
    let summary = result?;

    println!(
        "sync complete: job={} run_id={} provenance={:?} rows={} batches={} sink={}{}",
        summary.job_id,
        summary.run_id,
        summary.provenance,
        summary.sink.rows_written,
        summary.sink.batches_total,
        summary.sink.sink,
        summary
            .sink
            .output
            .as_ref()
            .map(|p| format!(" output={}", p.display()))
            .unwrap_or_default()
    );
    Ok(())
}

async fn schedule_job(config: SyncConfig, job: PathBuf) -> Result<()> {
    let job = load_job(&job)?;
    let pipeline = Arc::new(build_pipeline(&config, job, None, None, CancelFlag::new())?);

    let Some(mut sched) = maybe_build_scheduler(&config, pipeline).await? else {
        warn!("scheduler disabled; set TABSYNC_SCHEDULER_ENABLED=true to enable it");
        return Ok(());
    };
    sched.start().await.context("starting scheduler")?;
    info!(crons = ?config.sync_crons, "scheduler running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

async fn execute(cli: Cli, config: SyncConfig) -> Result<()> {
    match cli.command {
        Commands::Run {
            job,
            sink,
            out,
            snapshot_dir,
        } => run_job(config, job, sink, out, snapshot_dir).await,
        Commands::Apply {
            script,
            database_url,
        } => {
            let Some(database_url) = database_url.or(config.database_url) else {
                return Err(PipelineError::Credentials("DATABASE_URL must be set for apply".into()).into());
            };
            apply_script(&database_url, &script).await?;
            println!("applied {}", script.display());
            Ok(())
        }
        Commands::Schedule { job } => schedule_job(config, job).await,
        Commands::CheckJob { job } => {
            let job = load_job(&job)?;
            println!(
                "job {} ok: {} dataset(s), {} field(s), table {} keyed on {}",
                job.job_id,
                job.datasets().count(),
                job.declared_fields().len(),
                job.table.name,
                job.table.conflict_key
            );
            Ok(())
        }
    }
}

fn exit_code(err: &anyhow::Error) -> (u8, &'static str) {
    err.downcast_ref::<PipelineError>()
        .map(|e| (e.exit_code() as u8, e.stage()))
        .unwrap_or((1, "cli"))
}

fn main() -> ExitCode {
    let workspace_root = std::env::var("TABSYNC_WORKSPACE_ROOT").unwrap_or_else(|_| ".".to_string());
    let dotenv = load_dotenv(&Path::new(&workspace_root).join(".env"));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = dotenv {
        warn!(error = %format!("{err:#}"), "ignoring unreadable .env file");
    }

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "could not start async runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(execute(cli, config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let (code, stage) = exit_code(&err);
            error!(stage, error = %format!("{err:#}"), "tabsync failed");
            ExitCode::from(code)
        }
    }
}
