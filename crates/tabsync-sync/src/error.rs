use tabsync_adapters::SourceError;
use thiserror::Error;

use crate::gate::ValidationReport;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("{dataset}: required column `{column}` not found{}", hint(.suggestion))]
    MissingColumn {
        dataset: String,
        column: String,
        suggestion: Option<String>,
    },
}

fn hint(suggestion: &Option<String>) -> String {
    suggestion
        .as_deref()
        .map(|s| format!(" (closest header: `{s}`)"))
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{dataset}: key `{key}` appears {occurrences} times; secondary datasets must be unique on the key")]
pub struct JoinCardinalityError {
    pub dataset: String,
    pub key: String,
    pub occurrences: usize,
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("validation gate failed: {}", .report.reasons.join("; "))]
pub struct ValidationThresholdError {
    pub report: ValidationReport,
}

/// Terminal failure of one batch after its retries were spent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("batch {batch} ({rows} rows) failed after {attempts} attempt(s){}: {message}", status_suffix(.status))]
pub struct UpsertBatchError {
    pub batch: usize,
    pub rows: usize,
    pub attempts: u32,
    pub status: Option<u16>,
    pub message: String,
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" with status {s}")).unwrap_or_default()
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{dataset}: {source}")]
    Source {
        dataset: String,
        #[source]
        source: SourceError,
    },
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    JoinCardinality(#[from] JoinCardinalityError),
    #[error(transparent)]
    Validation(#[from] ValidationThresholdError),
    #[error("{failed} of {total} batch(es) failed")]
    BatchesFailed {
        failed: usize,
        total: usize,
        errors: Vec<UpsertBatchError>,
    },
    #[error("missing credentials: {0}")]
    Credentials(String),
    #[error("configuration: {0:#}")]
    Config(anyhow::Error),
    #[error("sink: {0:#}")]
    Sink(anyhow::Error),
}

impl PipelineError {
    pub fn stage(&self) -> &'static str {
        match self {
            PipelineError::Source {
                source: SourceError::Fetch(_),
                ..
            } => "fetch",
            PipelineError::Source { .. } => "decode",
            PipelineError::Schema(_) => "normalize",
            PipelineError::JoinCardinality(_) => "merge",
            PipelineError::Validation(_) => "validation gate",
            PipelineError::BatchesFailed { .. } | PipelineError::Sink(_) => "sink",
            PipelineError::Credentials(_) | PipelineError::Config(_) => "configuration",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Source {
                source: SourceError::Fetch(_),
                ..
            } => 2,
            PipelineError::Source { .. } | PipelineError::Schema(_) => 3,
            PipelineError::JoinCardinality(_) => 4,
            PipelineError::Validation(_) => 5,
            PipelineError::BatchesFailed { .. } => 6,
            PipelineError::Credentials(_) | PipelineError::Config(_) => 7,
            PipelineError::Sink(_) => 1,
        }
    }

    pub fn is_fetch_failure(&self) -> bool {
        matches!(
            self,
            PipelineError::Source {
                source: SourceError::Fetch(_),
                ..
            }
        )
    }
}
