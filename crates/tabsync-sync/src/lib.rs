//! Sync pipeline: normalize, merge, validate, enrich, and persist idempotently.

pub mod config;
pub mod enrich;
pub mod error;
pub mod fallback;
pub mod gate;
pub mod merge;
pub mod normalize;
pub mod pipeline;
pub mod sink;
pub mod snapshot;

pub const CRATE_NAME: &str = "tabsync-sync";

pub use config::{load_dotenv, JobConfig, SinkKind, SyncConfig};
pub use enrich::{EnrichmentHook, NoopEnrichmentHook, RuleSet, RuleSetEnrichmentHook};
pub use error::{JoinCardinalityError, PipelineError, SchemaError, UpsertBatchError, ValidationThresholdError};
pub use fallback::{FallbackPolicy, FallbackSynthesizer};
pub use gate::{ValidationGate, ValidationReport};
pub use merge::merge;
pub use normalize::Normalizer;
pub use pipeline::{
    apply_script, build_byte_source, build_enrichment, build_sink, maybe_build_scheduler,
    SyncPipeline, SyncRunSummary,
};
pub use sink::{prepare_plan, CancelFlag, IdempotentSink, MemorySink, NetworkSink, ScriptSink, SinkReport, UpsertPlan};
