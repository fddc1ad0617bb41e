use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tabsync_core::UpsertBatch;
use tabsync_storage::{
    classify_status, RetryDisposition, RetryPolicy, Sleeper, TokioSleeper, UpsertTransport,
};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::{IdempotentSink, SinkReport, UpsertPlan};
use crate::error::UpsertBatchError;

const MAX_ERROR_BODY: usize = 300;

/// Run-granular abort: once set, no further batches are dispatched.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutcome {
    pub index: usize,
    pub rows: usize,
    pub attempts: u32,
    pub error: Option<UpsertBatchError>,
}

fn truncate(body: &str) -> String {
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((cut, _)) => format!("{}…", &body[..cut]),
        None => body.to_string(),
    }
}

/// Posts batches to a merge-on-conflict endpoint with bounded concurrency and per-batch retry.
pub struct NetworkSink<T, S = TokioSleeper> {
    transport: Arc<T>,
    sleeper: Arc<S>,
    policy: RetryPolicy,
    concurrency: usize,
    cancel: CancelFlag,
}

impl<T, S> Clone for NetworkSink<T, S> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            sleeper: Arc::clone(&self.sleeper),
            policy: self.policy,
            concurrency: self.concurrency,
            cancel: self.cancel.clone(),
        }
    }
}

impl<T> NetworkSink<T, TokioSleeper>
where
    T: UpsertTransport + 'static,
{
    pub fn new(transport: T) -> Self {
        Self::with_sleeper(transport, TokioSleeper)
    }
}

impl<T, S> NetworkSink<T, S>
where
    T: UpsertTransport + 'static,
    S: Sleeper + 'static,
{
    pub fn with_sleeper(transport: T, sleeper: S) -> Self {
        Self {
            transport: Arc::new(transport),
            sleeper: Arc::new(sleeper),
            policy: RetryPolicy::default(),
            concurrency: 4,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// One batch, retried on transient outcomes until the policy gives up.
    pub async fn upsert(&self, batch: &UpsertBatch) -> BatchOutcome {
        let failed = |attempts: u32, status: Option<u16>, message: String| BatchOutcome {
            index: batch.index,
            rows: batch.len(),
            attempts,
            error: Some(UpsertBatchError {
                batch: batch.index,
                rows: batch.len(),
                attempts,
                status,
                message,
            }),
        };

        let body = match serde_json::to_vec(&batch.rows) {
            Ok(body) => body,
            Err(err) => return failed(0, None, format!("serializing batch: {err}")),
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let (disposition, status, message) = match self
                .transport
                .post_batch(&batch.table, &batch.conflict_key, body.clone())
                .await
            {
                Ok(resp) if resp.is_success() => {
                    debug!(attempt, status = resp.status, "batch accepted");
                    return BatchOutcome {
                        index: batch.index,
                        rows: batch.len(),
                        attempts: attempt,
                        error: None,
                    };
                }
                Ok(resp) => (
                    classify_status(resp.status),
                    Some(resp.status),
                    truncate(&resp.body),
                ),
                Err(err) => (err.disposition, None, err.message),
            };

            if disposition == RetryDisposition::Retryable && self.policy.allows_retry_after(attempt) {
                let delay = self.policy.sample_delay(attempt);
                warn!(
                    attempt,
                    status = ?status,
                    delay_ms = delay.as_millis() as u64,
                    %message,
                    "transient upsert failure; retrying"
                );
                self.sleeper.sleep(delay).await;
                continue;
            }

            error!(attempt, status = ?status, %message, "batch failed");
            return failed(attempt, status, message);
        }
    }
}

#[async_trait]
impl<T, S> IdempotentSink for NetworkSink<T, S>
where
    T: UpsertTransport + 'static,
    S: Sleeper + 'static,
{
    fn name(&self) -> &'static str {
        "network"
    }

    async fn write(&self, plan: &UpsertPlan) -> Result<SinkReport> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        let mut cancelled_batches = 0;

        for (position, batch) in plan.batches.iter().enumerate() {
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .context("upsert semaphore closed")?;
            if self.cancel.is_cancelled() {
                cancelled_batches = plan.batches.len() - position;
                warn!(cancelled_batches, "cancellation requested; no further batches dispatched");
                break;
            }
            let sink = self.clone();
            let batch = batch.clone();
            let span = info_span!("upsert_batch", batch = batch.index, rows = batch.len());
            tasks.spawn(
                async move {
                    let _permit = permit;
                    sink.upsert(&batch).await
                }
                .instrument(span),
            );
        }

        let mut outcomes = Vec::with_capacity(plan.batches.len());
        while let Some(joined) = tasks.join_next().await {
            outcomes.push(joined.context("upsert task failed to complete")?);
        }
        outcomes.sort_by_key(|o| o.index);

        let batches_succeeded = outcomes.iter().filter(|o| o.error.is_none()).count();
        let rows_written = outcomes
            .iter()
            .filter(|o| o.error.is_none())
            .map(|o| o.rows)
            .sum();
        let failures: Vec<UpsertBatchError> =
            outcomes.into_iter().filter_map(|o| o.error).collect();

        info!(
            table = %plan.table.name,
            batches = plan.batches.len(),
            succeeded = batches_succeeded,
            failed = failures.len(),
            cancelled = cancelled_batches,
            rows_written,
            "network upsert finished"
        );
        Ok(SinkReport {
            sink: self.name().to_string(),
            batches_total: plan.batches.len(),
            batches_succeeded,
            rows_written,
            rows_skipped_missing_key: plan.skipped_missing_key,
            failures,
            cancelled_batches,
            output: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::prepare_plan;
    use crate::sink::tests::{merged, run, table};
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;
    use tabsync_core::UpsertRecord;
    use tabsync_storage::{TransportError, TransportResponse};

    #[derive(Default)]
    struct ScriptedTransport {
        statuses: Mutex<VecDeque<u16>>,
        reject_containing: Option<String>,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn with_statuses(statuses: &[u16]) -> Self {
            Self {
                statuses: Mutex::new(statuses.iter().copied().collect()),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl UpsertTransport for ScriptedTransport {
        async fn post_batch(
            &self,
            table: &str,
            conflict_key: &str,
            body: Vec<u8>,
        ) -> Result<TransportResponse, TransportError> {
            assert_eq!(table, "zip_housing_costs");
            assert_eq!(conflict_key, "zip");
            self.calls.fetch_add(1, Ordering::SeqCst);
            let text = String::from_utf8(body).expect("utf8 body");
            if let Some(needle) = &self.reject_containing {
                if text.contains(needle.as_str()) {
                    return Ok(TransportResponse { status: 400, body: "bad row".into() });
                }
            }
            let status = self.statuses.lock().expect("lock").pop_front().unwrap_or(201);
            Ok(TransportResponse { status, body: String::new() })
        }
    }

    #[derive(Default)]
    struct RecordingSleeper {
        delays: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.delays.lock().expect("lock").push(duration);
        }
    }

    fn batch() -> UpsertBatch {
        let mut columns = std::collections::BTreeMap::new();
        columns.insert("zip".to_string(), "00501".into());
        UpsertBatch {
            index: 0,
            table: "zip_housing_costs".into(),
            conflict_key: "zip".into(),
            rows: vec![UpsertRecord { columns }],
        }
    }

    #[tokio::test]
    async fn transient_statuses_are_retried_until_success() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let sink = NetworkSink {
            transport: Arc::new(ScriptedTransport::with_statuses(&[503, 503, 429, 500, 502])),
            sleeper: Arc::clone(&sleeper),
            policy: RetryPolicy::default(),
            concurrency: 1,
            cancel: CancelFlag::new(),
        };
        let outcome = sink.upsert(&batch()).await;

        assert!(outcome.error.is_none());
        assert_eq!(outcome.attempts, 6);
        let delays = sleeper.delays.lock().expect("lock");
        assert_eq!(delays.len(), 5);
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(30)));
        assert!(delays[0] >= Duration::from_secs(1) && delays[0] < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn non_transient_status_is_not_retried() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let sink = NetworkSink {
            transport: Arc::new(ScriptedTransport::with_statuses(&[409])),
            sleeper: Arc::clone(&sleeper),
            policy: RetryPolicy::default(),
            concurrency: 1,
            cancel: CancelFlag::new(),
        };
        let outcome = sink.upsert(&batch()).await;

        assert_eq!(outcome.attempts, 1);
        let error = outcome.error.expect("failed");
        assert_eq!(error.status, Some(409));
        assert!(sleeper.delays.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let sink = NetworkSink::with_sleeper(
            ScriptedTransport::with_statuses(&[503; 10]),
            RecordingSleeper::default(),
        );
        let outcome = sink.upsert(&batch()).await;
        assert_eq!(outcome.attempts, 7);
        assert_eq!(outcome.error.and_then(|e| e.status), Some(503));
    }

    #[tokio::test]
    async fn failed_batch_does_not_stop_the_run() {
        let transport = ScriptedTransport {
            reject_containing: Some("00601".into()),
            ..ScriptedTransport::default()
        };
        let sink = NetworkSink::with_sleeper(transport, RecordingSleeper::default()).with_concurrency(2);
        let plan = prepare_plan(
            &run(),
            &table(),
            merged(&[("00501", Some(1)), ("00601", Some(2)), ("00701", Some(3))]),
            1,
        );
        let report = sink.write(&plan).await.expect("write");

        assert_eq!(report.batches_total, 3);
        assert_eq!(report.batches_succeeded, 2);
        assert_eq!(report.rows_written, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].batch, 1);
        assert!(!report.is_success());
    }

    #[tokio::test]
    async fn cancelled_run_dispatches_nothing_further() {
        let sink = NetworkSink::with_sleeper(ScriptedTransport::default(), RecordingSleeper::default());
        sink.cancel_flag().cancel();
        let plan = prepare_plan(&run(), &table(), merged(&[("00501", Some(1)), ("00601", Some(2))]), 1);
        let report = sink.write(&plan).await.expect("write");

        assert_eq!(report.cancelled_batches, 2);
        assert_eq!(report.batches_succeeded, 0);
        assert_eq!(sink.transport.calls.load(Ordering::SeqCst), 0);
        assert!(!report.is_success());
    }
}
