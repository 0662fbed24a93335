//! The per-shard batcher and bulk-dispatch-with-retry loop (`spec.md`
//! §4.5).

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use backoff::{Backoff, BackoffConfig, BackoffResult};
use cbes_types::{BulkOutcome, Checkpoint, IndexRequest, Partition, SeqNo};
use checkpoint_service::CheckpointHandle;
use metric::{Metric, U64Counter, U64Gauge};
use observability_deps::tracing::warn;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::index_client::IndexClient;

#[derive(Debug, Clone)]
pub struct BatchThresholds {
    pub max_docs: usize,
    pub max_bytes: usize,
    pub flush_deadline: Duration,
}

#[derive(Debug, Clone)]
pub struct BulkMetrics {
    pub attempts: Metric<U64Counter>,
    pub successes: Metric<U64Counter>,
    pub retries: Metric<U64Counter>,
    pub rejects: Metric<U64Counter>,
    pub version_conflicts: Metric<U64Counter>,
    pub es_wait_ms: Metric<U64Gauge>,
    pub write_queue: Metric<U64Gauge>,
}

impl BulkMetrics {
    /// Registers the bulk-request counters and gauges named in `spec.md`
    /// §6's metrics surface.
    pub fn new(registry: &metric::Registry) -> Self {
        Self {
            attempts: registry.register_metric("cbes_bulk_attempts", "bulk call attempts"),
            successes: registry.register_metric("cbes_bulk_successes", "bulk items applied"),
            retries: registry.register_metric("cbes_bulk_retries", "bulk items retried"),
            rejects: registry.register_metric("cbes_bulk_rejects", "bulk items rejected"),
            version_conflicts: registry
                .register_metric("cbes_bulk_version_conflicts", "bulk items version-conflicted"),
            es_wait_ms: registry.register_metric("cbes_es_wait_ms", "duration of the in-flight bulk call"),
            write_queue: registry.register_metric("cbes_write_queue", "pending requests across all shards"),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("bulk dispatch attempt needs another round")]
struct RetryNeeded;

/// Drains `rx` into thresholded batches and dispatches each with retry,
/// until the channel is closed and drained. One instance of this loop runs
/// per shard (`spec.md` §4.5's "hashing docId to a worker shard").
pub async fn run_shard(
    shard: usize,
    mut rx: mpsc::Receiver<IndexRequest>,
    client: Arc<dyn IndexClient>,
    backoff_config: BackoffConfig,
    thresholds: BatchThresholds,
    checkpoint: CheckpointHandle,
    metrics: BulkMetrics,
    queue_depth: Arc<std::sync::atomic::AtomicI64>,
) {
    loop {
        let Some(first) = rx.recv().await else {
            return;
        };
        queue_depth.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
        metrics.write_queue.recorder_default().set(queue_depth.load(std::sync::atomic::Ordering::Relaxed).max(0) as u64);

        let mut bytes = first.approx_bytes();
        let mut batch = vec![first];
        let deadline = Instant::now() + thresholds.flush_deadline;
        let mut closed = false;

        while batch.len() < thresholds.max_docs && bytes < thresholds.max_bytes {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some(request)) => {
                    queue_depth.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
                    bytes += request.approx_bytes();
                    batch.push(request);
                }
                Ok(None) => {
                    closed = true;
                    break;
                }
                Err(_elapsed) => break,
            }
        }
        metrics.write_queue.recorder_default().set(queue_depth.load(std::sync::atomic::Ordering::Relaxed).max(0) as u64);

        dispatch_batch(shard, Arc::clone(&client), &backoff_config, batch, &checkpoint, &metrics).await;

        if closed {
            return;
        }
    }
}

/// Dispatch one batch, retrying the whole unit on connection failure and
/// the retryable subset on partial failure, until everything reaches a
/// terminal outcome. Then advances the checkpoint once per partition with
/// that batch's maximum seqno (`spec.md` §4.5 "Checkpoint accounting").
async fn dispatch_batch(
    shard: usize,
    client: Arc<dyn IndexClient>,
    backoff_config: &BackoffConfig,
    initial: Vec<IndexRequest>,
    checkpoint: &CheckpointHandle,
    metrics: &BulkMetrics,
) {
    let remaining = Arc::new(Mutex::new(initial));
    let completed = Arc::new(Mutex::new(Vec::new()));
    let completed_handle = Arc::clone(&completed);
    let mut backoff = Backoff::new(backoff_config);
    let mut wait_started = Instant::now();

    let outcome: BackoffResult<()> = backoff
        .retry_with_backoff("bulk dispatch", move || {
            let client = Arc::clone(&client);
            let remaining = Arc::clone(&remaining);
            let completed = Arc::clone(&completed_handle);
            let metrics = metrics.clone();
            wait_started = Instant::now();
            async move {
                let batch = remaining.lock().clone();
                metrics.attempts.recorder_default().inc();

                let result = client.bulk(batch.clone()).await;
                metrics
                    .es_wait_ms
                    .recorder_default()
                    .set(wait_started.elapsed().as_millis() as u64);

                match result {
                    Err(err) => {
                        warn!(shard, %err, "bulk call failed wholesale, retrying as a unit");
                        ControlFlow::Continue(RetryNeeded)
                    }
                    Ok(outcomes) => {
                        let mut retry_batch = Vec::new();
                        let mut done = completed.lock();
                        for (request, item) in batch.into_iter().zip(outcomes) {
                            match item {
                                BulkOutcome::Success => {
                                    metrics.successes.recorder_default().inc();
                                    done.push(request);
                                }
                                BulkOutcome::VersionConflict => {
                                    metrics.version_conflicts.recorder_default().inc();
                                    done.push(request);
                                }
                                BulkOutcome::Rejected => {
                                    metrics.rejects.recorder_default().inc();
                                    done.push(request);
                                }
                                BulkOutcome::Retryable => {
                                    metrics.retries.recorder_default().inc();
                                    retry_batch.push(request);
                                }
                            }
                        }
                        drop(done);

                        if retry_batch.is_empty() {
                            ControlFlow::Break(())
                        } else {
                            *remaining.lock() = retry_batch;
                            ControlFlow::Continue(RetryNeeded)
                        }
                    }
                }
            }
        })
        .await;

    // `Backoff::retry_with_backoff` never gives up (`BackoffError` is
    // `Infallible`), so this always succeeds once every item is terminal.
    let _: () = outcome.unwrap_or_else(|infallible| match infallible {});

    let completed = Arc::try_unwrap(completed)
        .expect("no other Arc clone survives past retry_with_backoff completion")
        .into_inner();

    let mut max_seqno: HashMap<Partition, SeqNo> = HashMap::new();
    for request in &completed {
        let (partition, seqno) = request.origin();
        max_seqno
            .entry(partition)
            .and_modify(|current| {
                if seqno > *current {
                    *current = seqno;
                }
            })
            .or_insert(seqno);
    }

    for (partition, seqno) in max_seqno {
        let mut next = checkpoint
            .get(partition)
            .unwrap_or_else(|| Checkpoint::zero_at(partition, cbes_types::BucketUuid::unknown(), seqno));
        next.seqno = seqno;
        checkpoint.set(partition, next);
    }
}
