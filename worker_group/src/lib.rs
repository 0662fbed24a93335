//! Turns a stream of [`cbes_types::IndexRequest`]s into bulk calls against
//! the index, preserving per-docId ordering, retrying indefinitely, and
//! latching the first fatal error (`spec.md` §4.5, component C5 — "the
//! heart of the design").
//!
//! Mirrors the teacher's lifecycle manager/handle split: [`WorkerGroup`]
//! is owned exclusively by the Supervisor and drives shutdown; cheap-clone
//! [`WorkerGroupHandle`]s are handed to the replication pipeline for
//! submission.
#![warn(missing_debug_implementations, clippy::clone_on_ref_ptr)]

mod batch;
mod fatal;
pub mod index_client;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::AtomicI64;
use std::sync::Arc;
use std::time::Duration;

use backoff::BackoffConfig;
use cbes_types::IndexRequest;
use checkpoint_service::CheckpointHandle;
use metric::Registry;
use observability_deps::tracing::info;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use batch::{BatchThresholds, BulkMetrics};
pub use fatal::{FatalError, FatalSlot};
pub use index_client::{HttpIndexClient, IndexClient, IndexClientError, MockIndexClient};

/// Configuration for a [`WorkerGroup`]: batching thresholds, queue
/// capacity, shard count, and the retry backoff.
#[derive(Debug, Clone)]
pub struct WorkerGroupConfig {
    /// Number of independent shard workers; `docId`s hash to a fixed
    /// shard so per-document ordering is preserved without a global lock
    /// (`spec.md` §4.5).
    pub shard_count: usize,
    /// Bounded capacity of each shard's queue.
    pub queue_capacity_per_shard: usize,
    pub thresholds: BatchThresholds,
    pub backoff: BackoffConfig,
}

impl Default for WorkerGroupConfig {
    fn default() -> Self {
        Self {
            shard_count: 4,
            queue_capacity_per_shard: 256,
            thresholds: BatchThresholds {
                max_docs: 500,
                max_bytes: 5 * 1024 * 1024,
                flush_deadline: Duration::from_millis(200),
            },
            backoff: BackoffConfig::default(),
        }
    }
}

/// `spec.md` §4.5's `Idle → Running → Draining → Closed` state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
    Draining,
    Closed,
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("cannot start a worker group in state {0:?}, expected Idle")]
    NotIdle(WorkerState),
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("worker group is not running (state: {0:?})")]
    NotRunning(WorkerState),
    #[error("worker group queue is closed")]
    Closed,
}

fn shard_for(doc_id: &str, shard_count: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    doc_id.hash(&mut hasher);
    (hasher.finish() as usize) % shard_count
}

/// A cheap-clone submission surface for components that feed the worker
/// group (the replication pipeline). Submission blocks when the target
/// shard's queue is full, which is the back-pressure signal that
/// ultimately pauses the source's flow-control credits (`spec.md` §5, P5).
#[derive(Debug, Clone)]
pub struct WorkerGroupHandle {
    senders: Vec<mpsc::Sender<IndexRequest>>,
    state: Arc<Mutex<WorkerState>>,
    queue_depth: Arc<AtomicI64>,
}

impl WorkerGroupHandle {
    pub async fn submit(&self, request: IndexRequest) -> Result<(), SubmitError> {
        let state = *self.state.lock();
        if state != WorkerState::Running {
            return Err(SubmitError::NotRunning(state));
        }

        let shard = shard_for(request.doc_id(), self.senders.len());
        self.queue_depth
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.senders[shard]
            .send(request)
            .await
            .map_err(|_| SubmitError::Closed)
    }

    /// Current approximate total queue depth across every shard, used by
    /// `spec.md` §5's back-pressure description and the `write.queue`
    /// metric.
    pub fn queue_depth(&self) -> i64 {
        self.queue_depth.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// Owns the shard worker tasks and the fatal-error latch. Exactly one
/// instance exists per running process, held by the Supervisor.
#[derive(Debug)]
pub struct WorkerGroup {
    senders: Vec<mpsc::Sender<IndexRequest>>,
    handles: Vec<JoinHandle<()>>,
    state: Arc<Mutex<WorkerState>>,
    fatal: Arc<FatalSlot>,
    queue_depth: Arc<AtomicI64>,
}

impl WorkerGroup {
    /// Construct the worker group `Idle`, spawning one task per shard.
    /// Shard tasks sit parked on an empty channel until submissions start
    /// arriving; [`WorkerGroup::start`] only gates [`WorkerGroupHandle::submit`],
    /// not the tasks themselves.
    pub fn new(
        config: WorkerGroupConfig,
        client: Arc<dyn IndexClient>,
        checkpoint: CheckpointHandle,
        registry: &Registry,
    ) -> Self {
        let fatal = Arc::new(FatalSlot::new());
        let state = Arc::new(Mutex::new(WorkerState::Idle));
        let queue_depth = Arc::new(AtomicI64::new(0));
        let metrics = BulkMetrics::new(registry);

        let mut senders = Vec::with_capacity(config.shard_count);
        let mut handles = Vec::with_capacity(config.shard_count);
        for shard in 0..config.shard_count {
            let (tx, rx) = mpsc::channel(config.queue_capacity_per_shard);
            senders.push(tx);
            handles.push(tokio::spawn(batch::run_shard(
                shard,
                rx,
                Arc::clone(&client),
                config.backoff.clone(),
                config.thresholds.clone(),
                checkpoint.clone(),
                metrics.clone(),
                Arc::clone(&queue_depth),
            )));
        }

        Self {
            senders,
            handles,
            state,
            fatal,
            queue_depth,
        }
    }

    /// A cheap-clone submission handle sharing this group's shards.
    pub fn handle(&self) -> WorkerGroupHandle {
        WorkerGroupHandle {
            senders: self.senders.clone(),
            state: Arc::clone(&self.state),
            queue_depth: Arc::clone(&self.queue_depth),
        }
    }

    /// The panic-button latch, shared with the replication pipeline so a
    /// protocol-level fault can be routed here too (`spec.md` §4.6).
    pub fn fatal_slot(&self) -> Arc<FatalSlot> {
        Arc::clone(&self.fatal)
    }

    pub fn start(&self) -> Result<(), StateError> {
        let mut state = self.state.lock();
        match *state {
            WorkerState::Idle => {
                *state = WorkerState::Running;
                Ok(())
            }
            other => Err(StateError::NotIdle(other)),
        }
    }

    /// Immediately transitions to `Closed` without flushing, aborting
    /// every shard task. Used when a fatal error is latched
    /// (`spec.md` §4.5: "Running → Closed on fatal error; immediate; no
    /// flush").
    pub fn latch_fatal(&self, error: FatalError) {
        let mut state = self.state.lock();
        if *state == WorkerState::Closed {
            return;
        }
        *state = WorkerState::Closed;
        drop(state);
        for handle in &self.handles {
            handle.abort();
        }
        self.fatal.latch(error);
    }

    pub async fn await_fatal_error(&self) -> FatalError {
        self.fatal.await_error().await
    }

    /// Graceful shutdown: `Running → Draining`, drop this instance's own
    /// sender clones so each shard's queue closes once drained, then wait
    /// for every shard to finish its last batch. Callers MUST have already
    /// dropped every [`WorkerGroupHandle`] (i.e. disconnected the source)
    /// before calling this, or the channels never close (`spec.md` §4.7
    /// shutdown: "Close WorkerGroup... after source disconnects").
    pub async fn close(mut self) {
        {
            let mut state = self.state.lock();
            if *state == WorkerState::Closed {
                return;
            }
            *state = WorkerState::Draining;
        }
        self.senders.clear();

        for handle in self.handles.drain(..) {
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    info!(%err, "shard worker task ended with an error during shutdown");
                }
            }
        }

        *self.state.lock() = WorkerState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cbes_types::{BucketUuid, Partition, SeqNo};
    use checkpoint_service::{CheckpointService, InitError, LiveSeqnoProvider};
    use checkpoint_store::{CheckpointStore, MemoryCollection};
    use clock::{MockProvider, TimeProvider};

    struct FixedLiveState;

    #[async_trait]
    impl LiveSeqnoProvider for FixedLiveState {
        async fn live_state(&self, _partition: Partition) -> Result<(BucketUuid, SeqNo), InitError> {
            Ok((BucketUuid::from("bucket-a"), SeqNo(0)))
        }
    }

    async fn checkpoint_handle(registry: &Registry) -> CheckpointHandle {
        let store = CheckpointStore::new("grp", Arc::new(MemoryCollection::new()));
        let time_provider: Arc<dyn TimeProvider> = Arc::new(MockProvider::new(chrono::Utc::now()));
        let service = CheckpointService::init(
            store,
            &[Partition(0), Partition(1)],
            &FixedLiveState,
            time_provider,
            registry,
        )
        .await
        .unwrap();
        service.handle()
    }

    fn upsert(doc_id: &str, seqno: u64) -> IndexRequest {
        IndexRequest::Upsert {
            index_name: "docs".to_string(),
            doc_id: doc_id.to_string(),
            version: seqno,
            routing: None,
            pipeline: None,
            body: b"{}".to_vec(),
            partition: Partition(0),
            seqno: SeqNo(seqno),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn submit_before_start_is_rejected() {
        let registry = Registry::new();
        let checkpoint = checkpoint_handle(&registry).await;
        let client = Arc::new(MockIndexClient::new());
        let group = WorkerGroup::new(WorkerGroupConfig::default(), client, checkpoint, &registry);
        let handle = group.handle();

        let err = handle.submit(upsert("a", 1)).await.unwrap_err();
        assert!(matches!(err, SubmitError::NotRunning(WorkerState::Idle)));
    }

    /// S1: two upserts of the same docId only ever produce a committed
    /// seqno equal to the latest one, and both are applied in order.
    #[tokio::test(flavor = "multi_thread")]
    async fn same_doc_id_upserts_apply_in_submission_order() {
        let registry = Registry::new();
        let checkpoint = checkpoint_handle(&registry).await;
        let client = Arc::new(MockIndexClient::new());
        let group = WorkerGroup::new(
            WorkerGroupConfig {
                shard_count: 1,
                ..WorkerGroupConfig::default()
            },
            Arc::clone(&client) as Arc<dyn IndexClient>,
            checkpoint.clone(),
            &registry,
        );
        group.start().unwrap();
        let handle = group.handle();

        handle.submit(upsert("a", 1)).await.unwrap();
        handle.submit(upsert("a", 2)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(client.document_version("a"), Some(2));
        assert_eq!(checkpoint.get(Partition(0)).unwrap().seqno, SeqNo(2));
    }

    /// S4: retryable failures don't advance the checkpoint until the item
    /// finally succeeds.
    #[tokio::test(flavor = "multi_thread")]
    async fn retries_delay_checkpoint_advance() {
        let registry = Registry::new();
        let checkpoint = checkpoint_handle(&registry).await;
        let client = Arc::new(MockIndexClient::new());
        client.script(
            "a",
            vec![
                cbes_types::BulkOutcome::Retryable,
                cbes_types::BulkOutcome::Retryable,
                cbes_types::BulkOutcome::Success,
            ],
        );

        let mut config = WorkerGroupConfig {
            shard_count: 1,
            ..WorkerGroupConfig::default()
        };
        config.backoff = BackoffConfig {
            init_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            multiplier: 2.0,
        };

        let group = WorkerGroup::new(config, Arc::clone(&client) as Arc<dyn IndexClient>, checkpoint.clone(), &registry);
        group.start().unwrap();
        let handle = group.handle();
        handle.submit(upsert("a", 9)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(checkpoint.get(Partition(0)).unwrap().seqno, SeqNo(9));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fatal_latch_stops_submissions() {
        let registry = Registry::new();
        let checkpoint = checkpoint_handle(&registry).await;
        let client = Arc::new(MockIndexClient::new());
        let group = WorkerGroup::new(WorkerGroupConfig::default(), client, checkpoint, &registry);
        group.start().unwrap();
        let handle = group.handle();

        group.latch_fatal(FatalError("auth failure".to_string()));
        let err = handle.submit(upsert("a", 1)).await.unwrap_err();
        assert!(matches!(err, SubmitError::NotRunning(WorkerState::Closed)));

        let fatal = group.await_fatal_error().await;
        assert_eq!(fatal.0, "auth failure");
    }
}
