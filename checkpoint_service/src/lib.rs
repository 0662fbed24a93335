//! In-memory authoritative checkpoint state for every owned partition, with
//! single-writer discipline and periodic/on-demand flush to the source
//! database (`spec.md` §4.3, component C3).
//!
//! The split mirrors the teacher's lifecycle manager: a single
//! [`CheckpointService`] owns the durable flush path, and cheap-clone
//! [`CheckpointHandle`]s are handed to the replication pipeline and the
//! worker group so they can record progress without contending on anything
//! but a single mutex.
#![warn(missing_debug_implementations, clippy::clone_on_ref_ptr)]

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use cbes_types::{BucketUuid, Checkpoint, Partition, SeqNo};
use checkpoint_store::{CheckpointStore, CheckpointStoreError};
use clock::{Time, TimeProvider};
use metric::{Attributes, Metric, Registry, U64Gauge};
use observability_deps::tracing::{info, warn};
use parking_lot::Mutex;
use thiserror::Error;

/// Supplies the live `(bucketUuid, currentSeqno)` for a partition that has
/// no persisted checkpoint yet, so [`CheckpointService::init`] can seed a
/// [`Checkpoint::zero_at`] record (`spec.md` §4.3 `init`).
#[async_trait]
pub trait LiveSeqnoProvider: Send + Sync + 'static {
    async fn live_state(&self, partition: Partition) -> Result<(BucketUuid, SeqNo), InitError>;
}

#[derive(Debug, Error)]
pub enum InitError {
    #[error("failed loading stored checkpoints: {0}")]
    Store(#[from] CheckpointStoreError),
    #[error("failed querying live source state for partition {partition}: {reason}")]
    LiveState { partition: Partition, reason: String },
}

#[derive(Debug)]
struct Inner {
    checkpoints: BTreeMap<Partition, Checkpoint>,
    observed: BTreeMap<Partition, SeqNo>,
    dirty: bool,
}

/// A cheap-clone handle used by the replication pipeline and the worker
/// group to advance checkpoint state. Never touches the document store
/// directly; only [`CheckpointService::save`] does.
#[derive(Debug, Clone)]
pub struct CheckpointHandle {
    state: Arc<Mutex<Inner>>,
    committed_seqno: Metric<U64Gauge>,
    observed_seqno: Metric<U64Gauge>,
}

impl CheckpointHandle {
    /// Advance the committed checkpoint for `partition` to `checkpoint`,
    /// provided it is not a regression. Returns `true` if the state moved
    /// forward, `false` if `checkpoint.seqno` was not greater than the
    /// currently held one (a no-op, not an error — `spec.md` §4.3).
    pub fn set(&self, partition: Partition, checkpoint: Checkpoint) -> bool {
        let mut inner = self.state.lock();
        let advanced = match inner.checkpoints.get(&partition) {
            Some(current) if checkpoint.seqno <= current.seqno => false,
            _ => true,
        };
        if advanced {
            self.committed_seqno
                .recorder(partition_attrs(partition))
                .set(checkpoint.seqno.get());
            inner.checkpoints.insert(partition, checkpoint);
            inner.dirty = true;
        }
        advanced
    }

    /// Record the latest seqno seen on the replication stream for
    /// `partition`, independent of whether it ends up committed
    /// (`spec.md` §3's `PartitionSeqnos::observed`, §6's `observed.seqno`
    /// metric). Never regresses the gauge backwards.
    pub fn observe(&self, partition: Partition, seqno: SeqNo) {
        let mut inner = self.state.lock();
        let entry = inner.observed.entry(partition).or_insert(SeqNo::BEGINNING);
        if seqno > *entry {
            *entry = seqno;
            self.observed_seqno
                .recorder(partition_attrs(partition))
                .set(seqno.get());
        }
    }

    /// The checkpoint currently held for `partition`, if any.
    pub fn get(&self, partition: Partition) -> Option<Checkpoint> {
        self.state.lock().checkpoints.get(&partition).cloned()
    }

    /// A consistent point-in-time copy of every tracked checkpoint.
    pub fn snapshot(&self) -> BTreeMap<Partition, Checkpoint> {
        self.state.lock().checkpoints.clone()
    }
}

fn partition_attrs(partition: Partition) -> Attributes {
    let mut attrs = Attributes::new();
    attrs.insert("partition", partition.to_string());
    attrs
}

/// Owns the flush path: periodically (or on demand) persists the current
/// checkpoint map to the source database via [`CheckpointStore`].
#[derive(Debug)]
pub struct CheckpointService {
    store: CheckpointStore,
    state: Arc<Mutex<Inner>>,
    time_provider: Arc<dyn TimeProvider>,
    last_save: Mutex<Time>,
    committed_seqno: Metric<U64Gauge>,
    observed_seqno: Metric<U64Gauge>,
}

impl CheckpointService {
    /// Load every owned partition's checkpoint, seeding a zero checkpoint
    /// for any that have none yet, per `spec.md` §4.3 `init`.
    pub async fn init(
        store: CheckpointStore,
        partitions: &[Partition],
        live: &dyn LiveSeqnoProvider,
        time_provider: Arc<dyn TimeProvider>,
        registry: &Registry,
    ) -> Result<Self, InitError> {
        let loaded = store.load(partitions).await?;

        let mut checkpoints = BTreeMap::new();
        for &partition in partitions {
            let checkpoint = match loaded.get(&partition).cloned().flatten() {
                Some(checkpoint) => checkpoint,
                None => {
                    let (bucket_uuid, live_seqno) = live.live_state(partition).await?;
                    info!(%partition, "no stored checkpoint, starting from BEGINNING");
                    Checkpoint::zero_at(partition, bucket_uuid, live_seqno)
                }
            };
            checkpoints.insert(partition, checkpoint);
        }

        let committed_seqno: Metric<U64Gauge> =
            registry.register_metric("cbes_checkpoint_committed_seqno", "last committed seqno");
        let observed_seqno: Metric<U64Gauge> =
            registry.register_metric("cbes_observed_seqno", "last seqno seen on the replication stream");
        let mut observed = BTreeMap::new();
        for (&partition, checkpoint) in &checkpoints {
            committed_seqno
                .recorder(partition_attrs(partition))
                .set(checkpoint.seqno.get());
            observed_seqno
                .recorder(partition_attrs(partition))
                .set(checkpoint.seqno.get());
            observed.insert(partition, checkpoint.seqno);
        }

        Ok(Self {
            store,
            state: Arc::new(Mutex::new(Inner {
                checkpoints,
                observed,
                dirty: false,
            })),
            last_save: Mutex::new(time_provider.now()),
            time_provider,
            committed_seqno,
            observed_seqno,
        })
    }

    /// A cheap-clone handle sharing this service's state.
    pub fn handle(&self) -> CheckpointHandle {
        CheckpointHandle {
            state: Arc::clone(&self.state),
            committed_seqno: self.committed_seqno.clone(),
            observed_seqno: self.observed_seqno.clone(),
        }
    }

    /// Flush the current checkpoint map to the store unconditionally.
    /// Returns which partitions, if any, failed to persist; callers retry
    /// those on the next cadence rather than treating a partial failure as
    /// fatal (`spec.md` §4.2 `save`).
    pub async fn save(&self) -> Result<checkpoint_store::SaveOutcome, CheckpointStoreError> {
        let checkpoints = {
            let mut inner = self.state.lock();
            inner.dirty = false;
            inner.checkpoints.clone()
        };
        *self.last_save.lock() = self.time_provider.now();

        let map = checkpoints.into_iter().collect();
        let outcome = self.store.save(&map).await?;
        if !outcome.all_succeeded() {
            warn!(
                failed = outcome.failed_partitions.len(),
                "checkpoint save reported partial failure"
            );
            let mut inner = self.state.lock();
            inner.dirty = true;
        }
        Ok(outcome)
    }

    /// Whether state has changed since the last [`CheckpointService::save`]
    /// call. Used by the supervisor's save-cadence loop to skip idle
    /// flushes.
    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    /// True once `interval` has elapsed since the last flush, idle or not.
    /// A ceiling cadence independent of [`CheckpointService::is_dirty`],
    /// so a long-idle partition's checkpoint is still periodically
    /// re-asserted.
    pub fn save_due(&self, interval: std::time::Duration) -> bool {
        let elapsed = self
            .time_provider
            .now()
            .signed_duration_since(*self.last_save.lock());
        elapsed
            .to_std()
            .map(|elapsed| elapsed >= interval)
            .unwrap_or(true)
    }

    /// A consistent point-in-time copy of every tracked checkpoint.
    pub fn snapshot(&self) -> BTreeMap<Partition, Checkpoint> {
        self.state.lock().checkpoints.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use checkpoint_store::MemoryCollection;
    use clock::MockProvider;

    struct FixedLiveState;

    #[async_trait]
    impl LiveSeqnoProvider for FixedLiveState {
        async fn live_state(&self, _partition: Partition) -> Result<(BucketUuid, SeqNo), InitError> {
            Ok((BucketUuid::from("bucket-a"), SeqNo(100)))
        }
    }

    fn checkpoint(partition: u32, seqno: u64) -> Checkpoint {
        Checkpoint {
            partition: Partition(partition),
            vbucket_uuid: BucketUuid::from("bucket-a"),
            seqno: SeqNo(seqno),
            snapshot_start_seqno: SeqNo(0),
            snapshot_end_seqno: SeqNo(seqno),
        }
    }

    async fn service() -> CheckpointService {
        let store = CheckpointStore::new("grp", Arc::new(MemoryCollection::new()));
        let registry = Registry::new();
        let time_provider: Arc<dyn TimeProvider> = Arc::new(MockProvider::new(chrono::Utc::now()));
        CheckpointService::init(
            store,
            &[Partition(0), Partition(1)],
            &FixedLiveState,
            time_provider,
            &registry,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn init_seeds_zero_checkpoint_for_unseen_partitions() {
        let service = service().await;
        let snapshot = service.snapshot();
        assert_eq!(snapshot[&Partition(0)].seqno, SeqNo::BEGINNING);
        assert_eq!(snapshot[&Partition(0)].snapshot_end_seqno, SeqNo(100));
    }

    /// P1: `set` never lets the committed checkpoint move backwards.
    #[tokio::test]
    async fn set_is_a_no_op_on_regression() {
        let service = service().await;
        let handle = service.handle();

        assert!(handle.set(Partition(0), checkpoint(0, 10)));
        assert!(!handle.set(Partition(0), checkpoint(0, 5)));
        assert_eq!(handle.get(Partition(0)).unwrap().seqno, SeqNo(10));

        assert!(!handle.set(Partition(0), checkpoint(0, 10)));
    }

    #[tokio::test]
    async fn save_persists_and_clears_dirty_flag() {
        let service = service().await;
        let handle = service.handle();
        handle.set(Partition(1), checkpoint(1, 42));
        assert!(service.is_dirty());

        let outcome = service.save().await.unwrap();
        assert!(outcome.all_succeeded());
        assert!(!service.is_dirty());
    }
}
