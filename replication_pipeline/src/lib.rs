//! Owns the replication client, seeds per-partition stream state from
//! checkpoints, and forwards events to the worker group while preserving
//! per-partition submission order (`spec.md` §4.6, component C6).
#![warn(missing_debug_implementations, clippy::clone_on_ref_ptr)]

pub mod dcp_client;
pub mod mock;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use cbes_types::Partition;
use checkpoint_service::CheckpointHandle;
use membership::{ConfigError, Membership};
use observability_deps::tracing::{error, info, warn};
use request_factory::{Outcome, RequestFactory, TracingRejectSink};
use thiserror::Error;
use tokio::task::JoinHandle;
use worker_group::{FatalError, FatalSlot, WorkerGroupHandle};

pub use dcp_client::{DcpClient, DcpError, DcpStreamHandler, StreamStart};

#[derive(Debug, Error)]
pub enum DcpPipelineError {
    #[error("connect: {0}")]
    Connect(#[from] DcpError),
    #[error(transparent)]
    Membership(#[from] ConfigError),
    #[error("membership computed an empty owned-partition set")]
    EmptyPartitionSet,
}

/// Owns the per-partition stream-reading tasks once started. Exactly one
/// instance exists per running process, constructed by the Supervisor
/// after `WorkerGroup` and `RequestFactory` (`spec.md` §4.7 steps 5-6).
pub struct DcpPipeline {
    client: Arc<dyn DcpClient>,
    partitions: Vec<Partition>,
    handles: Vec<JoinHandle<()>>,
}

impl fmt::Debug for DcpPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DcpPipeline")
            .field("client", &self.client)
            .field("partitions", &self.partitions)
            .field("running_tasks", &self.handles.len())
            .finish()
    }
}

impl DcpPipeline {
    /// `spec.md` §4.6 steps 1-3: connect within `connect_timeout`, discover
    /// the partition count, and compute this member's owned set. An empty
    /// owned set is always fatal, never silently tolerated.
    pub async fn connect(
        client: Arc<dyn DcpClient>,
        membership: Membership,
        connect_timeout: Duration,
    ) -> Result<Self, DcpPipelineError> {
        match tokio::time::timeout(connect_timeout, client.connect(connect_timeout)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(DcpPipelineError::Connect(err)),
            Err(_elapsed) => {
                return Err(DcpPipelineError::Connect(DcpError::ConnectTimeout(connect_timeout)));
            }
        }

        let num_partitions = client.num_partitions().await?;
        let partitions = membership.partitions_of(num_partitions)?;
        if partitions.is_empty() {
            return Err(DcpPipelineError::EmptyPartitionSet);
        }

        info!(count = partitions.len(), "connected, owns partitions");

        Ok(Self {
            client,
            partitions,
            handles: Vec::new(),
        })
    }

    pub fn owned_partitions(&self) -> &[Partition] {
        &self.partitions
    }

    /// `spec.md` §4.6 step 4: seed each owned partition's [`StreamStart`]
    /// from its stored checkpoint, discarding it in favor of
    /// [`StreamStart::Beginning`] if the source's live `BucketUuid` no
    /// longer matches what was stored (B3).
    pub fn init_session_state(&self, checkpoint: &CheckpointHandle) -> Vec<(Partition, StreamStart)> {
        let live_uuid = self.client.bucket_uuid();
        self.partitions
            .iter()
            .map(|&partition| {
                let start = match checkpoint.get(partition) {
                    Some(existing) if existing.vbucket_uuid == live_uuid => StreamStart::At {
                        seqno: existing.seqno,
                        snapshot_start: existing.snapshot_start_seqno,
                        snapshot_end: existing.snapshot_end_seqno,
                    },
                    Some(stale) => {
                        warn!(
                            ?partition,
                            stored = %stale.vbucket_uuid,
                            live = %live_uuid,
                            "bucket uuid mismatch, restreaming from the beginning"
                        );
                        StreamStart::Beginning
                    }
                    None => StreamStart::Beginning,
                };
                (partition, start)
            })
            .collect()
    }

    /// `spec.md` §4.6 steps 5-6: install the event listener and start
    /// streaming every owned partition. One task per partition preserves
    /// per-partition submission order into `worker`; per-docId order is
    /// then preserved downstream by the worker group's shard hashing, so
    /// the end-to-end property holds: within one partition, same-docId
    /// mutations apply to the index in source order.
    pub async fn start_streaming(
        &mut self,
        starts: Vec<(Partition, StreamStart)>,
        request_factory: Arc<RequestFactory>,
        worker: WorkerGroupHandle,
        checkpoint: CheckpointHandle,
        fatal: Arc<FatalSlot>,
    ) -> Result<(), DcpPipelineError> {
        for (partition, start) in starts {
            let mut handler = self.client.stream_handler(partition).await?;
            handler.seek(start).await?;

            let request_factory = Arc::clone(&request_factory);
            let worker = worker.clone();
            let checkpoint = checkpoint.clone();
            let fatal = Arc::clone(&fatal);
            self.handles.push(tokio::spawn(async move {
                run_partition(partition, handler, request_factory, worker, checkpoint, fatal).await;
            }));
        }
        Ok(())
    }

    /// `spec.md` §4.7 shutdown: stop every per-partition streaming task.
    /// Must happen before [`worker_group::WorkerGroup::close`], since
    /// draining relies on every submitter having gone away.
    pub async fn disconnect(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
            let _ = handle.await;
        }
    }
}

async fn run_partition(
    partition: Partition,
    mut handler: Box<dyn DcpStreamHandler>,
    request_factory: Arc<RequestFactory>,
    worker: WorkerGroupHandle,
    checkpoint: CheckpointHandle,
    fatal: Arc<FatalSlot>,
) {
    loop {
        let event = match handler.next_event().await {
            Ok(event) => event,
            Err(err) => {
                error!(?partition, %err, "stream ended with a protocol-level error");
                fatal.latch(FatalError(format!("partition {partition}: {err}")));
                return;
            }
        };

        checkpoint.observe(event.partition(), event.seqno());

        match request_factory.process(&event) {
            Outcome::Request(request) => {
                if worker.submit(request).await.is_err() {
                    return;
                }
            }
            Outcome::Rejected(_) | Outcome::NotApplicable => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbes_types::{BucketUuid, Checkpoint, ReplicationEvent, SeqNo, TypeRule};
    use checkpoint_service::{CheckpointService, LiveSeqnoProvider};
    use checkpoint_store::{CheckpointStore, MemoryCollection};
    use clock::{MockProvider, TimeProvider};
    use mock::MockDcpClient;
    use worker_group::{IndexClient, MockIndexClient, WorkerGroup, WorkerGroupConfig};

    struct FixedLiveState;

    #[async_trait::async_trait]
    impl LiveSeqnoProvider for FixedLiveState {
        async fn live_state(
            &self,
            _partition: Partition,
        ) -> Result<(BucketUuid, SeqNo), checkpoint_service::InitError> {
            Ok((BucketUuid::from("bucket-a"), SeqNo(0)))
        }
    }

    fn doc_rule() -> TypeRule {
        TypeRule {
            key_pattern: "*".to_string(),
            index_name: "docs".to_string(),
            routing: None,
            pipeline: None,
            type_name: "doc".to_string(),
            ignore: false,
            ignore_deletes: false,
            doc_id_format: String::new(),
            doc_structure: Default::default(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn events_flow_end_to_end_and_advance_the_checkpoint() {
        let registry = metric::Registry::new();
        let store = CheckpointStore::new("grp", Arc::new(MemoryCollection::new()));
        let time_provider: Arc<dyn TimeProvider> = Arc::new(MockProvider::new(chrono::Utc::now()));
        let checkpoint_service = CheckpointService::init(
            store,
            &[Partition(0)],
            &FixedLiveState,
            time_provider,
            &registry,
        )
        .await
        .unwrap();
        let checkpoint = checkpoint_service.handle();

        let index_client = Arc::new(MockIndexClient::new());
        let worker_group = WorkerGroup::new(
            WorkerGroupConfig {
                shard_count: 1,
                ..WorkerGroupConfig::default()
            },
            Arc::clone(&index_client) as Arc<dyn IndexClient>,
            checkpoint.clone(),
            &registry,
        );
        worker_group.start().unwrap();

        let dcp_client: Arc<MockDcpClient> = Arc::new(MockDcpClient::new("bucket-a", 1));
        dcp_client.push_event(ReplicationEvent::Mutation {
            key: "doc-1".to_string(),
            cas: 1,
            rev_seqno: 1,
            partition: Partition(0),
            seqno: SeqNo(5),
            body: b"{}".to_vec(),
            xattrs: Vec::new(),
        });

        let membership = Membership {
            member_number: 1,
            cluster_size: 1,
        };
        let mut pipeline = DcpPipeline::connect(
            Arc::clone(&dcp_client) as Arc<dyn DcpClient>,
            membership,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(pipeline.owned_partitions(), &[Partition(0)]);

        let starts = pipeline.init_session_state(&checkpoint);
        assert_eq!(starts, vec![(Partition(0), StreamStart::Beginning)]);

        let request_factory = Arc::new(RequestFactory::new(vec![doc_rule()], &registry, Arc::new(TracingRejectSink)));
        pipeline
            .start_streaming(
                starts,
                request_factory,
                worker_group.handle(),
                checkpoint.clone(),
                worker_group.fatal_slot(),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(index_client.document_version("doc-1"), Some(1));
        assert_eq!(checkpoint.get(Partition(0)).unwrap().seqno, SeqNo(5));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bucket_uuid_mismatch_discards_the_stored_checkpoint() {
        let registry = metric::Registry::new();
        let store = CheckpointStore::new("grp", Arc::new(MemoryCollection::new()));
        let time_provider: Arc<dyn TimeProvider> = Arc::new(MockProvider::new(chrono::Utc::now()));
        let checkpoint_service = CheckpointService::init(
            store,
            &[Partition(0)],
            &FixedLiveState,
            time_provider,
            &registry,
        )
        .await
        .unwrap();
        let checkpoint = checkpoint_service.handle();
        checkpoint.set(
            Partition(0),
            Checkpoint {
                partition: Partition(0),
                vbucket_uuid: BucketUuid::from("stale-bucket"),
                seqno: SeqNo(42),
                snapshot_start_seqno: SeqNo(0),
                snapshot_end_seqno: SeqNo(42),
            },
        );

        let dcp_client: Arc<MockDcpClient> = Arc::new(MockDcpClient::new("bucket-a", 1));
        let membership = Membership {
            member_number: 1,
            cluster_size: 1,
        };
        let pipeline = DcpPipeline::connect(
            Arc::clone(&dcp_client) as Arc<dyn DcpClient>,
            membership,
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        let starts = pipeline.init_session_state(&checkpoint);
        assert_eq!(starts, vec![(Partition(0), StreamStart::Beginning)]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_owned_partition_set_is_an_error() {
        let dcp_client: Arc<MockDcpClient> = Arc::new(MockDcpClient::new("bucket-a", 1));
        let membership = Membership {
            member_number: 2,
            cluster_size: 2,
        };

        let err = DcpPipeline::connect(
            Arc::clone(&dcp_client) as Arc<dyn DcpClient>,
            membership,
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DcpPipelineError::Membership(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn a_closed_stream_latches_fatal() {
        let registry = metric::Registry::new();
        let store = CheckpointStore::new("grp", Arc::new(MemoryCollection::new()));
        let time_provider: Arc<dyn TimeProvider> = Arc::new(MockProvider::new(chrono::Utc::now()));
        let checkpoint_service = CheckpointService::init(
            store,
            &[Partition(0)],
            &FixedLiveState,
            time_provider,
            &registry,
        )
        .await
        .unwrap();
        let checkpoint = checkpoint_service.handle();

        let index_client = Arc::new(MockIndexClient::new());
        let worker_group = WorkerGroup::new(
            WorkerGroupConfig::default(),
            index_client as Arc<dyn IndexClient>,
            checkpoint.clone(),
            &registry,
        );
        worker_group.start().unwrap();

        let dcp_client: Arc<MockDcpClient> = Arc::new(MockDcpClient::new("bucket-a", 1));
        dcp_client.close_with_error(Partition(0));

        let membership = Membership {
            member_number: 1,
            cluster_size: 1,
        };
        let mut pipeline = DcpPipeline::connect(
            Arc::clone(&dcp_client) as Arc<dyn DcpClient>,
            membership,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        let starts = pipeline.init_session_state(&checkpoint);

        let request_factory = Arc::new(RequestFactory::new(vec![doc_rule()], &registry, Arc::new(TracingRejectSink)));
        pipeline
            .start_streaming(
                starts,
                request_factory,
                worker_group.handle(),
                checkpoint.clone(),
                worker_group.fatal_slot(),
            )
            .await
            .unwrap();

        let fatal = tokio::time::timeout(Duration::from_millis(500), worker_group.await_fatal_error())
            .await
            .expect("fatal error should have been latched");
        assert!(fatal.0.contains("closed unexpectedly"));
    }
}
