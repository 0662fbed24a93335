//! The source replication client boundary: everything [`crate::DcpPipeline`]
//! needs from the real wire protocol, abstracted so the pipeline can be
//! tested against [`crate::mock::MockDcpClient`] (`spec.md` §4.6).

use async_trait::async_trait;
use cbes_types::{BucketUuid, Partition, ReplicationEvent, SeqNo};
use std::fmt::Debug;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DcpError {
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("sequence number {0:?} on partition {1:?} is no longer available")]
    UnknownSeqno(SeqNo, Partition),
}

/// Where a partition's stream should begin, derived from a stored
/// checkpoint or the absence of one (`spec.md` §4.6 `initSessionState`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStart {
    /// No persisted checkpoint, or its `BucketUuid` no longer matches the
    /// live source: stream from `BEGINNING` to `INFINITY`.
    Beginning,
    /// Resume from a persisted position.
    At {
        seqno: SeqNo,
        snapshot_start: SeqNo,
        snapshot_end: SeqNo,
    },
}

/// One partition's live stream handle, obtained once and not shared
/// (mirrors the teacher's `WriteBufferStreamHandler`).
#[async_trait]
pub trait DcpStreamHandler: Debug + Send + 'static {
    async fn seek(&mut self, start: StreamStart) -> Result<(), DcpError>;

    /// Blocks until the next event is available, or returns an error if the
    /// stream ends unexpectedly (rollback loop, uuid change, connection
    /// drop) — any such error is protocol-level and fatal (`spec.md` §4.6
    /// step 5).
    async fn next_event(&mut self) -> Result<ReplicationEvent, DcpError>;
}

/// The source replication client (`spec.md` §4.6).
#[async_trait]
pub trait DcpClient: Debug + Send + Sync + 'static {
    async fn connect(&self, timeout: Duration) -> Result<(), DcpError>;

    /// The source dataset's opaque instance identifier, compared against
    /// stored checkpoints to detect a reset dataset (`spec.md` §3
    /// `BucketUuid`).
    fn bucket_uuid(&self) -> BucketUuid;

    async fn num_partitions(&self) -> Result<u32, DcpError>;

    async fn stream_handler(&self, partition: Partition) -> Result<Box<dyn DcpStreamHandler>, DcpError>;
}
