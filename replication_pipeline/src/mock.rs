//! An in-memory [`DcpClient`] for tests, mirroring the teacher's
//! `write_buffer::core::test_utils` shape: scripted events per partition,
//! delivered in push order, with a way to simulate a protocol-level
//! disconnect.

use async_trait::async_trait;
use cbes_types::{BucketUuid, Partition, ReplicationEvent};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::dcp_client::{DcpClient, DcpError, DcpStreamHandler, StreamStart};

#[derive(Debug, Default)]
struct Shared {
    events: Mutex<HashMap<Partition, VecDeque<ReplicationEvent>>>,
    closed: Mutex<HashSet<Partition>>,
    notify: Notify,
}

#[derive(Debug)]
pub struct MockDcpClient {
    bucket_uuid: BucketUuid,
    num_partitions: u32,
    shared: Arc<Shared>,
}

impl MockDcpClient {
    pub fn new(bucket_uuid: impl Into<BucketUuid>, num_partitions: u32) -> Self {
        Self {
            bucket_uuid: bucket_uuid.into(),
            num_partitions,
            shared: Arc::default(),
        }
    }

    /// Appends an event to its partition's queue, to be delivered the next
    /// time that partition's handler calls `next_event`.
    pub fn push_event(&self, event: ReplicationEvent) {
        let partition = event.partition();
        self.shared
            .events
            .lock()
            .entry(partition)
            .or_default()
            .push_back(event);
        self.shared.notify.notify_waiters();
    }

    /// Simulates the stream for `partition` ending unexpectedly, e.g. a
    /// rollback loop or a uuid change (`spec.md` §4.6 step 5).
    pub fn close_with_error(&self, partition: Partition) {
        self.shared.closed.lock().insert(partition);
        self.shared.notify.notify_waiters();
    }
}

#[async_trait]
impl DcpClient for MockDcpClient {
    async fn connect(&self, _timeout: Duration) -> Result<(), DcpError> {
        Ok(())
    }

    fn bucket_uuid(&self) -> BucketUuid {
        self.bucket_uuid.clone()
    }

    async fn num_partitions(&self) -> Result<u32, DcpError> {
        Ok(self.num_partitions)
    }

    async fn stream_handler(&self, partition: Partition) -> Result<Box<dyn DcpStreamHandler>, DcpError> {
        Ok(Box::new(MockStreamHandler {
            partition,
            shared: Arc::clone(&self.shared),
        }))
    }
}

#[derive(Debug)]
struct MockStreamHandler {
    partition: Partition,
    shared: Arc<Shared>,
}

#[async_trait]
impl DcpStreamHandler for MockStreamHandler {
    async fn seek(&mut self, _start: StreamStart) -> Result<(), DcpError> {
        // Tests script exactly the events expected after the requested
        // start; the mock has no retained history to seek within.
        Ok(())
    }

    async fn next_event(&mut self) -> Result<ReplicationEvent, DcpError> {
        loop {
            let notified = self.shared.notify.notified();

            if let Some(event) = self
                .shared
                .events
                .lock()
                .get_mut(&self.partition)
                .and_then(VecDeque::pop_front)
            {
                return Ok(event);
            }

            if self.shared.closed.lock().contains(&self.partition) {
                return Err(DcpError::Transport(format!(
                    "partition {} stream closed unexpectedly",
                    self.partition
                )));
            }

            notified.await;
        }
    }
}
