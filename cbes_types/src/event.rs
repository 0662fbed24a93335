use crate::{Partition, SeqNo};

/// A single unit from the source's replication stream.
///
/// Created in the replication pipeline, passed by value to the worker
/// group, and dropped once the batch containing it has been acknowledged
/// (`spec.md` §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationEvent {
    Mutation {
        key: String,
        cas: u64,
        rev_seqno: u64,
        partition: Partition,
        seqno: SeqNo,
        body: Vec<u8>,
        xattrs: Vec<u8>,
    },
    Deletion {
        key: String,
        cas: u64,
        rev_seqno: u64,
        partition: Partition,
        seqno: SeqNo,
    },
    SnapshotMarker {
        partition: Partition,
        start: SeqNo,
        end: SeqNo,
    },
}

impl ReplicationEvent {
    /// The partition this event was observed on.
    pub fn partition(&self) -> Partition {
        match self {
            Self::Mutation { partition, .. }
            | Self::Deletion { partition, .. }
            | Self::SnapshotMarker { partition, .. } => *partition,
        }
    }

    /// The document key this event applies to, if any (snapshot markers
    /// have none).
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Mutation { key, .. } | Self::Deletion { key, .. } => Some(key),
            Self::SnapshotMarker { .. } => None,
        }
    }

    /// The seqno this event carries, used to advance `observed` even for
    /// events that the request factory ultimately drops.
    pub fn seqno(&self) -> SeqNo {
        match self {
            Self::Mutation { seqno, .. } | Self::Deletion { seqno, .. } => *seqno,
            Self::SnapshotMarker { end, .. } => *end,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_marker_has_no_key() {
        let marker = ReplicationEvent::SnapshotMarker {
            partition: Partition(0),
            start: SeqNo(0),
            end: SeqNo(10),
        };
        assert_eq!(marker.key(), None);
        assert_eq!(marker.seqno(), SeqNo(10));
    }

    #[test]
    fn mutation_exposes_partition_and_key() {
        let mutation = ReplicationEvent::Mutation {
            key: "doc-1".to_string(),
            cas: 1,
            rev_seqno: 1,
            partition: Partition(3),
            seqno: SeqNo(7),
            body: b"{}".to_vec(),
            xattrs: Vec::new(),
        };
        assert_eq!(mutation.partition(), Partition(3));
        assert_eq!(mutation.key(), Some("doc-1"));
    }
}
