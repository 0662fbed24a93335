use std::fmt;

use serde::{Deserialize, Serialize};

/// A source-side hash partition, in `[0, P)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Partition(pub u32);

impl Partition {
    /// The raw partition index.
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Partition {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// A 64-bit monotonic per-partition sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SeqNo(pub u64);

impl SeqNo {
    /// The sequence number that precedes any real event: BEGINNING.
    pub const BEGINNING: SeqNo = SeqNo(0);

    /// The raw numeric value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SeqNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SeqNo {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Opaque identifier of the source dataset instance a checkpoint was taken
/// against. A live source uuid that disagrees with a stored checkpoint's
/// uuid means the dataset was recreated and the checkpoint must be
/// discarded (`spec.md` §3, B3).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BucketUuid(pub String);

impl BucketUuid {
    /// An explicitly-unknown uuid. Distinct from any real uuid a source
    /// would ever report, so it only ever compares equal to itself.
    pub fn unknown() -> Self {
        Self(String::new())
    }

    /// True if this is the [`BucketUuid::unknown`] sentinel.
    pub fn is_unknown(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for BucketUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for BucketUuid {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for BucketUuid {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// The two ordered sequence-number marks tracked per partition: the last
/// event seen (`observed`) and the last one durably applied to the index
/// and checkpointed (`committed`).
///
/// Invariant I1 (`spec.md` §3): `committed <= observed`, both
/// non-decreasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionSeqnos {
    pub observed: SeqNo,
    pub committed: SeqNo,
}

impl PartitionSeqnos {
    /// True if `observed >= committed`, i.e. invariant I1 holds.
    pub fn is_consistent(&self) -> bool {
        self.committed <= self.observed
    }
}

/// A durable per-partition checkpoint record, as stored in the source's
/// metadata collection (`spec.md` §3, §6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub partition: Partition,
    pub vbucket_uuid: BucketUuid,
    pub seqno: SeqNo,
    pub snapshot_start_seqno: SeqNo,
    pub snapshot_end_seqno: SeqNo,
}

impl Checkpoint {
    /// A zero checkpoint anchored at the source's current live seqnos, used
    /// when a partition has no persisted record yet (`spec.md` §4.3
    /// `init`).
    pub fn zero_at(partition: Partition, vbucket_uuid: BucketUuid, live_seqno: SeqNo) -> Self {
        Self {
            partition,
            vbucket_uuid,
            seqno: SeqNo::BEGINNING,
            snapshot_start_seqno: SeqNo::BEGINNING,
            snapshot_end_seqno: live_seqno,
        }
    }

    /// The document key this checkpoint is stored under, per `spec.md` §6:
    /// `<group-name>::checkpoint::<partition>`.
    pub fn document_key(group_name: &str, partition: Partition) -> String {
        format!("{group_name}::checkpoint::{partition}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_key_matches_spec_layout() {
        assert_eq!(
            Checkpoint::document_key("my-group", Partition(42)),
            "my-group::checkpoint::42"
        );
    }

    #[test]
    fn unknown_uuid_is_empty_string() {
        assert!(BucketUuid::unknown().is_unknown());
        assert!(!BucketUuid::from("abc-123").is_unknown());
    }

    #[test]
    fn consistent_seqnos_require_committed_le_observed() {
        let ok = PartitionSeqnos {
            observed: SeqNo(10),
            committed: SeqNo(10),
        };
        assert!(ok.is_consistent());

        let broken = PartitionSeqnos {
            observed: SeqNo(5),
            committed: SeqNo(10),
        };
        assert!(!broken.is_consistent());
    }
}
