use crate::{Partition, SeqNo};

/// A document-level write derived from a [`crate::ReplicationEvent`] by the
/// request factory, tagged with the `(partition, seqno)` its originating
/// event carried so the worker group can do checkpoint accounting after
/// the bulk call completes (`spec.md` §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexRequest {
    Upsert {
        index_name: String,
        doc_id: String,
        version: u64,
        routing: Option<String>,
        pipeline: Option<String>,
        body: Vec<u8>,
        partition: Partition,
        seqno: SeqNo,
    },
    Delete {
        index_name: String,
        doc_id: String,
        version: u64,
        routing: Option<String>,
        partition: Partition,
        seqno: SeqNo,
    },
}

impl IndexRequest {
    /// The document id this request targets; used to enforce per-document
    /// ordering (`spec.md` §4.5, P3).
    pub fn doc_id(&self) -> &str {
        match self {
            Self::Upsert { doc_id, .. } | Self::Delete { doc_id, .. } => doc_id,
        }
    }

    /// The `(partition, seqno)` tag used for checkpoint accounting.
    pub fn origin(&self) -> (Partition, SeqNo) {
        match self {
            Self::Upsert {
                partition, seqno, ..
            }
            | Self::Delete {
                partition, seqno, ..
            } => (*partition, *seqno),
        }
    }

    /// Approximate wire size in bytes, used by the batcher's
    /// `bulkRequest.maxBytes` threshold.
    pub fn approx_bytes(&self) -> usize {
        match self {
            Self::Upsert { doc_id, body, .. } => doc_id.len() + body.len() + 64,
            Self::Delete { doc_id, .. } => doc_id.len() + 64,
        }
    }
}

/// Why a replication event or index request never made it to the index,
/// recorded in the reject log (`spec.md` §4.4, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Decodable body expected (e.g. JSON) was not decodable.
    Malformed,
    /// No type rule's `keyPattern` matched the event's key.
    NoMatchingRule,
    /// The matching rule has `ignore: true`.
    RuleIgnored,
    /// The event was a deletion and the matching rule has
    /// `ignoreDeletes: true`.
    IgnoredDeletion,
}

impl RejectReason {
    /// Stable machine-readable label for this reason, used in reject-log
    /// entries.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::NoMatchingRule => "no_matching_rule",
            Self::RuleIgnored => "rule_ignored",
            Self::IgnoredDeletion => "ignored_deletion",
        }
    }
}

/// The per-item outcome of a bulk dispatch, as described prose-only in
/// `spec.md` §4.5 and §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkOutcome {
    /// Applied successfully.
    Success,
    /// The index already holds a version >= ours; treated as success.
    VersionConflict,
    /// Transient server/network error (429, 5xx, connection reset);
    /// retried indefinitely.
    Retryable,
    /// Permanent 4xx (other than version conflict); logged to the reject
    /// log, counted as success for checkpointing.
    Rejected,
}

impl BulkOutcome {
    /// True for outcomes that advance the checkpoint (everything except
    /// `Retryable`, which must be retried before it counts).
    pub fn counts_as_applied(&self) -> bool {
        !matches!(self, Self::Retryable)
    }
}
