//! Where rejected events go (`spec.md` §6): append-only, machine-readable,
//! format left to the implementation.

use cbes_types::RejectReason;
use observability_deps::tracing::warn;

/// One reject-log entry: `{timestamp, docId, indexName, reason, originalEvent?}`
/// per `spec.md` §6, minus `timestamp` (added by whatever transport writes
/// the entry onward) and `originalEvent` (not all rejection reasons have a
/// matched rule to attribute an index to).
#[derive(Debug, Clone)]
pub struct RejectEntry {
    pub doc_id: Option<String>,
    pub index_name: Option<String>,
    pub reason: RejectReason,
}

/// A sink for rejected events, so a file- or queue-backed implementation can
/// be substituted for the default without touching [`crate::RequestFactory`].
pub trait RejectSink: std::fmt::Debug + Send + Sync + 'static {
    fn reject(&self, entry: RejectEntry);
}

/// Default sink: structured `tracing::warn!`, machine-parseable via any log
/// collector that understands `tracing`'s field output.
#[derive(Debug, Default)]
pub struct TracingRejectSink;

impl RejectSink for TracingRejectSink {
    fn reject(&self, entry: RejectEntry) {
        warn!(
            doc_id = entry.doc_id.as_deref().unwrap_or(""),
            index_name = entry.index_name.as_deref().unwrap_or(""),
            reason = entry.reason.as_str(),
            "rejected event"
        );
    }
}
