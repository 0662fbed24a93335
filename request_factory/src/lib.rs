//! Maps one [`ReplicationEvent`] to zero or one [`IndexRequest`] via
//! declarative, first-match-wins [`TypeRule`]s (`spec.md` §4.4, component
//! C4).
#![warn(missing_debug_implementations, clippy::clone_on_ref_ptr)]

use std::sync::Arc;

use cbes_types::{IndexRequest, RejectReason, ReplicationEvent, TypeRule};
use metric::{Attributes, Metric, Registry, U64Counter};
use observability_deps::tracing::debug;

mod glob;
mod project;
mod reject_sink;

pub use reject_sink::{RejectEntry, RejectSink, TracingRejectSink};

/// What the factory produced for one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The event became this indexing or deletion request.
    Request(IndexRequest),
    /// The event was dropped and should be routed to the reject log
    /// (`spec.md` §6).
    Rejected(RejectReason),
    /// The event carries no document (a snapshot marker) and is neither a
    /// request nor a rejection.
    NotApplicable,
}

/// The ordered, immutable set of rules loaded from config for the lifetime
/// of the run.
#[derive(Debug)]
pub struct RequestFactory {
    rules: Vec<TypeRule>,
    sink: Arc<dyn RejectSink>,
    rejects: Metric<U64Counter>,
    matched: Metric<U64Counter>,
}

impl RequestFactory {
    pub fn new(rules: Vec<TypeRule>, registry: &Registry, sink: Arc<dyn RejectSink>) -> Self {
        Self {
            rules,
            sink,
            rejects: registry
                .register_metric("cbes_request_factory_rejects", "events dropped by reason"),
            matched: registry
                .register_metric("cbes_request_factory_matched", "events turned into requests"),
        }
    }

    /// Select the first rule whose `keyPattern` matches `key`.
    fn matching_rule(&self, key: &str) -> Option<&TypeRule> {
        self.rules.iter().find(|rule| glob::matches(&rule.key_pattern, key))
    }

    /// Process one event, producing a request, a rejection, or nothing.
    pub fn process(&self, event: &ReplicationEvent) -> Outcome {
        let key = match event.key() {
            Some(key) => key,
            None => return Outcome::NotApplicable,
        };

        let rule = match self.matching_rule(key) {
            Some(rule) => rule,
            None => return self.reject(RejectReason::NoMatchingRule, key, None),
        };

        if rule.ignore {
            return self.reject(RejectReason::RuleIgnored, key, Some(&rule.index_name));
        }

        let request = match event {
            ReplicationEvent::Deletion {
                key,
                rev_seqno,
                partition,
                seqno,
                ..
            } => {
                if rule.ignore_deletes {
                    return self.reject(RejectReason::IgnoredDeletion, key, Some(&rule.index_name));
                }
                IndexRequest::Delete {
                    index_name: rule.index_name.clone(),
                    doc_id: render_doc_id(rule, key),
                    version: *rev_seqno,
                    routing: rule.routing.clone(),
                    partition: *partition,
                    seqno: *seqno,
                }
            }
            ReplicationEvent::Mutation {
                key,
                cas,
                rev_seqno,
                partition,
                seqno,
                body,
                ..
            } => {
                let body = match project::project_body(body, rule, *cas, *rev_seqno) {
                    Ok(body) => body,
                    Err(_) => {
                        return self.reject(RejectReason::Malformed, key, Some(&rule.index_name))
                    }
                };
                IndexRequest::Upsert {
                    index_name: rule.index_name.clone(),
                    doc_id: render_doc_id(rule, key),
                    version: *rev_seqno,
                    routing: rule.routing.clone(),
                    pipeline: rule.pipeline.clone(),
                    body,
                    partition: *partition,
                    seqno: *seqno,
                }
            }
            ReplicationEvent::SnapshotMarker { .. } => unreachable!("filtered by event.key() above"),
        };

        self.matched.recorder_default().inc();
        debug!(doc_id = request.doc_id(), "matched type rule");
        Outcome::Request(request)
    }

    fn reject(&self, reason: RejectReason, doc_id: &str, index_name: Option<&str>) -> Outcome {
        let mut attrs = Attributes::new();
        attrs.insert("reason", reason.as_str().to_string());
        self.rejects.recorder(attrs).inc();
        self.sink.reject(RejectEntry {
            doc_id: Some(doc_id.to_string()),
            index_name: index_name.map(str::to_string),
            reason,
        });
        Outcome::Rejected(reason)
    }
}

/// Render `docIdFormat` (`{key}`/`{type}` placeholders) or fall back to the
/// source key unchanged when the template is empty (`spec.md` §4.4).
fn render_doc_id(rule: &TypeRule, key: &str) -> String {
    if rule.doc_id_format.is_empty() {
        return key.to_string();
    }
    rule.doc_id_format
        .replace("{key}", key)
        .replace("{type}", &rule.type_name)
}
