//! The bulk-indexing boundary: everything the worker group needs from the
//! search index cluster, abstracted behind [`IndexClient`] so the retry and
//! batching logic can be tested against [`MockIndexClient`] without a live
//! cluster.

use async_trait::async_trait;
use cbes_types::{BulkOutcome, IndexRequest};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Debug;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("index client error: {0}")]
pub struct IndexClientError(pub String);

/// A bulk-indexing backend. One [`IndexClient::bulk`] call corresponds to
/// one bulk request to the index; an `Err` return means the whole batch
/// failed to reach the server (connection error) and must be retried as a
/// unit (`spec.md` §4.5).
#[async_trait]
pub trait IndexClient: Debug + Send + Sync + 'static {
    /// Outcomes are returned in the same order as `requests`.
    async fn bulk(&self, requests: Vec<IndexRequest>) -> Result<Vec<BulkOutcome>, IndexClientError>;
}

/// A [`reqwest`]-backed [`IndexClient`] speaking an Elasticsearch-style
/// newline-delimited `_bulk` API.
#[derive(Debug)]
pub struct HttpIndexClient {
    http: reqwest::Client,
    bulk_url: String,
}

impl HttpIndexClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            bulk_url: format!("{}/_bulk", base_url.into().trim_end_matches('/')),
        }
    }

    fn encode(requests: &[IndexRequest]) -> Vec<u8> {
        let mut body = Vec::new();
        for request in requests {
            let (action, meta, doc) = match request {
                IndexRequest::Upsert {
                    index_name,
                    doc_id,
                    version,
                    routing,
                    pipeline,
                    body,
                    ..
                } => {
                    let mut meta = serde_json::json!({
                        "_index": index_name,
                        "_id": doc_id,
                        "version": version,
                        "version_type": "external",
                    });
                    if let Some(routing) = routing {
                        meta["routing"] = serde_json::Value::from(routing.as_str());
                    }
                    if let Some(pipeline) = pipeline {
                        meta["pipeline"] = serde_json::Value::from(pipeline.as_str());
                    }
                    ("index", meta, Some(body.clone()))
                }
                IndexRequest::Delete {
                    index_name,
                    doc_id,
                    version,
                    routing,
                    ..
                } => {
                    let mut meta = serde_json::json!({
                        "_index": index_name,
                        "_id": doc_id,
                        "version": version,
                        "version_type": "external",
                    });
                    if let Some(routing) = routing {
                        meta["routing"] = serde_json::Value::from(routing.as_str());
                    }
                    ("delete", meta, None)
                }
            };

            let line = serde_json::json!({ action: meta });
            body.extend_from_slice(&serde_json::to_vec(&line).expect("action line serializes"));
            body.push(b'\n');
            if let Some(doc) = doc {
                body.extend_from_slice(&doc);
                body.push(b'\n');
            }
        }
        body
    }
}

#[async_trait]
impl IndexClient for HttpIndexClient {
    async fn bulk(&self, requests: Vec<IndexRequest>) -> Result<Vec<BulkOutcome>, IndexClientError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let body = Self::encode(&requests);
        let response = self
            .http
            .post(&self.bulk_url)
            .header("content-type", "application/x-ndjson")
            .body(body)
            .send()
            .await
            .map_err(|e| IndexClientError(e.to_string()))?;

        if response.status().is_server_error() || response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Ok(requests.iter().map(|_| BulkOutcome::Retryable).collect());
        }

        let parsed: serde_json::Value = response
            .json()
            .await
            .map_err(|e| IndexClientError(e.to_string()))?;

        let items = parsed
            .get("items")
            .and_then(|v| v.as_array())
            .ok_or_else(|| IndexClientError("bulk response missing items array".to_string()))?;

        if items.len() != requests.len() {
            return Err(IndexClientError(
                "bulk response item count did not match request count".to_string(),
            ));
        }

        Ok(items.iter().map(item_outcome).collect())
    }
}

fn item_outcome(item: &serde_json::Value) -> BulkOutcome {
    let result = item
        .as_object()
        .and_then(|obj| obj.values().next())
        .cloned()
        .unwrap_or_default();
    let status = result.get("status").and_then(|v| v.as_u64()).unwrap_or(0);

    match status {
        200..=299 => BulkOutcome::Success,
        409 => BulkOutcome::VersionConflict,
        429 | 500..=599 => BulkOutcome::Retryable,
        _ => BulkOutcome::Rejected,
    }
}

/// An in-memory [`IndexClient`] for tests: a `doc_id -> (version, deleted)`
/// map plus a queue of scripted outcomes for specific attempts.
#[derive(Debug, Default)]
pub struct MockIndexClient {
    documents: Mutex<HashMap<String, (u64, bool)>>,
    scripted: Mutex<HashMap<String, Vec<BulkOutcome>>>,
    attempts: Mutex<HashMap<String, usize>>,
}

impl MockIndexClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the outcome sequence for `doc_id`: the Nth `bulk` call
    /// touching that doc returns `outcomes[N]`, repeating the last entry
    /// once exhausted. Used to simulate transient failures (S4).
    pub fn script(&self, doc_id: impl Into<String>, outcomes: Vec<BulkOutcome>) {
        self.scripted.lock().insert(doc_id.into(), outcomes);
    }

    pub fn document_version(&self, doc_id: &str) -> Option<u64> {
        self.documents.lock().get(doc_id).map(|(v, _)| *v)
    }
}

#[async_trait]
impl IndexClient for MockIndexClient {
    async fn bulk(&self, requests: Vec<IndexRequest>) -> Result<Vec<BulkOutcome>, IndexClientError> {
        let mut outcomes = Vec::with_capacity(requests.len());
        for request in &requests {
            let doc_id = request.doc_id().to_string();
            let attempt = {
                let mut attempts = self.attempts.lock();
                let count = attempts.entry(doc_id.clone()).or_insert(0);
                let this_attempt = *count;
                *count += 1;
                this_attempt
            };

            if let Some(scripted) = self.scripted.lock().get(&doc_id) {
                let index = attempt.min(scripted.len().saturating_sub(1));
                outcomes.push(scripted[index]);
                continue;
            }

            let mut documents = self.documents.lock();
            let outcome = match request {
                IndexRequest::Upsert { version, .. } => {
                    match documents.get(&doc_id) {
                        Some((current, _)) if *current >= *version => BulkOutcome::VersionConflict,
                        _ => {
                            documents.insert(doc_id.clone(), (*version, false));
                            BulkOutcome::Success
                        }
                    }
                }
                IndexRequest::Delete { version, .. } => {
                    documents.insert(doc_id.clone(), (*version, true));
                    BulkOutcome::Success
                }
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}
