//! Durable per-partition checkpoint persistence into the source database
//! (`spec.md` §4.2).
//!
//! The real document-database wire client is a boundary component (see
//! `spec.md` §1); this crate talks to it through the [`DocumentCollection`]
//! trait, mirroring how the teacher's `write_buffer` crate separates its
//! `WriteBufferReading`/`WriteBufferWriting` trait surface from any one
//! backend. [`MemoryCollection`] is the in-memory test double.
#![warn(missing_debug_implementations, clippy::clone_on_ref_ptr)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use cbes_types::{BucketUuid, Checkpoint, Partition, SeqNo};
use observability_deps::tracing::warn;
use parking_lot::Mutex;
use thiserror::Error;

/// Generic key/value document collection abstraction, standing in for the
/// source database's metadata collection.
#[async_trait]
pub trait DocumentCollection: std::fmt::Debug + Send + Sync + 'static {
    /// Fetch the raw document body stored under `key`, or `None` if absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CollectionError>;

    /// Best-effort batch upsert. Returns the subset of `documents` (by key)
    /// that failed to write; a partial failure is not itself an `Err`.
    async fn upsert_batch(
        &self,
        documents: Vec<(String, Vec<u8>)>,
    ) -> Result<Vec<String>, CollectionError>;

    /// Delete the documents under `keys`, best-effort.
    async fn remove_batch(&self, keys: Vec<String>) -> Result<(), CollectionError>;
}

/// An I/O-level failure talking to the document collection.
#[derive(Debug, Error)]
#[error("document collection error: {0}")]
pub struct CollectionError(pub String);

/// Failures from [`CheckpointStore::load`] / [`CheckpointStore::clear`].
#[derive(Debug, Error)]
pub enum CheckpointStoreError {
    #[error("failed reading checkpoint for partition {partition}: {source}")]
    Load {
        partition: Partition,
        source: CollectionError,
    },
    #[error("failed decoding checkpoint document for partition {partition}: {source}")]
    Decode {
        partition: Partition,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Collection(#[from] CollectionError),
}

/// Result of a [`CheckpointStore::save`] call: which partitions, if any,
/// failed to persist. The caller (`checkpoint_service`) decides whether to
/// retry.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SaveOutcome {
    pub failed_partitions: Vec<Partition>,
}

impl SaveOutcome {
    pub fn all_succeeded(&self) -> bool {
        self.failed_partitions.is_empty()
    }
}

/// Reads and writes [`Checkpoint`] records into a [`DocumentCollection`],
/// keyed per `spec.md` §6's `<group-name>::checkpoint::<partition>` layout.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    group_name: String,
    collection: Arc<dyn DocumentCollection>,
}

impl CheckpointStore {
    pub fn new(group_name: impl Into<String>, collection: Arc<dyn DocumentCollection>) -> Self {
        Self {
            group_name: group_name.into(),
            collection,
        }
    }

    /// Read one checkpoint document per partition. An absent document
    /// means "start from BEGINNING" and is represented as `None`, not an
    /// error.
    pub async fn load(
        &self,
        partitions: &[Partition],
    ) -> Result<HashMap<Partition, Option<Checkpoint>>, CheckpointStoreError> {
        let mut result = HashMap::with_capacity(partitions.len());
        for &partition in partitions {
            let key = Checkpoint::document_key(&self.group_name, partition);
            let raw = self
                .collection
                .get(&key)
                .await
                .map_err(|source| CheckpointStoreError::Load { partition, source })?;

            let checkpoint = match raw {
                None => None,
                Some(bytes) => {
                    let doc: CheckpointDoc = serde_json::from_slice(&bytes)
                        .map_err(|source| CheckpointStoreError::Decode { partition, source })?;
                    Some(doc.into_checkpoint(partition))
                }
            };
            result.insert(partition, checkpoint);
        }
        Ok(result)
    }

    /// Best-effort batch upsert. Idempotent under replay: re-saving the
    /// same checkpoint is a no-op observationally. Any extra fields
    /// already present in a stored document are preserved, per `spec.md`
    /// §6.
    pub async fn save(
        &self,
        checkpoints: &HashMap<Partition, Checkpoint>,
    ) -> Result<SaveOutcome, CheckpointStoreError> {
        let mut documents = Vec::with_capacity(checkpoints.len());
        for (&partition, checkpoint) in checkpoints {
            let key = Checkpoint::document_key(&self.group_name, partition);
            let existing_extra = match self.collection.get(&key).await {
                Ok(Some(bytes)) => serde_json::from_slice::<serde_json::Value>(&bytes)
                    .ok()
                    .and_then(|v| v.as_object().cloned()),
                _ => None,
            };

            let mut doc = serde_json::to_value(CheckpointDoc::from(checkpoint))
                .expect("CheckpointDoc always serializes");
            if let (Some(extra), Some(obj)) = (existing_extra, doc.as_object_mut()) {
                for (k, v) in extra {
                    obj.entry(k).or_insert(v);
                }
            }

            documents.push((key, serde_json::to_vec(&doc).expect("value serializes")));
        }

        let failed_keys = self.collection.upsert_batch(documents).await?;
        if !failed_keys.is_empty() {
            warn!(count = failed_keys.len(), "partial checkpoint save failure");
        }

        let prefix = format!("{}::checkpoint::", self.group_name);
        let failed_partitions = failed_keys
            .into_iter()
            .filter_map(|key| {
                key.strip_prefix(&prefix)
                    .and_then(|rest| rest.parse::<u32>().ok())
                    .map(Partition)
            })
            .collect();

        Ok(SaveOutcome { failed_partitions })
    }

    /// Delete the checkpoint documents for `partitions`. Used when a
    /// bucket-uuid mismatch is detected at startup (`spec.md` §3, B3).
    pub async fn clear(&self, partitions: &[Partition]) -> Result<(), CheckpointStoreError> {
        let keys = partitions
            .iter()
            .map(|&p| Checkpoint::document_key(&self.group_name, p))
            .collect();
        self.collection.remove_batch(keys).await?;
        Ok(())
    }
}

/// The on-the-wire checkpoint document shape from `spec.md` §6:
/// `{vbuuid, seqno, snapshotStartSeqno, snapshotEndSeqno}`.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct CheckpointDoc {
    vbuuid: String,
    seqno: u64,
    #[serde(rename = "snapshotStartSeqno")]
    snapshot_start_seqno: u64,
    #[serde(rename = "snapshotEndSeqno")]
    snapshot_end_seqno: u64,
}

impl CheckpointDoc {
    fn into_checkpoint(self, partition: Partition) -> Checkpoint {
        Checkpoint {
            partition,
            vbucket_uuid: BucketUuid::from(self.vbuuid),
            seqno: SeqNo(self.seqno),
            snapshot_start_seqno: SeqNo(self.snapshot_start_seqno),
            snapshot_end_seqno: SeqNo(self.snapshot_end_seqno),
        }
    }
}

impl From<&Checkpoint> for CheckpointDoc {
    fn from(checkpoint: &Checkpoint) -> Self {
        Self {
            vbuuid: checkpoint.vbucket_uuid.0.clone(),
            seqno: checkpoint.seqno.get(),
            snapshot_start_seqno: checkpoint.snapshot_start_seqno.get(),
            snapshot_end_seqno: checkpoint.snapshot_end_seqno.get(),
        }
    }
}

/// An in-memory [`DocumentCollection`], used in tests and as the reference
/// semantics for the document layout in `spec.md` §6.
#[derive(Debug, Default)]
pub struct MemoryCollection {
    documents: Mutex<HashMap<String, Vec<u8>>>,
    fail_keys: Mutex<std::collections::HashSet<String>>,
}

impl MemoryCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `upsert_batch` report `key` as failed, without
    /// actually writing it. Used to exercise `SaveOutcome::failed_partitions`.
    pub fn fail_next_write(&self, key: impl Into<String>) {
        self.fail_keys.lock().insert(key.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.documents.lock().contains_key(key)
    }
}

#[async_trait]
impl DocumentCollection for MemoryCollection {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CollectionError> {
        Ok(self.documents.lock().get(key).cloned())
    }

    async fn upsert_batch(
        &self,
        documents: Vec<(String, Vec<u8>)>,
    ) -> Result<Vec<String>, CollectionError> {
        let mut failed = Vec::new();
        let mut guard = self.documents.lock();
        let mut fail_keys = self.fail_keys.lock();
        for (key, body) in documents {
            if fail_keys.remove(&key) {
                failed.push(key);
                continue;
            }
            guard.insert(key, body);
        }
        Ok(failed)
    }

    async fn remove_batch(&self, keys: Vec<String>) -> Result<(), CollectionError> {
        let mut guard = self.documents.lock();
        for key in keys {
            guard.remove(&key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint(partition: u32, seqno: u64) -> Checkpoint {
        Checkpoint {
            partition: Partition(partition),
            vbucket_uuid: BucketUuid::from("uuid-a"),
            seqno: SeqNo(seqno),
            snapshot_start_seqno: SeqNo(0),
            snapshot_end_seqno: SeqNo(seqno),
        }
    }

    #[tokio::test]
    async fn load_is_none_for_absent_partition() {
        let collection = Arc::new(MemoryCollection::new());
        let store = CheckpointStore::new("grp", collection);

        let loaded = store.load(&[Partition(0)]).await.unwrap();
        assert_eq!(loaded.get(&Partition(0)), Some(&None));
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let collection = Arc::new(MemoryCollection::new());
        let store = CheckpointStore::new("grp", collection);

        let mut checkpoints = HashMap::new();
        checkpoints.insert(Partition(3), checkpoint(3, 9));
        let outcome = store.save(&checkpoints).await.unwrap();
        assert!(outcome.all_succeeded());

        let loaded = store.load(&[Partition(3)]).await.unwrap();
        assert_eq!(loaded[&Partition(3)], Some(checkpoint(3, 9)));
    }

    #[tokio::test]
    async fn partial_failure_reports_which_partition_failed() {
        let collection = Arc::new(MemoryCollection::new());
        collection.fail_next_write(Checkpoint::document_key("grp", Partition(1)));
        let store = CheckpointStore::new("grp", Arc::clone(&collection) as Arc<dyn DocumentCollection>);

        let mut checkpoints = HashMap::new();
        checkpoints.insert(Partition(0), checkpoint(0, 1));
        checkpoints.insert(Partition(1), checkpoint(1, 1));
        let outcome = store.save(&checkpoints).await.unwrap();

        assert_eq!(outcome.failed_partitions, vec![Partition(1)]);
        assert!(collection.contains(&Checkpoint::document_key("grp", Partition(0))));
        assert!(!collection.contains(&Checkpoint::document_key("grp", Partition(1))));
    }

    #[tokio::test]
    async fn extra_fields_are_preserved_on_rewrite() {
        let collection = Arc::new(MemoryCollection::new());
        let key = Checkpoint::document_key("grp", Partition(0));
        collection
            .upsert_batch(vec![(
                key.clone(),
                br#"{"vbuuid":"old","seqno":1,"snapshotStartSeqno":0,"snapshotEndSeqno":1,"note":"keep me"}"#.to_vec(),
            )])
            .await
            .unwrap();

        let store = CheckpointStore::new("grp", Arc::clone(&collection) as Arc<dyn DocumentCollection>);
        let mut checkpoints = HashMap::new();
        checkpoints.insert(Partition(0), checkpoint(0, 5));
        store.save(&checkpoints).await.unwrap();

        let raw = collection.get(&key).await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(value["note"], "keep me");
        assert_eq!(value["seqno"], 5);
    }

    #[tokio::test]
    async fn clear_removes_documents() {
        let collection = Arc::new(MemoryCollection::new());
        let store = CheckpointStore::new("grp", Arc::clone(&collection) as Arc<dyn DocumentCollection>);
        let mut checkpoints = HashMap::new();
        checkpoints.insert(Partition(2), checkpoint(2, 1));
        store.save(&checkpoints).await.unwrap();

        store.clear(&[Partition(2)]).await.unwrap();
        assert!(!collection.contains(&Checkpoint::document_key("grp", Partition(2))));
    }
}
