use super::{dedup_last_wins, BulkWriteReport, DocumentStore, StagedDocument};
use crate::document::Document;
use crate::error::StoreError;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Process-local store used by tests and dry runs.
///
/// Supports fault injection: whole bulk writes can be made to fail a number of times,
/// individual ids can be rejected, and the store can be marked unreachable.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    documents: DashMap<(String, String), Document>,
    failing_writes: AtomicUsize,
    rejected_ids: Mutex<HashSet<String>>,
    unreachable: AtomicBool,
    bulk_calls: AtomicUsize,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a document directly, bypassing the bulk write path.
    pub fn seed(&self, collection: &str, id: &str, document: Document) {
        self.documents
            .insert((collection.to_string(), id.to_string()), document);
    }

    pub fn get(&self, collection: &str, id: &str) -> Option<Document> {
        self.documents
            .get(&(collection.to_string(), id.to_string()))
            .map(|entry| entry.value().clone())
    }

    /// Fail the next `count` bulk writes as a whole.
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Reject `id` in every subsequent bulk write.
    pub fn reject_id(&self, id: &str) {
        self.rejected_ids.lock().insert(id.to_string());
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn bulk_calls(&self) -> usize {
        self.bulk_calls.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    fn check_reachable(&self) -> Result<(), StoreError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store marked unreachable".into()));
        }
        Ok(())
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl DocumentStore for MemoryDocumentStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.check_reachable()
    }

    async fn find_by_id(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        self.check_reachable()?;
        Ok(self.get(collection, id))
    }

    async fn bulk_upsert(
        &self,
        collection: &str,
        documents: Vec<StagedDocument>,
    ) -> Result<BulkWriteReport, StoreError> {
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        if self.take_injected_failure() {
            return Err(StoreError::Unavailable("injected bulk write failure".into()));
        }

        let rejected = self.rejected_ids.lock().clone();
        let mut report = BulkWriteReport::default();
        for staged in dedup_last_wins(documents) {
            if rejected.contains(&staged.id) {
                report
                    .failed
                    .insert(staged.id, "rejected by store".to_string());
                continue;
            }

            let key = (collection.to_string(), staged.id);
            let unchanged = self
                .documents
                .get(&key)
                .map(|existing| *existing == staged.document);
            match unchanged {
                Some(true) => report.unchanged += 1,
                Some(false) => {
                    self.documents.insert(key, staged.document);
                    report.updated += 1;
                }
                None => {
                    self.documents.insert(key, staged.document);
                    report.inserted += 1;
                }
            }
        }
        Ok(report)
    }

    async fn count(&self, collection: &str) -> Result<u64, StoreError> {
        self.check_reachable()?;
        Ok(self
            .documents
            .iter()
            .filter(|entry| entry.key().0 == collection)
            .count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        Document::try_from(value).unwrap()
    }

    #[tokio::test]
    async fn test_bulk_upsert_reports_changes() {
        let store = MemoryDocumentStore::new();
        store.seed("alphas", "a", doc(json!({"id": "a", "v": 1})));
        store.seed("alphas", "b", doc(json!({"id": "b", "v": 1})));
        store.reject_id("d");

        let report = store
            .bulk_upsert(
                "alphas",
                vec![
                    StagedDocument::new("a", doc(json!({"id": "a", "v": 1}))),
                    StagedDocument::new("b", doc(json!({"id": "b", "v": 2}))),
                    StagedDocument::new("c", doc(json!({"id": "c"}))),
                    StagedDocument::new("d", doc(json!({"id": "d"}))),
                ],
            )
            .await
            .unwrap();

        assert_eq!(report.unchanged, 1);
        assert_eq!(report.updated, 1);
        assert_eq!(report.inserted, 1);
        assert_eq!(report.rejection("d"), Some("rejected by store"));
        assert_eq!(store.count("alphas").await.unwrap(), 3);
        assert_eq!(store.count("other").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let store = MemoryDocumentStore::new();
        store.fail_next_writes(1);

        let staged = vec![StagedDocument::new("a", doc(json!({"id": "a"})))];
        assert!(store.bulk_upsert("alphas", staged.clone()).await.is_err());
        assert!(store.bulk_upsert("alphas", staged).await.is_ok());
        assert_eq!(store.bulk_calls(), 2);

        store.set_unreachable(true);
        assert!(store.ping().await.is_err());
    }
}
