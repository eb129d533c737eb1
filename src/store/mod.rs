//! Document store interface and its backends.
//!
//! The store owns the canonical version of every document. The importer only reads one
//! document at a time by id and writes each batch with a single bulk upsert.

mod memory;
mod postgres;

pub use memory::MemoryDocumentStore;
pub use postgres::PgDocumentStore;

use crate::document::Document;
use crate::error::StoreError;
use std::collections::HashMap;
use std::future::Future;

/// One merged document waiting for the batch's bulk write.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedDocument {
    pub id: String,
    pub document: Document,
}

impl StagedDocument {
    pub fn new(id: impl Into<String>, document: Document) -> Self {
        Self {
            id: id.into(),
            document,
        }
    }
}

/// Per-item result of a bulk upsert.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkWriteReport {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Document ids the store rejected, with the reason.
    pub failed: HashMap<String, String>,
}

impl BulkWriteReport {
    /// Reason the store gave for rejecting `id`, if it did.
    pub fn rejection(&self, id: &str) -> Option<&str> {
        self.failed.get(id).map(String::as_str)
    }
}

/// Keyed document storage.
///
/// `bulk_upsert` receives at most one document per id. It returns `Err` only when the
/// write as a whole failed; individual rejections are reported in
/// [`BulkWriteReport::failed`].
pub trait DocumentStore: Send + Sync + 'static {
    fn ping(&self) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn find_by_id(
        &self,
        collection: &str,
        id: &str,
    ) -> impl Future<Output = Result<Option<Document>, StoreError>> + Send;

    fn bulk_upsert(
        &self,
        collection: &str,
        documents: Vec<StagedDocument>,
    ) -> impl Future<Output = Result<BulkWriteReport, StoreError>> + Send;

    fn count(&self, collection: &str) -> impl Future<Output = Result<u64, StoreError>> + Send;
}

/// Keep the last document per id, positioned where the id first appeared.
pub(crate) fn dedup_last_wins(documents: Vec<StagedDocument>) -> Vec<StagedDocument> {
    let mut positions: HashMap<String, usize> = HashMap::with_capacity(documents.len());
    let mut unique: Vec<StagedDocument> = Vec::with_capacity(documents.len());
    for staged in documents {
        match positions.get(&staged.id) {
            Some(&index) => unique[index] = staged,
            None => {
                positions.insert(staged.id.clone(), unique.len());
                unique.push(staged);
            }
        }
    }
    unique
}
