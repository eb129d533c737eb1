//! Per-batch parallel processing.
//!
//! Each unit goes through skip check → read → lookup → merge on its own task, with at
//! most `workers` tasks running at once. The staged documents of the whole batch are
//! then written with a single bulk upsert, and every processed unit gets its outcome
//! recorded in the state tracker.

use super::source::{SourceReader, Unit};
use super::stats::BatchReport;
use crate::config::{ImportJob, ImportMode};
use crate::document::Document;
use crate::merge::MergePlanner;
use crate::retry::RetryPolicy;
use crate::state::{Outcome, ProcessedRecord, StateTracker};
use crate::store::{BulkWriteReport, DocumentStore, StagedDocument};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Knobs the pool needs from the job, copied once per run.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub mode: ImportMode,
    pub workers: usize,
    pub key_field: String,
    pub validate: bool,
    pub write_retry: RetryPolicy,
}

impl WorkerSettings {
    pub fn from_job(job: &ImportJob) -> Self {
        Self {
            mode: job.mode,
            workers: job.workers.max(1),
            key_field: job.key_field.clone(),
            validate: job.validate,
            write_retry: RetryPolicy::new(job.write_retries, job.retry_backoff_ms),
        }
    }
}

/// What happened to one unit before the bulk write.
enum Prepared {
    Skipped,
    Failed(String),
    Staged {
        id: String,
        incoming: Document,
        merged: Document,
        fingerprint: String,
    },
}

struct PoolInner<S, R> {
    store: Arc<S>,
    reader: Arc<R>,
    tracker: StateTracker,
    planner: MergePlanner,
    settings: WorkerSettings,
}

pub struct ImportWorkerPool<S, R> {
    inner: Arc<PoolInner<S, R>>,
}

impl<S, R> Clone for ImportWorkerPool<S, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: DocumentStore, R: SourceReader> ImportWorkerPool<S, R> {
    pub fn new(
        store: Arc<S>,
        reader: Arc<R>,
        tracker: StateTracker,
        planner: MergePlanner,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                store,
                reader,
                tracker,
                planner,
                settings,
            }),
        }
    }

    /// Process one batch of units bound for `collection`, checking each unit against the
    /// tracker first.
    ///
    /// Never fails as a whole: unit errors and a failed bulk write are reported in the
    /// returned [`BatchReport`] and the affected units are recorded as failures.
    pub async fn process_batch(&self, collection: &str, units: &[Unit]) -> BatchReport {
        self.run_batch(collection, units, true).await
    }

    /// Like [`process_batch`](Self::process_batch) for units the caller already filtered
    /// against the tracker. Skips the per-unit lookup.
    pub async fn process_pending(&self, collection: &str, units: &[Unit]) -> BatchReport {
        self.run_batch(collection, units, false).await
    }

    async fn run_batch(&self, collection: &str, units: &[Unit], check_done: bool) -> BatchReport {
        let prepared = self.prepare_all(collection, units, check_done).await;
        let settings = &self.inner.settings;

        let mut report = BatchReport::default();
        report.stats.batches = 1;

        let mut records: Vec<ProcessedRecord> = Vec::with_capacity(units.len());
        let mut staged: Vec<StagedDocument> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut pending: Vec<(usize, String, String)> = Vec::new();

        for (index, outcome) in prepared.into_iter().enumerate() {
            let unit = &units[index];
            match outcome {
                Prepared::Skipped => report.stats.skipped += 1,
                Prepared::Failed(reason) => {
                    debug!("worker: unit {} failed: {}", unit.id, reason);
                    records.push(record_for(unit, &unit.fingerprint, Outcome::Failure));
                    report.failures.push((unit.id.clone(), reason));
                    report.stats.failed += 1;
                }
                Prepared::Staged {
                    id,
                    incoming,
                    merged,
                    fingerprint,
                } => {
                    match positions.get(&id) {
                        // Same id earlier in this batch: fold in unit order.
                        Some(&position) => {
                            let combined = self.inner.planner.plan(
                                settings.mode,
                                Some(&staged[position].document),
                                &incoming,
                            );
                            staged[position].document = combined;
                        }
                        None => {
                            positions.insert(id.clone(), staged.len());
                            staged.push(StagedDocument::new(id.clone(), merged));
                        }
                    }
                    pending.push((index, id, fingerprint));
                }
            }
        }

        if !staged.is_empty() {
            match self.write_staged(collection, &staged).await {
                Ok(write) => {
                    report.stats.record_write(&write);
                    for (index, id, fingerprint) in &pending {
                        let unit = &units[*index];
                        match write.rejection(id) {
                            Some(reason) => {
                                records.push(record_for(unit, fingerprint, Outcome::Failure));
                                report
                                    .failures
                                    .push((unit.id.clone(), format!("store rejected {}: {}", id, reason)));
                                report.stats.failed += 1;
                            }
                            None => {
                                records.push(record_for(unit, fingerprint, Outcome::Success));
                                report.stats.succeeded += 1;
                            }
                        }
                    }
                }
                Err(reason) => {
                    report.write_failed = true;
                    report.stats.failed_batches += 1;
                    for (index, _, fingerprint) in &pending {
                        let unit = &units[*index];
                        records.push(record_for(unit, fingerprint, Outcome::Failure));
                        report.failures.push((unit.id.clone(), reason.clone()));
                        report.stats.failed += 1;
                    }
                }
            }
        }

        report.stats.attempted = report.stats.succeeded + report.stats.failed;

        if let Err(err) = self.inner.tracker.record_outcomes(&records).await {
            warn!(
                "worker: failed to record {} outcomes, {} committed units left unverified: {}",
                records.len(),
                report.stats.succeeded,
                err
            );
            report.stats.unverified = report.stats.succeeded;
        }

        report
    }

    /// Run every unit through the per-unit pipeline, bounded by the worker count.
    /// Results come back in unit order.
    async fn prepare_all(&self, collection: &str, units: &[Unit], check_done: bool) -> Vec<Prepared> {
        let semaphore = Arc::new(Semaphore::new(self.inner.settings.workers));
        let collection: Arc<str> = Arc::from(collection);
        let mut tasks = JoinSet::new();

        for (index, unit) in units.iter().enumerate() {
            let inner = Arc::clone(&self.inner);
            let semaphore = Arc::clone(&semaphore);
            let collection = Arc::clone(&collection);
            let unit = unit.clone();
            tasks.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (index, Prepared::Failed("worker pool closed".into())),
                };
                (index, inner.prepare_unit(&collection, unit, check_done).await)
            });
        }

        let mut results: Vec<Option<Prepared>> = (0..units.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, prepared)) => results[index] = Some(prepared),
                Err(err) => warn!("worker: unit task did not complete: {}", err),
            }
        }

        results
            .into_iter()
            .map(|prepared| {
                prepared.unwrap_or_else(|| Prepared::Failed("unit task did not complete".into()))
            })
            .collect()
    }

    async fn write_staged(
        &self,
        collection: &str,
        staged: &[StagedDocument],
    ) -> Result<BulkWriteReport, String> {
        let store = &self.inner.store;
        self.inner
            .settings
            .write_retry
            .run("worker: bulk upsert", move || {
                store.bulk_upsert(collection, staged.to_vec())
            })
            .await
            .map_err(|err| format!("bulk write failed: {}", err))
    }
}

impl<S: DocumentStore, R: SourceReader> PoolInner<S, R> {
    async fn prepare_unit(&self, collection: &str, unit: Unit, check_done: bool) -> Prepared {
        let settings = &self.settings;
        if check_done {
            match self
                .tracker
                .is_done(&unit.id, settings.mode, &unit.fingerprint)
                .await
            {
                Ok(true) => return Prepared::Skipped,
                Ok(false) => {}
                Err(err) => warn!("worker: tracker lookup failed for {}: {}", unit.id, err),
            }
        }

        let reader = Arc::clone(&self.reader);
        let read_unit = unit.clone();
        let (incoming, fingerprint) =
            match tokio::task::spawn_blocking(move || reader.read(&read_unit)).await {
                Ok(Ok(read)) => read,
                Ok(Err(err)) => return Prepared::Failed(err.to_string()),
                Err(err) => return Prepared::Failed(format!("read task failed: {}", err)),
            };

        if settings.validate {
            if let Err(err) = incoming.validate_strict(&settings.key_field) {
                return Prepared::Failed(err.to_string());
            }
        }

        let id = match incoming.require_id(&settings.key_field) {
            Ok(id) => id,
            Err(err) => return Prepared::Failed(err.to_string()),
        };

        let stored = match self.store.find_by_id(collection, &id).await {
            Ok(stored) => stored,
            Err(err) => return Prepared::Failed(format!("lookup of {} failed: {}", id, err)),
        };

        let merged = self.planner.plan(settings.mode, stored.as_ref(), &incoming);
        Prepared::Staged {
            id,
            incoming,
            merged,
            fingerprint,
        }
    }
}

fn record_for(unit: &Unit, fingerprint: &str, outcome: Outcome) -> ProcessedRecord {
    ProcessedRecord::new(
        unit.id.clone(),
        unit.partition_key.clone(),
        fingerprint,
        outcome,
        unit.data_timestamp,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PartitionClass;
    use crate::importer::source::{fingerprint, FsSourceReader};
    use crate::store::MemoryDocumentStore;
    use serde_json::{json, Value};
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn write_unit(dir: &Path, name: &str, body: &Value) -> Unit {
        let path = dir.join(name);
        let bytes = serde_json::to_vec(body).unwrap();
        fs::write(&path, &bytes).unwrap();
        Unit {
            id: name.to_string(),
            path,
            class: PartitionClass::Regular,
            month: "2024-03".to_string(),
            partition_key: "regular/2024-03".to_string(),
            fingerprint: fingerprint(&bytes),
            size: bytes.len() as u64,
            data_timestamp: None,
        }
    }

    async fn pool(
        dir: &TempDir,
        store: Arc<MemoryDocumentStore>,
        mode: ImportMode,
    ) -> ImportWorkerPool<MemoryDocumentStore, FsSourceReader> {
        let tracker = StateTracker::open(&dir.path().join("state.db"))
            .await
            .unwrap()
            .with_retry(RetryPolicy::none());
        let settings = WorkerSettings {
            mode,
            workers: 3,
            key_field: "id".to_string(),
            validate: false,
            write_retry: RetryPolicy::new(2, 1),
        };
        ImportWorkerPool::new(
            store,
            Arc::new(FsSourceReader),
            tracker,
            MergePlanner::default(),
            settings,
        )
    }

    #[tokio::test]
    async fn test_unit_failure_does_not_abort_batch() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryDocumentStore::new());
        let pool = pool(&dir, Arc::clone(&store), ImportMode::Incremental).await;

        let good = write_unit(dir.path(), "a.json", &json!({"id": "a", "v": 1}));
        let mut broken = write_unit(dir.path(), "b.json", &json!({"id": "b"}));
        fs::write(&broken.path, b"{ nope").unwrap();
        broken.fingerprint = String::new();
        let missing_key = write_unit(dir.path(), "c.json", &json!({"name": "no id"}));

        let report = pool.process_batch("alphas", &[good, broken, missing_key]).await;
        assert_eq!(report.stats.succeeded, 1);
        assert_eq!(report.stats.failed, 2);
        assert_eq!(report.stats.inserted, 1);
        assert!(!report.write_failed);
        assert_eq!(store.bulk_calls(), 1);
        assert!(store.get("alphas", "a").is_some());
    }

    #[tokio::test]
    async fn test_duplicate_ids_fold_in_unit_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryDocumentStore::new());
        store.seed(
            "alphas",
            "x",
            Document::try_from(json!({"id": "x", "keep": true, "v": 0})).unwrap(),
        );
        let pool = pool(&dir, Arc::clone(&store), ImportMode::Overwrite).await;

        let first = write_unit(dir.path(), "1.json", &json!({"id": "x", "v": 1, "a": 1}));
        let second = write_unit(dir.path(), "2.json", &json!({"id": "x", "b": 2}));

        let report = pool.process_batch("alphas", &[first, second]).await;
        assert_eq!(report.stats.succeeded, 2);
        assert_eq!(
            store.get("alphas", "x").unwrap(),
            Document::try_from(json!({"id": "x", "keep": true, "v": 1, "a": 1, "b": 2})).unwrap()
        );
    }

    #[tokio::test]
    async fn test_failed_bulk_write_marks_units_failed() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryDocumentStore::new());
        store.fail_next_writes(2);
        let pool = pool(&dir, Arc::clone(&store), ImportMode::Incremental).await;

        let unit = write_unit(dir.path(), "a.json", &json!({"id": "a"}));
        let report = pool.process_batch("alphas", &[unit.clone()]).await;
        assert!(report.write_failed);
        assert!(report.is_total_failure());
        assert_eq!(store.bulk_calls(), 2);

        let record = pool.inner.tracker.get(&unit.id).await.unwrap().unwrap();
        assert_eq!(record.outcome, Outcome::Failure);

        // Eligible again on the next attempt.
        let retry = pool.process_batch("alphas", &[unit]).await;
        assert_eq!(retry.stats.succeeded, 1);
    }

    #[tokio::test]
    async fn test_tracker_failure_leaves_committed_units_unverified() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryDocumentStore::new());
        let pool = pool(&dir, Arc::clone(&store), ImportMode::Incremental).await;
        pool.inner.tracker.close().await;

        let unit = write_unit(dir.path(), "a.json", &json!({"id": "a", "v": 1}));
        let report = pool.process_batch("alphas", &[unit]).await;

        assert_eq!(report.stats.succeeded, 1);
        assert_eq!(report.stats.failed, 0);
        assert_eq!(report.stats.unverified, 1);
        assert!(!report.write_failed);
        assert!(report.failures.is_empty());
        assert!(store.get("alphas", "a").is_some());
    }

    #[tokio::test]
    async fn test_pending_batch_skips_tracker_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryDocumentStore::new());
        let pool = pool(&dir, Arc::clone(&store), ImportMode::Incremental).await;

        let unit = write_unit(dir.path(), "a.json", &json!({"id": "a"}));
        pool.process_batch("alphas", &[unit.clone()]).await;

        // Already tracked as done, but the caller vouches it is pending.
        let again = pool.process_pending("alphas", &[unit]).await;
        assert_eq!(again.stats.skipped, 0);
        assert_eq!(again.stats.succeeded, 1);
        assert_eq!(again.stats.unchanged, 1);
        assert_eq!(store.bulk_calls(), 2);
    }

    #[tokio::test]
    async fn test_completed_units_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryDocumentStore::new());
        let pool = pool(&dir, Arc::clone(&store), ImportMode::Incremental).await;

        let unit = write_unit(dir.path(), "a.json", &json!({"id": "a"}));
        pool.process_batch("alphas", &[unit.clone()]).await;
        let again = pool.process_batch("alphas", &[unit]).await;
        assert_eq!(again.stats.skipped, 1);
        assert_eq!(again.stats.attempted, 0);
        assert_eq!(store.bulk_calls(), 1);
    }
}
