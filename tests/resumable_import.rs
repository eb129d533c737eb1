use alpha_importer::config::{ImportMode, PartitionClass};
use alpha_importer::document::Document;
use alpha_importer::error::StoreError;
use alpha_importer::importer::{FsSourceReader, ImportOrchestrator, RunOutcome, RunSummary};
use alpha_importer::state::{Outcome, StateTracker};
use alpha_importer::store::{BulkWriteReport, DocumentStore, MemoryDocumentStore, StagedDocument};
use alpha_importer::test_support::{test_job, SourceTree};
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;

const REGULAR: &str = "regular_alphas";

/// Delegates to a shared memory store and cancels the run after the n-th bulk write,
/// simulating an operator interrupt in the middle of a partition.
struct InterruptAfterWrites {
    inner: Arc<MemoryDocumentStore>,
    token: CancellationToken,
    after: usize,
    writes: AtomicUsize,
}

impl InterruptAfterWrites {
    fn new(inner: Arc<MemoryDocumentStore>, token: CancellationToken, after: usize) -> Self {
        Self {
            inner,
            token,
            after,
            writes: AtomicUsize::new(0),
        }
    }
}

impl DocumentStore for InterruptAfterWrites {
    async fn ping(&self) -> Result<(), StoreError> {
        self.inner.ping().await
    }

    async fn find_by_id(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        self.inner.find_by_id(collection, id).await
    }

    async fn bulk_upsert(
        &self,
        collection: &str,
        documents: Vec<StagedDocument>,
    ) -> Result<BulkWriteReport, StoreError> {
        let report = self.inner.bulk_upsert(collection, documents).await?;
        if self.writes.fetch_add(1, Ordering::SeqCst) + 1 == self.after {
            self.token.cancel();
        }
        Ok(report)
    }

    async fn count(&self, collection: &str) -> Result<u64, StoreError> {
        self.inner.count(collection).await
    }
}

fn doc(value: Value) -> Document {
    Document::try_from(value).expect("object document")
}

async fn run_with<S: DocumentStore>(
    root: &Path,
    state_db: &Path,
    mode: ImportMode,
    store: Arc<S>,
    cancel: CancellationToken,
) -> RunSummary {
    let job = test_job(root, state_db, mode);
    let tracker = StateTracker::open(state_db).await.expect("open tracker");
    let mut orchestrator = ImportOrchestrator::new(job, store, Arc::new(FsSourceReader), tracker)
        .with_cancellation(cancel);
    orchestrator.run().await
}

async fn run_mode(
    root: &Path,
    state_db: &Path,
    mode: ImportMode,
    store: &Arc<MemoryDocumentStore>,
) -> RunSummary {
    run_with(root, state_db, mode, Arc::clone(store), CancellationToken::new()).await
}

#[tokio::test]
async fn interrupted_run_resumes_without_reprocessing() {
    let dir = tempfile::tempdir().unwrap();
    let tree = SourceTree::new(&dir.path().join("data"));
    for i in 0..10 {
        tree.write(
            PartitionClass::Regular,
            "2024-03",
            &format!("alpha_{:02}", i),
            &json!({"id": format!("A{}", i), "type": "REGULAR", "n": i}),
        )
        .unwrap();
    }
    let state_db = dir.path().join("state.db");
    let memory = Arc::new(MemoryDocumentStore::new());

    // workers=2, batch_size=2: batches of 4, 4 and 2. Interrupt after the first.
    let token = CancellationToken::new();
    let interrupting = Arc::new(InterruptAfterWrites::new(Arc::clone(&memory), token.clone(), 1));
    let first = run_with(tree.root(), &state_db, ImportMode::Incremental, interrupting, token).await;
    assert_eq!(first.outcome, RunOutcome::Cancelled);
    assert_eq!(first.exit_code(), 130);
    assert_eq!(first.totals().succeeded, 4);
    assert_eq!(memory.len(), 4);

    let tracker = StateTracker::open(&state_db).await.unwrap();
    assert_eq!(tracker.stats(Some("regular")).await.unwrap().succeeded, 4);
    tracker.close().await;

    let second = run_mode(tree.root(), &state_db, ImportMode::Incremental, &memory).await;
    assert_eq!(second.outcome, RunOutcome::Done);
    assert_eq!(second.totals().skipped, 4);
    assert_eq!(second.totals().succeeded, 6);
    assert_eq!(second.totals().inserted, 6);
    assert_eq!(memory.len(), 10);

    // A third run finds nothing left to do.
    let third = run_mode(tree.root(), &state_db, ImportMode::Incremental, &memory).await;
    assert_eq!(third.totals().attempted, 0);
    assert_eq!(third.totals().skipped, 10);
}

#[tokio::test]
async fn rebuild_drops_history_while_overwrite_keeps_it() {
    let dir = tempfile::tempdir().unwrap();
    let tree = SourceTree::new(&dir.path().join("data"));
    tree.write(
        PartitionClass::Regular,
        "2024-03",
        "a",
        &json!({"id": "a", "type": "REGULAR", "settings": {"decay": 2}}),
    )
    .unwrap();

    let stored = json!({
        "id": "a",
        "type": "REGULAR",
        "legacy": true,
        "settings": {"decay": 0, "neutralization": "SUBINDUSTRY"}
    });

    let overwrite_store = Arc::new(MemoryDocumentStore::new());
    overwrite_store.seed(REGULAR, "a", doc(stored.clone()));
    let summary = run_mode(tree.root(), &dir.path().join("o.db"), ImportMode::Overwrite, &overwrite_store).await;
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(
        overwrite_store.get(REGULAR, "a").unwrap(),
        doc(json!({
            "id": "a",
            "type": "REGULAR",
            "legacy": true,
            "settings": {"decay": 2, "neutralization": "SUBINDUSTRY"}
        }))
    );

    let rebuild_store = Arc::new(MemoryDocumentStore::new());
    rebuild_store.seed(REGULAR, "a", doc(stored));
    let summary = run_mode(tree.root(), &dir.path().join("r.db"), ImportMode::Rebuild, &rebuild_store).await;
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(
        rebuild_store.get(REGULAR, "a").unwrap(),
        doc(json!({"id": "a", "type": "REGULAR", "settings": {"decay": 2}}))
    );
}

#[tokio::test]
async fn rebuild_reprocesses_units_already_tracked() {
    let dir = tempfile::tempdir().unwrap();
    let tree = SourceTree::new(&dir.path().join("data"));
    tree.write(PartitionClass::Super, "2024-01", "s", &json!({"id": "s", "type": "SUPER"}))
        .unwrap();
    let state_db = dir.path().join("state.db");
    let store = Arc::new(MemoryDocumentStore::new());

    run_mode(tree.root(), &state_db, ImportMode::Incremental, &store).await;
    let rebuild = run_mode(tree.root(), &state_db, ImportMode::Rebuild, &store).await;
    assert_eq!(rebuild.totals().succeeded, 1);
    assert_eq!(rebuild.totals().skipped, 0);
    assert_eq!(rebuild.totals().unchanged, 1);
}

#[tokio::test]
async fn rebuild_keeps_tracking_for_months_outside_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let tree = SourceTree::new(&dir.path().join("data"));
    for month in ["2024-01", "2024-02"] {
        tree.write(
            PartitionClass::Regular,
            month,
            "a",
            &json!({"id": format!("a-{}", month)}),
        )
        .unwrap();
    }
    let state_db = dir.path().join("state.db");
    let store = Arc::new(MemoryDocumentStore::new());
    run_mode(tree.root(), &state_db, ImportMode::Incremental, &store).await;

    let mut job = test_job(tree.root(), &state_db, ImportMode::Rebuild);
    job.recent_months = Some(1);
    let tracker = StateTracker::open(&state_db).await.unwrap();
    let mut orchestrator =
        ImportOrchestrator::new(job, Arc::clone(&store), Arc::new(FsSourceReader), tracker);
    let rebuild = orchestrator.run().await;

    let keys: Vec<_> = rebuild.partitions.iter().map(|p| p.key.as_str()).collect();
    assert_eq!(keys, vec!["regular/2024-02"]);
    assert_eq!(rebuild.totals().succeeded, 1);

    let tracker = StateTracker::open(&state_db).await.unwrap();
    let untouched = tracker
        .get(&tree.unit_id(PartitionClass::Regular, "2024-01", "a"))
        .await
        .unwrap();
    assert_eq!(untouched.map(|record| record.outcome), Some(Outcome::Success));
    assert_eq!(tracker.stats(Some("regular")).await.unwrap().succeeded, 2);
}

#[tokio::test]
async fn smart_merge_only_reprocesses_changed_files() {
    let dir = tempfile::tempdir().unwrap();
    let tree = SourceTree::new(&dir.path().join("data"));
    for name in ["a", "b", "c"] {
        tree.write(
            PartitionClass::Regular,
            "2024-02",
            name,
            &json!({"id": name, "type": "REGULAR", "v": 1}),
        )
        .unwrap();
    }
    let state_db = dir.path().join("state.db");
    let store = Arc::new(MemoryDocumentStore::new());
    run_mode(tree.root(), &state_db, ImportMode::Incremental, &store).await;

    tree.write(
        PartitionClass::Regular,
        "2024-02",
        "b",
        &json!({"id": "b", "type": "REGULAR", "v": 2}),
    )
    .unwrap();

    // Incremental ignores content changes once a unit is committed.
    let incremental = run_mode(tree.root(), &state_db, ImportMode::Incremental, &store).await;
    assert_eq!(incremental.totals().skipped, 3);
    assert_eq!(store.get(REGULAR, "b").unwrap().get("v"), Some(&json!(1)));

    let smart = run_mode(tree.root(), &state_db, ImportMode::SmartMerge, &store).await;
    assert_eq!(smart.totals().skipped, 2);
    assert_eq!(smart.totals().succeeded, 1);
    assert_eq!(store.get(REGULAR, "b").unwrap().get("v"), Some(&json!(2)));
}

#[tokio::test]
async fn time_range_only_touches_recent_documents() {
    let dir = tempfile::tempdir().unwrap();
    let tree = SourceTree::new(&dir.path().join("data"));
    let now = Utc::now();
    let this_month = now.format("%Y-%m").to_string();

    tree.write(
        PartitionClass::Regular,
        &this_month,
        "recent",
        &json!({"id": "recent", "dateModified": (now - Duration::hours(1)).to_rfc3339()}),
    )
    .unwrap();
    tree.write(
        PartitionClass::Regular,
        &this_month,
        "stale",
        &json!({"id": "stale", "dateModified": (now - Duration::days(40)).to_rfc3339()}),
    )
    .unwrap();
    tree.write(
        PartitionClass::Regular,
        "2020-01",
        "ancient",
        &json!({"id": "ancient", "dateModified": "2020-01-15T00:00:00Z"}),
    )
    .unwrap();

    let store = Arc::new(MemoryDocumentStore::new());
    let summary = run_mode(tree.root(), &dir.path().join("state.db"), ImportMode::TimeRange, &store).await;
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(summary.totals().succeeded, 1);
    assert_eq!(summary.totals().out_of_window, 1);
    assert!(store.get(REGULAR, "recent").is_some());
    assert!(store.get(REGULAR, "stale").is_none());
    assert!(store.get(REGULAR, "ancient").is_none());
}

#[tokio::test]
async fn checks_merge_by_name_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let tree = SourceTree::new(&dir.path().join("data"));
    tree.write(
        PartitionClass::Regular,
        "2024-04",
        "a",
        &json!({
            "id": "a",
            "is": {"checks": [
                {"name": "LOW_SHARPE", "result": "PASS"},
                {"name": "NEW_CHECK", "result": "PASS"}
            ]}
        }),
    )
    .unwrap();

    let store = Arc::new(MemoryDocumentStore::new());
    store.seed(
        REGULAR,
        "a",
        doc(json!({
            "id": "a",
            "is": {"sharpe": 1.2, "checks": [
                {"name": "LOW_SHARPE", "result": "FAIL", "limit": 1.25},
                {"name": "HIGH_TURNOVER", "result": "PASS"}
            ]}
        })),
    );

    let summary = run_mode(tree.root(), &dir.path().join("state.db"), ImportMode::Incremental, &store).await;
    assert_eq!(summary.totals().updated, 1);
    assert_eq!(
        store.get(REGULAR, "a").unwrap(),
        doc(json!({
            "id": "a",
            "is": {"sharpe": 1.2, "checks": [
                {"name": "LOW_SHARPE", "result": "PASS", "limit": 1.25},
                {"name": "HIGH_TURNOVER", "result": "PASS"},
                {"name": "NEW_CHECK", "result": "PASS"}
            ]}
        }))
    );
}

#[tokio::test]
async fn failed_units_are_tracked_and_fail_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let tree = SourceTree::new(&dir.path().join("data"));
    tree.write(PartitionClass::Regular, "2024-05", "good", &json!({"id": "good"}))
        .unwrap();
    let bad = tree
        .write(PartitionClass::Regular, "2024-05", "bad", &json!({"id": "bad"}))
        .unwrap();
    std::fs::write(&bad, b"[1, 2]").unwrap();

    let state_db = dir.path().join("state.db");
    let store = Arc::new(MemoryDocumentStore::new());
    let summary = run_mode(tree.root(), &state_db, ImportMode::Incremental, &store).await;
    assert_eq!(summary.outcome, RunOutcome::Done);
    assert_eq!(summary.totals().failed, 1);
    assert_eq!(summary.totals().succeeded, 1);
    assert_eq!(summary.exit_code(), 1);

    let tracker = StateTracker::open(&state_db).await.unwrap();
    let record = tracker
        .get(&tree.unit_id(PartitionClass::Regular, "2024-05", "bad"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.outcome, Outcome::Failure);
}
