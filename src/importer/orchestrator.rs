//! Run state machine.
//!
//! `Init → ProcessingRegular → ProcessingSuper → Finalize → Done`, with `Failed` reachable
//! from any processing state. Partitions and batches run strictly one after another; the
//! stop signal is only honoured between batches, so a batch is never abandoned halfway.

use super::batch::BatchPlanner;
use super::source::{
    discover_partition_dirs, filter_months, filter_months_by_window, filter_units_by_window,
    limit_recent_months, scan_partitions, Partition, SourceReader, Unit,
};
use super::stats::{ImportStats, PartitionSummary, RunOutcome, RunSummary};
use super::worker::{ImportWorkerPool, WorkerSettings};
use crate::config::{ImportJob, ImportMode, PartitionClass, TimeWindow};
use crate::error::ImportError;
use crate::merge::MergePlanner;
use crate::state::{is_done_with, StateTracker};
use crate::store::DocumentStore;
use chrono::Utc;
use log::{debug, error, info, warn};
use std::io;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Consecutive batches without a single successful unit before the run is aborted.
pub const CIRCUIT_BREAKER_THRESHOLD: usize = 5;

/// Most failed units logged individually per batch.
const MAX_LOGGED_FAILURES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    ProcessingRegular,
    ProcessingSuper,
    Finalize,
    Done,
    Failed,
}

impl RunState {
    fn processing(class: PartitionClass) -> Self {
        match class {
            PartitionClass::Regular => RunState::ProcessingRegular,
            PartitionClass::Super => RunState::ProcessingSuper,
        }
    }
}

pub struct ImportOrchestrator<S, R> {
    job: ImportJob,
    store: Arc<S>,
    reader: Arc<R>,
    tracker: StateTracker,
    cancel: CancellationToken,
    state: RunState,
    history: Vec<RunState>,
    consecutive_failed_batches: usize,
}

impl<S: DocumentStore, R: SourceReader> ImportOrchestrator<S, R> {
    pub fn new(job: ImportJob, store: Arc<S>, reader: Arc<R>, tracker: StateTracker) -> Self {
        Self {
            job,
            store,
            reader,
            tracker,
            cancel: CancellationToken::new(),
            state: RunState::Init,
            history: vec![RunState::Init],
            consecutive_failed_batches: 0,
        }
    }

    /// Token that stops the run before its next batch when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Every state entered so far, in order.
    pub fn history(&self) -> &[RunState] {
        &self.history
    }

    fn transition(&mut self, next: RunState) {
        if self.state != next {
            debug!("orchestrator: {:?} -> {:?}", self.state, next);
            self.state = next;
            self.history.push(next);
        }
    }

    /// Drive the whole run. Never returns an error: failures end in a `Failed` summary.
    pub async fn run(&mut self) -> RunSummary {
        let started = Instant::now();
        let mut summary = RunSummary::new(self.job.mode);
        info!(
            "orchestrator: starting {} import from {} ({} workers, batch size {})",
            self.job.mode,
            self.job.data_root.display(),
            self.job.workers,
            self.job.batch_size
        );

        match self.execute(&mut summary).await {
            Ok(()) => {
                self.transition(RunState::Finalize);
                summary.outcome = RunOutcome::Done;
            }
            Err(ImportError::Cancelled) => {
                warn!("orchestrator: cancelled, stopping before the next batch");
                self.transition(RunState::Finalize);
                summary.outcome = RunOutcome::Cancelled;
            }
            Err(err) => {
                error!("orchestrator: run failed: {}", err);
                summary.outcome = RunOutcome::Failed;
                summary.error = Some(err.to_string());
            }
        }

        summary.elapsed = started.elapsed();
        self.tracker.close().await;

        if summary.outcome == RunOutcome::Failed {
            self.transition(RunState::Failed);
        } else {
            self.transition(RunState::Done);
        }
        info!("orchestrator: {}", summary.totals());
        summary
    }

    async fn execute(&mut self, summary: &mut RunSummary) -> Result<(), ImportError> {
        self.init().await?;

        let partitions = self.discover().await?;
        if self.job.mode.purges_tracking() {
            self.purge_discovered(&partitions).await?;
        }
        let pool = ImportWorkerPool::new(
            Arc::clone(&self.store),
            Arc::clone(&self.reader),
            self.tracker.clone(),
            MergePlanner::new(self.job.array_keys.clone()),
            WorkerSettings::from_job(&self.job),
        );
        let planner = BatchPlanner::new(self.job.workers, self.job.batch_size);

        for class in self.job.ordered_classes() {
            self.transition(RunState::processing(class));
            let window = self.unit_window(class).await;
            let collection = self.job.collection_for(class).to_string();

            for partition in partitions.iter().filter(|p| p.class == class) {
                let mut part = PartitionSummary {
                    key: partition.key.clone(),
                    class,
                    month: partition.month.clone(),
                    stats: ImportStats::default(),
                };
                let result = self
                    .process_partition(&pool, &planner, &collection, partition, &window, &mut part.stats)
                    .await;
                info!("{}: {}", part.key, part.stats);
                summary.partitions.push(part);
                result?;
            }
        }
        Ok(())
    }

    /// Validate the job and check the store.
    async fn init(&mut self) -> Result<(), ImportError> {
        self.job.validate()?;
        self.store
            .ping()
            .await
            .map_err(ImportError::StoreUnavailable)?;
        Ok(())
    }

    /// Clear tracking for the partitions this `rebuild` will reprocess, and nothing else.
    async fn purge_discovered(&self, partitions: &[Partition]) -> Result<(), ImportError> {
        for partition in partitions {
            let purged = self.tracker.purge_scope(&partition.key).await?;
            info!("orchestrator: rebuild purged {} records in {}", purged, partition.key);
        }
        Ok(())
    }

    /// Find and scan the partitions in scope. Runs on the blocking pool.
    async fn discover(&self) -> Result<Vec<Partition>, ImportError> {
        let root = self.job.data_root.clone();
        let classes = self.job.ordered_classes();
        let months = self.job.months.clone();
        let recent = self.job.recent_months;
        let month_window = match recent {
            Some(_) => TimeWindow::default(),
            None => self.month_window().await,
        };
        let threads = self.job.workers;

        let scan = tokio::task::spawn_blocking(move || {
            let dirs = discover_partition_dirs(&root)?;
            let dirs: Vec<_> = dirs
                .into_iter()
                .filter(|dir| classes.contains(&dir.class))
                .collect();
            let dirs = filter_months(dirs, &months);
            let dirs = match recent {
                Some(n) => limit_recent_months(dirs, n),
                None => filter_months_by_window(dirs, &month_window),
            };
            scan_partitions(&root, &dirs, threads)
        });

        let partitions = scan.await.map_err(|err| ImportError::Scan {
            path: self.job.data_root.clone(),
            source: io::Error::other(err),
        })??;

        info!(
            "orchestrator: {} partitions to process ({} regular, {} super)",
            partitions.len(),
            partitions
                .iter()
                .filter(|p| p.class == PartitionClass::Regular)
                .count(),
            partitions
                .iter()
                .filter(|p| p.class == PartitionClass::Super)
                .count()
        );
        Ok(partitions)
    }

    /// Window used to drop whole months before scanning.
    async fn month_window(&self) -> TimeWindow {
        match self.job.mode {
            ImportMode::TimeRange | ImportMode::SmartMerge => self.unit_window_for(None).await,
            _ => self.explicit_window(TimeWindow::default()),
        }
    }

    async fn unit_window(&self, class: PartitionClass) -> TimeWindow {
        self.unit_window_for(Some(class)).await
    }

    /// Mode window, narrowed or replaced by explicit `since`/`until` bounds.
    async fn unit_window_for(&self, class: Option<PartitionClass>) -> TimeWindow {
        let window = match self.job.mode {
            ImportMode::TimeRange => self.job.time_range_window(Utc::now()),
            ImportMode::SmartMerge => {
                let scope = class.map(|c| c.as_str());
                let latest = match self.tracker.query_latest_timestamp(scope).await {
                    Ok(latest) => latest,
                    Err(err) => {
                        warn!("orchestrator: cannot read latest timestamp, using no window: {}", err);
                        None
                    }
                };
                self.job.smart_merge_window(latest)
            }
            _ => TimeWindow::default(),
        };
        self.explicit_window(window)
    }

    fn explicit_window(&self, mut window: TimeWindow) -> TimeWindow {
        if self.job.since.is_some() {
            window.start = self.job.since;
        }
        if self.job.until.is_some() {
            window.end = self.job.until;
        }
        window
    }

    /// Units that still need work under the current mode, the number skipped as done,
    /// and whether the result is already checked against the tracker. When the bulk
    /// lookup fails the workers fall back to checking each unit.
    async fn pending_units(
        &self,
        partition: &Partition,
        units: Vec<Unit>,
    ) -> (Vec<Unit>, usize, bool) {
        let mode = self.job.mode;
        if !matches!(mode, ImportMode::Incremental | ImportMode::SmartMerge) {
            return (units, 0, true);
        }

        let completed = match self.tracker.completed_in_scope(&partition.key).await {
            Ok(completed) => completed,
            Err(err) => {
                warn!(
                    "{}: cannot load completed units, workers will check each unit: {}",
                    partition.key, err
                );
                return (units, 0, false);
            }
        };

        let before = units.len();
        let pending: Vec<Unit> = units
            .into_iter()
            .filter(|unit| !is_done_with(mode, completed.get(&unit.id), &unit.fingerprint))
            .collect();
        let skipped = before - pending.len();
        (pending, skipped, true)
    }

    async fn process_partition(
        &mut self,
        pool: &ImportWorkerPool<S, R>,
        planner: &BatchPlanner,
        collection: &str,
        partition: &Partition,
        window: &TimeWindow,
        stats: &mut ImportStats,
    ) -> Result<(), ImportError> {
        let in_window = filter_units_by_window(partition.units.clone(), window);
        let outside = partition.units.len() - in_window.len();
        stats.out_of_window += outside;
        if outside > 0 {
            debug!("{}: {} units outside the time window", partition.key, outside);
        }

        let (pending, skipped, prefiltered) = self.pending_units(partition, in_window).await;
        stats.skipped += skipped;

        let batches = planner.plan(pending);
        if batches.is_empty() {
            info!("{}: nothing to do ({} already done)", partition.key, skipped);
            return Ok(());
        }

        let total = batches.len();
        for (index, batch) in batches.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(ImportError::Cancelled);
            }

            info!(
                "{}: batch {}/{} ({} units)",
                partition.key,
                index + 1,
                total,
                batch.len()
            );
            let report = if prefiltered {
                pool.process_pending(collection, batch).await
            } else {
                pool.process_batch(collection, batch).await
            };
            for (unit_id, reason) in report.failures.iter().take(MAX_LOGGED_FAILURES) {
                warn!("{}: unit {} failed: {}", partition.key, unit_id, reason);
            }
            if report.failures.len() > MAX_LOGGED_FAILURES {
                warn!(
                    "{}: {} more failed units in batch {}",
                    partition.key,
                    report.failures.len() - MAX_LOGGED_FAILURES,
                    index + 1
                );
            }
            stats.merge(&report.stats);

            if report.write_failed {
                self.store
                    .ping()
                    .await
                    .map_err(ImportError::StoreUnavailable)?;
            }

            if report.is_total_failure() {
                self.consecutive_failed_batches += 1;
                if self.consecutive_failed_batches >= CIRCUIT_BREAKER_THRESHOLD {
                    return Err(ImportError::CircuitOpen(self.consecutive_failed_batches));
                }
            } else if report.stats.succeeded > 0 {
                self.consecutive_failed_batches = 0;
            }
        }
        Ok(())
    }
}
