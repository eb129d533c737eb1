//! Import statistics and the end-of-run summary.

use crate::config::{ImportMode, PartitionClass};
use crate::store::BulkWriteReport;
use std::fmt;
use std::time::Duration;

/// Exit status for a run stopped by the operator.
pub const EXIT_CANCELLED: i32 = 130;

/// Counters for one batch, partition, class or run.
///
/// `attempted` counts units that were actually processed (`succeeded + failed`);
/// units skipped because they were already done are counted in `skipped` only, and
/// units whose data timestamp falls outside the run's time window in `out_of_window`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportStats {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub out_of_window: usize,
    /// Committed to the store but the tracker write did not go through.
    pub unverified: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub batches: usize,
    pub failed_batches: usize,
}

impl ImportStats {
    /// Merge another ImportStats into this one by summing all counts.
    pub fn merge(&mut self, other: &ImportStats) {
        self.attempted += other.attempted;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.out_of_window += other.out_of_window;
        self.unverified += other.unverified;
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.batches += other.batches;
        self.failed_batches += other.failed_batches;
    }

    pub fn record_write(&mut self, report: &BulkWriteReport) {
        self.inserted += report.inserted;
        self.updated += report.updated;
        self.unchanged += report.unchanged;
    }
}

impl fmt::Display for ImportStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "attempted={} succeeded={} failed={} skipped={} out_of_window={} unverified={} (inserted={} updated={} unchanged={})",
            self.attempted,
            self.succeeded,
            self.failed,
            self.skipped,
            self.out_of_window,
            self.unverified,
            self.inserted,
            self.updated,
            self.unchanged
        )
    }
}

/// Result of one batch handed back by the worker pool.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub stats: ImportStats,
    /// The bulk write failed after all retries.
    pub write_failed: bool,
    /// `(unit id, reason)` for every failed unit.
    pub failures: Vec<(String, String)>,
}

impl BatchReport {
    /// A batch with units to write where not a single one succeeded.
    pub fn is_total_failure(&self) -> bool {
        self.stats.attempted > 0 && self.stats.succeeded == 0
    }
}

#[derive(Debug, Clone)]
pub struct PartitionSummary {
    pub key: String,
    pub class: PartitionClass,
    pub month: String,
    pub stats: ImportStats,
}

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Done,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub mode: ImportMode,
    pub outcome: RunOutcome,
    pub partitions: Vec<PartitionSummary>,
    /// Reason for a `Failed` run.
    pub error: Option<String>,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn new(mode: ImportMode) -> Self {
        Self {
            mode,
            outcome: RunOutcome::Done,
            partitions: Vec::new(),
            error: None,
            elapsed: Duration::ZERO,
        }
    }

    pub fn totals(&self) -> ImportStats {
        let mut totals = ImportStats::default();
        for partition in &self.partitions {
            totals.merge(&partition.stats);
        }
        totals
    }

    pub fn class_totals(&self, class: PartitionClass) -> ImportStats {
        let mut totals = ImportStats::default();
        for partition in self.partitions.iter().filter(|p| p.class == class) {
            totals.merge(&partition.stats);
        }
        totals
    }

    /// 0 only when the run finished and no unit failed.
    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            RunOutcome::Cancelled => EXIT_CANCELLED,
            RunOutcome::Failed => 1,
            RunOutcome::Done if self.totals().failed > 0 => 1,
            RunOutcome::Done => 0,
        }
    }

    /// Multi-line operator summary.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "import {} ({}) in {:.1}s\n",
            match self.outcome {
                RunOutcome::Done => "finished",
                RunOutcome::Cancelled => "cancelled",
                RunOutcome::Failed => "failed",
            },
            self.mode,
            self.elapsed.as_secs_f64()
        ));
        for partition in &self.partitions {
            out.push_str(&format!("  {:<18} {}\n", partition.key, partition.stats));
        }
        for class in PartitionClass::ORDERED {
            if self.partitions.iter().any(|p| p.class == class) {
                out.push_str(&format!("  {:<18} {}\n", class.as_str(), self.class_totals(class)));
            }
        }
        out.push_str(&format!("  {:<18} {}\n", "total", self.totals()));
        if let Some(error) = &self.error {
            out.push_str(&format!("  reason: {}\n", error));
        }
        out
    }
}
