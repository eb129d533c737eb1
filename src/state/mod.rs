//! Durable record of which source units have been committed.
//!
//! One row per unit id, upserted after every attempt. The document store remains the
//! source of truth: a missing or stale row only ever causes a unit to be processed again,
//! and re-merging an already committed document is a no-op.

mod tracker;

pub use tracker::StateTracker;

use crate::config::ImportMode;
use crate::error::TrackerError;
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Outcome {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Outcome::Success),
            "failure" => Ok(Outcome::Failure),
            other => Err(TrackerError::UnknownOutcome(other.to_string())),
        }
    }
}

/// Latest known outcome for one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedRecord {
    pub unit_id: String,
    pub fingerprint: String,
    pub outcome: Outcome,
    pub data_timestamp: Option<DateTime<Utc>>,
    pub recorded_at: DateTime<Utc>,
    pub partition_key: String,
}

impl ProcessedRecord {
    pub fn new(
        unit_id: impl Into<String>,
        partition_key: impl Into<String>,
        fingerprint: impl Into<String>,
        outcome: Outcome,
        data_timestamp: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            unit_id: unit_id.into(),
            fingerprint: fingerprint.into(),
            outcome,
            data_timestamp,
            recorded_at: Utc::now(),
            partition_key: partition_key.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}

/// Per-outcome totals for a scope, used by the `status` command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerStats {
    pub succeeded: u64,
    pub failed: u64,
    pub latest_data_timestamp: Option<DateTime<Utc>>,
}

impl TrackerStats {
    pub fn total(&self) -> u64 {
        self.succeeded + self.failed
    }
}

/// Whether a unit with `fingerprint` can be skipped given its stored record.
///
/// `incremental` skips any unit committed successfully, regardless of content changes.
/// `smart_merge` skips only when the content is byte-identical to what was committed.
/// Every other mode reprocesses.
pub fn is_done_with(mode: ImportMode, record: Option<&ProcessedRecord>, fingerprint: &str) -> bool {
    let Some(record) = record.filter(|record| record.is_success()) else {
        return false;
    };
    match mode {
        ImportMode::Incremental => true,
        ImportMode::SmartMerge => record.fingerprint == fingerprint,
        ImportMode::Overwrite | ImportMode::Rebuild | ImportMode::TimeRange => false,
    }
}
