use super::{is_done_with, Outcome, ProcessedRecord, TrackerStats};
use crate::config::ImportMode;
use crate::error::TrackerError;
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use log::{debug, info};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, Sqlite, Transaction};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

static STATE_MIGRATOR: Migrator = sqlx::migrate!("./migrations/state");

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

// Scope filters compare the partition key prefix exactly (case-sensitive, no wildcards).
// Each filter binds the scope three times.

const UPSERT_SQL: &str = r#"INSERT INTO processed_units
       (unit_id, fingerprint, outcome, data_timestamp, recorded_at, partition_key)
   VALUES (?, ?, ?, ?, ?, ?)
   ON CONFLICT(unit_id) DO UPDATE SET
       fingerprint = excluded.fingerprint,
       outcome = excluded.outcome,
       data_timestamp = excluded.data_timestamp,
       recorded_at = excluded.recorded_at,
       partition_key = excluded.partition_key"#;

#[derive(Debug, FromRow)]
struct ProcessedRow {
    unit_id: String,
    fingerprint: String,
    outcome: String,
    data_timestamp: Option<i64>,
    recorded_at: i64,
    partition_key: String,
}

impl TryFrom<ProcessedRow> for ProcessedRecord {
    type Error = TrackerError;

    fn try_from(row: ProcessedRow) -> Result<Self, Self::Error> {
        Ok(ProcessedRecord {
            outcome: row.outcome.parse()?,
            unit_id: row.unit_id,
            fingerprint: row.fingerprint,
            data_timestamp: row.data_timestamp.and_then(DateTime::from_timestamp_millis),
            recorded_at: DateTime::from_timestamp_millis(row.recorded_at).unwrap_or_default(),
            partition_key: row.partition_key,
        })
    }
}

/// SQLite-backed tracker.
///
/// The pool holds a single connection, so every write is serialized through one writer
/// regardless of how many workers report outcomes concurrently.
#[derive(Debug, Clone)]
pub struct StateTracker {
    pool: SqlitePool,
    retry: RetryPolicy,
}

impl StateTracker {
    /// Open (creating if needed) the state database at `path` and apply its schema.
    pub async fn open(path: &Path) -> Result<Self, TrackerError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        STATE_MIGRATOR.run(&pool).await?;
        info!("state tracker: opened {}", path.display());

        Ok(Self {
            pool,
            retry: RetryPolicy::default(),
        })
    }

    /// Bounded retry applied to outcome writes.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn get(&self, unit_id: &str) -> Result<Option<ProcessedRecord>, TrackerError> {
        let row: Option<ProcessedRow> = sqlx::query_as(
            r#"SELECT unit_id, fingerprint, outcome, data_timestamp, recorded_at, partition_key
               FROM processed_units
               WHERE unit_id = ?"#,
        )
        .bind(unit_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ProcessedRecord::try_from).transpose()
    }

    /// Whether `unit_id` may be skipped under `mode`.
    pub async fn is_done(
        &self,
        unit_id: &str,
        mode: ImportMode,
        fingerprint: &str,
    ) -> Result<bool, TrackerError> {
        if !matches!(mode, ImportMode::Incremental | ImportMode::SmartMerge) {
            return Ok(false);
        }
        let record = self.get(unit_id).await?;
        Ok(is_done_with(mode, record.as_ref(), fingerprint))
    }

    /// Successful records in `scope`, keyed by unit id. Lets the orchestrator filter a
    /// whole partition with one query instead of one per unit.
    pub async fn completed_in_scope(
        &self,
        scope: &str,
    ) -> Result<HashMap<String, ProcessedRecord>, TrackerError> {
        let rows: Vec<ProcessedRow> = sqlx::query_as(
            r#"SELECT unit_id, fingerprint, outcome, data_timestamp, recorded_at, partition_key
               FROM processed_units
               WHERE outcome = 'success' AND (partition_key = ? OR substr(partition_key, 1, length(?) + 1) = ? || '/')"#,
        )
        .bind(scope)
        .bind(scope)
        .bind(scope)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| ProcessedRecord::try_from(row).map(|r| (r.unit_id.clone(), r)))
            .collect()
    }

    pub async fn record_outcome(&self, record: &ProcessedRecord) -> Result<(), TrackerError> {
        self.record_outcomes(std::slice::from_ref(record)).await
    }

    /// Upsert every record in one transaction, retrying the whole transaction on failure.
    pub async fn record_outcomes(&self, records: &[ProcessedRecord]) -> Result<(), TrackerError> {
        if records.is_empty() {
            return Ok(());
        }
        self.retry
            .run("state tracker: record outcomes", move || self.write_records(records))
            .await?;
        debug!("state tracker: recorded {} outcomes", records.len());
        Ok(())
    }

    async fn write_records(&self, records: &[ProcessedRecord]) -> Result<(), TrackerError> {
        let mut tx: Transaction<'_, Sqlite> = self.pool.begin().await?;
        for record in records {
            sqlx::query(UPSERT_SQL)
                .bind(&record.unit_id)
                .bind(&record.fingerprint)
                .bind(record.outcome.as_str())
                .bind(record.data_timestamp.map(|ts| ts.timestamp_millis()))
                .bind(record.recorded_at.timestamp_millis())
                .bind(&record.partition_key)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Delete every record in `scope`. Returns the number of rows removed.
    pub async fn purge_scope(&self, scope: &str) -> Result<u64, TrackerError> {
        let result = sqlx::query(
            r#"DELETE FROM processed_units
               WHERE partition_key = ? OR substr(partition_key, 1, length(?) + 1) = ? || '/'"#,
        )
        .bind(scope)
        .bind(scope)
        .bind(scope)
        .execute(&self.pool)
        .await?;

        info!(
            "state tracker: purged {} records in scope {}",
            result.rows_affected(),
            scope
        );
        Ok(result.rows_affected())
    }

    /// Newest data timestamp among successful units in `scope` (all scopes when `None`).
    pub async fn query_latest_timestamp(
        &self,
        scope: Option<&str>,
    ) -> Result<Option<DateTime<Utc>>, TrackerError> {
        let latest: Option<i64> = match scope {
            Some(scope) => {
                sqlx::query_scalar(
                    r#"SELECT MAX(data_timestamp) FROM processed_units
                       WHERE outcome = 'success' AND (partition_key = ? OR substr(partition_key, 1, length(?) + 1) = ? || '/')"#,
                )
                .bind(scope)
                .bind(scope)
                .bind(scope)
                .fetch_one(&self.pool)
                .await?
            }
            None => {
                sqlx::query_scalar(
                    "SELECT MAX(data_timestamp) FROM processed_units WHERE outcome = 'success'",
                )
                .fetch_one(&self.pool)
                .await?
            }
        };

        Ok(latest.and_then(DateTime::from_timestamp_millis))
    }

    pub async fn stats(&self, scope: Option<&str>) -> Result<TrackerStats, TrackerError> {
        let rows: Vec<(String, i64)> = match scope {
            Some(scope) => {
                sqlx::query_as(
                    r#"SELECT outcome, COUNT(*) FROM processed_units
                       WHERE partition_key = ? OR substr(partition_key, 1, length(?) + 1) = ? || '/'
                       GROUP BY outcome"#,
                )
                .bind(scope)
                .bind(scope)
                .bind(scope)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as("SELECT outcome, COUNT(*) FROM processed_units GROUP BY outcome")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut stats = TrackerStats::default();
        for (outcome, count) in rows {
            match outcome.parse::<Outcome>()? {
                Outcome::Success => stats.succeeded = count as u64,
                Outcome::Failure => stats.failed = count as u64,
            }
        }
        stats.latest_data_timestamp = self.query_latest_timestamp(scope).await?;
        Ok(stats)
    }
}
