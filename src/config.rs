//! Run configuration.
//!
//! An [`ImportJob`] is assembled once per invocation: defaults come from environment
//! variables, the CLI overrides them, and [`ImportJob::validate`] rejects anything that
//! would prevent the run from starting.

use crate::document::DEFAULT_KEY_FIELD;
use crate::error::ImportError;
use crate::merge::ArrayKeys;
use chrono::{DateTime, Duration, Utc};
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

/// How incoming documents combine with stored ones and which units are skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ImportMode {
    /// Skip units already committed successfully; deep merge the rest.
    #[default]
    Incremental,
    /// Reprocess everything; deep merge keeps historical fields.
    Overwrite,
    /// Purge tracking for the scope and replace stored documents wholesale.
    Rebuild,
    /// Reprocess units whose data timestamp falls inside a recent window.
    TimeRange,
    /// Start from the newest tracked timestamp; skip units whose content is unchanged.
    SmartMerge,
}

impl ImportMode {
    pub const ALL: [ImportMode; 5] = [
        ImportMode::Incremental,
        ImportMode::Overwrite,
        ImportMode::Rebuild,
        ImportMode::TimeRange,
        ImportMode::SmartMerge,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ImportMode::Incremental => "incremental",
            ImportMode::Overwrite => "overwrite",
            ImportMode::Rebuild => "rebuild",
            ImportMode::TimeRange => "time_range",
            ImportMode::SmartMerge => "smart_merge",
        }
    }

    /// Only `rebuild` discards stored history.
    pub fn replaces_documents(&self) -> bool {
        matches!(self, ImportMode::Rebuild)
    }

    pub fn purges_tracking(&self) -> bool {
        matches!(self, ImportMode::Rebuild)
    }
}

impl fmt::Display for ImportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "incremental" | "skip" => Ok(ImportMode::Incremental),
            "overwrite" => Ok(ImportMode::Overwrite),
            "rebuild" => Ok(ImportMode::Rebuild),
            "time_range" => Ok(ImportMode::TimeRange),
            "smart_merge" => Ok(ImportMode::SmartMerge),
            other => Err(format!(
                "unknown import mode '{}' (expected one of: incremental, overwrite, rebuild, time_range, smart_merge)",
                other
            )),
        }
    }
}

/// The two partition classes. Every regular partition is processed before any super one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PartitionClass {
    Regular,
    Super,
}

impl PartitionClass {
    pub const ORDERED: [PartitionClass; 2] = [PartitionClass::Regular, PartitionClass::Super];

    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionClass::Regular => "regular",
            PartitionClass::Super => "super",
        }
    }
}

impl fmt::Display for PartitionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PartitionClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "regular" => Ok(PartitionClass::Regular),
            "super" => Ok(PartitionClass::Super),
            other => Err(format!("unknown partition class '{}'", other)),
        }
    }
}

/// Connection parameters for the document store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Full connection URL; takes precedence over the individual fields.
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub max_connections: u32,
}

impl StoreConfig {
    pub fn from_env() -> Self {
        Self {
            url: env_opt("DATABASE_URL"),
            host: env_string("STORE_HOST", "localhost"),
            port: env::var("STORE_PORT")
                .ok()
                .and_then(|value| value.parse::<u16>().ok())
                .unwrap_or(5432),
            database: env_string("STORE_DATABASE", "alphas"),
            user: env_string("STORE_USER", "postgres"),
            password: env_string("STORE_PASSWORD", "postgres"),
            max_connections: env_usize("STORE_MAX_CONNECTIONS", 8) as u32,
        }
    }

    pub fn connection_url(&self) -> String {
        match &self.url {
            Some(url) => url.clone(),
            None => format!(
                "postgres://{}:{}@{}:{}/{}",
                self.user, self.password, self.host, self.port, self.database
            ),
        }
    }

    /// Connection target without credentials, for logs.
    pub fn display_target(&self) -> String {
        match &self.url {
            Some(_) => "DATABASE_URL".to_string(),
            None => format!("{}:{}/{}", self.host, self.port, self.database),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Inclusive bounds on a unit's data timestamp. Either side may be open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeWindow {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeWindow {
    pub fn new(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        Self { start, end }
    }

    pub fn is_open(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    /// Units without a timestamp are always kept.
    pub fn contains(&self, ts: Option<DateTime<Utc>>) -> bool {
        let Some(ts) = ts else {
            return true;
        };
        self.start.is_none_or(|start| ts >= start) && self.end.is_none_or(|end| ts <= end)
    }
}

/// Immutable configuration of one import run.
#[derive(Debug, Clone)]
pub struct ImportJob {
    pub mode: ImportMode,
    pub workers: usize,
    pub batch_size: usize,
    pub data_root: PathBuf,
    pub state_db: PathBuf,
    pub store: StoreConfig,
    pub regular_collection: String,
    pub super_collection: String,
    /// Partition classes in scope, always processed in [`PartitionClass::ORDERED`] order.
    pub classes: Vec<PartitionClass>,
    /// Restrict the run to these `YYYY-MM` months. Empty means every month.
    pub months: Vec<String>,
    pub key_field: String,
    pub array_keys: ArrayKeys,
    pub validate: bool,
    /// Only the newest N months per class. Overrides mode window month filtering.
    pub recent_months: Option<usize>,
    pub time_range_hours: i64,
    pub time_range_buffer_days: i64,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub write_retries: u32,
    pub tracker_retries: u32,
    pub retry_backoff_ms: u64,
}

/// Workers default to every core but two, never fewer than one.
pub fn default_workers() -> usize {
    num_cpus::get().saturating_sub(2).max(1)
}

impl ImportJob {
    pub fn from_env() -> Self {
        let array_keys = env_opt("IMPORT_ARRAY_KEYS")
            .and_then(|spec| match ArrayKeys::parse(&spec) {
                Ok(keys) => Some(keys),
                Err(err) => {
                    log::warn!("ignoring IMPORT_ARRAY_KEYS: {}", err);
                    None
                }
            })
            .unwrap_or_default();

        let mode = env_opt("IMPORT_MODE")
            .and_then(|value| match value.parse() {
                Ok(mode) => Some(mode),
                Err(err) => {
                    log::warn!("ignoring IMPORT_MODE: {}", err);
                    None
                }
            })
            .unwrap_or_default();

        Self {
            mode,
            workers: env_usize("IMPORT_WORKERS", default_workers()),
            batch_size: env_usize("IMPORT_BATCH_SIZE", 1000),
            data_root: PathBuf::from(env_string("IMPORT_DATA_ROOT", "./final_data")),
            state_db: PathBuf::from(env_string("IMPORT_STATE_DB", "./state/processed_units.db")),
            store: StoreConfig::from_env(),
            regular_collection: env_string("IMPORT_REGULAR_COLLECTION", "regular_alphas"),
            super_collection: env_string("IMPORT_SUPER_COLLECTION", "super_alphas"),
            classes: PartitionClass::ORDERED.to_vec(),
            months: Vec::new(),
            key_field: env_string("IMPORT_KEY_FIELD", DEFAULT_KEY_FIELD),
            array_keys,
            validate: env_bool("IMPORT_VALIDATE", false),
            recent_months: env_opt("IMPORT_RECENT_MONTHS").and_then(|v| v.parse().ok()),
            time_range_hours: env_i64("TIME_RANGE_HOURS", 25),
            time_range_buffer_days: env_i64("TIME_RANGE_BUFFER_DAYS", 3),
            since: None,
            until: None,
            write_retries: env_usize("IMPORT_WRITE_RETRIES", 3) as u32,
            tracker_retries: env_usize("IMPORT_TRACKER_RETRIES", 3) as u32,
            retry_backoff_ms: env_usize("IMPORT_RETRY_BACKOFF_MS", 500) as u64,
        }
    }

    pub fn collection_for(&self, class: PartitionClass) -> &str {
        match class {
            PartitionClass::Regular => &self.regular_collection,
            PartitionClass::Super => &self.super_collection,
        }
    }

    /// Units in flight per batch.
    pub fn batch_threshold(&self) -> usize {
        self.workers.saturating_mul(self.batch_size)
    }

    /// Classes in scope, in processing order.
    pub fn ordered_classes(&self) -> Vec<PartitionClass> {
        PartitionClass::ORDERED
            .into_iter()
            .filter(|class| self.classes.contains(class))
            .collect()
    }

    /// Window for `time_range`: `[now - hours - buffer, now + buffer]`.
    pub fn time_range_window(&self, now: DateTime<Utc>) -> TimeWindow {
        let buffer = Duration::days(self.time_range_buffer_days);
        TimeWindow::new(
            Some(now - Duration::hours(self.time_range_hours) - buffer),
            Some(now + buffer),
        )
    }

    /// Window for `smart_merge`, starting a buffer before the newest tracked data.
    pub fn smart_merge_window(&self, latest: Option<DateTime<Utc>>) -> TimeWindow {
        TimeWindow::new(
            latest.map(|ts| ts - Duration::days(self.time_range_buffer_days)),
            None,
        )
    }

    pub fn validate(&self) -> Result<(), ImportError> {
        if self.workers < 1 {
            return Err(ImportError::config(format!("workers must be >= 1, got {}", self.workers)));
        }
        if self.batch_size < 1 {
            return Err(ImportError::config(format!(
                "batch size must be >= 1, got {}",
                self.batch_size
            )));
        }
        if self.classes.is_empty() {
            return Err(ImportError::config("at least one partition class is required"));
        }
        if self.key_field.trim().is_empty() {
            return Err(ImportError::config("key field must not be empty"));
        }
        if self.regular_collection.trim().is_empty() || self.super_collection.trim().is_empty() {
            return Err(ImportError::config("collection names must not be empty"));
        }
        if self.time_range_hours <= 0 {
            return Err(ImportError::config(format!(
                "time range hours must be > 0, got {}",
                self.time_range_hours
            )));
        }
        if self.time_range_buffer_days < 0 {
            return Err(ImportError::config(format!(
                "time range buffer days must be >= 0, got {}",
                self.time_range_buffer_days
            )));
        }
        if self.recent_months == Some(0) {
            return Err(ImportError::config("recent months must be >= 1"));
        }
        if let (Some(since), Some(until)) = (self.since, self.until) {
            if since > until {
                return Err(ImportError::config(format!(
                    "since ({}) is after until ({})",
                    since, until
                )));
            }
        }
        for month in &self.months {
            if !is_month_token(month) {
                return Err(ImportError::config(format!(
                    "month '{}' is not in YYYY-MM form",
                    month
                )));
            }
        }
        if self.store.port == 0 && self.store.url.is_none() {
            return Err(ImportError::config("store port must be positive"));
        }
        if !self.data_root.is_dir() {
            return Err(ImportError::config(format!(
                "data root does not exist: {}",
                self.data_root.display()
            )));
        }
        Ok(())
    }
}

impl Default for ImportJob {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Tracker partition key for one month of a class, e.g. `regular/2024-03`.
pub fn partition_key(class: PartitionClass, month: &str) -> String {
    format!("{}/{}", class.as_str(), month)
}

/// `YYYY-MM` with a plausible month number.
pub fn is_month_token(token: &str) -> bool {
    let bytes = token.as_bytes();
    bytes.len() == 7
        && bytes[4] == b'-'
        && bytes[..4].iter().all(u8::is_ascii_digit)
        && bytes[5..].iter().all(u8::is_ascii_digit)
        && matches!(token[5..].parse::<u32>(), Ok(1..=12))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn job(root: &std::path::Path) -> ImportJob {
        ImportJob {
            data_root: root.to_path_buf(),
            workers: 4,
            batch_size: 10,
            ..ImportJob::from_env()
        }
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("incremental".parse::<ImportMode>(), Ok(ImportMode::Incremental));
        assert_eq!("skip".parse::<ImportMode>(), Ok(ImportMode::Incremental));
        assert_eq!("time-range".parse::<ImportMode>(), Ok(ImportMode::TimeRange));
        assert_eq!("SMART_MERGE".parse::<ImportMode>(), Ok(ImportMode::SmartMerge));
        assert!("merge_everything".parse::<ImportMode>().is_err());

        for mode in ImportMode::ALL {
            assert_eq!(mode.as_str().parse::<ImportMode>(), Ok(mode));
        }
        assert!(ImportMode::Rebuild.replaces_documents());
        assert!(!ImportMode::Overwrite.replaces_documents());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let dir = tempfile::tempdir().unwrap();
        assert!(job(dir.path()).validate().is_ok());

        let zero_workers = ImportJob { workers: 0, ..job(dir.path()) };
        assert!(matches!(zero_workers.validate(), Err(ImportError::ConfigInvalid(_))));

        let zero_batch = ImportJob { batch_size: 0, ..job(dir.path()) };
        assert!(zero_batch.validate().is_err());

        let bad_month = ImportJob { months: vec!["2024-13".to_string()], ..job(dir.path()) };
        assert!(bad_month.validate().is_err());

        let missing_root = job(&dir.path().join("missing"));
        assert!(missing_root.validate().is_err());
    }

    #[test]
    fn test_classes_follow_processing_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = job(dir.path());
        job.classes = vec![PartitionClass::Super, PartitionClass::Regular];
        assert_eq!(
            job.ordered_classes(),
            vec![PartitionClass::Regular, PartitionClass::Super]
        );

        job.classes = vec![PartitionClass::Super];
        assert_eq!(job.ordered_classes(), vec![PartitionClass::Super]);
    }

    #[test]
    fn test_time_windows() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = job(dir.path());
        job.time_range_hours = 24;
        job.time_range_buffer_days = 1;
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();

        let window = job.time_range_window(now);
        assert_eq!(window.start, Some(Utc.with_ymd_and_hms(2024, 3, 8, 12, 0, 0).unwrap()));
        assert_eq!(window.end, Some(Utc.with_ymd_and_hms(2024, 3, 11, 12, 0, 0).unwrap()));
        assert!(window.contains(Some(now)));
        assert!(!window.contains(Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap())));
        assert!(window.contains(None));

        assert!(job.smart_merge_window(None).is_open());
        let smart = job.smart_merge_window(Some(now));
        assert_eq!(smart.start, Some(Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap()));
    }

    #[test]
    fn test_month_tokens() {
        assert!(is_month_token("2024-03"));
        assert!(!is_month_token("2024-3"));
        assert!(!is_month_token("2024-00"));
        assert!(!is_month_token("abcd-01"));
    }
}
