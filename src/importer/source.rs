//! Source discovery and reading.
//!
//! The data root holds one directory per user, month and class, for example
//! `u1_2024-03_all_regular_alphas/`. Every `*.json` file below such a directory is one
//! unit. Directories for the same class and month are folded into a single partition.

use crate::config::{partition_key, PartitionClass, TimeWindow};
use crate::document::Document;
use crate::error::{ImportError, SourceError};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use log::{debug, info, warn};
use rayon::prelude::*;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

static MONTH_REGEX: OnceLock<Regex> = OnceLock::new();

/// Matches a `YYYY-MM` token delimited by underscores or the ends of the name.
fn get_month_regex() -> &'static Regex {
    MONTH_REGEX.get_or_init(|| {
        Regex::new(r"(?:^|_)(\d{4}-(?:0[1-9]|1[0-2]))(?:_|$)").expect("Invalid month token regex")
    })
}

/// One source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unit {
    /// Path relative to the data root, `/`-separated. Stable across runs.
    pub id: String,
    pub path: PathBuf,
    pub class: PartitionClass,
    pub month: String,
    pub partition_key: String,
    /// SHA-256 of the raw bytes at scan time. Empty when the file could not be read.
    pub fingerprint: String,
    pub size: u64,
    pub data_timestamp: Option<DateTime<Utc>>,
}

/// All units of one class and month, in processing order.
#[derive(Debug, Clone)]
pub struct Partition {
    pub class: PartitionClass,
    pub month: String,
    pub key: String,
    pub dirs: Vec<PathBuf>,
    pub units: Vec<Unit>,
}

/// A month directory before its files are scanned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionDir {
    pub class: PartitionClass,
    pub month: String,
    pub path: PathBuf,
}

/// Parse `class` and `YYYY-MM` out of a month directory name.
pub fn parse_partition_dir(name: &str) -> Option<(PartitionClass, String)> {
    let month = get_month_regex().captures(name)?.get(1)?.as_str().to_string();
    let class = name.split('_').find_map(|token| match token {
        "regular" => Some(PartitionClass::Regular),
        "super" => Some(PartitionClass::Super),
        _ => None,
    })?;
    Some((class, month))
}

/// Month directories directly under `root`, sorted by class then month then path.
pub fn discover_partition_dirs(root: &Path) -> Result<Vec<PartitionDir>, ImportError> {
    let scan_err = |source: io::Error| ImportError::Scan {
        path: root.to_path_buf(),
        source,
    };

    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(root).map_err(scan_err)? {
        let entry = entry.map_err(scan_err)?;
        if !entry.file_type().map_err(scan_err)?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        match parse_partition_dir(name) {
            Some((class, month)) => dirs.push(PartitionDir {
                class,
                month,
                path: entry.path(),
            }),
            None => debug!("source: ignoring directory {}", name),
        }
    }

    dirs.sort_by(|a, b| (a.class, &a.month, &a.path).cmp(&(b.class, &b.month, &b.path)));
    Ok(dirs)
}

/// Keep directories whose month is listed (all when `months` is empty).
pub fn filter_months(dirs: Vec<PartitionDir>, months: &[String]) -> Vec<PartitionDir> {
    if months.is_empty() {
        return dirs;
    }
    dirs.into_iter()
        .filter(|dir| months.contains(&dir.month))
        .collect()
}

/// Keep only the newest `n` months of each class.
pub fn limit_recent_months(dirs: Vec<PartitionDir>, n: usize) -> Vec<PartitionDir> {
    let mut months_by_class: BTreeMap<PartitionClass, Vec<String>> = BTreeMap::new();
    for dir in &dirs {
        let months = months_by_class.entry(dir.class).or_default();
        if !months.contains(&dir.month) {
            months.push(dir.month.clone());
        }
    }

    for months in months_by_class.values_mut() {
        months.sort();
        let skip = months.len().saturating_sub(n);
        months.drain(..skip);
    }

    dirs.into_iter()
        .filter(|dir| {
            months_by_class
                .get(&dir.class)
                .is_some_and(|months| months.contains(&dir.month))
        })
        .collect()
}

/// Drop month directories that cannot hold data inside `window`.
pub fn filter_months_by_window(dirs: Vec<PartitionDir>, window: &TimeWindow) -> Vec<PartitionDir> {
    if window.is_open() {
        return dirs;
    }
    dirs.into_iter()
        .filter(|dir| match month_bounds(&dir.month) {
            Some((first, last)) => {
                window.start.is_none_or(|start| last >= start)
                    && window.end.is_none_or(|end| first <= end)
            }
            None => true,
        })
        .collect()
}

/// First and last instant of a `YYYY-MM` month.
fn month_bounds(month: &str) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let first = NaiveDate::parse_from_str(&format!("{}-01", month), "%Y-%m-%d").ok()?;
    let next = if first.month() == 12 {
        NaiveDate::from_ymd_opt(first.year() + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(first.year(), first.month() + 1, 1)?
    };
    let start = first.and_hms_opt(0, 0, 0)?.and_utc();
    let end = next.and_hms_opt(0, 0, 0)?.and_utc() - chrono::Duration::milliseconds(1);
    Some((start, end))
}

/// `*.json` files below `dir`, sorted by path.
fn collect_json_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                pending.push(path);
            } else if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

pub fn fingerprint(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn unit_id(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Scan the given month directories into partitions, fingerprinting every file in
/// parallel on a rayon pool of `threads` threads.
pub fn scan_partitions(
    root: &Path,
    dirs: &[PartitionDir],
    threads: usize,
) -> Result<Vec<Partition>, ImportError> {
    let mut grouped: BTreeMap<(PartitionClass, String), Partition> = BTreeMap::new();
    let mut files: Vec<(PartitionClass, String, PathBuf)> = Vec::new();

    for dir in dirs {
        let found = collect_json_files(&dir.path).map_err(|source| ImportError::Scan {
            path: dir.path.clone(),
            source,
        })?;
        debug!("source: {} files in {}", found.len(), dir.path.display());
        files.extend(
            found
                .into_iter()
                .map(|path| (dir.class, dir.month.clone(), path)),
        );
        grouped
            .entry((dir.class, dir.month.clone()))
            .or_insert_with(|| Partition {
                class: dir.class,
                month: dir.month.clone(),
                key: partition_key(dir.class, &dir.month),
                dirs: Vec::new(),
                units: Vec::new(),
            })
            .dirs
            .push(dir.path.clone());
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .build()
        .map_err(|err| ImportError::Scan {
            path: root.to_path_buf(),
            source: io::Error::other(err),
        })?;

    let unreadable = AtomicUsize::new(0);
    let units: Vec<Unit> = pool.install(|| {
        files
            .par_iter()
            .map(|(class, month, path)| {
                let (fingerprint, size, data_timestamp) = match std::fs::read(path) {
                    Ok(bytes) => (
                        fingerprint(&bytes),
                        bytes.len() as u64,
                        Document::from_slice(&bytes)
                            .ok()
                            .and_then(|doc| doc.data_timestamp()),
                    ),
                    Err(err) => {
                        unreadable.fetch_add(1, Ordering::Relaxed);
                        warn!("source: cannot read {} during scan: {}", path.display(), err);
                        (String::new(), 0, None)
                    }
                };
                Unit {
                    id: unit_id(root, path),
                    path: path.clone(),
                    class: *class,
                    month: month.clone(),
                    partition_key: partition_key(*class, month),
                    fingerprint,
                    size,
                    data_timestamp,
                }
            })
            .collect()
    });

    for unit in units {
        if let Some(partition) = grouped.get_mut(&(unit.class, unit.month.clone())) {
            partition.units.push(unit);
        }
    }

    let partitions: Vec<Partition> = grouped.into_values().collect();
    info!(
        "source: scanned {} units in {} partitions ({} unreadable)",
        partitions.iter().map(|p| p.units.len()).sum::<usize>(),
        partitions.len(),
        unreadable.load(Ordering::Relaxed)
    );
    Ok(partitions)
}

/// Drop units whose data timestamp falls outside `window`. Units without one are kept.
pub fn filter_units_by_window(units: Vec<Unit>, window: &TimeWindow) -> Vec<Unit> {
    if window.is_open() {
        return units;
    }
    units
        .into_iter()
        .filter(|unit| window.contains(unit.data_timestamp))
        .collect()
}

/// Reads one unit's document at processing time.
pub trait SourceReader: Send + Sync + 'static {
    /// Returns the parsed document and the fingerprint of the bytes actually read.
    fn read(&self, unit: &Unit) -> Result<(Document, String), SourceError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FsSourceReader;

impl SourceReader for FsSourceReader {
    fn read(&self, unit: &Unit) -> Result<(Document, String), SourceError> {
        let bytes = std::fs::read(&unit.path).map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => SourceError::NotFound(unit.path.clone()),
            _ => SourceError::Io {
                path: unit.path.clone(),
                source,
            },
        })?;

        let actual = fingerprint(&bytes);
        if !unit.fingerprint.is_empty() && actual != unit.fingerprint {
            return Err(SourceError::FingerprintMismatch {
                path: unit.path.clone(),
                expected: unit.fingerprint.clone(),
                actual,
            });
        }

        let document = Document::from_slice(&bytes).map_err(|source| SourceError::Malformed {
            path: unit.path.clone(),
            source,
        })?;
        Ok((document, actual))
    }
}
