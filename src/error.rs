use std::path::PathBuf;
use thiserror::Error;

/// Problems with a single source document's content.
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("document root is not a JSON object")]
    NotAnObject,
    #[error("missing key field '{0}'")]
    MissingKey(String),
    #[error("validation failed: {0}")]
    Validation(String),
}

/// Errors raised while reading one source unit. Always unit-scoped: the unit is
/// recorded as failed and its siblings continue.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source not found: {0}")]
    NotFound(PathBuf),
    #[error("malformed source {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: DocumentError,
    },
    #[error("fingerprint mismatch for {path}: expected {expected}, read {actual}")]
    FingerprintMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Document store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// State tracker failures. Never fatal once the document store has committed.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("state database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("state migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("failed to prepare state directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown outcome '{0}' in state database")]
    UnknownOutcome(String),
}

/// Run-level errors surfaced by the orchestrator and the CLI.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
    #[error("document store unreachable: {0}")]
    StoreUnavailable(#[source] StoreError),
    #[error("document store error: {0}")]
    Store(#[from] StoreError),
    #[error("state tracker error: {0}")]
    Tracker(#[from] TrackerError),
    #[error("failed to scan sources under {path}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("circuit breaker open after {0} consecutive failed batches")]
    CircuitOpen(usize),
    #[error("run cancelled")]
    Cancelled,
}

impl ImportError {
    pub fn config(msg: impl Into<String>) -> Self {
        ImportError::ConfigInvalid(msg.into())
    }
}
