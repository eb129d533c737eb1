use alpha_importer::config::{ImportJob, ImportMode, PartitionClass};
use alpha_importer::document::parse_timestamp;
use alpha_importer::error::ImportError;
use alpha_importer::importer::{FsSourceReader, ImportOrchestrator};
use alpha_importer::merge::ArrayKeys;
use alpha_importer::retry::RetryPolicy;
use alpha_importer::state::StateTracker;
use alpha_importer::store::PgDocumentStore;
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(
    name = "alpha-importer",
    about = "Resumable deep-merge import of alpha documents",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import documents (the default when no subcommand is given).
    Run(RunArgs),
    /// Show tracked outcomes per scope.
    Status {
        /// Scope to report (`regular`, `super`, `regular/2024-03`). Defaults to both classes.
        #[arg(long)]
        scope: Vec<String>,
        /// State database path.
        #[arg(long)]
        state_db: Option<PathBuf>,
    },
    /// Delete tracked outcomes so the scope is processed again.
    Purge {
        /// Scope to purge (`regular`, `super`, `regular/2024-03`).
        #[arg(long, required = true)]
        scope: Vec<String>,
        #[arg(long)]
        state_db: Option<PathBuf>,
    },
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Import mode: incremental, overwrite, rebuild, time_range, smart_merge.
    #[arg(long)]
    mode: Option<ImportMode>,

    /// Concurrent units per batch.
    #[arg(long)]
    workers: Option<usize>,

    /// Units per worker per batch.
    #[arg(long)]
    batch_size: Option<usize>,

    /// Directory holding the month directories.
    #[arg(long)]
    data_root: Option<PathBuf>,

    #[arg(long)]
    state_db: Option<PathBuf>,

    /// Full store connection URL. Overrides host/port/database/user/password.
    #[arg(long)]
    database_url: Option<String>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    database: Option<String>,

    #[arg(long)]
    user: Option<String>,

    #[arg(long)]
    password: Option<String>,

    /// Restrict to a partition class (repeatable).
    #[arg(long = "class")]
    classes: Vec<PartitionClass>,

    /// Restrict to a `YYYY-MM` month (repeatable).
    #[arg(long = "month")]
    months: Vec<String>,

    /// Only the newest N months of each class.
    #[arg(long)]
    recent_months: Option<usize>,

    #[arg(long)]
    key_field: Option<String>,

    /// Per-path array merge keys, e.g. `checks=name,is.pyramids=name`.
    #[arg(long)]
    array_keys: Option<String>,

    /// Require id, type and author on every document.
    #[arg(long)]
    validate: bool,

    #[arg(long)]
    time_range_hours: Option<i64>,

    #[arg(long)]
    buffer_days: Option<i64>,

    /// Lower bound on document timestamps.
    #[arg(long, value_parser = parse_bound)]
    since: Option<DateTime<Utc>>,

    /// Upper bound on document timestamps.
    #[arg(long, value_parser = parse_bound)]
    until: Option<DateTime<Utc>>,
}

fn parse_bound(raw: &str) -> Result<DateTime<Utc>, String> {
    parse_timestamp(raw).ok_or_else(|| format!("cannot parse '{}' as a timestamp", raw))
}

impl RunArgs {
    fn apply(self, job: &mut ImportJob) -> Result<(), ImportError> {
        if let Some(mode) = self.mode {
            job.mode = mode;
        }
        if let Some(workers) = self.workers {
            job.workers = workers;
        }
        if let Some(batch_size) = self.batch_size {
            job.batch_size = batch_size;
        }
        if let Some(data_root) = self.data_root {
            job.data_root = data_root;
        }
        if let Some(state_db) = self.state_db {
            job.state_db = state_db;
        }
        if let Some(url) = self.database_url {
            job.store.url = Some(url);
        }
        if let Some(host) = self.host {
            job.store.host = host;
        }
        if let Some(port) = self.port {
            job.store.port = port;
        }
        if let Some(database) = self.database {
            job.store.database = database;
        }
        if let Some(user) = self.user {
            job.store.user = user;
        }
        if let Some(password) = self.password {
            job.store.password = password;
        }
        if !self.classes.is_empty() {
            job.classes = self.classes;
        }
        if !self.months.is_empty() {
            job.months = self.months;
        }
        if self.recent_months.is_some() {
            job.recent_months = self.recent_months;
        }
        if let Some(key_field) = self.key_field {
            job.key_field = key_field;
        }
        if let Some(spec) = self.array_keys {
            job.array_keys = ArrayKeys::parse(&spec).map_err(ImportError::config)?;
        }
        if self.validate {
            job.validate = true;
        }
        if let Some(hours) = self.time_range_hours {
            job.time_range_hours = hours;
        }
        if let Some(days) = self.buffer_days {
            job.time_range_buffer_days = days;
        }
        job.since = self.since.or(job.since);
        job.until = self.until.or(job.until);
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    alpha_importer::init_logger();
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Command::Run(args)) => run(args).await,
        None => run(cli.run).await,
        Some(Command::Status { scope, state_db }) => status(scope, state_db).await,
        Some(Command::Purge { scope, state_db }) => purge(scope, state_db).await,
    };

    let code = match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {}", err);
            1
        }
    };
    std::process::exit(code);
}

async fn run(args: RunArgs) -> Result<i32, ImportError> {
    let mut job = ImportJob::from_env();
    args.apply(&mut job)?;
    job.validate()?;

    let tracker = StateTracker::open(&job.state_db)
        .await?
        .with_retry(RetryPolicy::new(job.tracker_retries, job.retry_backoff_ms));
    let store = PgDocumentStore::connect(&job.store)
        .await
        .map_err(ImportError::StoreUnavailable)?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("interrupt received, stopping after the current batch");
            interrupt.cancel();
        }
    });

    let mut orchestrator =
        ImportOrchestrator::new(job, Arc::new(store), Arc::new(FsSourceReader), tracker)
            .with_cancellation(cancel);
    let summary = orchestrator.run().await;

    print!("{}", summary.render());
    Ok(summary.exit_code())
}

fn state_db_path(state_db: Option<PathBuf>) -> PathBuf {
    state_db.unwrap_or_else(|| ImportJob::from_env().state_db)
}

async fn status(scopes: Vec<String>, state_db: Option<PathBuf>) -> Result<i32, ImportError> {
    let tracker = StateTracker::open(&state_db_path(state_db)).await?;
    let scopes = if scopes.is_empty() {
        PartitionClass::ORDERED
            .iter()
            .map(|class| class.as_str().to_string())
            .collect()
    } else {
        scopes
    };

    for scope in &scopes {
        let stats = tracker.stats(Some(scope)).await?;
        println!(
            "{:<18} succeeded={} failed={} latest={}",
            scope,
            stats.succeeded,
            stats.failed,
            stats
                .latest_data_timestamp
                .map(|ts| ts.to_rfc3339())
                .unwrap_or_else(|| "-".to_string())
        );
    }
    tracker.close().await;
    Ok(0)
}

async fn purge(scopes: Vec<String>, state_db: Option<PathBuf>) -> Result<i32, ImportError> {
    let tracker = StateTracker::open(&state_db_path(state_db)).await?;
    for scope in &scopes {
        let purged = tracker.purge_scope(scope).await?;
        println!("{:<18} purged {} records", scope, purged);
    }
    tracker.close().await;
    Ok(0)
}
