//! Resumable import pipeline.
//!
//! # Architecture Overview
//!
//! - **`source`**: Discovers month directories under the data root, scans their JSON files
//!   into units (fingerprinted in parallel with rayon) and reads a unit's document at
//!   processing time.
//!
//! - **`batch`**: Splits a partition's units into sequential batches of at most
//!   `workers × batch_size` units.
//!
//! - **`worker`**: Processes one batch. Units are read, looked up and merged concurrently;
//!   the batch is committed with one bulk upsert and every outcome is tracked.
//!
//! - **`orchestrator`**: The run state machine. Walks all regular partitions (ascending
//!   month) before all super partitions, honours the stop signal between batches and
//!   trips the circuit breaker on repeated batch failures.
//!
//! - **`stats`**: Counters and the end-of-run summary.
//!
//! ## Data Flow
//!
//! 1. **Init**: validate the job, ping the store
//! 2. **Discovery**: month directories → partitions → units (blocking pool + rayon);
//!    `rebuild` then purges tracking for exactly the discovered partitions
//! 3. **Filtering**: time window, then units the tracker already reports as done
//! 4. **Batches**: worker pool per batch, one bulk write, outcomes recorded
//! 5. **Finalize**: aggregate counters, close the tracker
//!
//! ## Consistency
//!
//! There is no transaction spanning the document store and the tracker. The store write
//! happens first; if the tracker write is lost the unit is simply processed again on the
//! next run, and merging an already merged document yields the same document.

pub mod batch;
pub mod orchestrator;
pub mod source;
pub mod stats;
pub mod worker;

pub use batch::BatchPlanner;
pub use orchestrator::{ImportOrchestrator, RunState, CIRCUIT_BREAKER_THRESHOLD};
pub use source::{FsSourceReader, Partition, SourceReader, Unit};
pub use stats::{BatchReport, ImportStats, PartitionSummary, RunOutcome, RunSummary, EXIT_CANCELLED};
pub use worker::{ImportWorkerPool, WorkerSettings};
