//! Run records, run tracking, node caching and the executor interface.
//!
//! This crate holds everything that runs inside a worker process:
//! - `contracts`: line results and node/flow run records
//! - `tracker`: the per-executor run ledger
//! - `cache`: content-hash caching around node invocations
//! - `storage`: the persistence sink for run records
//! - `flow`: the executor trait and a sequential reference executor

pub mod cache;
pub mod contracts;
pub mod error;
pub mod flow;
pub mod storage;
pub mod tracker;

pub use cache::{CacheManager, CacheStore, FileCacheStore, MemoryCacheStore};
pub use contracts::{
    AggregationResult, ErrorInfo, FlowRunInfo, LineResult, RunInfo, Status, line_run_id,
};
pub use error::{Error, Result};
pub use flow::{FlowCreateArgs, FlowExecutor, LinearFlow};
pub use storage::{DummyRunStorage, MemoryRunStorage, RunStorage, StatusSummary};
pub use tracker::{RunError, RunTracker, TrackedRun};
