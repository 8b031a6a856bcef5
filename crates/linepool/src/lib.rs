//! Process-isolated batch line execution.
//!
//! A [`LinePool`] runs the lines of a flow on N worker processes, each
//! supervised by a monitor thread:
//!
//! ```text
//!   LinePool::run ──> task queue ──> monitor 0 ──tcp──> worker 0
//!        ^                      └──> monitor 1 ──tcp──> worker 1
//!        |                                 |
//!        └──────── result table <──────────┘
//! ```
//!
//! A worker that crashes or exceeds its line timeout is replaced, and its
//! line is reported as a failed [`linepool_core::LineResult`]. The worker
//! side lives in [`worker`]; the `linepool-worker` binary wraps it.

pub mod config;
pub mod error;
pub mod ipc;
pub mod pool;
pub mod process;
pub mod worker;

pub use config::{PoolConfig, StartMethod};
pub use error::{LineError, PoolError, Result};
pub use ipc::ProcessInfo;
pub use pool::{LinePool, Task};
pub use worker::{ExecutorBuilder, ForwardingRunStorage, WorkerArgs};
