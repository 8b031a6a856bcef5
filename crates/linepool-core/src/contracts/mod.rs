//! Data model shared by the pool, the workers and the executor.

mod line_result;
mod run_info;
mod status;

pub use line_result::{AggregationResult, LineResult};
pub use run_info::{
    ErrorInfo, FlowRunInfo, RunInfo, SystemMetrics, TOKEN_METRICS, line_run_id,
};
pub(crate) use run_info::seconds_between;
pub use status::Status;
