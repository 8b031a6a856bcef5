//! The executor interface consumed by worker processes.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::contracts::{AggregationResult, LineResult};

/// Recipe for constructing an executor inside a worker process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowCreateArgs {
    /// Flow name or definition path, interpreted by the executor builder.
    pub flow: String,
    pub working_dir: PathBuf,
    #[serde(default)]
    pub connections: Map<String, Value>,
    #[serde(default)]
    pub init_kwargs: Map<String, Value>,
    /// Whether line errors should abort instead of producing failed results.
    #[serde(default)]
    pub raise_ex: bool,
    /// Per-line timeout the executor enforces between nodes.
    pub line_timeout_ms: Option<u64>,
    /// Directory of a shared node cache, if caching is enabled.
    pub cache_dir: Option<PathBuf>,
}

impl FlowCreateArgs {
    pub fn new(flow: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            flow: flow.into(),
            working_dir: working_dir.into(),
            ..Default::default()
        }
    }
}

/// Executes a flow one line at a time.
///
/// Implementations never return errors for line-level failures; those are
/// folded into a failed [`LineResult`].
pub trait FlowExecutor: Send {
    fn flow_id(&self) -> &str;

    fn exec_line(
        &self,
        inputs: Map<String, Value>,
        run_id: &str,
        index: usize,
        timeout: Option<Duration>,
    ) -> LineResult;

    /// Run the aggregation nodes over the whole batch.
    ///
    /// `aggregation_inputs` maps each referenced node to the array of its
    /// per-line outputs, in line order.
    fn exec_aggregation(
        &self,
        batch_inputs: &[Map<String, Value>],
        aggregation_inputs: &Map<String, Value>,
        run_id: &str,
    ) -> AggregationResult;

    fn has_aggregation_node(&self) -> bool;
}
