//! Node and flow run records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::Status;

/// Metric name to value, e.g. `duration` or `total_tokens`.
pub type SystemMetrics = BTreeMap<String, f64>;

/// Token counters summed from traces and aggregated into flow runs.
pub const TOKEN_METRICS: [&str; 3] = ["prompt_tokens", "completion_tokens", "total_tokens"];

/// Error attached to a failed or canceled run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Taxonomy name, e.g. `ProcessCrashError`.
    pub error_type: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
        }
    }
}

/// Record of one node invocation within a line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub node: String,
    pub flow_run_id: String,
    pub run_id: String,
    pub parent_run_id: String,
    pub status: Status,
    pub inputs: Option<Map<String, Value>>,
    pub output: Option<Value>,
    pub error: Option<ErrorInfo>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Line index; `None` for aggregation nodes.
    pub index: Option<usize>,
    /// Trace calls recorded while the node ran.
    #[serde(default)]
    pub api_calls: Vec<Value>,
    pub cached_run_id: Option<String>,
    pub cached_flow_run_id: Option<String>,
    #[serde(default)]
    pub system_metrics: SystemMetrics,
}

impl RunInfo {
    pub fn new(
        node: impl Into<String>,
        flow_run_id: impl Into<String>,
        run_id: impl Into<String>,
        parent_run_id: impl Into<String>,
        index: Option<usize>,
    ) -> Self {
        Self {
            node: node.into(),
            flow_run_id: flow_run_id.into(),
            run_id: run_id.into(),
            parent_run_id: parent_run_id.into(),
            status: Status::Running,
            inputs: None,
            output: None,
            error: None,
            start_time: Utc::now(),
            end_time: None,
            index,
            api_calls: Vec::new(),
            cached_run_id: None,
            cached_flow_run_id: None,
            system_metrics: SystemMetrics::new(),
        }
    }

    /// Whether the result came from the node cache.
    pub fn is_cached(&self) -> bool {
        self.cached_run_id.as_deref().is_some_and(|id| !id.is_empty())
    }
}

/// Record of one line (or the aggregation step) of a batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRunInfo {
    pub run_id: String,
    pub status: Status,
    pub error: Option<ErrorInfo>,
    pub inputs: Option<Map<String, Value>>,
    pub output: Option<Value>,
    #[serde(default)]
    pub metrics: Map<String, Value>,
    pub parent_run_id: String,
    pub root_run_id: String,
    pub source_run_id: Option<String>,
    pub flow_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub index: Option<usize>,
    #[serde(default)]
    pub api_calls: Vec<Value>,
    #[serde(default)]
    pub system_metrics: SystemMetrics,
}

impl FlowRunInfo {
    pub fn new(
        flow_id: impl Into<String>,
        root_run_id: impl Into<String>,
        run_id: impl Into<String>,
        parent_run_id: impl Into<String>,
        index: Option<usize>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            status: Status::Running,
            error: None,
            inputs: None,
            output: None,
            metrics: Map::new(),
            parent_run_id: parent_run_id.into(),
            root_run_id: root_run_id.into(),
            source_run_id: None,
            flow_id: flow_id.into(),
            start_time: Utc::now(),
            end_time: None,
            index,
            api_calls: Vec::new(),
            system_metrics: SystemMetrics::new(),
        }
    }

    /// Seconds between start and end, if ended.
    pub fn duration_secs(&self) -> Option<f64> {
        self.end_time.map(|end| seconds_between(self.start_time, end))
    }
}

/// Line run id derived from the batch run id and the line index.
pub fn line_run_id(run_id: &str, line_index: usize) -> String {
    format!("{run_id}_{line_index}")
}

pub(crate) fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let micros = (end - start).num_microseconds().unwrap_or(i64::MAX);
    micros as f64 / 1_000_000.0
}
