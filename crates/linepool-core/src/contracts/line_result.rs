//! Line and aggregation results.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{ErrorInfo, FlowRunInfo, RunInfo, Status, line_run_id};

/// Outcome of executing one line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineResult {
    /// Flow outputs; empty when the line did not complete.
    pub output: Map<String, Value>,
    /// Per aggregation node, the value this line contributes to it.
    #[serde(default)]
    pub aggregation_inputs: Map<String, Value>,
    pub run_info: FlowRunInfo,
    /// Node runs keyed by node name.
    #[serde(default)]
    pub node_run_infos: BTreeMap<String, RunInfo>,
}

impl LineResult {
    /// Failed result for a line that produced no result of its own.
    pub fn failed(
        flow_id: &str,
        run_id: &str,
        line_index: usize,
        inputs: Map<String, Value>,
        error: ErrorInfo,
    ) -> Self {
        let mut run_info = FlowRunInfo::new(
            flow_id,
            run_id,
            line_run_id(run_id, line_index),
            run_id,
            Some(line_index),
        );
        run_info.inputs = Some(inputs);
        run_info.status = Status::Failed;
        run_info.error = Some(error);
        run_info.end_time = Some(chrono::Utc::now());
        Self {
            output: Map::new(),
            aggregation_inputs: Map::new(),
            run_info,
            node_run_infos: BTreeMap::new(),
        }
    }

    pub fn line_index(&self) -> Option<usize> {
        self.run_info.index
    }

    pub fn status(&self) -> Status {
        self.run_info.status
    }

    /// Taxonomy name of the line error, if any.
    pub fn error_type(&self) -> Option<&str> {
        self.run_info.error.as_ref().map(|e| e.error_type.as_str())
    }
}

/// Outcome of the aggregation step run after all lines.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregationResult {
    pub output: Map<String, Value>,
    pub metrics: Map<String, Value>,
    pub node_run_infos: BTreeMap<String, RunInfo>,
}
