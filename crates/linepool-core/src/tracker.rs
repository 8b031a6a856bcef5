//! Run tracking.
//!
//! The tracker is the in-memory ledger of node and flow run records for one
//! executor (or one monitor thread). Every record moves through a single
//! transition:
//!
//! ```text
//!            start_*              end_run / cancel_node_runs
//!   (none) ──────────> Running ─────────────────────────────> Completed
//!     │                                                     ├> Failed
//!     │ bypass_node_run                                     └> Canceled
//!     └──────────────────> Bypassed
//! ```
//!
//! Terminal records are never mutated again. Storage failures are logged and
//! swallowed so that bookkeeping can never fail a line.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::contracts::{
    ErrorInfo, FlowRunInfo, RunInfo, Status, SystemMetrics, TOKEN_METRICS, seconds_between,
};
use crate::error::{Error, Result};
use crate::storage::{DummyRunStorage, RunStorage, StatusSummary};

/// Taxonomy name of the error attached to canceled runs.
pub const CANCELED_ERROR_TYPE: &str = "ToolCanceledError";

/// Why a run did not complete.
#[derive(Debug, Clone, PartialEq)]
pub enum RunError {
    /// Explicit cancellation; the run ends `Canceled`.
    Canceled(String),
    /// Any other failure; the run ends `Failed`.
    Failed(ErrorInfo),
}

impl RunError {
    pub fn failed(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        RunError::Failed(ErrorInfo::new(error_type, message))
    }

    fn into_parts(self) -> (Status, ErrorInfo) {
        match self {
            RunError::Canceled(message) => (
                Status::Canceled,
                ErrorInfo::new(CANCELED_ERROR_TYPE, message),
            ),
            RunError::Failed(info) => (Status::Failed, info),
        }
    }
}

/// A record returned by [`RunTracker::end_run`] or [`RunTracker::get_run`].
#[derive(Debug, Clone, PartialEq)]
pub enum TrackedRun {
    Node(RunInfo),
    Flow(FlowRunInfo),
}

impl TrackedRun {
    pub fn status(&self) -> Status {
        match self {
            TrackedRun::Node(info) => info.status,
            TrackedRun::Flow(info) => info.status,
        }
    }

    pub fn into_node(self) -> Option<RunInfo> {
        match self {
            TrackedRun::Node(info) => Some(info),
            TrackedRun::Flow(_) => None,
        }
    }

    pub fn into_flow(self) -> Option<FlowRunInfo> {
        match self {
            TrackedRun::Flow(info) => Some(info),
            TrackedRun::Node(_) => None,
        }
    }
}

#[derive(Default)]
struct Ledger {
    node_runs: FxHashMap<String, RunInfo>,
    node_order: Vec<String>,
    flow_runs: FxHashMap<String, FlowRunInfo>,
    flow_order: Vec<String>,
}

impl Ledger {
    fn contains(&self, run_id: &str) -> bool {
        self.node_runs.contains_key(run_id) || self.flow_runs.contains_key(run_id)
    }

    fn insert_node(&mut self, info: RunInfo) {
        if !self.node_runs.contains_key(&info.run_id) {
            self.node_order.push(info.run_id.clone());
        }
        self.node_runs.insert(info.run_id.clone(), info);
    }

    fn insert_flow(&mut self, info: FlowRunInfo) {
        if !self.flow_runs.contains_key(&info.run_id) {
            self.flow_order.push(info.run_id.clone());
        }
        self.flow_runs.insert(info.run_id.clone(), info);
    }

    fn nodes(&self) -> impl Iterator<Item = &RunInfo> {
        self.node_order.iter().filter_map(|id| self.node_runs.get(id))
    }

    fn flows(&self) -> impl Iterator<Item = &FlowRunInfo> {
        self.flow_order.iter().filter_map(|id| self.flow_runs.get(id))
    }
}

/// In-memory ledger of node and flow runs with a persistence sink.
pub struct RunTracker {
    ledger: Mutex<Ledger>,
    storage: Arc<dyn RunStorage>,
}

impl fmt::Debug for RunTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ledger = self.ledger.lock();
        f.debug_struct("RunTracker")
            .field("node_runs", &ledger.node_runs.len())
            .field("flow_runs", &ledger.flow_runs.len())
            .finish()
    }
}

impl RunTracker {
    pub fn new(storage: Arc<dyn RunStorage>) -> Self {
        Self {
            ledger: Mutex::new(Ledger::default()),
            storage,
        }
    }

    /// Tracker that persists nothing.
    pub fn dummy() -> Self {
        Self::new(Arc::new(DummyRunStorage))
    }

    pub fn storage(&self) -> &Arc<dyn RunStorage> {
        &self.storage
    }

    /// Create a Running flow run, register it and persist it.
    pub fn start_flow_run(
        &self,
        flow_id: &str,
        root_run_id: &str,
        run_id: &str,
        parent_run_id: &str,
        inputs: Option<Map<String, Value>>,
        index: Option<usize>,
    ) -> Result<FlowRunInfo> {
        let mut info = FlowRunInfo::new(flow_id, root_run_id, run_id, parent_run_id, index);
        info.inputs = inputs;
        {
            let mut ledger = self.ledger.lock();
            if ledger.contains(run_id) {
                return Err(Error::DuplicateRun(run_id.to_string()));
            }
            ledger.insert_flow(info.clone());
        }
        self.persist_flow_run(&info);
        Ok(info)
    }

    /// Create a Running node run and register it.
    pub fn start_node_run(
        &self,
        node: &str,
        flow_run_id: &str,
        parent_run_id: &str,
        run_id: &str,
        index: Option<usize>,
    ) -> Result<RunInfo> {
        let info = RunInfo::new(node, flow_run_id, run_id, parent_run_id, index);
        let mut ledger = self.ledger.lock();
        if ledger.contains(run_id) {
            return Err(Error::DuplicateRun(run_id.to_string()));
        }
        ledger.insert_node(info.clone());
        Ok(info)
    }

    /// Create an already-terminal Bypassed node run and register it.
    pub fn bypass_node_run(
        &self,
        node: &str,
        flow_run_id: &str,
        parent_run_id: &str,
        run_id: &str,
        index: Option<usize>,
    ) -> Result<RunInfo> {
        let mut info = RunInfo::new(node, flow_run_id, run_id, parent_run_id, index);
        info.status = Status::Bypassed;
        info.end_time = Some(info.start_time);
        let mut ledger = self.ledger.lock();
        if ledger.contains(run_id) {
            return Err(Error::DuplicateRun(run_id.to_string()));
        }
        ledger.insert_node(info.clone());
        Ok(info)
    }

    /// Import a node run produced elsewhere.
    ///
    /// A terminal record already present is kept.
    pub fn register_node_run(&self, info: RunInfo) {
        let mut ledger = self.ledger.lock();
        if let Some(existing) = ledger.node_runs.get(&info.run_id)
            && existing.status.is_terminal()
        {
            return;
        }
        ledger.insert_node(info);
    }

    /// Import a flow run produced elsewhere.
    ///
    /// A terminal record already present is kept.
    pub fn register_flow_run(&self, info: FlowRunInfo) {
        let mut ledger = self.ledger.lock();
        if let Some(existing) = ledger.flow_runs.get(&info.run_id)
            && existing.status.is_terminal()
        {
            return;
        }
        ledger.insert_flow(info);
    }

    /// Record the resolved inputs of a run.
    pub fn set_inputs(&self, run_id: &str, inputs: Map<String, Value>) -> Result<()> {
        let mut ledger = self.ledger.lock();
        if let Some(info) = ledger.node_runs.get_mut(run_id) {
            let node = info.node.clone();
            info.inputs = Some(inputs_to_json(inputs, &node));
            return Ok(());
        }
        if let Some(info) = ledger.flow_runs.get_mut(run_id) {
            info.inputs = Some(inputs);
            return Ok(());
        }
        Err(Error::RunNotFound(run_id.to_string()))
    }

    /// Tag a Running node run as served from the cache.
    pub fn set_cache_provenance(
        &self,
        run_id: &str,
        cached_run_id: &str,
        cached_flow_run_id: &str,
    ) -> Result<()> {
        let mut ledger = self.ledger.lock();
        let info = ledger
            .node_runs
            .get_mut(run_id)
            .ok_or_else(|| Error::RunNotFound(run_id.to_string()))?;
        info.cached_run_id = Some(cached_run_id.to_string());
        info.cached_flow_run_id = Some(cached_flow_run_id.to_string());
        Ok(())
    }

    /// Move a Running record to its terminal status.
    ///
    /// Ending a record that is already terminal returns it untouched. For
    /// node runs the token counters found in `traces` are summed into the
    /// system metrics; for flow runs the child node metrics are aggregated
    /// and the node traces become children of a single flow trace.
    pub fn end_run(
        &self,
        run_id: &str,
        result: std::result::Result<Option<Value>, RunError>,
        traces: Option<Vec<Value>>,
    ) -> Result<TrackedRun> {
        let mut ledger = self.ledger.lock();

        if let Some(info) = ledger.node_runs.get_mut(run_id) {
            if info.status.is_terminal() {
                tracing::debug!(run_id, status = %info.status, "Run already ended");
                return Ok(TrackedRun::Node(info.clone()));
            }
            info.api_calls = traces.unwrap_or_default();
            let token_metrics = token_metrics_from_traces(&info.api_calls);
            info.system_metrics.extend(token_metrics);
            apply_outcome(
                &mut info.status,
                &mut info.output,
                &mut info.error,
                result,
            );
            let end = chrono::Utc::now();
            info.end_time = Some(end);
            info.system_metrics
                .insert("duration".to_string(), seconds_between(info.start_time, end));
            return Ok(TrackedRun::Node(info.clone()));
        }

        let Some(info) = ledger.flow_runs.get(run_id) else {
            return Err(Error::RunNotFound(run_id.to_string()));
        };
        if info.status.is_terminal() {
            tracing::debug!(run_id, status = %info.status, "Run already ended");
            return Ok(TrackedRun::Flow(info.clone()));
        }

        let children: Vec<RunInfo> = ledger
            .nodes()
            .filter(|n| n.parent_run_id == run_id)
            .cloned()
            .collect();
        let child_metrics = collect_metrics(&children, &TOKEN_METRICS);
        let child_traces: Vec<Value> = children
            .iter()
            .flat_map(|n| n.api_calls.iter().cloned())
            .collect();

        let Some(info) = ledger.flow_runs.get_mut(run_id) else {
            return Err(Error::RunNotFound(run_id.to_string()));
        };
        apply_outcome(&mut info.status, &mut info.output, &mut info.error, result);
        let end = chrono::Utc::now();
        info.end_time = Some(end);
        info.system_metrics
            .insert("duration".to_string(), seconds_between(info.start_time, end));
        info.system_metrics.extend(child_metrics);
        match traces {
            Some(traces) if !traces.is_empty() => info.api_calls = traces,
            _ => {
                info.api_calls = vec![json!({
                    "name": "flow",
                    "node_name": "flow",
                    "type": "Flow",
                    "start_time": info.start_time.timestamp_micros() as f64 / 1e6,
                    "end_time": end.timestamp_micros() as f64 / 1e6,
                    "children": child_traces,
                    "system_metrics": info.system_metrics,
                    "inputs": info.inputs,
                    "output": info.output,
                    "error": info.error,
                })];
            }
        }
        Ok(TrackedRun::Flow(info.clone()))
    }

    /// Cancel every still-Running node run of a flow run and persist it.
    ///
    /// `flow_run_id` of `None` cancels all running node runs.
    pub fn cancel_node_runs(&self, flow_run_id: Option<&str>, reason: &str) -> Vec<RunInfo> {
        let reason = reason.trim_end_matches('.');
        let message = format!("Tool execution is canceled because: {reason}.");
        let running: Vec<String> = self
            .collect_node_runs(flow_run_id)
            .into_iter()
            .filter(|n| n.status == Status::Running)
            .map(|n| n.run_id)
            .collect();

        let mut canceled = Vec::with_capacity(running.len());
        for run_id in running {
            match self.end_run(&run_id, Err(RunError::Canceled(message.clone())), None) {
                Ok(TrackedRun::Node(info)) => {
                    self.persist_node_run(&info);
                    canceled.push(info);
                }
                Ok(TrackedRun::Flow(_)) => {}
                Err(e) => tracing::warn!(run_id = %run_id, error = %e, "Failed to cancel node run"),
            }
        }
        canceled
    }

    pub fn get_run(&self, run_id: &str) -> Option<TrackedRun> {
        let ledger = self.ledger.lock();
        if let Some(info) = ledger.node_runs.get(run_id) {
            return Some(TrackedRun::Node(info.clone()));
        }
        ledger
            .flow_runs
            .get(run_id)
            .map(|info| TrackedRun::Flow(info.clone()))
    }

    pub fn node_run_list(&self) -> Vec<RunInfo> {
        self.ledger.lock().nodes().cloned().collect()
    }

    pub fn flow_run_list(&self) -> Vec<FlowRunInfo> {
        self.ledger.lock().flows().cloned().collect()
    }

    /// Node runs whose `flow_run_id` matches, or all of them.
    pub fn collect_node_runs(&self, flow_run_id: Option<&str>) -> Vec<RunInfo> {
        self.ledger
            .lock()
            .nodes()
            .filter(|n| flow_run_id.is_none_or(|id| n.flow_run_id == id))
            .cloned()
            .collect()
    }

    /// Node runs directly under a line run.
    pub fn collect_child_node_runs(&self, parent_run_id: &str) -> Vec<RunInfo> {
        self.ledger
            .lock()
            .nodes()
            .filter(|n| n.parent_run_id == parent_run_id)
            .cloned()
            .collect()
    }

    /// Per-node and per-line status counters of a batch run.
    ///
    /// Node runs of the batch count toward `nodes.<node>.<status>` for the
    /// Completed, Bypassed and Failed statuses. Aggregation node runs (no
    /// line index) report `nodes.<node>.completed` as 1 or 0. Line counters
    /// consider the flow runs rooted at `run_id`, excluding the root itself.
    pub fn get_status_summary(&self, run_id: &str) -> StatusSummary {
        let mut summary = StatusSummary::new();
        for info in self.collect_node_runs(Some(run_id)) {
            match info.index {
                Some(_) => {
                    if matches!(
                        info.status,
                        Status::Completed | Status::Bypassed | Status::Failed
                    ) {
                        let key = format!("nodes.{}.{}", info.node, info.status.as_key());
                        *summary.entry(key).or_insert(0) += 1;
                    }
                }
                None => {
                    let completed = u64::from(info.status == Status::Completed);
                    summary.insert(format!("nodes.{}.completed", info.node), completed);
                }
            }
        }

        let ledger = self.ledger.lock();
        let lines: Vec<&FlowRunInfo> = ledger
            .flows()
            .filter(|f| f.root_run_id == run_id && f.run_id != run_id)
            .collect();
        let completed = lines
            .iter()
            .filter(|f| f.status == Status::Completed)
            .count() as u64;
        summary.insert("lines.completed".to_string(), completed);
        summary.insert("lines.failed".to_string(), lines.len() as u64 - completed);
        summary
    }

    pub fn persist_node_run(&self, info: &RunInfo) {
        if let Err(e) = self.storage.persist_node_run(info) {
            tracing::warn!(run_id = %info.run_id, error = %e, "Failed to persist node run");
        }
    }

    pub fn persist_flow_run(&self, info: &FlowRunInfo) {
        if let Err(e) = self.storage.persist_flow_run(info) {
            tracing::warn!(run_id = %info.run_id, error = %e, "Failed to persist flow run");
        }
    }

    pub fn persist_status_summary(&self, summary: &StatusSummary, run_id: &str) {
        if let Err(e) = self.storage.persist_status_summary(summary, run_id) {
            tracing::warn!(run_id = %run_id, error = %e, "Failed to persist status summary");
        }
    }
}

/// Sum the given metrics over a set of runs.
pub fn collect_metrics(run_infos: &[RunInfo], metrics: &[&str]) -> SystemMetrics {
    let mut total = SystemMetrics::new();
    if metrics.is_empty() {
        return total;
    }
    for info in run_infos {
        if info.system_metrics.is_empty() {
            continue;
        }
        for metric in metrics {
            let value = info.system_metrics.get(*metric).copied().unwrap_or(0.0);
            *total.entry((*metric).to_string()).or_insert(0.0) += value;
        }
    }
    total
}

/// Convert a value to JSON, degrading to its `Debug` text on failure.
pub fn ensure_serializable<T>(value: &T, warning: &str) -> Value
where
    T: Serialize + fmt::Debug + ?Sized,
{
    match serde_json::to_value(value) {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!(error = %e, "{warning}");
            Value::String(format!("{value:?}"))
        }
    }
}

fn inputs_to_json(inputs: Map<String, Value>, node: &str) -> Map<String, Value> {
    inputs
        .into_iter()
        .map(|(k, v)| {
            let warning = format!("Input '{k}' of {node} is not json serializable, use str to store it.");
            let v = ensure_serializable(&v, &warning);
            (k, v)
        })
        .collect()
}

fn apply_outcome(
    status: &mut Status,
    output: &mut Option<Value>,
    error: &mut Option<ErrorInfo>,
    result: std::result::Result<Option<Value>, RunError>,
) {
    match result {
        Ok(value) => {
            if value.is_some() {
                *output = value;
            }
            *status = Status::Completed;
        }
        Err(err) => {
            let (next, info) = err.into_parts();
            *status = next;
            *error = Some(info);
        }
    }
}

/// Sum `usage.<metric>` over the traces and their children.
fn token_metrics_from_traces(traces: &[Value]) -> SystemMetrics {
    fn visit(trace: &Value, total: &mut SystemMetrics) {
        if let Some(usage) = trace.get("usage").and_then(Value::as_object) {
            for metric in TOKEN_METRICS {
                if let Some(n) = usage.get(metric).and_then(Value::as_f64) {
                    *total.entry(metric.to_string()).or_insert(0.0) += n;
                }
            }
        }
        if let Some(children) = trace.get("children").and_then(Value::as_array) {
            for child in children {
                visit(child, total);
            }
        }
    }

    let mut total = SystemMetrics::new();
    for trace in traces {
        visit(trace, &mut total);
    }
    total
}
