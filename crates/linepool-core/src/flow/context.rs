//! Per-line execution context.
//!
//! A [`FlowExecutionContext`] is created for each line (or for the
//! aggregation step) and passed explicitly to every node invocation. It owns
//! the run ids of the line and routes each invocation through the run
//! tracker and, for cacheable nodes, the cache manager.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::{Map, Value, json};

use crate::cache::{CacheLookup, CacheManager};
use crate::contracts::{ErrorInfo, RunInfo};
use crate::tracker::{RunError, RunTracker};

use super::tool::{ToolDescriptor, ToolError, ToolOutput};

#[derive(Clone)]
pub struct FlowExecutionContext {
    flow_id: String,
    /// Batch run id; recorded as `flow_run_id` on node runs.
    run_id: String,
    /// Parent of the node runs: the line run, or the batch run for aggregation.
    parent_run_id: String,
    index: Option<usize>,
    tracker: Arc<RunTracker>,
    cache: Option<CacheManager>,
}

impl FlowExecutionContext {
    pub fn new(
        flow_id: impl Into<String>,
        run_id: impl Into<String>,
        parent_run_id: impl Into<String>,
        index: Option<usize>,
        tracker: Arc<RunTracker>,
        cache: Option<CacheManager>,
    ) -> Self {
        Self {
            flow_id: flow_id.into(),
            run_id: run_id.into(),
            parent_run_id: parent_run_id.into(),
            index,
            tracker,
            cache,
        }
    }

    pub fn tracker(&self) -> &Arc<RunTracker> {
        &self.tracker
    }

    pub fn parent_run_id(&self) -> &str {
        &self.parent_run_id
    }

    pub fn node_run_id(&self, node: &str) -> String {
        match self.index {
            Some(index) => format!("{}_{node}_{index}", self.run_id),
            None => format!("{}_{node}_reduce", self.run_id),
        }
    }

    /// Record a node as skipped.
    pub fn bypass_node(&self, node: &str) -> Result<RunInfo, RunError> {
        let run_id = self.node_run_id(node);
        let info = self
            .tracker
            .bypass_node_run(node, &self.run_id, &self.parent_run_id, &run_id, self.index)
            .map_err(|e| RunError::failed("RunTrackerError", e.to_string()))?;
        self.tracker.persist_node_run(&info);
        Ok(info)
    }

    /// Run one node: validate args, consult the cache, invoke, record.
    ///
    /// The node run is persisted when it starts and again when it ends.
    pub fn invoke_node(
        &self,
        node: &str,
        tool: &ToolDescriptor,
        args: Map<String, Value>,
        enable_cache: bool,
    ) -> Result<Value, RunError> {
        let run_id = self.node_run_id(node);
        let started = self
            .tracker
            .start_node_run(node, &self.run_id, &self.parent_run_id, &run_id, self.index)
            .map_err(|e| RunError::failed("RunTrackerError", e.to_string()))?;
        self.tracker.persist_node_run(&started);

        let args = match tool.resolve_args(args) {
            Ok(args) => args,
            Err(e) => return Err(self.fail_node(&run_id, e, None)),
        };
        if let Err(e) = self.tracker.set_inputs(&run_id, args.clone()) {
            tracing::warn!(run_id = %run_id, error = %e, "Failed to record node inputs");
        }

        let cache = self.cache.as_ref().filter(|_| enable_cache);
        let cache_info = cache
            .map(|_| CacheManager::calculate_cache_info(&self.flow_id, &tool.name, &args));

        if let (Some(cache), Some(info)) = (cache, cache_info.as_ref())
            && let CacheLookup::Hit {
                cached_run_id,
                cached_flow_run_id,
                result,
            } = cache.get_cache_result(info)
        {
            tracing::debug!(node, cached_run_id = %cached_run_id, "Serving node from cache");
            if let Err(e) = self
                .tracker
                .set_cache_provenance(&run_id, &cached_run_id, &cached_flow_run_id)
            {
                tracing::warn!(run_id = %run_id, error = %e, "Failed to tag cached node run");
            }
            self.finish_node(&run_id, Ok(Some(result.clone())), None);
            return Ok(result);
        }

        let mut call_args = args.clone();
        call_args.insert("__run_id".to_string(), json!(self.parent_run_id));
        call_args.insert("__line_index".to_string(), json!(self.index));

        let start = Utc::now();
        let clock = Instant::now();
        match tool.invoke(&call_args) {
            Ok(output) => {
                let value = output_to_json(node, &*output);
                let trace = build_trace(node, tool, &args, Some(&value), None, start, clock);
                let info = self.finish_node(&run_id, Ok(Some(value.clone())), Some(vec![trace]));
                if let (Some(cache), Some(cache_info), Some(info)) = (cache, cache_info, info)
                    && let Err(e) = cache.persist_result(&info, &cache_info, &self.flow_id)
                {
                    tracing::warn!(node, error = %e, "Failed to persist cache result");
                }
                Ok(value)
            }
            Err(e) => {
                let trace = build_trace(node, tool, &args, None, Some(&e), start, clock);
                Err(self.fail_node(&run_id, e, Some(vec![trace])))
            }
        }
    }

    fn fail_node(&self, run_id: &str, error: ToolError, traces: Option<Vec<Value>>) -> RunError {
        let run_error = match &error {
            ToolError::Canceled(msg) => RunError::Canceled(msg.clone()),
            other => RunError::Failed(ErrorInfo::new(other.error_type(), other.to_string())),
        };
        self.finish_node(run_id, Err(run_error.clone()), traces);
        run_error
    }

    fn finish_node(
        &self,
        run_id: &str,
        result: Result<Option<Value>, RunError>,
        traces: Option<Vec<Value>>,
    ) -> Option<RunInfo> {
        match self.tracker.end_run(run_id, result, traces) {
            Ok(tracked) => {
                let info = tracked.into_node()?;
                self.tracker.persist_node_run(&info);
                Some(info)
            }
            Err(e) => {
                tracing::warn!(run_id = %run_id, error = %e, "Failed to end node run");
                None
            }
        }
    }
}

fn output_to_json(node: &str, output: &dyn ToolOutput) -> Value {
    match output.to_json() {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(
                node,
                error = %e,
                "Output of {node} is not json serializable, use str to store it."
            );
            Value::String(format!("{output:?}"))
        }
    }
}

fn build_trace(
    node: &str,
    tool: &ToolDescriptor,
    args: &Map<String, Value>,
    output: Option<&Value>,
    error: Option<&ToolError>,
    start: chrono::DateTime<Utc>,
    clock: Instant,
) -> Value {
    let mut trace = json!({
        "name": tool.name,
        "node_name": node,
        "type": "Function",
        "inputs": args,
        "output": output,
        "error": error.map(ToString::to_string),
        "start_time": start.timestamp_micros() as f64 / 1e6,
        "end_time": start.timestamp_micros() as f64 / 1e6 + clock.elapsed().as_secs_f64(),
    });
    if let Some(usage) = output.and_then(|o| o.get("usage")).cloned()
        && let Some(obj) = trace.as_object_mut()
    {
        obj.insert("usage".to_string(), usage);
    }
    trace
}
