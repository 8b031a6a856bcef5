//! A sequential reference executor.
//!
//! Nodes run in declaration order. A node whose activate condition does not
//! hold, or that consumes the output of a bypassed node, is bypassed.
//! Aggregation nodes are skipped per line and run once by
//! [`FlowExecutor::exec_aggregation`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::{Map, Value};

use crate::cache::CacheManager;
use crate::contracts::{AggregationResult, ErrorInfo, LineResult, Status, line_run_id};
use crate::error::{Error, Result};
use crate::storage::{DummyRunStorage, RunStorage};
use crate::tracker::{RunError, RunTracker};

use super::context::FlowExecutionContext;
use super::executor::FlowExecutor;
use super::tool::ToolDescriptor;

const LINE_TIMEOUT_ERROR_TYPE: &str = "LineExecutionTimeoutError";
const INPUT_NOT_FOUND_ERROR_TYPE: &str = "InputNotFound";

/// Where a node input comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum InputBinding {
    /// A column of the line inputs.
    Line(String),
    /// The output of an earlier node.
    Node(String),
    Literal(Value),
}

impl InputBinding {
    /// Parse `${inputs.<name>}`, `${<node>.output}` or a literal string.
    pub fn parse(text: &str) -> Self {
        let Some(inner) = text.strip_prefix("${").and_then(|t| t.strip_suffix('}')) else {
            return InputBinding::Literal(Value::String(text.to_string()));
        };
        if let Some(name) = inner.strip_prefix("inputs.") {
            return InputBinding::Line(name.to_string());
        }
        if let Some(node) = inner.strip_suffix(".output") {
            return InputBinding::Node(node.to_string());
        }
        InputBinding::Literal(Value::String(text.to_string()))
    }

    fn node(&self) -> Option<&str> {
        match self {
            InputBinding::Node(node) => Some(node),
            _ => None,
        }
    }
}

/// Run a node only when `when` resolves to `is`.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivateCondition {
    pub when: InputBinding,
    pub is: Value,
}

#[derive(Debug, Clone)]
pub struct FlowNode {
    pub name: String,
    pub tool: ToolDescriptor,
    pub inputs: BTreeMap<String, InputBinding>,
    pub activate: Option<ActivateCondition>,
    pub enable_cache: bool,
    pub aggregation: bool,
}

impl FlowNode {
    pub fn new(name: impl Into<String>, tool: ToolDescriptor) -> Self {
        Self {
            name: name.into(),
            tool,
            inputs: BTreeMap::new(),
            activate: None,
            enable_cache: false,
            aggregation: false,
        }
    }

    pub fn input(mut self, name: impl Into<String>, binding: InputBinding) -> Self {
        self.inputs.insert(name.into(), binding);
        self
    }

    pub fn activate_when(mut self, when: InputBinding, is: Value) -> Self {
        self.activate = Some(ActivateCondition { when, is });
        self
    }

    pub fn cached(mut self) -> Self {
        self.enable_cache = true;
        self
    }

    pub fn aggregation(mut self) -> Self {
        self.aggregation = true;
        self
    }

    fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.inputs
            .values()
            .chain(self.activate.iter().map(|a| &a.when))
            .filter_map(InputBinding::node)
    }
}

pub struct LinearFlow {
    id: String,
    nodes: Vec<FlowNode>,
    outputs: BTreeMap<String, InputBinding>,
    storage: Arc<dyn RunStorage>,
    cache: Option<CacheManager>,
}

impl LinearFlow {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            nodes: Vec::new(),
            outputs: BTreeMap::new(),
            storage: Arc::new(DummyRunStorage),
            cache: None,
        }
    }

    pub fn node(mut self, node: FlowNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn output(mut self, name: impl Into<String>, binding: InputBinding) -> Self {
        self.outputs.insert(name.into(), binding);
        self
    }

    /// Persist run records to `storage`.
    pub fn with_storage(mut self, storage: Arc<dyn RunStorage>) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_cache(mut self, cache: CacheManager) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Check node names and that every reference points at an earlier line node.
    pub fn validate(&self) -> Result<()> {
        let mut seen: FxHashSet<&str> = FxHashSet::default();
        for node in &self.nodes {
            for dep in node.dependencies() {
                if !seen.contains(dep) {
                    return Err(Error::InvalidFlow(format!(
                        "node '{}' references '{dep}' which is not an earlier line node",
                        node.name
                    )));
                }
            }
            if !node.aggregation {
                seen.insert(node.name.as_str());
            }
            if self.nodes.iter().filter(|n| n.name == node.name).count() > 1 {
                return Err(Error::InvalidFlow(format!("duplicate node '{}'", node.name)));
            }
        }
        for (name, binding) in &self.outputs {
            if let Some(dep) = binding.node()
                && !seen.contains(dep)
            {
                return Err(Error::InvalidFlow(format!(
                    "output '{name}' references unknown line node '{dep}'"
                )));
            }
        }
        Ok(())
    }

    fn should_bypass(
        &self,
        node: &FlowNode,
        inputs: &Map<String, Value>,
        outputs: &FxHashMap<String, Value>,
        bypassed: &FxHashSet<String>,
    ) -> bool {
        if node.dependencies().any(|dep| bypassed.contains(dep)) {
            return true;
        }
        match &node.activate {
            Some(condition) => resolve(&condition.when, inputs, outputs).ok() != Some(condition.is.clone()),
            None => false,
        }
    }

    /// Tracker for one line or aggregation step; records do not outlive it.
    fn new_tracker(&self) -> Arc<RunTracker> {
        Arc::new(RunTracker::new(self.storage.clone()))
    }

    fn run_line_nodes(
        &self,
        ctx: &FlowExecutionContext,
        inputs: &Map<String, Value>,
        index: usize,
        timeout: Option<Duration>,
        outputs: &mut FxHashMap<String, Value>,
    ) -> std::result::Result<(), RunError> {
        let started = Instant::now();
        let mut bypassed: FxHashSet<String> = FxHashSet::default();

        for node in self.nodes.iter().filter(|n| !n.aggregation) {
            if let Some(limit) = timeout
                && started.elapsed() > limit
            {
                ctx.tracker()
                    .cancel_node_runs(None, "Line execution timeout");
                return Err(RunError::failed(
                    LINE_TIMEOUT_ERROR_TYPE,
                    format!(
                        "Line {index} execution timeout for exceeding {} seconds",
                        limit.as_secs()
                    ),
                ));
            }

            if self.should_bypass(node, inputs, outputs, &bypassed) {
                ctx.bypass_node(&node.name)?;
                bypassed.insert(node.name.clone());
                continue;
            }

            let mut args = Map::new();
            for (name, binding) in &node.inputs {
                let value = resolve(binding, inputs, outputs)
                    .map_err(|missing| RunError::failed(INPUT_NOT_FOUND_ERROR_TYPE, missing))?;
                args.insert(name.clone(), value);
            }
            let value = ctx.invoke_node(&node.name, &node.tool, args, node.enable_cache)?;
            outputs.insert(node.name.clone(), value);
        }
        Ok(())
    }
}

fn resolve(
    binding: &InputBinding,
    inputs: &Map<String, Value>,
    outputs: &FxHashMap<String, Value>,
) -> std::result::Result<Value, String> {
    match binding {
        InputBinding::Line(name) => inputs
            .get(name)
            .cloned()
            .ok_or_else(|| format!("The input '{name}' is not found in the line inputs")),
        InputBinding::Node(node) => Ok(outputs.get(node).cloned().unwrap_or(Value::Null)),
        InputBinding::Literal(value) => Ok(value.clone()),
    }
}

impl FlowExecutor for LinearFlow {
    fn flow_id(&self) -> &str {
        &self.id
    }

    fn exec_line(
        &self,
        inputs: Map<String, Value>,
        run_id: &str,
        index: usize,
        timeout: Option<Duration>,
    ) -> LineResult {
        let line_id = line_run_id(run_id, index);
        let tracker = self.new_tracker();
        if let Err(e) = tracker.start_flow_run(
            &self.id,
            run_id,
            &line_id,
            run_id,
            Some(inputs.clone()),
            Some(index),
        ) {
            let error = ErrorInfo::new("RunTrackerError", e.to_string());
            return LineResult::failed(&self.id, run_id, index, inputs, error);
        }

        let ctx = FlowExecutionContext::new(
            &self.id,
            run_id,
            &line_id,
            Some(index),
            tracker.clone(),
            self.cache.clone(),
        );
        let mut node_outputs = FxHashMap::default();
        let outcome = self.run_line_nodes(&ctx, &inputs, index, timeout, &mut node_outputs);

        let mut aggregation_inputs = Map::new();
        for node in self.nodes.iter().filter(|n| n.aggregation) {
            for dep in node.dependencies() {
                let value = node_outputs.get(dep).cloned().unwrap_or(Value::Null);
                aggregation_inputs.insert(dep.to_string(), value);
            }
        }

        let mut output = Map::new();
        let result = match outcome {
            Ok(()) => {
                for (name, binding) in &self.outputs {
                    let value = resolve(binding, &inputs, &node_outputs).unwrap_or(Value::Null);
                    output.insert(name.clone(), value);
                }
                Ok(Some(Value::Object(output.clone())))
            }
            Err(e) => Err(e),
        };

        let run_info = match tracker.end_run(&line_id, result, None) {
            Ok(tracked) => tracked.into_flow(),
            Err(e) => {
                tracing::warn!(run_id = %line_id, error = %e, "Failed to end line run");
                None
            }
        };
        let Some(run_info) = run_info else {
            let error = ErrorInfo::new("RunTrackerError", format!("line run {line_id} was lost"));
            return LineResult::failed(&self.id, run_id, index, inputs, error);
        };
        tracker.persist_flow_run(&run_info);

        if run_info.status != Status::Completed {
            output.clear();
        }
        let node_run_infos = tracker
            .collect_child_node_runs(&line_id)
            .into_iter()
            .map(|info| (info.node.clone(), info))
            .collect();

        LineResult {
            output,
            aggregation_inputs,
            run_info,
            node_run_infos,
        }
    }

    fn exec_aggregation(
        &self,
        batch_inputs: &[Map<String, Value>],
        aggregation_inputs: &Map<String, Value>,
        run_id: &str,
    ) -> AggregationResult {
        let tracker = self.new_tracker();
        let ctx = FlowExecutionContext::new(
            &self.id,
            run_id,
            run_id,
            None,
            tracker.clone(),
            self.cache.clone(),
        );
        let mut result = AggregationResult::default();

        for node in self.nodes.iter().filter(|n| n.aggregation) {
            let mut args = Map::new();
            for (name, binding) in &node.inputs {
                let value = match binding {
                    InputBinding::Line(column) => Value::Array(
                        batch_inputs
                            .iter()
                            .map(|line| line.get(column).cloned().unwrap_or(Value::Null))
                            .collect(),
                    ),
                    InputBinding::Node(dep) => aggregation_inputs
                        .get(dep)
                        .cloned()
                        .unwrap_or_else(|| Value::Array(Vec::new())),
                    InputBinding::Literal(value) => value.clone(),
                };
                args.insert(name.clone(), value);
            }

            match ctx.invoke_node(&node.name, &node.tool, args, node.enable_cache) {
                Ok(value) => {
                    if let Some(metrics) = value.get("metrics").and_then(Value::as_object) {
                        result
                            .metrics
                            .extend(metrics.iter().map(|(k, v)| (k.clone(), v.clone())));
                    }
                    result.output.insert(node.name.clone(), value);
                }
                Err(e) => {
                    tracing::warn!(node = %node.name, error = ?e, "Aggregation node failed");
                }
            }
        }

        result.node_run_infos = tracker
            .collect_child_node_runs(run_id)
            .into_iter()
            .filter(|info| info.index.is_none())
            .map(|info| (info.node.clone(), info))
            .collect();
        result
    }

    fn has_aggregation_node(&self) -> bool {
        self.nodes.iter().any(|n| n.aggregation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::Status;
    use crate::flow::tool::{ParamSpec, ToolError, ValueType};
    use serde_json::json;

    fn echo() -> ToolDescriptor {
        ToolDescriptor::new("echo", |args| Ok(args["text"].clone()))
            .with_input("text", ParamSpec::required(ValueType::Any))
    }

    fn line(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_parse_bindings() {
        assert_eq!(InputBinding::parse("${inputs.q}"), InputBinding::Line("q".into()));
        assert_eq!(InputBinding::parse("${a.output}"), InputBinding::Node("a".into()));
        assert_eq!(
            InputBinding::parse("plain"),
            InputBinding::Literal(json!("plain"))
        );
    }

    #[test]
    fn test_line_outputs_and_records() {
        let flow = LinearFlow::new("flow")
            .node(FlowNode::new("a", echo()).input("text", InputBinding::Line("q".into())))
            .node(FlowNode::new("b", echo()).input("text", InputBinding::Node("a".into())))
            .output("answer", InputBinding::Node("b".into()));
        flow.validate().unwrap();

        let result = flow.exec_line(line(&[("q", json!("hi"))]), "run", 3, None);
        assert_eq!(result.status(), Status::Completed);
        assert_eq!(result.output["answer"], json!("hi"));
        assert_eq!(result.run_info.run_id, "run_3");
        assert_eq!(result.node_run_infos.len(), 2);
        assert_eq!(result.node_run_infos["b"].run_id, "run_b_3");
    }

    #[test]
    fn test_same_line_runs_again_on_one_executor() {
        let flow = LinearFlow::new("flow")
            .node(FlowNode::new("a", echo()).input("text", InputBinding::Line("q".into())))
            .output("answer", InputBinding::Node("a".into()));

        let first = flow.exec_line(line(&[("q", json!("x"))]), "run", 0, None);
        let second = flow.exec_line(line(&[("q", json!("z"))]), "run", 0, None);

        assert_eq!(first.output["answer"], json!("x"));
        assert_eq!(second.status(), Status::Completed);
        assert_eq!(second.output["answer"], json!("z"));
        assert_eq!(second.node_run_infos["a"].status, Status::Completed);
    }

    #[test]
    fn test_inactive_node_and_dependents_bypassed() {
        let flow = LinearFlow::new("flow")
            .node(
                FlowNode::new("a", echo())
                    .input("text", InputBinding::Line("q".into()))
                    .activate_when(InputBinding::Line("go".into()), json!(true)),
            )
            .node(FlowNode::new("b", echo()).input("text", InputBinding::Node("a".into())))
            .output("answer", InputBinding::Node("b".into()));

        let result = flow.exec_line(line(&[("q", json!("hi")), ("go", json!(false))]), "run", 0, None);
        assert_eq!(result.status(), Status::Completed);
        assert_eq!(result.node_run_infos["a"].status, Status::Bypassed);
        assert_eq!(result.node_run_infos["b"].status, Status::Bypassed);
        assert_eq!(result.output["answer"], Value::Null);
    }

    #[test]
    fn test_failing_node_fails_line() {
        let fail = ToolDescriptor::new("fail", |_| -> std::result::Result<i32, ToolError> {
            Err(ToolError::Failed("boom".into()))
        });
        let flow = LinearFlow::new("flow")
            .node(FlowNode::new("a", fail))
            .node(FlowNode::new("b", echo()).input("text", InputBinding::Node("a".into())))
            .output("answer", InputBinding::Node("b".into()));

        let result = flow.exec_line(Map::new(), "run", 0, None);
        assert_eq!(result.status(), Status::Failed);
        assert!(result.output.is_empty());
        assert_eq!(result.error_type(), Some("ToolExecutionError"));
        assert!(!result.node_run_infos.contains_key("b"));
    }

    #[test]
    fn test_missing_line_input() {
        let flow = LinearFlow::new("flow")
            .node(FlowNode::new("a", echo()).input("text", InputBinding::Line("q".into())));
        let result = flow.exec_line(Map::new(), "run", 0, None);
        assert_eq!(result.error_type(), Some("InputNotFound"));
    }

    #[test]
    fn test_timeout_between_nodes() {
        let slow = ToolDescriptor::new("slow", |_| {
            std::thread::sleep(Duration::from_millis(50));
            Ok(0)
        });
        let flow = LinearFlow::new("flow")
            .node(FlowNode::new("a", slow.clone()))
            .node(FlowNode::new("b", slow));
        let result = flow.exec_line(Map::new(), "run", 7, Some(Duration::from_millis(10)));
        assert_eq!(result.error_type(), Some("LineExecutionTimeoutError"));
        assert!(
            result.run_info.error.unwrap().message.starts_with("Line 7 execution timeout")
        );
        assert_eq!(result.node_run_infos.len(), 1);
    }

    #[test]
    fn test_validate_rejects_forward_reference() {
        let flow = LinearFlow::new("flow")
            .node(FlowNode::new("a", echo()).input("text", InputBinding::Node("b".into())))
            .node(FlowNode::new("b", echo()).input("text", InputBinding::Literal(json!(1))));
        assert!(matches!(flow.validate(), Err(Error::InvalidFlow(_))));
    }

    #[test]
    fn test_aggregation_over_batch() {
        let mean = ToolDescriptor::new("mean", |args| {
            let values = args["scores"].as_array().cloned().unwrap_or_default();
            let sum: f64 = values.iter().filter_map(Value::as_f64).sum();
            let mean = sum / values.len().max(1) as f64;
            Ok(json!({"metrics": {"mean": mean}}))
        })
        .with_input("scores", ParamSpec::required(ValueType::List));
        let score = ToolDescriptor::new("score", |args| Ok(args["x"].clone()))
            .with_input("x", ParamSpec::required(ValueType::Double));

        let flow = LinearFlow::new("flow")
            .node(FlowNode::new("score", score).input("x", InputBinding::Line("x".into())))
            .node(
                FlowNode::new("mean", mean)
                    .input("scores", InputBinding::Node("score".into()))
                    .aggregation(),
            );
        assert!(flow.has_aggregation_node());

        let batch: Vec<_> = [1.0, 2.0, 3.0]
            .iter()
            .map(|x| line(&[("x", json!(x))]))
            .collect();
        let mut scores = Vec::new();
        for (i, inputs) in batch.iter().enumerate() {
            let result = flow.exec_line(inputs.clone(), "run", i, None);
            scores.push(result.aggregation_inputs["score"].clone());
        }
        let mut agg_inputs = Map::new();
        agg_inputs.insert("score".into(), Value::Array(scores));

        let result = flow.exec_aggregation(&batch, &agg_inputs, "run");
        assert_eq!(result.metrics["mean"], json!(2.0));
        assert_eq!(result.node_run_infos["mean"].index, None);
        assert_eq!(result.node_run_infos["mean"].status, Status::Completed);
    }
}
