//! Built-in flows served by the worker binary.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use linepool_core::flow::{FlowNode, InputBinding, ParamSpec, ToolDescriptor, ToolError, ValueType};
use linepool_core::{
    CacheManager, Error, FileCacheStore, FlowCreateArgs, FlowExecutor, LinearFlow, RunStorage,
};
use serde_json::Value;

/// Build the flow named by `args.flow`.
pub fn build(
    args: &FlowCreateArgs,
    storage: Arc<dyn RunStorage>,
) -> linepool_core::Result<Box<dyn FlowExecutor>> {
    let flow = match args.flow.as_str() {
        "echo" => echo_flow(),
        "demo" => demo_flow(),
        "cached" => cached_flow(args)?,
        other => return Err(Error::InvalidFlow(format!("unknown flow '{other}'"))),
    };
    flow.validate()?;
    Ok(Box::new(flow.with_storage(storage)))
}

fn echo_tool() -> ToolDescriptor {
    ToolDescriptor::new("echo", |args| Ok(args["text"].clone()))
        .with_input("text", ParamSpec::required(ValueType::Any))
}

/// `answer` = `text`.
fn echo_flow() -> LinearFlow {
    LinearFlow::new("echo")
        .node(FlowNode::new("echo", echo_tool()).input("text", InputBinding::parse("${inputs.text}")))
        .output("answer", InputBinding::parse("${echo.output}"))
}

/// Echo after sleeping `sleep_ms`; aborts the process when `crash` is true.
fn demo_flow() -> LinearFlow {
    let sleep = ToolDescriptor::new("sleep", |args| {
        let ms = args["ms"].as_u64().unwrap_or(0);
        thread::sleep(Duration::from_millis(ms));
        Ok(ms)
    })
    .with_input("ms", ParamSpec::optional(ValueType::Int, Value::from(0)));

    let fault = ToolDescriptor::new("fault", |args| {
        if args["crash"].as_bool().unwrap_or(false) {
            tracing::error!("Crash requested, aborting");
            std::process::abort();
        }
        Ok(false)
    })
    .with_input("crash", ParamSpec::optional(ValueType::Bool, Value::Bool(false)));

    LinearFlow::new("demo")
        .node(FlowNode::new("delay", sleep).input("ms", InputBinding::parse("${inputs.sleep_ms}")))
        .node(FlowNode::new("fault", fault).input("crash", InputBinding::parse("${inputs.crash}")))
        .node(FlowNode::new("echo", echo_tool()).input("text", InputBinding::parse("${inputs.text}")))
        .output("answer", InputBinding::parse("${echo.output}"))
}

/// `square` = `x * x`, cached in `cache_dir`.
fn cached_flow(args: &FlowCreateArgs) -> linepool_core::Result<LinearFlow> {
    let cache_dir = args
        .cache_dir
        .clone()
        .ok_or_else(|| Error::InvalidFlow("the cached flow needs a cache_dir".to_string()))?;
    let store = FileCacheStore::new(cache_dir)?;

    let square = ToolDescriptor::new("square", |args| {
        args["x"]
            .as_i64()
            .map(|x| x * x)
            .ok_or_else(|| ToolError::InvalidInput("x must be an integer".to_string()))
    })
    .with_input("x", ParamSpec::required(ValueType::Int));

    Ok(LinearFlow::new("cached")
        .node(
            FlowNode::new("square", square)
                .input("x", InputBinding::parse("${inputs.x}"))
                .cached(),
        )
        .output("square", InputBinding::parse("${square.output}"))
        .with_cache(CacheManager::new(Arc::new(store))))
}
