//! Cache integration through the linear executor.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use linepool_core::flow::{FlowNode, InputBinding, ParamSpec, ToolDescriptor, ValueType};
use linepool_core::{
    CacheManager, FileCacheStore, FlowExecutor, LinearFlow, MemoryRunStorage, Status,
};
use serde_json::{Map, Value, json};
use tempfile::TempDir;

fn counting_square(calls: Arc<AtomicUsize>) -> ToolDescriptor {
    ToolDescriptor::new("square", move |args| {
        calls.fetch_add(1, Ordering::SeqCst);
        let x = args["x"].as_i64().unwrap_or(0);
        Ok(x * x)
    })
    .with_input("x", ParamSpec::required(ValueType::Int))
}

fn square_flow(calls: Arc<AtomicUsize>, cache: CacheManager) -> LinearFlow {
    LinearFlow::new("square-flow")
        .node(
            FlowNode::new("square", counting_square(calls))
                .input("x", InputBinding::Line("x".into()))
                .cached(),
        )
        .output("y", InputBinding::Node("square".into()))
        .with_cache(cache)
}

fn inputs(x: i64) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("x".into(), json!(x));
    map
}

#[test]
fn test_second_identical_call_is_served_from_cache() {
    let calls = Arc::new(AtomicUsize::new(0));
    let storage = Arc::new(MemoryRunStorage::new());
    let flow = square_flow(calls.clone(), CacheManager::in_memory()).with_storage(storage.clone());

    let first = flow.exec_line(inputs(4), "run", 0, None);
    let second = flow.exec_line(inputs(4), "run", 1, None);

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(first.output["y"], json!(16));
    assert_eq!(second.output["y"], json!(16));

    let first_node = &first.node_run_infos["square"];
    let second_node = &second.node_run_infos["square"];
    assert!(!first_node.is_cached());
    assert_eq!(second_node.status, Status::Completed);
    assert_eq!(second_node.cached_run_id.as_deref(), Some("run_square_0"));
    assert_eq!(second_node.cached_flow_run_id.as_deref(), Some("run_0"));

    let persisted = storage.node_run("run_square_1").expect("persisted node run");
    assert!(persisted.is_cached());
}

#[test]
fn test_different_inputs_miss() {
    let calls = Arc::new(AtomicUsize::new(0));
    let flow = square_flow(calls.clone(), CacheManager::in_memory());

    flow.exec_line(inputs(2), "run", 0, None);
    flow.exec_line(inputs(3), "run", 1, None);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_file_cache_is_shared_between_executors() {
    let dir = TempDir::new().expect("temp dir");
    let calls = Arc::new(AtomicUsize::new(0));
    let cache = || {
        CacheManager::new(Arc::new(
            FileCacheStore::new(dir.path()).expect("cache store"),
        ))
    };

    // Two executors stand in for two worker processes.
    let worker_a = square_flow(calls.clone(), cache());
    let worker_b = square_flow(calls.clone(), cache());

    worker_a.exec_line(inputs(5), "run", 0, None);
    let result = worker_b.exec_line(inputs(5), "run", 1, None);

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(result.output["y"], json!(25));
    assert!(result.node_run_infos["square"].is_cached());
}
