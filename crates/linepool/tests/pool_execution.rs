//! End-to-end batch execution against the `linepool-worker` binary.

mod common;

use common::{config, demo_line, echo_line, start};
use linepool::{LinePool, PoolError, StartMethod};
use linepool_core::{FlowCreateArgs, MemoryRunStorage, Status};
use serde_json::json;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

// =============================================================================
// Batch runs
// =============================================================================

fn run_echo_batch(method: StartMethod) {
    let dir = TempDir::new().unwrap();
    let lines: Vec<_> = (0..6)
        .map(|i| (i, echo_line(&format!("line {i}"))))
        .collect();
    let (mut pool, storage) = start(config("echo", 2, method, dir.path()), lines.len());
    assert_eq!(pool.worker_count(), 2);

    let results = pool.run(lines).unwrap();

    assert_eq!(results.len(), 6);
    assert!(!pool.is_timeout());
    for (i, result) in results.iter().enumerate() {
        assert_eq!(result.line_index(), Some(i));
        assert_eq!(result.status(), Status::Completed);
        assert_eq!(result.output["answer"], json!(format!("line {i}")));
        assert!(result.node_run_infos.contains_key("echo"));
    }

    // Node runs persisted in the worker reach the parent's storage.
    let run_id = pool.config().run_id.clone();
    let node_run = storage
        .node_run(&format!("{run_id}_echo_3"))
        .expect("forwarded node run");
    assert_eq!(node_run.status, Status::Completed);

    let summary = storage.status_summary(&run_id).expect("status summary");
    assert_eq!(summary["lines.completed"], 6);
    assert_eq!(summary["lines.failed"], 0);
    assert_eq!(summary["nodes.echo.completed"], 6);

    pool.close().unwrap();
    assert!(pool.process_infos().is_empty());
}

#[test]
fn test_batch_returns_one_result_per_line_spawn() {
    run_echo_batch(StartMethod::Spawn);
}

#[cfg(unix)]
#[test]
fn test_batch_returns_one_result_per_line_fork() {
    run_echo_batch(StartMethod::Fork);
}

#[test]
fn test_results_are_ordered_by_line_index() {
    let dir = TempDir::new().unwrap();
    let (pool, _storage) = start(config("demo", 3, StartMethod::Spawn, dir.path()), 3);

    // Line 3 finishes last, line 1 first.
    let results = pool
        .run(vec![
            (3, demo_line("c", 600, false)),
            (1, demo_line("a", 0, false)),
            (2, demo_line("b", 300, false)),
        ])
        .unwrap();

    let order: Vec<_> = results.iter().map(|r| r.line_index()).collect();
    assert_eq!(order, vec![Some(1), Some(2), Some(3)]);
    let answers: Vec<_> = results.iter().map(|r| r.output["answer"].clone()).collect();
    assert_eq!(answers, vec![json!("a"), json!("b"), json!("c")]);
}

#[test]
fn test_pool_is_reusable_across_batches() {
    let dir = TempDir::new().unwrap();
    let (pool, _storage) = start(config("echo", 1, StartMethod::Spawn, dir.path()), 2);
    let pid = common::pid_of(&pool, 0).unwrap();

    // The single worker serves line 0 of the same run id twice.
    let first = pool.run(vec![(0, echo_line("x")), (1, echo_line("y"))]).unwrap();
    let second = pool.run(vec![(0, echo_line("z"))]).unwrap();

    assert_eq!(first.len(), 2);
    assert_eq!(first[0].output["answer"], json!("x"));
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].status(), Status::Completed);
    assert_eq!(second[0].output["answer"], json!("z"));
    assert_eq!(common::pid_of(&pool, 0), Some(pid));
}

#[test]
fn test_submit_after_batch_with_deadline() {
    let dir = TempDir::new().unwrap();
    let mut config = config("echo", 1, StartMethod::Spawn, dir.path());
    config.batch_timeout = Some(Duration::from_secs(1));
    let (pool, _storage) = start(config, 1);
    let pid = common::pid_of(&pool, 0).unwrap();

    let results = pool.run(vec![(0, echo_line("in time"))]).unwrap();
    assert_eq!(results[0].status(), Status::Completed);
    assert!(!pool.is_timeout());

    // Well past the old batch deadline.
    thread::sleep(Duration::from_secs(2));
    let result = pool
        .submit("adhoc", 5, echo_line("later"))
        .unwrap()
        .expect("result within the line timeout");

    assert_eq!(result.status(), Status::Completed);
    assert_eq!(result.output["answer"], json!("later"));
    assert!(!pool.is_timeout());
    assert_eq!(common::pid_of(&pool, 0), Some(pid));
}

#[test]
fn test_missing_input_fails_line_without_restart() {
    let dir = TempDir::new().unwrap();
    let (pool, _storage) = start(config("demo", 1, StartMethod::Spawn, dir.path()), 2);
    let pid = common::pid_of(&pool, 0).unwrap();

    // `crash` and `sleep_ms` are missing from line 0.
    let results = pool
        .run(vec![(0, echo_line("incomplete")), (1, demo_line("ok", 0, false))])
        .unwrap();

    assert_eq!(results[0].status(), Status::Failed);
    assert_ne!(results[0].error_type(), Some("ProcessCrashError"));
    assert_eq!(results[1].status(), Status::Completed);
    assert_eq!(common::pid_of(&pool, 0), Some(pid));
}

// =============================================================================
// Single lines
// =============================================================================

#[test]
fn test_submit_returns_the_line_result() {
    let dir = TempDir::new().unwrap();
    let (pool, _storage) = start(config("echo", 1, StartMethod::Spawn, dir.path()), 1);

    let result = pool
        .submit("adhoc", 7, echo_line("hello"))
        .unwrap()
        .expect("result within the line timeout");

    assert_eq!(result.line_index(), Some(7));
    assert_eq!(result.run_info.run_id, "adhoc_7");
    assert_eq!(result.output["answer"], json!("hello"));
}

#[test]
fn test_submit_before_start_is_rejected() {
    let dir = TempDir::new().unwrap();
    let pool = LinePool::new(
        config("echo", 1, StartMethod::Spawn, dir.path()),
        Arc::new(MemoryRunStorage::new()),
        1,
    );

    let err = pool.submit("run", 0, echo_line("x")).unwrap_err();
    assert!(matches!(err, PoolError::NotRunning));
    assert!(matches!(pool.run(Vec::new()), Err(PoolError::NotRunning)));
}

// =============================================================================
// Node cache shared by workers
// =============================================================================

#[test]
fn test_cached_node_reused_across_lines() {
    let dir = TempDir::new().unwrap();
    let mut config = config("cached", 1, StartMethod::Spawn, dir.path());
    config.flow = FlowCreateArgs {
        cache_dir: Some(dir.path().join("cache")),
        ..FlowCreateArgs::new("cached", dir.path())
    };
    let (pool, _storage) = start(config, 3);

    let line = |x: i64| {
        let mut map = serde_json::Map::new();
        map.insert("x".into(), json!(x));
        map
    };
    let results = pool.run(vec![(0, line(4)), (1, line(4)), (2, line(5))]).unwrap();

    assert_eq!(results[0].output["square"], json!(16));
    assert_eq!(results[1].output["square"], json!(16));
    assert_eq!(results[2].output["square"], json!(25));
    assert!(!results[0].node_run_infos["square"].is_cached());
    assert!(results[1].node_run_infos["square"].is_cached());
    assert!(!results[2].node_run_infos["square"].is_cached());
}

// =============================================================================
// Startup failures
// =============================================================================

#[test]
fn test_unknown_flow_fails_startup() {
    let dir = TempDir::new().unwrap();
    let mut pool = LinePool::new(
        config("no-such-flow", 1, StartMethod::Spawn, dir.path()),
        Arc::new(MemoryRunStorage::new()),
        1,
    );

    let err = pool.start().unwrap_err();
    assert!(matches!(err, PoolError::Startup(_)), "got {err:?}");
}

#[cfg(unix)]
#[test]
fn test_worker_exiting_early_fails_startup() {
    let dir = TempDir::new().unwrap();
    let mut config = config("echo", 1, StartMethod::Spawn, dir.path());
    config.worker_program = Some(which::which("true").unwrap());
    let mut pool = LinePool::new(config, Arc::new(MemoryRunStorage::new()), 1);

    let err = pool.start().unwrap_err();
    assert!(matches!(err, PoolError::Startup(_)), "got {err:?}");
}
