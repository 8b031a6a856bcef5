//! Run tracker behavior as seen through its public API.

use std::collections::HashMap;
use std::sync::Arc;

use linepool_core::contracts::RunInfo;
use linepool_core::{MemoryRunStorage, RunError, RunTracker, Status};
use proptest::prelude::*;

// =============================================================================
// Bypass
// =============================================================================

#[test]
fn test_bypassing_twice_yields_two_terminal_records() {
    let storage = Arc::new(MemoryRunStorage::new());
    let tracker = RunTracker::new(storage.clone());

    let first = tracker
        .bypass_node_run("summarize", "run", "run_0", "run_summarize_0", Some(0))
        .expect("first bypass");
    let second = tracker
        .bypass_node_run("summarize", "run", "run_1", "run_summarize_1", Some(1))
        .expect("second bypass");
    for info in [&first, &second] {
        tracker.persist_node_run(info);
    }

    assert_ne!(first.run_id, second.run_id);
    assert_eq!(first.status, Status::Bypassed);
    assert_eq!(second.status, Status::Bypassed);
    assert_eq!(first.end_time, Some(first.start_time));

    // Ending a bypassed run leaves it bypassed.
    let ended = tracker
        .end_run("run_summarize_0", Ok(None), None)
        .expect("end bypassed");
    assert_eq!(ended.status(), Status::Bypassed);

    let history = storage.node_run_history();
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|r| r.status == Status::Bypassed));
}

#[test]
fn test_registered_running_copy_does_not_reopen_terminal_run() {
    let tracker = RunTracker::dummy();
    let started = tracker
        .start_node_run("a", "run", "run_0", "run_a_0", Some(0))
        .expect("start");
    tracker.end_run("run_a_0", Ok(None), None).expect("end");

    tracker.register_node_run(started);
    assert_eq!(
        tracker.get_run("run_a_0").map(|r| r.status()),
        Some(Status::Completed)
    );
}

// =============================================================================
// Monotonic status under random operations
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Start(usize),
    Bypass(usize),
    Complete(usize),
    Fail(usize),
    Cancel(usize),
    /// A worker crash: every running node of the batch is canceled.
    Crash,
    /// A stale Running copy arrives from elsewhere.
    Register(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let id = 0..4usize;
    prop_oneof![
        id.clone().prop_map(Op::Start),
        id.clone().prop_map(Op::Bypass),
        id.clone().prop_map(Op::Complete),
        id.clone().prop_map(Op::Fail),
        id.clone().prop_map(Op::Cancel),
        Just(Op::Crash),
        id.prop_map(Op::Register),
    ]
}

fn run_id(id: usize) -> String {
    format!("run_node{id}_0")
}

fn apply(tracker: &RunTracker, op: &Op) {
    // Individual operations may legitimately fail (unknown or duplicate ids).
    let _ = match op {
        Op::Start(id) => tracker
            .start_node_run(&format!("node{id}"), "run", "run_0", &run_id(*id), Some(0))
            .map(|_| ()),
        Op::Bypass(id) => tracker
            .bypass_node_run(&format!("node{id}"), "run", "run_0", &run_id(*id), Some(0))
            .map(|_| ()),
        Op::Complete(id) => tracker
            .end_run(&run_id(*id), Ok(Some(serde_json::json!(id))), None)
            .map(|_| ()),
        Op::Fail(id) => tracker
            .end_run(&run_id(*id), Err(RunError::failed("ToolExecutionError", "x")), None)
            .map(|_| ()),
        Op::Cancel(id) => tracker
            .end_run(&run_id(*id), Err(RunError::Canceled("stop".into())), None)
            .map(|_| ()),
        Op::Crash => {
            tracker.cancel_node_runs(Some("run"), "Process crashed");
            Ok(())
        }
        Op::Register(id) => {
            tracker.register_node_run(RunInfo::new(
                format!("node{id}"),
                "run",
                run_id(*id),
                "run_0",
                Some(0),
            ));
            Ok(())
        }
    };
}

proptest! {
    #[test]
    fn test_status_never_returns_to_running(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let tracker = RunTracker::dummy();
        let mut terminal: HashMap<usize, Status> = HashMap::new();

        for op in &ops {
            apply(&tracker, op);
            for id in 0..4 {
                let Some(status) = tracker.get_run(&run_id(id)).map(|r| r.status()) else {
                    continue;
                };
                if let Some(previous) = terminal.get(&id) {
                    prop_assert_eq!(*previous, status);
                } else if status.is_terminal() {
                    terminal.insert(id, status);
                }
            }
        }
    }
}
