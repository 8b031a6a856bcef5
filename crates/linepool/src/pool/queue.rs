//! The shared task queue and the result table.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use linepool_core::LineResult;
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use serde_json::{Map, Value};

/// One line of work, submitted once.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub request_id: String,
    pub run_id: String,
    pub line_index: usize,
    pub inputs: Map<String, Value>,
}

impl Task {
    pub fn new(run_id: impl Into<String>, line_index: usize, inputs: Map<String, Value>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.into(),
            line_index,
            inputs,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TaskMessage {
    Line(Task),
    /// Stops the monitor that receives it.
    Terminate,
}

/// Many-writer, many-reader FIFO feeding the monitor threads.
#[derive(Default)]
pub(crate) struct TaskQueue {
    queue: Mutex<VecDeque<TaskMessage>>,
    available: Condvar,
}

impl TaskQueue {
    pub fn push(&self, message: TaskMessage) {
        self.queue.lock().push_back(message);
        self.available.notify_one();
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Option<TaskMessage> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.queue.lock();
        loop {
            if let Some(message) = queue.pop_front() {
                return Some(message);
            }
            if self.available.wait_until(&mut queue, deadline).timed_out() {
                return queue.pop_front();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Drop every queued line, keeping terminate markers. Returns how many went.
    pub fn discard_lines(&self) -> usize {
        let mut queue = self.queue.lock();
        let before = queue.len();
        queue.retain(|message| matches!(message, TaskMessage::Terminate));
        before - queue.len()
    }
}

#[derive(Default)]
struct ResultState {
    results: FxHashMap<String, LineResult>,
    sealed: bool,
}

/// Line results keyed by request id, written once per key.
#[derive(Default)]
pub(crate) struct ResultTable {
    state: Mutex<ResultState>,
    changed: Condvar,
}

impl ResultTable {
    /// Record a result. Returns false if the table is sealed or the key is
    /// already present; the existing entry always wins.
    pub fn insert(&self, request_id: &str, result: LineResult) -> bool {
        let mut state = self.state.lock();
        if state.sealed {
            tracing::warn!(
                request_id,
                line = ?result.line_index(),
                "Discarding line result that arrived after the batch timed out"
            );
            return false;
        }
        if state.results.contains_key(request_id) {
            tracing::warn!(request_id, "Duplicate line result ignored");
            return false;
        }
        state.results.insert(request_id.to_string(), result);
        self.changed.notify_all();
        true
    }

    pub fn take(&self, request_id: &str) -> Option<LineResult> {
        self.state.lock().results.remove(request_id)
    }

    pub fn len(&self) -> usize {
        self.state.lock().results.len()
    }

    /// Wait until a result is inserted or `timeout` passes.
    pub fn wait_changed(&self, timeout: Duration) {
        let mut state = self.state.lock();
        self.changed.wait_for(&mut state, timeout);
    }

    /// Refuse further inserts.
    pub fn seal(&self) {
        self.state.lock().sealed = true;
    }

    /// Empty the table and accept inserts again.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.results.clear();
        state.sealed = false;
    }

    /// Remove every result, ordered by line index.
    pub fn drain_sorted(&self) -> Vec<LineResult> {
        let mut results: Vec<LineResult> = self.state.lock().results.drain().map(|(_, r)| r).collect();
        results.sort_by_key(|r| r.line_index());
        results
    }
}
