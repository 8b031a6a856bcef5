//! Per-slot monitor loop.
//!
//! One thread per worker slot pulls tasks from the shared queue, forwards
//! each to its worker and waits for the outcome:
//!
//! ```text
//!            +-------------------------------------------------+
//!            v                                                 |
//!   pop task --> terminate? --yes--> end worker, exit           |
//!            |                                                 |
//!            no --> send Execute --> poll responses ------------+
//!                                     | NodeRun/FlowRun: persist
//!                                     | LineResult: store
//!                                     | died / deadline: synthesize
//!                                     |   failure, restart slot
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use linepool_core::{
    FlowRunInfo, LineResult, RunInfo, RunStorage, RunTracker, line_run_id,
};
use parking_lot::Mutex;

use crate::error::{LineError, Result};
use crate::ipc::{WorkerCommand, WorkerResponse, WorkerSlot, decode_json, encode_json};
use crate::process::ProcessManager;

use super::queue::{ResultTable, Task, TaskMessage, TaskQueue};

/// Upper bound of a single blocking wait.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// State shared by the façade and all monitor threads.
pub(crate) struct Dispatch {
    pub tasks: TaskQueue,
    pub results: ResultTable,
    pub manager: ProcessManager,
    pub storage: Arc<dyn RunStorage>,
    pub flow_id: String,
    pub line_timeout: Duration,
    pub batch_timeout: Option<Duration>,
    pub monitor_buffer: Duration,
    pub batch_start: Mutex<Option<Instant>>,
    pub is_timeout: AtomicBool,
    pub closing: AtomicBool,
    /// Line being executed, by slot.
    pub processing: Mutex<BTreeMap<usize, (usize, ProcessLabel)>>,
    /// Lines finished, with the process that served them.
    pub completed: Mutex<BTreeMap<usize, ProcessLabel>>,
}

/// `name(pid)` of a worker, for status logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ProcessLabel(pub String);

impl ProcessLabel {
    fn of(slot: &WorkerSlot) -> Self {
        Self(format!("{}({})", slot.info.process_name, slot.info.process_id))
    }
}

impl std::fmt::Display for ProcessLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Dispatch {
    /// Per-line budget, shrunk to what is left of the batch budget.
    ///
    /// `None` once the batch deadline has passed.
    pub fn effective_timeout(&self) -> Option<Duration> {
        let (Some(batch_timeout), Some(start)) = (self.batch_timeout, *self.batch_start.lock())
        else {
            return Some(self.line_timeout);
        };
        let remaining = batch_timeout.checked_sub(start.elapsed())?;
        if remaining.is_zero() {
            return None;
        }
        Some(self.line_timeout.min(remaining))
    }

    fn classify_timeout(&self, line_number: usize, effective: Duration) -> LineError {
        match self.batch_timeout {
            Some(batch_timeout) if effective < self.line_timeout => LineError::BatchTimeout {
                line_number,
                timeout: batch_timeout.as_secs(),
            },
            _ => LineError::LineTimeout {
                line_number,
                timeout: effective.as_secs(),
            },
        }
    }
}

enum Outcome {
    Completed(Box<LineResult>),
    Crashed,
    TimedOut,
    Unexpected(String),
    /// The pool is closing; the line is dropped.
    Abandoned,
}

/// Serve slot `index` until a terminate marker arrives.
pub(crate) fn monitor_slot(dispatch: Arc<Dispatch>, index: usize) -> Result<()> {
    let mut slot = dispatch.manager.attach(index)?;
    tracing::debug!(slot = index, pid = slot.info.process_id, "Monitor attached");

    loop {
        let message = loop {
            if let Some(message) = dispatch.tasks.pop_timeout(POLL_INTERVAL) {
                break message;
            }
        };

        let timeout = dispatch.effective_timeout();
        let (task, timeout) = match (message, timeout) {
            (TaskMessage::Line(task), Some(timeout)) => (task, timeout),
            (message, timeout) => {
                if timeout.is_none() {
                    dispatch.is_timeout.store(true, Ordering::SeqCst);
                    if let TaskMessage::Line(task) = &message {
                        tracing::warn!(
                            line = task.line_index,
                            "Batch deadline passed before the line was dispatched"
                        );
                    }
                }
                retire(&dispatch, index, slot)?;
                return Ok(());
            }
        };

        if !dispatch.manager.is_process_alive(slot.info.process_id) {
            tracing::warn!(
                slot = index,
                pid = slot.info.process_id,
                "Worker died while idle, restarting it"
            );
            dispatch.manager.log_process_errors(index);
            dispatch.manager.restart_process(index)?;
            slot = dispatch.manager.attach(index)?;
        }

        if let Some(replacement) = execute_task(&dispatch, index, &mut slot, task, timeout)? {
            slot = replacement;
        }
    }
}

fn retire(dispatch: &Dispatch, index: usize, mut slot: WorkerSlot) -> Result<()> {
    tracing::info!(
        slot = index,
        "The thread monitoring the process [{}] will be terminated.",
        ProcessLabel::of(&slot)
    );
    let pid = slot.info.process_id;
    let _ = slot.channel.send(&WorkerCommand::Terminate);
    drop(slot);
    dispatch.manager.end_process(index);
    dispatch.manager.ensure_process_terminated_within_timeout(pid)
}

/// Run one task. Returns the replacement slot if the worker was restarted.
fn execute_task(
    dispatch: &Dispatch,
    index: usize,
    slot: &mut WorkerSlot,
    task: Task,
    timeout: Duration,
) -> Result<Option<WorkerSlot>> {
    let line = task.line_index;
    let label = ProcessLabel::of(slot);
    dispatch.processing.lock().insert(index, (line, label.clone()));
    tracing::info!(
        "Process name({})-Process id({})-Line number({}) start execution.",
        slot.info.process_name,
        slot.info.process_id,
        line
    );

    let start_time = Utc::now();
    let started = Instant::now();
    let deadline = started + timeout + dispatch.monitor_buffer;
    let mut returned = BTreeMap::new();

    let outcome = match encode_json(&task.inputs) {
        Err(e) => Outcome::Unexpected(e.to_string()),
        Ok(inputs_json) => {
            let command = WorkerCommand::Execute {
                run_id: task.run_id.clone(),
                line_index: line as u64,
                inputs_json,
                timeout_ms: timeout.as_millis() as u64,
            };
            match slot.channel.send(&command) {
                Ok(()) => poll_outcome(dispatch, slot, deadline, &mut returned),
                Err(e) => {
                    tracing::warn!(line, error = %e, "Failed to send the line to its worker");
                    Outcome::Crashed
                }
            }
        }
    };

    let error = match outcome {
        Outcome::Completed(result) => {
            finish(dispatch, index, &task, *result, &label);
            return Ok(None);
        }
        Outcome::Abandoned => {
            dispatch.processing.lock().remove(&index);
            return Ok(None);
        }
        Outcome::Crashed => {
            tracing::warn!(line, pid = slot.info.process_id, "Process crashed while executing line");
            if !dispatch.manager.log_process_errors(index) {
                tracing::warn!(line, "No error logs were found for the crashed process");
            }
            LineError::ProcessCrash { line_number: line }
        }
        Outcome::TimedOut => dispatch.classify_timeout(line, timeout),
        Outcome::Unexpected(message) => {
            tracing::error!(line, error = %message, "Unexpected error while monitoring line execution");
            LineError::Unexpected {
                line_number: line,
                message,
            }
        }
    };

    tracing::warn!(line, error_type = error.error_type(), "{}", error);
    let failed = failed_line_result(dispatch, &task, start_time, &error, returned);
    finish(dispatch, index, &task, failed, &label);

    let _ = slot.channel.send(&WorkerCommand::Terminate);
    dispatch.manager.restart_process(index)?;
    Ok(Some(dispatch.manager.attach(index)?))
}

fn poll_outcome(
    dispatch: &Dispatch,
    slot: &WorkerSlot,
    deadline: Instant,
    returned: &mut BTreeMap<String, RunInfo>,
) -> Outcome {
    loop {
        if dispatch.closing.load(Ordering::SeqCst) {
            return Outcome::Abandoned;
        }
        if !dispatch.manager.is_process_alive(slot.info.process_id) {
            return Outcome::Crashed;
        }
        let now = Instant::now();
        if now >= deadline {
            return Outcome::TimedOut;
        }

        match slot.channel.recv_timeout((deadline - now).min(POLL_INTERVAL)) {
            Ok(WorkerResponse::LineResult { result_json }) => {
                return match decode_json::<LineResult>(&result_json) {
                    Ok(result) => Outcome::Completed(Box::new(result)),
                    Err(e) => Outcome::Unexpected(e.to_string()),
                };
            }
            Ok(WorkerResponse::NodeRun { run_info_json }) => {
                match decode_json::<RunInfo>(&run_info_json) {
                    Ok(info) => {
                        if let Err(e) = dispatch.storage.persist_node_run(&info) {
                            tracing::warn!(run_id = %info.run_id, error = %e, "Failed to persist node run");
                        }
                        returned.insert(info.node.clone(), info);
                    }
                    Err(e) => tracing::warn!(error = %e, "Dropping undecodable node run"),
                }
            }
            Ok(WorkerResponse::FlowRun { run_info_json }) => {
                match decode_json::<FlowRunInfo>(&run_info_json) {
                    Ok(info) => {
                        if let Err(e) = dispatch.storage.persist_flow_run(&info) {
                            tracing::warn!(run_id = %info.run_id, error = %e, "Failed to persist flow run");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Dropping undecodable flow run"),
                }
            }
            Ok(WorkerResponse::Error { message }) => {
                tracing::warn!(pid = slot.info.process_id, "Worker reported an error: {message}");
            }
            Ok(other) => tracing::debug!(response = ?other, "Ignoring worker response"),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return Outcome::Crashed,
        }
    }
}

/// Failed result for a line the worker never finished.
///
/// Node runs received so far are kept; those still running are canceled.
fn failed_line_result(
    dispatch: &Dispatch,
    task: &Task,
    start_time: DateTime<Utc>,
    error: &LineError,
    returned: BTreeMap<String, RunInfo>,
) -> LineResult {
    let tracker = RunTracker::new(dispatch.storage.clone());
    for info in returned.into_values() {
        tracker.register_node_run(info);
    }
    tracker.cancel_node_runs(Some(&task.run_id), &error.to_string());

    let mut result = LineResult::failed(
        &dispatch.flow_id,
        &task.run_id,
        task.line_index,
        task.inputs.clone(),
        error.to_error_info(),
    );
    result.run_info.start_time = start_time;
    result.node_run_infos = tracker
        .collect_child_node_runs(&line_run_id(&task.run_id, task.line_index))
        .into_iter()
        .map(|info| (info.node.clone(), info))
        .collect();
    tracker.persist_flow_run(&result.run_info);
    result
}

fn finish(dispatch: &Dispatch, index: usize, task: &Task, result: LineResult, label: &ProcessLabel) {
    let status = result.status();
    dispatch.results.insert(&task.request_id, result);
    dispatch.processing.lock().remove(&index);
    dispatch
        .completed
        .lock()
        .insert(task.line_index, label.clone());
    tracing::info!(
        "Process name({})-Line number({}) completed with status {}.",
        label,
        task.line_index,
        status
    );
}
