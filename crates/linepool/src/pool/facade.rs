//! The public pool API.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use linepool_core::{LineResult, RunStorage, RunTracker};
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::config::PoolConfig;
use crate::error::{PoolError, Result};
use crate::ipc::ProcessInfo;
use crate::process::ProcessManager;

use super::dispatcher::{Dispatch, monitor_slot};
use super::queue::{ResultTable, Task, TaskMessage, TaskQueue};

/// Extra wait on top of the line timeout in `submit()`.
const SUBMIT_BUFFER: Duration = Duration::from_secs(20);
/// How long `run()` waits for monitors to drain after a batch timeout.
const THREAD_TERMINATED_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_secs(1);

struct Monitor {
    index: usize,
    handle: Option<JoinHandle<Result<()>>>,
}

struct Running {
    dispatch: Arc<Dispatch>,
    monitors: Mutex<Vec<Monitor>>,
    log_dir: PathBuf,
    remove_log_dir: bool,
}

/// Runs lines of one flow on a pool of worker processes.
///
/// ```no_run
/// # use linepool::{LinePool, PoolConfig};
/// # use linepool_core::{FlowCreateArgs, MemoryRunStorage};
/// # use std::sync::Arc;
/// let config = PoolConfig::new(FlowCreateArgs::new("echo", "."));
/// let mut pool = LinePool::new(config, Arc::new(MemoryRunStorage::new()), 2);
/// pool.start()?;
/// let mut line = serde_json::Map::new();
/// line.insert("text".into(), "hello".into());
/// let results = pool.run(vec![(0, line)])?;
/// pool.close()?;
/// # Ok::<(), linepool::PoolError>(())
/// ```
pub struct LinePool {
    config: PoolConfig,
    storage: Arc<dyn RunStorage>,
    worker_count: usize,
    running: Option<Running>,
}

impl LinePool {
    /// Create a pool sized for a batch of `nlines` lines. Nothing starts yet.
    pub fn new(config: PoolConfig, storage: Arc<dyn RunStorage>, nlines: usize) -> Self {
        let worker_count = config.resolve_worker_count(nlines);
        Self {
            config,
            storage,
            worker_count,
            running: None,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Start the workers and their monitor threads.
    ///
    /// Fails with [`PoolError::Startup`] if any worker is not ready in time;
    /// every process started so far is killed.
    pub fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }

        let program = self.config.resolve_worker_program()?;
        let (log_dir, remove_log_dir) = match &self.config.log_dir {
            Some(dir) => (dir.clone(), false),
            None => (
                std::env::temp_dir().join(format!("linepool-{}", uuid::Uuid::new_v4())),
                true,
            ),
        };

        let mut flow = self.config.flow.clone();
        flow.raise_ex = false;

        tracing::info!(
            workers = self.worker_count,
            method = %self.config.start_method,
            program = %program.display(),
            log_dir = %log_dir.display(),
            "Starting line execution pool"
        );

        let manager = ProcessManager::new(
            self.config.start_method,
            self.worker_count,
            program,
            log_dir.clone(),
            &flow,
            self.config.startup_timeout,
        )?;
        if let Err(e) = manager
            .start_processes()
            .and_then(|()| manager.ensure_healthy())
        {
            manager.shutdown();
            if remove_log_dir {
                let _ = std::fs::remove_dir_all(&log_dir);
            }
            return Err(e);
        }

        let dispatch = Arc::new(Dispatch {
            tasks: TaskQueue::default(),
            results: ResultTable::default(),
            manager,
            storage: self.storage.clone(),
            flow_id: flow.flow.clone(),
            line_timeout: self.config.line_timeout,
            batch_timeout: self.config.batch_timeout,
            monitor_buffer: self.config.monitor_buffer,
            batch_start: Mutex::new(None),
            is_timeout: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            processing: Mutex::new(BTreeMap::new()),
            completed: Mutex::new(BTreeMap::new()),
        });

        let mut monitors = Vec::with_capacity(self.worker_count);
        for index in 0..self.worker_count {
            let thread_dispatch = dispatch.clone();
            let spawned = thread::Builder::new()
                .name(format!("linepool-monitor-{index}"))
                .spawn(move || {
                    let result = monitor_slot(thread_dispatch, index);
                    if let Err(e) = &result {
                        tracing::error!(slot = index, error = %e, "Monitor thread failed");
                    }
                    result
                });
            match spawned {
                Ok(handle) => monitors.push(Monitor {
                    index,
                    handle: Some(handle),
                }),
                Err(e) => {
                    let running = Running {
                        dispatch,
                        monitors: Mutex::new(monitors),
                        log_dir,
                        remove_log_dir,
                    };
                    shutdown(running);
                    return Err(e.into());
                }
            }
        }

        self.running = Some(Running {
            dispatch,
            monitors: Mutex::new(monitors),
            log_dir,
            remove_log_dir,
        });
        Ok(())
    }

    /// Execute a single line and wait for its result.
    ///
    /// `None` if no result arrived within the line timeout plus a buffer.
    pub fn submit(
        &self,
        run_id: &str,
        line_index: usize,
        inputs: Map<String, Value>,
    ) -> Result<Option<LineResult>> {
        let running = self.running.as_ref().ok_or(PoolError::NotRunning)?;
        let dispatch = &running.dispatch;

        let task = Task::new(run_id, line_index, inputs);
        let request_id = task.request_id.clone();
        dispatch.tasks.push(TaskMessage::Line(task));

        let deadline = Instant::now() + self.config.line_timeout + SUBMIT_BUFFER;
        loop {
            if let Some(result) = dispatch.results.take(&request_id) {
                return Ok(Some(result));
            }
            running.check_monitors()?;
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(line = line_index, "No result for the submitted line");
                return Ok(None);
            }
            dispatch.results.wait_changed((deadline - now).min(POLL_INTERVAL));
        }
    }

    /// Execute a batch of `(line_index, inputs)` pairs.
    ///
    /// Results come back ordered by line index. On a batch timeout the lines
    /// finished so far are returned and [`LinePool::is_timeout`] is set.
    pub fn run(&self, batch_inputs: Vec<(usize, Map<String, Value>)>) -> Result<Vec<LineResult>> {
        let running = self.running.as_ref().ok_or(PoolError::NotRunning)?;
        let dispatch = &running.dispatch;

        let total = batch_inputs.len();
        let start = Instant::now();
        dispatch.results.reset();
        dispatch.is_timeout.store(false, Ordering::SeqCst);
        *dispatch.batch_start.lock() = Some(start);

        for (line_index, inputs) in batch_inputs {
            dispatch
                .tasks
                .push(TaskMessage::Line(Task::new(&self.config.run_id, line_index, inputs)));
        }

        let batch_deadline = self
            .config
            .batch_timeout
            .map(|timeout| start + timeout + self.config.monitor_buffer);
        let mut last_log = Instant::now();
        let mut timed_out = false;
        loop {
            let finished = dispatch.results.len();
            if finished >= total {
                break;
            }
            if batch_deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                timed_out = true;
                break;
            }
            if last_log.elapsed() >= self.config.log_interval {
                log_progress(dispatch, start, finished, total);
                last_log = Instant::now();
            }
            if let Err(e) = running.check_monitors() {
                *dispatch.batch_start.lock() = None;
                return Err(e);
            }
            dispatch.results.wait_changed(POLL_INTERVAL);
        }

        if timed_out {
            let abandoned = dispatch.tasks.discard_lines();
            if abandoned > 0 {
                tracing::warn!("{abandoned} pending lines were abandoned by the batch timeout.");
            }
            running.terminate_monitors();
            running.join_finished_within(THREAD_TERMINATED_TIMEOUT);
            dispatch.results.seal();
            dispatch.is_timeout.store(true, Ordering::SeqCst);
            tracing::warn!(
                "The batch run timed out, with {} line results processed out of {}.",
                dispatch.results.len(),
                total
            );
        }

        let results = dispatch.results.drain_sorted();
        self.persist_status_summary(&results);
        // Lines submitted after this batch get the plain line timeout.
        *dispatch.batch_start.lock() = None;
        tracing::info!(
            "Finished {} / {} lines in {:.2}s.",
            results.len(),
            total,
            start.elapsed().as_secs_f64()
        );
        Ok(results)
    }

    /// Whether the last `run()` hit the batch timeout.
    pub fn is_timeout(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| running.dispatch.is_timeout.load(Ordering::SeqCst))
    }

    /// Current slot to process bindings.
    pub fn process_infos(&self) -> Vec<ProcessInfo> {
        self.running
            .as_ref()
            .map(|running| running.dispatch.manager.process_infos())
            .unwrap_or_default()
    }

    /// Stop monitors and workers and discard transient logs. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if let Some(running) = self.running.take() {
            shutdown(running);
        }
        Ok(())
    }

    fn persist_status_summary(&self, results: &[LineResult]) {
        let tracker = RunTracker::new(self.storage.clone());
        for result in results {
            tracker.register_flow_run(result.run_info.clone());
            for info in result.node_run_infos.values() {
                tracker.register_node_run(info.clone());
            }
        }
        let summary = tracker.get_status_summary(&self.config.run_id);
        tracker.persist_status_summary(&summary, &self.config.run_id);
    }
}

impl Drop for LinePool {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl Running {
    /// Surface the first monitor thread that stopped with an error.
    fn check_monitors(&self) -> Result<()> {
        let mut monitors = self.monitors.lock();
        for monitor in monitors.iter_mut() {
            if !monitor.handle.as_ref().is_some_and(JoinHandle::is_finished) {
                continue;
            }
            let Some(handle) = monitor.handle.take() else {
                continue;
            };
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(PoolError::ThreadCrash(e.to_string())),
                Err(_) => {
                    return Err(PoolError::ThreadCrash(format!(
                        "monitor thread of slot {} panicked",
                        monitor.index
                    )));
                }
            }
        }
        Ok(())
    }

    /// One terminate marker per monitor still running.
    fn terminate_monitors(&self) {
        let alive = self
            .monitors
            .lock()
            .iter()
            .filter(|monitor| monitor.handle.as_ref().is_some_and(|h| !h.is_finished()))
            .count();
        for _ in 0..alive {
            self.dispatch.tasks.push(TaskMessage::Terminate);
        }
    }

    fn join_finished_within(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            let pending = self
                .monitors
                .lock()
                .iter()
                .filter(|monitor| monitor.handle.as_ref().is_some_and(|h| !h.is_finished()))
                .count();
            if pending == 0 {
                return;
            }
            if Instant::now() >= deadline {
                tracing::warn!(pending, "Monitor threads still running after the grace period");
                return;
            }
            thread::sleep(Duration::from_millis(100));
        }
    }
}

fn shutdown(running: Running) {
    let dispatch = &running.dispatch;
    dispatch.closing.store(true, Ordering::SeqCst);
    running.terminate_monitors();

    let monitors = std::mem::take(&mut *running.monitors.lock());
    for monitor in monitors {
        let Some(handle) = monitor.handle else {
            continue;
        };
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(slot = monitor.index, error = %e, "Monitor thread failed"),
            Err(_) => tracing::warn!(slot = monitor.index, "Monitor thread panicked"),
        }
    }

    dispatch.manager.shutdown();
    dispatch.results.reset();
    if running.remove_log_dir
        && let Err(e) = std::fs::remove_dir_all(&running.log_dir)
    {
        tracing::debug!(log_dir = %running.log_dir.display(), error = %e, "Failed to remove log directory");
    }
    tracing::info!("Line execution pool closed");
}

fn log_progress(dispatch: &Dispatch, start: Instant, finished: usize, total: usize) {
    let elapsed = start.elapsed().as_secs_f64();
    if finished > 0 {
        let average = elapsed / finished as f64;
        tracing::info!(
            "Finished {} / {} lines. Average execution time for completed lines: {:.2} seconds. \
             Estimated time for incomplete lines: {:.2} seconds.",
            finished,
            total,
            average,
            average * (total - finished) as f64
        );
    } else {
        tracing::info!("Finished 0 / {} lines.", total);
    }

    let workers = dispatch.manager.worker_count();
    let active = dispatch
        .manager
        .process_infos()
        .iter()
        .filter(|info| dispatch.manager.is_process_alive(info.process_id))
        .count();
    let processing = dispatch.processing.lock();
    let completed = dispatch.completed.lock().len();
    let pending = dispatch.tasks.len();
    tracing::info!("[Process Pool] [Active processes: {} / {}]", active, workers);
    tracing::info!(
        "[Lines] [Finished: {}] [Processing: {}] [Pending: {}]",
        completed,
        processing.len(),
        pending
    );
    for (line, label) in processing.values() {
        tracing::info!("Process {} is processing line {}.", label, line);
    }
}
