//! Creation, supervision and teardown of worker processes.
//!
//! Each slot index is bound to at most one process at a time. A restart bumps
//! the slot's generation, so a late connection from the old process is
//! refused by the broker.

use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use linepool_core::FlowCreateArgs;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::config::StartMethod;
use crate::error::{PoolError, Result};
use crate::ipc::{
    Broker, ControlSignal, ProcessInfo, Readiness, WorkerSlot, encode_json, write_message,
};

use super::{logs, os};

const PROCESS_TERMINATED_TIMEOUT: Duration = Duration::from_secs(60);
const PROCESS_INFO_OBTAINED_TIMEOUT: Duration = Duration::from_secs(60);
const GRACEFUL_EXIT_TIMEOUT: Duration = Duration::from_secs(10);
const FORK_SERVER_EXIT_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The control process that forks workers on request.
struct ForkServer {
    child: Child,
    stdin: BufWriter<ChildStdin>,
}

impl ForkServer {
    fn send(&mut self, signal: &ControlSignal) -> Result<()> {
        write_message(&mut self.stdin, signal)
    }
}

pub struct ProcessManager {
    method: StartMethod,
    worker_count: usize,
    program: PathBuf,
    log_dir: PathBuf,
    flow_json: Vec<u8>,
    broker: Broker,
    generations: Mutex<Vec<u64>>,
    /// Spawned workers by slot. Forked workers are children of the fork server.
    children: Mutex<FxHashMap<usize, Child>>,
    fork_server: Mutex<Option<ForkServer>>,
    started: AtomicUsize,
    startup_timeout: Duration,
}

impl ProcessManager {
    pub fn new(
        method: StartMethod,
        worker_count: usize,
        program: PathBuf,
        log_dir: PathBuf,
        flow: &FlowCreateArgs,
        startup_timeout: Duration,
    ) -> Result<Self> {
        let method = if method == StartMethod::Fork && !cfg!(unix) {
            tracing::warn!("The fork start method is not available on this platform, using spawn");
            StartMethod::Spawn
        } else {
            method
        };

        std::fs::create_dir_all(&log_dir)?;
        let flow_json = encode_json(flow)?;
        let broker = Broker::bind(flow_json.clone(), startup_timeout)?;

        Ok(Self {
            method,
            worker_count,
            program,
            log_dir,
            flow_json,
            broker,
            generations: Mutex::new(vec![0; worker_count]),
            children: Mutex::new(FxHashMap::default()),
            fork_server: Mutex::new(None),
            started: AtomicUsize::new(0),
            startup_timeout,
        })
    }

    pub fn method(&self) -> StartMethod {
        self.method
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Launch one worker per slot (and the fork server first, in fork mode).
    pub fn start_processes(&self) -> Result<()> {
        if self.method == StartMethod::Fork {
            self.start_fork_server()?;
        }
        for index in 0..self.worker_count {
            self.new_process(index)?;
        }
        Ok(())
    }

    /// Wait until every slot has completed its handshake.
    pub fn ensure_healthy(&self) -> Result<()> {
        let deadline = Instant::now() + self.startup_timeout;
        for index in 0..self.worker_count {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let ready = self.await_ready(index, remaining).inspect_err(|_| {
                self.log_process_errors(index);
            })?;
            if ready.is_none() {
                return Err(self.startup_failure(
                    index,
                    format!(
                        "worker {index} was not ready within {}s",
                        self.startup_timeout.as_secs()
                    ),
                ));
            }
        }
        tracing::info!(
            workers = self.worker_count,
            method = %self.method,
            "All worker processes are ready"
        );
        Ok(())
    }

    /// Whether `pid` is still running. Spawned children are checked through
    /// their handle, which also reaps them.
    pub fn is_process_alive(&self, pid: u32) -> bool {
        {
            let mut children = self.children.lock();
            if let Some(child) = children.values_mut().find(|child| child.id() == pid) {
                return matches!(child.try_wait(), Ok(None));
            }
        }
        os::pid_alive(pid)
    }

    /// The slot's current process, once it is ready.
    pub fn get_process_info(&self, index: usize) -> Result<ProcessInfo> {
        self.await_ready(index, PROCESS_INFO_OBTAINED_TIMEOUT)?
            .ok_or(PoolError::ProcessInfoObtainedTimeout {
                index,
                timeout: PROCESS_INFO_OBTAINED_TIMEOUT.as_secs(),
            })
    }

    /// Claim the slot's private channel for a monitor thread.
    pub fn attach(&self, index: usize) -> Result<WorkerSlot> {
        let info = self.get_process_info(index)?;
        let channel = self.broker.take_channel(index).ok_or_else(|| {
            PoolError::Unexpected(format!("the channel of slot {index} was already claimed"))
        })?;
        Ok(WorkerSlot { info, channel })
    }

    /// Kill the slot's process, confirm it is gone, and start a replacement.
    pub fn restart_process(&self, index: usize) -> Result<ProcessInfo> {
        let old_pid = self
            .broker
            .forget(index)
            .map(|info| info.process_id)
            .or_else(|| self.children.lock().get(&index).map(Child::id));

        self.kill_slot(index, old_pid);
        if let Some(pid) = old_pid {
            self.ensure_process_terminated_within_timeout(pid)?;
        }

        self.new_process(index)?;
        let info = self.get_process_info(index)?;
        tracing::info!(
            slot = index,
            old_pid = ?old_pid,
            pid = info.process_id,
            name = %info.process_name,
            "Process restarted"
        );
        Ok(info)
    }

    /// Retire a slot: give its process time to exit on its own, then kill it.
    pub fn end_process(&self, index: usize) {
        let info = self.broker.forget(index);
        let child = self.children.lock().remove(&index);

        if let Some(mut child) = child {
            let deadline = Instant::now() + GRACEFUL_EXIT_TIMEOUT;
            loop {
                match child.try_wait() {
                    Ok(Some(_)) => return,
                    Ok(None) if Instant::now() < deadline => thread::sleep(POLL_INTERVAL),
                    _ => break,
                }
            }
            tracing::warn!(
                slot = index,
                pid = child.id(),
                "Process did not exit within {}s, killing it",
                GRACEFUL_EXIT_TIMEOUT.as_secs()
            );
            let _ = child.kill();
            let _ = child.wait();
            return;
        }

        let Some(info) = info else { return };
        let deadline = Instant::now() + GRACEFUL_EXIT_TIMEOUT;
        while os::pid_alive(info.process_id) {
            if Instant::now() >= deadline {
                tracing::warn!(
                    slot = index,
                    pid = info.process_id,
                    "Process did not exit within {}s, killing it",
                    GRACEFUL_EXIT_TIMEOUT.as_secs()
                );
                if let Err(e) = os::force_kill(info.process_id) {
                    tracing::warn!(pid = info.process_id, error = %e, "Failed to kill process");
                }
                return;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn ensure_process_terminated_within_timeout(&self, pid: u32) -> Result<()> {
        let deadline = Instant::now() + PROCESS_TERMINATED_TIMEOUT;
        while self.is_process_alive(pid) {
            if Instant::now() >= deadline {
                return Err(PoolError::ProcessTerminatedTimeout {
                    pid,
                    timeout: PROCESS_TERMINATED_TIMEOUT.as_secs(),
                });
            }
            thread::sleep(POLL_INTERVAL);
        }
        Ok(())
    }

    /// Kill every worker still alive, including ones orphaned by a crashed
    /// monitor thread.
    pub fn ensure_all_processes_terminated(&self) {
        let children: Vec<(usize, Child)> = self.children.lock().drain().collect();
        for (index, mut child) in children {
            if matches!(child.try_wait(), Ok(None)) {
                tracing::warn!(slot = index, pid = child.id(), "Killing leftover worker process");
                let _ = child.kill();
            }
            let _ = child.wait();
        }

        for info in self.broker.process_infos() {
            self.broker.forget(info.index);
            if os::pid_alive(info.process_id) {
                tracing::warn!(
                    slot = info.index,
                    pid = info.process_id,
                    "Killing leftover worker process"
                );
                if let Err(e) = os::force_kill(info.process_id) {
                    tracing::warn!(pid = info.process_id, error = %e, "Failed to kill process");
                }
            }
        }
    }

    /// Current slot bindings, ordered by slot.
    pub fn process_infos(&self) -> Vec<ProcessInfo> {
        self.broker.process_infos()
    }

    /// Re-log the stderr of the process serving `index`.
    pub fn log_process_errors(&self, index: usize) -> bool {
        match self.method {
            StartMethod::Spawn => logs::log_errors_from_file(&logs::worker_log_path(&self.log_dir, index)),
            StartMethod::Fork => logs::log_errors_from_file(&logs::manager_log_path(&self.log_dir)),
        }
    }

    /// Tear everything down: workers, fork server, broker. Idempotent.
    pub fn shutdown(&self) {
        self.ensure_all_processes_terminated();

        if let Some(mut server) = self.fork_server.lock().take() {
            let _ = server.send(&ControlSignal::Shutdown);
            let deadline = Instant::now() + FORK_SERVER_EXIT_TIMEOUT;
            loop {
                match server.child.try_wait() {
                    Ok(Some(_)) => break,
                    Ok(None) if Instant::now() < deadline => thread::sleep(POLL_INTERVAL),
                    _ => {
                        tracing::warn!(pid = server.child.id(), "Killing fork server");
                        let _ = server.child.kill();
                        let _ = server.child.wait();
                        break;
                    }
                }
            }
        }

        self.broker.shutdown();
    }

    fn start_fork_server(&self) -> Result<()> {
        let log = logs::open_log(&logs::manager_log_path(&self.log_dir))?;
        let mut child = Command::new(&self.program)
            .arg("--fork-server")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log))
            .spawn()
            .map_err(|e| {
                PoolError::Startup(format!(
                    "Failed to spawn fork server '{}': {}",
                    self.program.display(),
                    e
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PoolError::Startup("Failed to get fork server stdin".to_string()))?;
        let mut server = ForkServer {
            child,
            stdin: BufWriter::new(stdin),
        };

        let configured = server.send(&ControlSignal::Configure {
            broker_addr: self.broker.addr().to_string(),
            token: self.broker.token().to_string(),
            flow_json: self.flow_json.clone(),
        });
        let pid = server.child.id();
        // Keep the handle even on failure so shutdown() reaps it.
        *self.fork_server.lock() = Some(server);
        configured?;

        tracing::info!(pid, "Fork server started");
        Ok(())
    }

    fn new_process(&self, index: usize) -> Result<()> {
        let generation = {
            let mut generations = self.generations.lock();
            let slot = generations.get_mut(index).ok_or_else(|| {
                PoolError::Unexpected(format!("slot {index} is out of range"))
            })?;
            *slot += 1;
            *slot
        };
        let number = self.started.fetch_add(1, Ordering::SeqCst) + 1;
        let name = match self.method {
            StartMethod::Fork => format!("ForkProcess-{number}"),
            StartMethod::Spawn => format!("SpawnProcess-{number}"),
        };
        self.broker.expect(index, generation, name.clone());

        match self.method {
            StartMethod::Spawn => {
                let log = logs::open_log(&logs::worker_log_path(&self.log_dir, index))?;
                let child = Command::new(&self.program)
                    .arg("--broker")
                    .arg(self.broker.addr().to_string())
                    .arg("--token")
                    .arg(self.broker.token())
                    .arg("--slot")
                    .arg(index.to_string())
                    .arg("--generation")
                    .arg(generation.to_string())
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::from(log))
                    .spawn()
                    .map_err(|e| {
                        PoolError::Startup(format!(
                            "Failed to spawn worker process '{}': {}",
                            self.program.display(),
                            e
                        ))
                    })?;
                tracing::debug!(slot = index, pid = child.id(), name = %name, "Spawned worker");
                self.children.lock().insert(index, child);
            }
            StartMethod::Fork => {
                let mut server = self.fork_server.lock();
                let server = server
                    .as_mut()
                    .ok_or_else(|| PoolError::Startup("the fork server is not running".to_string()))?;
                server.send(&ControlSignal::Start {
                    slot: index as u64,
                    generation,
                })?;
                tracing::debug!(slot = index, generation, name = %name, "Requested forked worker");
            }
        }
        Ok(())
    }

    /// Poll the slot until ready. `Ok(None)` on timeout.
    fn await_ready(&self, index: usize, timeout: Duration) -> Result<Option<ProcessInfo>> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.broker.wait_ready(index, POLL_INTERVAL) {
                Readiness::Ready(info) => return Ok(Some(info)),
                Readiness::Failed(message) => {
                    return Err(PoolError::Startup(format!(
                        "worker {index} failed to initialize: {message}"
                    )));
                }
                Readiness::Pending => {}
            }
            self.check_fork_server()?;
            if let Some(status) = self.exited_child(index) {
                return Err(PoolError::Startup(format!(
                    "worker {index} exited with {status} before becoming ready"
                )));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    fn check_fork_server(&self) -> Result<()> {
        let mut server = self.fork_server.lock();
        if let Some(server) = server.as_mut()
            && !matches!(server.child.try_wait(), Ok(None))
        {
            logs::log_errors_from_file(&logs::manager_log_path(&self.log_dir));
            return Err(PoolError::Startup(
                "The fork server exited unexpectedly".to_string(),
            ));
        }
        Ok(())
    }

    fn exited_child(&self, index: usize) -> Option<ExitStatus> {
        self.children
            .lock()
            .get_mut(&index)
            .and_then(|child| child.try_wait().ok().flatten())
    }

    fn kill_slot(&self, index: usize, pid: Option<u32>) {
        let child = self.children.lock().remove(&index);
        if let Some(mut child) = child {
            if let Err(e) = child.kill() {
                tracing::debug!(slot = index, error = %e, "Worker already exited");
            }
            let _ = child.wait();
            return;
        }
        if let Some(pid) = pid
            && let Err(e) = os::force_kill(pid)
        {
            tracing::warn!(slot = index, pid, error = %e, "Failed to kill process");
        }
    }

    fn startup_failure(&self, index: usize, message: String) -> PoolError {
        self.log_process_errors(index);
        PoolError::Startup(message)
    }
}

impl Drop for ProcessManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
