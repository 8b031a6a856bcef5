//! Shared helpers for pool tests driving the real worker binary.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use linepool::{LinePool, PoolConfig, ProcessInfo, StartMethod};
use linepool_core::{FlowCreateArgs, MemoryRunStorage};
use serde_json::{Map, Value, json};

pub fn worker_program() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_linepool-worker"))
}

pub fn config(flow: &str, workers: usize, method: StartMethod, working_dir: &Path) -> PoolConfig {
    let mut config = PoolConfig::new(FlowCreateArgs::new(flow, working_dir));
    config.worker_count = Some(workers);
    config.start_method = method;
    config.worker_program = Some(worker_program());
    config.startup_timeout = Duration::from_secs(30);
    config.monitor_buffer = Duration::from_secs(1);
    config.log_dir = Some(working_dir.join("logs"));
    config
}

pub fn start(config: PoolConfig, nlines: usize) -> (LinePool, Arc<MemoryRunStorage>) {
    let storage = Arc::new(MemoryRunStorage::new());
    let mut pool = LinePool::new(config, storage.clone(), nlines);
    pool.start().expect("pool starts");
    (pool, storage)
}

pub fn echo_line(text: &str) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("text".into(), json!(text));
    map
}

pub fn demo_line(text: &str, sleep_ms: u64, crash: bool) -> Map<String, Value> {
    let mut map = echo_line(text);
    map.insert("sleep_ms".into(), json!(sleep_ms));
    map.insert("crash".into(), json!(crash));
    map
}

pub fn pid_of(pool: &LinePool, index: usize) -> Option<u32> {
    pool.process_infos()
        .into_iter()
        .find(|info| info.index == index)
        .map(|info| info.process_id)
}

/// Wait until slot `index` is bound to a process other than `old_pid`.
pub fn wait_for_replacement(pool: &LinePool, index: usize, old_pid: u32) -> Option<ProcessInfo> {
    let deadline = Instant::now() + Duration::from_secs(30);
    while Instant::now() < deadline {
        if let Some(info) = pool
            .process_infos()
            .into_iter()
            .find(|info| info.index == index && info.process_id != old_pid)
        {
            return Some(info);
        }
        thread::sleep(Duration::from_millis(100));
    }
    None
}

#[cfg(unix)]
pub fn kill(pid: u32) {
    // SAFETY: plain signal delivery to a worker this test started.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
    assert_eq!(rc, 0, "failed to kill worker {pid}");
}
