//! Pool configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use linepool_core::FlowCreateArgs;

use crate::error::{PoolError, Result};

/// Default upper bound on workers when no explicit count is configured.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Environment variable naming the worker program.
pub const WORKER_PATH_ENV: &str = "LINEPOOL_WORKER_PATH";

const WORKER_BINARY: &str = if cfg!(windows) {
    "linepool-worker.exe"
} else {
    "linepool-worker"
};

/// How worker processes are created. Chosen once per pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMethod {
    /// Copy-on-write children of a control process that built the executor once.
    Fork,
    /// A fresh process per slot, building its own executor.
    Spawn,
}

impl Default for StartMethod {
    fn default() -> Self {
        if cfg!(unix) {
            StartMethod::Fork
        } else {
            StartMethod::Spawn
        }
    }
}

impl FromStr for StartMethod {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fork" => Ok(StartMethod::Fork),
            "spawn" => Ok(StartMethod::Spawn),
            other => Err(PoolError::Config(format!(
                "unknown start method '{other}', expected 'fork' or 'spawn'"
            ))),
        }
    }
}

impl std::fmt::Display for StartMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartMethod::Fork => write!(f, "fork"),
            StartMethod::Spawn => write!(f, "spawn"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Explicit worker count. `None` (or zero) derives it from the batch size.
    pub worker_count: Option<usize>,
    pub line_timeout: Duration,
    /// Wall-clock budget for a whole `run()`.
    pub batch_timeout: Option<Duration>,
    pub start_method: StartMethod,
    /// Worker executable. Located automatically when unset.
    pub worker_program: Option<PathBuf>,
    /// Recipe each worker uses to build its executor.
    pub flow: FlowCreateArgs,
    /// Batch run id used by `run()`.
    pub run_id: String,
    /// Slack on top of a line's timeout so the worker can report its own timeout.
    pub monitor_buffer: Duration,
    pub startup_timeout: Duration,
    /// Interval between progress logs during `run()`.
    pub log_interval: Duration,
    /// Directory for worker stderr logs. A temporary directory when unset.
    pub log_dir: Option<PathBuf>,
}

impl PoolConfig {
    pub fn new(flow: FlowCreateArgs) -> Self {
        Self {
            worker_count: None,
            line_timeout: Duration::from_secs(600),
            batch_timeout: None,
            start_method: StartMethod::default(),
            worker_program: None,
            flow,
            run_id: uuid::Uuid::new_v4().to_string(),
            monitor_buffer: Duration::from_secs(10),
            startup_timeout: Duration::from_secs(60),
            log_interval: Duration::from_secs(60),
            log_dir: None,
        }
    }

    /// Apply `LINEPOOL_*` environment variables on top of this config.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(value) = lookup("LINEPOOL_WORKER_COUNT") {
            self.worker_count = Some(parse_number("LINEPOOL_WORKER_COUNT", &value)?);
        }
        if let Some(value) = lookup("LINEPOOL_LINE_TIMEOUT_SEC") {
            self.line_timeout =
                Duration::from_secs(parse_number("LINEPOOL_LINE_TIMEOUT_SEC", &value)?);
        }
        if let Some(value) = lookup("LINEPOOL_BATCH_TIMEOUT_SEC") {
            self.batch_timeout = Some(Duration::from_secs(parse_number(
                "LINEPOOL_BATCH_TIMEOUT_SEC",
                &value,
            )?));
        }
        if let Some(value) = lookup("LINEPOOL_START_METHOD") {
            self.start_method = value.parse()?;
        }
        Ok(self)
    }

    /// Number of workers to start for a batch of `nlines` lines.
    ///
    /// An explicit count wins (with a warning when it exceeds what memory
    /// allows for spawned workers). Otherwise the smallest of the default,
    /// the line count and the memory estimate, and at least one.
    pub fn resolve_worker_count(&self, nlines: usize) -> usize {
        let estimated = match self.start_method {
            StartMethod::Spawn => estimated_max_workers(),
            StartMethod::Fork => None,
        };

        if let Some(explicit) = self.worker_count.filter(|&n| n > 0) {
            if let Some(estimated) = estimated
                && explicit > estimated
            {
                tracing::warn!(
                    worker_count = explicit,
                    estimated,
                    "The configured worker count exceeds the estimated capacity of available memory. \
                     Processes may be killed by the OS if memory runs out."
                );
            }
            return explicit;
        }

        let mut count = DEFAULT_WORKER_COUNT.min(nlines);
        if let Some(estimated) = estimated {
            count = count.min(estimated);
        }
        count.max(1)
    }

    /// Locate the worker executable.
    ///
    /// Looks in the following order:
    /// 1. `worker_program` in this config (a path, or a name on `PATH`)
    /// 2. `LINEPOOL_WORKER_PATH` environment variable
    /// 3. Same directory as the current executable
    /// 4. System PATH
    pub fn resolve_worker_program(&self) -> Result<PathBuf> {
        if let Some(program) = &self.worker_program {
            if program.exists() {
                return Ok(program.clone());
            }
            return which::which(program).map_err(|e| {
                PoolError::Config(format!(
                    "worker program '{}' not found: {e}",
                    program.display()
                ))
            });
        }

        if let Ok(path) = std::env::var(WORKER_PATH_ENV) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Ok(path);
            }
        }

        if let Ok(exe_path) = std::env::current_exe()
            && let Some(exe_dir) = exe_path.parent()
        {
            let worker_path = exe_dir.join(WORKER_BINARY);
            if worker_path.exists() {
                return Ok(worker_path);
            }
        }

        if let Ok(path) = which::which(WORKER_BINARY) {
            return Ok(path);
        }

        Err(PoolError::Config(format!(
            "Could not find {WORKER_BINARY}. Set {WORKER_PATH_ENV} or ensure it's in PATH."
        )))
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| PoolError::Config(format!("{key} must be a non-negative integer, got '{value}'")))
}

/// How many copies of this process fit into available memory.
#[cfg(target_os = "linux")]
fn estimated_max_workers() -> Option<usize> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let available_kb: u64 = meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemAvailable:"))?
        .split_whitespace()
        .next()?
        .parse()
        .ok()?;

    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    // SAFETY: sysconf has no preconditions.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 || resident_pages == 0 {
        return None;
    }
    let rss_kb = resident_pages * page_size as u64 / 1024;

    let estimated = (available_kb / rss_kb.max(1)) as usize;
    tracing::debug!(available_kb, rss_kb, estimated, "Estimated worker capacity");
    Some(estimated.max(1))
}

#[cfg(not(target_os = "linux"))]
fn estimated_max_workers() -> Option<usize> {
    None
}
