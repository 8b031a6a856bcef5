//! Worker stderr log files.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

/// Error lines re-logged per crash.
const MAX_REPORTED_LINES: usize = 50;

pub fn worker_log_path(log_dir: &Path, index: usize) -> PathBuf {
    log_dir.join(format!("process_stderr_{index}.log"))
}

/// Log of the fork server and every worker it forks.
pub fn manager_log_path(log_dir: &Path) -> PathBuf {
    log_dir.join("manager_process_stderr.log")
}

/// Open a log for appending; restarted workers keep writing to their slot's file.
pub fn open_log(path: &Path) -> io::Result<File> {
    File::options().create(true).append(true).open(path)
}

/// Re-log the error lines of a worker log. Returns whether any were found.
pub fn log_errors_from_file(path: &Path) -> bool {
    let Ok(content) = std::fs::read_to_string(path) else {
        return false;
    };
    let errors: Vec<&str> = content
        .lines()
        .filter(|line| line.contains("ERROR") || line.contains("panicked at"))
        .collect();
    if errors.is_empty() {
        return false;
    }

    let tail = &errors[errors.len().saturating_sub(MAX_REPORTED_LINES)..];
    tracing::error!(
        log = %path.display(),
        "Error logs from the worker process:\n{}",
        tail.join("\n")
    );
    true
}
