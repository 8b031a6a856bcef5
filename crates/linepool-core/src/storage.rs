//! Persistence sink for run records.
//!
//! Concrete backends live outside this crate. [`DummyRunStorage`] discards
//! everything and [`MemoryRunStorage`] keeps the latest version of each
//! record in memory.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::contracts::{FlowRunInfo, RunInfo};
use crate::error::Result;

/// Status counters keyed like `nodes.<node>.completed` or `lines.failed`.
pub type StatusSummary = BTreeMap<String, u64>;

/// Destination for node runs, flow runs and status summaries.
///
/// Implementations must be callable from several threads at once. A record
/// may be persisted more than once (e.g. at start and at end); later calls
/// replace earlier ones.
pub trait RunStorage: Send + Sync {
    fn persist_node_run(&self, run_info: &RunInfo) -> Result<()>;

    fn persist_flow_run(&self, run_info: &FlowRunInfo) -> Result<()>;

    fn persist_status_summary(&self, _summary: &StatusSummary, _run_id: &str) -> Result<()> {
        Ok(())
    }
}

/// Storage that drops every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct DummyRunStorage;

impl RunStorage for DummyRunStorage {
    fn persist_node_run(&self, _run_info: &RunInfo) -> Result<()> {
        Ok(())
    }

    fn persist_flow_run(&self, _run_info: &FlowRunInfo) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct MemoryRecords {
    node_runs: FxHashMap<String, RunInfo>,
    flow_runs: FxHashMap<String, FlowRunInfo>,
    summaries: FxHashMap<String, StatusSummary>,
    /// Every node run write, in order.
    node_writes: Vec<RunInfo>,
}

/// In-memory storage, mostly useful for inspection.
#[derive(Default)]
pub struct MemoryRunStorage {
    records: Mutex<MemoryRecords>,
}

impl MemoryRunStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_run(&self, run_id: &str) -> Option<RunInfo> {
        self.records.lock().node_runs.get(run_id).cloned()
    }

    pub fn flow_run(&self, run_id: &str) -> Option<FlowRunInfo> {
        self.records.lock().flow_runs.get(run_id).cloned()
    }

    pub fn node_runs(&self) -> Vec<RunInfo> {
        let mut runs: Vec<_> = self.records.lock().node_runs.values().cloned().collect();
        runs.sort_by(|a, b| a.run_id.cmp(&b.run_id));
        runs
    }

    pub fn flow_runs(&self) -> Vec<FlowRunInfo> {
        let mut runs: Vec<_> = self.records.lock().flow_runs.values().cloned().collect();
        runs.sort_by_key(|r| (r.index, r.run_id.clone()));
        runs
    }

    /// All node run writes in the order they happened.
    pub fn node_run_history(&self) -> Vec<RunInfo> {
        self.records.lock().node_writes.clone()
    }

    pub fn status_summary(&self, run_id: &str) -> Option<StatusSummary> {
        self.records.lock().summaries.get(run_id).cloned()
    }
}

impl RunStorage for MemoryRunStorage {
    fn persist_node_run(&self, run_info: &RunInfo) -> Result<()> {
        let mut records = self.records.lock();
        records.node_writes.push(run_info.clone());
        records
            .node_runs
            .insert(run_info.run_id.clone(), run_info.clone());
        Ok(())
    }

    fn persist_flow_run(&self, run_info: &FlowRunInfo) -> Result<()> {
        self.records
            .lock()
            .flow_runs
            .insert(run_info.run_id.clone(), run_info.clone());
        Ok(())
    }

    fn persist_status_summary(&self, summary: &StatusSummary, run_id: &str) -> Result<()> {
        self.records
            .lock()
            .summaries
            .insert(run_id.to_string(), summary.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::Status;

    #[test]
    fn test_memory_storage_keeps_latest_version() {
        let storage = MemoryRunStorage::new();
        let mut run = RunInfo::new("node", "flow_0", "flow_0_node_0", "flow_0", Some(0));
        storage.persist_node_run(&run).unwrap();
        run.status = Status::Completed;
        storage.persist_node_run(&run).unwrap();

        assert_eq!(
            storage.node_run("flow_0_node_0").unwrap().status,
            Status::Completed
        );
        assert_eq!(storage.node_run_history().len(), 2);
    }

    #[test]
    fn test_flow_runs_sorted_by_index() {
        let storage = MemoryRunStorage::new();
        for i in [2usize, 0, 1] {
            let run = FlowRunInfo::new("flow", "run", format!("run_{i}"), "run", Some(i));
            storage.persist_flow_run(&run).unwrap();
        }
        let indexes: Vec<_> = storage.flow_runs().iter().map(|r| r.index).collect();
        assert_eq!(indexes, vec![Some(0), Some(1), Some(2)]);
    }
}
