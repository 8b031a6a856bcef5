//! Run storage that forwards records to the pool.

use std::net::TcpStream;
use std::sync::Arc;

use linepool_core::storage::RunStorage;
use linepool_core::{FlowRunInfo, RunInfo};
use parking_lot::Mutex;

use crate::ipc::{WorkerResponse, write_message};

/// Write half of a worker's broker connection.
pub(crate) type FrameSink = Arc<Mutex<TcpStream>>;

/// Sends node and flow run records to the parent as they are persisted.
///
/// Records persisted before a connection is attached are dropped; in fork
/// mode the executor is built before any worker has connected.
#[derive(Default)]
pub struct ForwardingRunStorage {
    sink: Mutex<Option<FrameSink>>,
}

impl ForwardingRunStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn attach(&self, sink: FrameSink) {
        *self.sink.lock() = Some(sink);
    }

    fn forward(&self, response: WorkerResponse) -> linepool_core::Result<()> {
        let Some(sink) = self.sink.lock().clone() else {
            return Ok(());
        };
        let mut stream = sink.lock();
        write_message(&mut *stream, &response)
            .map_err(|e| linepool_core::Error::Storage(e.to_string()))
    }
}

impl RunStorage for ForwardingRunStorage {
    fn persist_node_run(&self, run_info: &RunInfo) -> linepool_core::Result<()> {
        self.forward(WorkerResponse::NodeRun {
            run_info_json: serde_json::to_vec(run_info)?,
        })
    }

    fn persist_flow_run(&self, run_info: &FlowRunInfo) -> linepool_core::Result<()> {
        self.forward(WorkerResponse::FlowRun {
            run_info_json: serde_json::to_vec(run_info)?,
        })
    }
}
