//! Runtime of a worker process.
//!
//! A spawned worker calls [`serve`]: it dials the pool's broker, builds its
//! executor from the recipe received at handshake and executes lines until
//! told to terminate. In fork mode the control process calls
//! [`run_fork_server`] instead, builds the executor once and forks a worker
//! per slot on request.

mod fork_server;
mod storage;

pub use fork_server::run_fork_server;
pub use storage::ForwardingRunStorage;

use std::io::BufReader;
use std::net::TcpStream;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use linepool_core::{ErrorInfo, FlowCreateArgs, FlowExecutor, LineResult, RunStorage};
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::error::{PoolError, Result};
use crate::ipc::{
    WorkerCommand, WorkerResponse, decode_json, encode_json, read_message, write_message,
};

use storage::FrameSink;

/// Builds the executor a worker runs lines with.
pub type ExecutorBuilder = Arc<
    dyn Fn(&FlowCreateArgs, Arc<dyn RunStorage>) -> linepool_core::Result<Box<dyn FlowExecutor>>
        + Send
        + Sync,
>;

/// Where a worker connects and who it claims to be.
#[derive(Debug, Clone)]
pub struct WorkerArgs {
    pub broker: String,
    pub token: String,
    pub slot: usize,
    pub generation: u64,
}

/// Serve lines as a spawned worker until terminated.
pub fn serve(args: &WorkerArgs, builder: &ExecutorBuilder) -> Result<()> {
    let mut connection = Connection::open(args)?;
    let flow: FlowCreateArgs = decode_json(&connection.flow_json)?;

    let storage = Arc::new(ForwardingRunStorage::new());
    storage.attach(connection.writer.clone());
    let sink: Arc<dyn RunStorage> = storage;

    let executor = match builder(&flow, sink) {
        Ok(executor) => executor,
        Err(e) => {
            connection.send(&WorkerResponse::Error {
                message: e.to_string(),
            })?;
            return Err(e.into());
        }
    };
    connection.send(&WorkerResponse::Ready)?;
    tracing::info!(slot = args.slot, flow = %flow.flow, "Worker ready");

    serve_lines(&mut connection, executor.as_ref())
}

/// Serve lines with an executor built before the fork.
pub(crate) fn serve_forked(
    args: &WorkerArgs,
    executor: &dyn FlowExecutor,
    storage: &ForwardingRunStorage,
) -> Result<()> {
    let mut connection = Connection::open(args)?;
    storage.attach(connection.writer.clone());
    connection.send(&WorkerResponse::Ready)?;
    tracing::info!(slot = args.slot, "Forked worker ready");

    serve_lines(&mut connection, executor)
}

struct Connection {
    reader: BufReader<TcpStream>,
    writer: FrameSink,
    flow_json: Vec<u8>,
}

impl Connection {
    /// Dial the broker and complete the first half of the handshake.
    fn open(args: &WorkerArgs) -> Result<Self> {
        let stream = TcpStream::connect(&args.broker).map_err(|e| {
            PoolError::Ipc(format!("Failed to connect to broker {}: {}", args.broker, e))
        })?;
        stream.set_nodelay(true)?;
        let mut writer = stream.try_clone()?;
        write_message(
            &mut writer,
            &WorkerResponse::Hello {
                token: args.token.clone(),
                slot: args.slot as u64,
                generation: args.generation,
                pid: std::process::id(),
            },
        )?;

        let mut reader = BufReader::new(stream);
        let flow_json = match read_message(&mut reader)? {
            WorkerCommand::Init { flow_json } => flow_json,
            other => {
                return Err(PoolError::Ipc(format!("expected Init, got {other:?}")));
            }
        };

        Ok(Self {
            reader,
            writer: Arc::new(Mutex::new(writer)),
            flow_json,
        })
    }

    fn send(&self, response: &WorkerResponse) -> Result<()> {
        write_message(&mut *self.writer.lock(), response)
    }
}

fn serve_lines(connection: &mut Connection, executor: &dyn FlowExecutor) -> Result<()> {
    loop {
        let command = match read_message::<_, WorkerCommand>(&mut connection.reader) {
            Ok(command) => command,
            Err(e) => {
                tracing::info!(error = %e, "Broker connection closed, exiting");
                return Ok(());
            }
        };

        match command {
            WorkerCommand::Execute {
                run_id,
                line_index,
                inputs_json,
                timeout_ms,
            } => {
                let line_index = line_index as usize;
                let result = match decode_json::<Map<String, Value>>(&inputs_json) {
                    Ok(inputs) => execute_line(
                        executor,
                        inputs,
                        &run_id,
                        line_index,
                        Duration::from_millis(timeout_ms),
                    ),
                    Err(e) => LineResult::failed(
                        executor.flow_id(),
                        &run_id,
                        line_index,
                        Map::new(),
                        ErrorInfo::new("UnexpectedError", e.to_string()),
                    ),
                };
                connection.send(&WorkerResponse::LineResult {
                    result_json: encode_json(&result)?,
                })?;
            }
            WorkerCommand::Terminate => {
                tracing::info!("Received terminate signal");
                return Ok(());
            }
            WorkerCommand::Ping => connection.send(&WorkerResponse::Pong)?,
            WorkerCommand::Init { .. } => tracing::debug!("Ignoring repeated Init"),
        }
    }
}

/// Run one line, turning a panic into a failed result.
fn execute_line(
    executor: &dyn FlowExecutor,
    inputs: Map<String, Value>,
    run_id: &str,
    line_index: usize,
    timeout: Duration,
) -> LineResult {
    let line_inputs = inputs.clone();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        executor.exec_line(inputs, run_id, line_index, Some(timeout))
    }));

    match outcome {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(line = line_index, "Line execution panicked: {message}");
            LineResult::failed(
                executor.flow_id(),
                run_id,
                line_index,
                line_inputs,
                ErrorInfo::new(
                    "UnexpectedError",
                    format!("Line {line_index} execution panicked: {message}"),
                ),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linepool_core::{AggregationResult, Status};

    struct Panicking;

    impl FlowExecutor for Panicking {
        fn flow_id(&self) -> &str {
            "panicking"
        }

        fn exec_line(
            &self,
            _inputs: Map<String, Value>,
            _run_id: &str,
            _index: usize,
            _timeout: Option<Duration>,
        ) -> LineResult {
            panic!("tool exploded")
        }

        fn exec_aggregation(
            &self,
            _batch_inputs: &[Map<String, Value>],
            _aggregation_inputs: &Map<String, Value>,
            _run_id: &str,
        ) -> AggregationResult {
            AggregationResult::default()
        }

        fn has_aggregation_node(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_panic_becomes_failed_line() {
        let mut inputs = Map::new();
        inputs.insert("x".to_string(), Value::from(1));
        let result = execute_line(&Panicking, inputs.clone(), "run", 4, Duration::from_secs(1));

        assert_eq!(result.status(), Status::Failed);
        assert_eq!(result.line_index(), Some(4));
        assert_eq!(result.run_info.run_id, "run_4");
        assert_eq!(result.run_info.inputs, Some(inputs));
        let error = result.run_info.error.unwrap();
        assert_eq!(error.error_type, "UnexpectedError");
        assert!(error.message.contains("tool exploded"));
    }
}
