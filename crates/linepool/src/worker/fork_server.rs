//! The fork-mode control process.
//!
//! Reads [`ControlSignal`] frames from stdin. The executor is built once,
//! before any fork, so every worker starts from the same warm state.

use crate::error::Result;

use super::ExecutorBuilder;

#[cfg(unix)]
pub fn run_fork_server(builder: &ExecutorBuilder) -> Result<()> {
    use std::sync::Arc;

    use linepool_core::{FlowCreateArgs, RunStorage};

    use crate::ipc::{ControlSignal, decode_json, read_message};

    use super::{ForwardingRunStorage, WorkerArgs, serve_forked};

    let stdin = std::io::stdin();
    let mut control = stdin.lock();

    let (broker, token, flow_json) = match read_message(&mut control)? {
        ControlSignal::Configure {
            broker_addr,
            token,
            flow_json,
        } => (broker_addr, token, flow_json),
        other => {
            return Err(crate::error::PoolError::Ipc(format!(
                "expected Configure, got {other:?}"
            )));
        }
    };
    let flow: FlowCreateArgs = decode_json(&flow_json)?;
    let storage = Arc::new(ForwardingRunStorage::new());
    let sink: Arc<dyn RunStorage> = storage.clone();
    let executor = builder(&flow, sink)?;
    tracing::info!(flow = %flow.flow, pid = std::process::id(), "Fork server ready");

    // SAFETY: with SIGCHLD ignored the kernel reaps forked workers.
    unsafe {
        libc::signal(libc::SIGCHLD, libc::SIG_IGN);
    }

    loop {
        let signal = match read_message::<_, ControlSignal>(&mut control) {
            Ok(signal) => signal,
            Err(e) => {
                tracing::info!(error = %e, "Control channel closed, exiting");
                return Ok(());
            }
        };

        match signal {
            ControlSignal::Start { slot, generation } => {
                // SAFETY: the fork server is single-threaded. The child only
                // runs the serving loop and then exits.
                let pid = unsafe { libc::fork() };
                if pid == 0 {
                    unsafe {
                        libc::signal(libc::SIGCHLD, libc::SIG_DFL);
                    }
                    let args = WorkerArgs {
                        broker: broker.clone(),
                        token: token.clone(),
                        slot: slot as usize,
                        generation,
                    };
                    let code = match serve_forked(&args, executor.as_ref(), &storage) {
                        Ok(()) => 0,
                        Err(e) => {
                            tracing::error!(slot, error = %e, "Forked worker failed");
                            1
                        }
                    };
                    std::process::exit(code);
                } else if pid > 0 {
                    tracing::info!(slot, generation, pid, "Forked worker");
                } else {
                    tracing::error!(
                        slot,
                        error = %std::io::Error::last_os_error(),
                        "Failed to fork worker"
                    );
                }
            }
            ControlSignal::Shutdown => {
                tracing::info!("Fork server shutting down");
                return Ok(());
            }
            ControlSignal::Configure { .. } => tracing::warn!("Ignoring repeated Configure"),
        }
    }
}

#[cfg(not(unix))]
pub fn run_fork_server(_builder: &ExecutorBuilder) -> Result<()> {
    Err(crate::error::PoolError::Config(
        "the fork start method requires a unix platform".to_string(),
    ))
}
